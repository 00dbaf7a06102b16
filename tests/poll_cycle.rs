use komfovent_c5_tools::ErrorKind;
use komfovent_c5_tools::connection::{Error, Transport};
use komfovent_c5_tools::device::modes::OperationMode;
use komfovent_c5_tools::device::monitoring::C5Status;
use komfovent_c5_tools::device::settings::FlowUnits;
use komfovent_c5_tools::device::{Device, Options, RegisterSet};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A controller running an older firmware, with flows configured in m³/s.
struct Controller {
    registers: Mutex<BTreeMap<u16, u16>>,
}

impl Controller {
    fn new() -> Self {
        let registers = [
            (18003, 1450),
            // 2024-06-01 08:15:00, English, modbus address 1, flows in m³/s.
            (449, 0x080F),
            (452, 0x0601),
            (453, 2024),
            (455, 1),
            (458, 2),
            (459, u16::from_be_bytes(*b"SN")),
            (467, u16::from_be_bytes(*b"C5")),
            // AHU on, in economy 1.
            (0, 1),
            (99, 3),
            (110, 0),
            (111, 1500),
            (114, 185),
            // Monitoring: running, two readings and an active alarm.
            (1999, 2),
            (2000, 3),
            (2002, 1500),
            (2007, (-120i16) as u16),
            (2023, 0x8000),
            (999, 1),
            (1000, 0x84),
        ];
        Self { registers: Mutex::new(registers.into_iter().collect()) }
    }

    fn get(&self, address: u16) -> u16 {
        self.registers.lock().unwrap().get(&address).copied().unwrap_or(0)
    }
}

impl Transport for Controller {
    async fn read_holdings(&self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        assert!(count <= 125);
        tokio::task::yield_now().await;
        Ok((address..address + count).map(|a| self.get(a)).collect())
    }

    async fn write_holding(&self, address: u16, value: u16) -> Result<(), Error> {
        if address == 129 {
            return Err(Error::Exception { function: 6, address, code: 2 });
        }
        self.registers.lock().unwrap().insert(address, value);
        Ok(())
    }

    async fn write_holdings(&self, address: u16, values: &[u16]) -> Result<(), Error> {
        let mut registers = self.registers.lock().unwrap();
        for (offset, value) in values.iter().enumerate() {
            registers.insert(address + offset as u16, *value);
        }
        Ok(())
    }
}

#[tokio::test]
async fn poll_cycle_produces_a_complete_snapshot() {
    let device = Device::initialize(Controller::new(), &Options::default()).await.unwrap();
    assert_eq!(device.register_set(), RegisterSet::Basic);
    let identity = device.identity();
    assert_eq!(identity.serial_number, "SN");
    assert_eq!(identity.name, "C5");
    assert_eq!(identity.firmware_version, Some(1450));

    let state = device.refresh().await.unwrap();
    assert_eq!(state.settings.flow_units, FlowUnits::CubicMetersPerSecond);
    assert_eq!(state.settings.datetime, jiff::civil::date(2024, 6, 1).at(8, 15, 0, 0));
    assert!(state.modes.ahu_on);
    let active = state.modes.active_mode().unwrap();
    assert_eq!(active.extract_flow, 0);
    assert_eq!(active.supply_flow, 1500);
    assert_eq!(active.setpoint_temperature, 18.5);
    assert_eq!(state.modes.vav_sensors_range, None);
    assert_eq!(state.monitoring.status, C5Status::Running);
    assert_eq!(state.monitoring.operation_mode, OperationMode::Economy1);
    assert_eq!(state.monitoring.supply_flow, 1.5);
    assert_eq!(state.monitoring.outdoor_temperature, -12.0);
    assert_eq!(state.monitoring.internal_supply_temperature, None);
    assert_eq!(state.active_alarms.len(), 1);
    assert_eq!(state.active_alarms[0].code_str(), "5A");
}

#[tokio::test]
async fn concurrent_writes_and_refreshes() {
    let device = Arc::new(Device::initialize(Controller::new(), &Options::default()).await.unwrap());
    let mut updates = device.subscribe();
    let writer = {
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            let economy = device.modes().mode(OperationMode::Economy1)?;
            economy.set_setpoint_temperature(20.0).await?;
            device.modes().set_operation_mode(OperationMode::Comfort2).await
        })
    };
    let refresher = {
        let device = Arc::clone(&device);
        tokio::spawn(async move { device.refresh().await.map(drop) })
    };
    writer.await.unwrap().unwrap();
    refresher.await.unwrap().unwrap();
    assert!(updates.has_changed().unwrap());

    let state = device.refresh().await.unwrap();
    assert_eq!(state.modes.operation_mode, OperationMode::Comfort2);
    assert_eq!(state.modes.mode(OperationMode::Economy1).unwrap().setpoint_temperature, 20.0);
    let latest = updates.borrow_and_update().clone().unwrap();
    assert!(Arc::ptr_eq(&latest, &state));
}

#[tokio::test]
async fn rejected_and_unsupported_writes() {
    let device = Device::initialize(Controller::new(), &Options::default()).await.unwrap();
    let error = device.modes().set_vav_sensors_range(10).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Usage);

    // Lowering the capability boundary makes the same controller use the extended register set.
    let options = Options { extended_since_firmware: 1400 };
    let device = Device::initialize(Controller::new(), &options).await.unwrap();
    assert_eq!(device.register_set(), RegisterSet::Extended);
    let error = device.modes().set_vav_sensors_range(10).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Protocol);
    assert!(!error.is_retryable());
    device.alarms().reset_active().await.unwrap();
    assert_eq!(device.transport().get(999), 0x99C5);
}

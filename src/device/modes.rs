use super::{Error, RegisterSet};
use crate::connection::Transport;
use crate::registers::{
    DecodeError, RegisterCursor, RegisterEnum, decode_enum, register_enum, tenths, to_tenths,
};
use tracing::debug;

pub const REG_AHU_ON: u16 = 0;
pub const REG_OPERATION_MODE: u16 = 99;
pub const REG_COMFORT1: u16 = 100;
pub const REG_COMFORT2: u16 = 105;
pub const REG_ECONOMY1: u16 = 110;
pub const REG_ECONOMY2: u16 = 115;
pub const REG_SPECIAL: u16 = 120;
pub const REG_FLOW_CONTROL_MODE: u16 = 126;
pub const REG_TEMPERATURE_CONTROL_MODE: u16 = 127;
pub const REG_VAV_STATUS: u16 = 128;
pub const REG_VAV_SENSORS_RANGE: u16 = 129;
pub const REG_NOMINAL_SUPPLY_PRESSURE: u16 = 130;
pub const REG_NOMINAL_EXHAUST_PRESSURE: u16 = 131;

const OFFSET_SUPPLY_FLOW: u16 = 0;
const OFFSET_EXTRACT_FLOW: u16 = 2;
const OFFSET_SETPOINT_TEMPERATURE: u16 = 4;
const OFFSET_CONFIGURATION: u16 = 5;
const MODE_REGISTERS: usize = 5;

/// Writing this value to [`REG_VAV_STATUS`] starts the VAV sensor calibration.
const START_VAV_CALIBRATION: u16 = 0x99C5;

pub fn block_length(register_set: RegisterSet) -> usize {
    let end = match register_set {
        RegisterSet::Basic => REG_VAV_STATUS,
        RegisterSet::Extended => REG_NOMINAL_EXHAUST_PRESSURE,
    };
    usize::from(end - REG_OPERATION_MODE) + 1
}

register_enum! {
    pub enum OperationMode {
        Comfort1 = 1,
        Comfort2 = 2,
        Economy1 = 3,
        Economy2 = 4,
        Special = 5,
        Program = 6,
    }
}

impl OperationMode {
    /// Modes that have their own flow and temperature setpoints and can be selected manually.
    pub fn selectable() -> [OperationMode; 5] {
        [
            OperationMode::Comfort1,
            OperationMode::Comfort2,
            OperationMode::Economy1,
            OperationMode::Economy2,
            OperationMode::Special,
        ]
    }

    /// First register of the setpoint block belonging to this mode.
    pub fn setpoint_register(self) -> Option<u16> {
        Some(match self {
            OperationMode::Comfort1 => REG_COMFORT1,
            OperationMode::Comfort2 => REG_COMFORT2,
            OperationMode::Economy1 => REG_ECONOMY1,
            OperationMode::Economy2 => REG_ECONOMY2,
            OperationMode::Special => REG_SPECIAL,
            OperationMode::Program => return None,
        })
    }

    fn slot(self) -> Option<usize> {
        OperationMode::selectable().iter().position(|m| *m == self)
    }
}

register_enum! {
    pub enum FlowControlMode {
        Cav = 0,
        Vav = 1,
        Dcv = 2,
    }
}

register_enum! {
    pub enum TemperatureControlMode {
        Supply = 0,
        Extract = 1,
        Room = 2,
    }
}

register_enum! {
    pub enum VavStatus {
        NotCalibrated = 0,
        Calibrating = 1,
        Supply = 2,
        Extract = 3,
        Double = 4,
    }
}

bitflags::bitflags! {
    /// Functions the special mode is allowed to use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
    pub struct ConfigurationFlags: u16 {
        const HEATING = 1 << 0;
        const COOLING = 1 << 1;
        const RECIRCULATION = 1 << 2;
        const HUMIDIFYING = 1 << 3;
        const DEHUMIDIFYING = 1 << 4;
    }
}

impl ConfigurationFlags {
    pub fn from_register(value: u16, address: u16) -> Result<Self, DecodeError> {
        Self::from_bits(value).ok_or(DecodeError::UnknownFlags {
            field: "special.configuration",
            address,
            value,
        })
    }
}

/// Setpoints of a single operation mode.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ModeState {
    /// Raw flow in the controller's configured flow units.
    pub supply_flow: u32,
    pub extract_flow: u32,
    /// °C
    pub setpoint_temperature: f32,
    /// Present for the special mode only.
    pub configuration: Option<ConfigurationFlags>,
}

impl ModeState {
    fn decode(cursor: &mut RegisterCursor, special: bool) -> Result<Self, DecodeError> {
        let supply_flow = cursor.u32("mode.supply_flow")?;
        let extract_flow = cursor.u32("mode.extract_flow")?;
        let setpoint_temperature = cursor.tenths_u16("mode.setpoint_temperature")?;
        let configuration = if special {
            let address = cursor.address();
            let raw = cursor.u16("special.configuration")?;
            Some(ConfigurationFlags::from_register(raw, address)?)
        } else {
            None
        };
        Ok(Self { supply_flow, extract_flow, setpoint_temperature, configuration })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ModesState {
    pub ahu_on: bool,
    pub operation_mode: OperationMode,
    /// Indexed in [`OperationMode::selectable`] order.
    pub modes: [ModeState; 5],
    pub flow_control_mode: FlowControlMode,
    pub temperature_control_mode: TemperatureControlMode,
    pub vav_status: VavStatus,
    // Extended register set only.
    pub vav_sensors_range: Option<u16>,
    pub nominal_supply_pressure: Option<u16>,
    pub nominal_exhaust_pressure: Option<u16>,
}

impl ModesState {
    /// `words` start at [`REG_OPERATION_MODE`].
    pub fn decode(
        ahu_on: bool,
        words: &[u16],
        register_set: RegisterSet,
    ) -> Result<Self, DecodeError> {
        let mut cursor = RegisterCursor::new(REG_OPERATION_MODE, words);
        let operation_mode = cursor.enumeration("operation_mode")?;
        let modes = [
            ModeState::decode(&mut cursor, false)?,
            ModeState::decode(&mut cursor, false)?,
            ModeState::decode(&mut cursor, false)?,
            ModeState::decode(&mut cursor, false)?,
            ModeState::decode(&mut cursor, true)?,
        ];
        let flow_control_mode = cursor.enumeration("flow_control_mode")?;
        let temperature_control_mode = cursor.enumeration("temperature_control_mode")?;
        let vav_status = cursor.enumeration("vav_status")?;
        let (vav_sensors_range, nominal_supply_pressure, nominal_exhaust_pressure) =
            if register_set.is_extended() {
                (
                    Some(cursor.u16("vav_sensors_range")?),
                    Some(cursor.u16("nominal_supply_pressure")?),
                    Some(cursor.u16("nominal_exhaust_pressure")?),
                )
            } else {
                (None, None, None)
            };
        cursor.finish("modes")?;
        Ok(Self {
            ahu_on,
            operation_mode,
            modes,
            flow_control_mode,
            temperature_control_mode,
            vav_status,
            vav_sensors_range,
            nominal_supply_pressure,
            nominal_exhaust_pressure,
        })
    }

    pub fn mode(&self, mode: OperationMode) -> Option<&ModeState> {
        self.modes.get(mode.slot()?)
    }

    /// Setpoints currently in effect. `None` while a schedule is driving the unit.
    pub fn active_mode(&self) -> Option<&ModeState> {
        self.mode(self.operation_mode)
    }
}

/// Access to the operation mode block (register 0 and registers 99 onwards).
pub struct Modes<'a, T> {
    transport: &'a T,
    register_set: RegisterSet,
}

impl<'a, T: Transport> Modes<'a, T> {
    pub fn new(transport: &'a T, register_set: RegisterSet) -> Self {
        Self { transport, register_set }
    }

    pub async fn read_all(&self) -> Result<ModesState, Error> {
        let ahu_on = self.ahu_on().await?;
        let words = self
            .transport
            .read_many(REG_OPERATION_MODE, block_length(self.register_set))
            .await
            .map_err(Error::Transport)?;
        ModesState::decode(ahu_on, &words, self.register_set).map_err(Error::Decode)
    }

    pub async fn ahu_on(&self) -> Result<bool, Error> {
        Ok(self.transport.read_u16(REG_AHU_ON).await.map_err(Error::Transport)? != 0)
    }

    pub async fn set_ahu_on(&self, on: bool) -> Result<(), Error> {
        self.write(REG_AHU_ON, on.into()).await
    }

    pub async fn operation_mode(&self) -> Result<OperationMode, Error> {
        self.read_enum(REG_OPERATION_MODE, "operation_mode").await
    }

    pub async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), Error> {
        self.write(REG_OPERATION_MODE, mode.to_register()).await
    }

    pub async fn flow_control_mode(&self) -> Result<FlowControlMode, Error> {
        self.read_enum(REG_FLOW_CONTROL_MODE, "flow_control_mode").await
    }

    pub async fn set_flow_control_mode(&self, mode: FlowControlMode) -> Result<(), Error> {
        self.write(REG_FLOW_CONTROL_MODE, mode.to_register()).await
    }

    pub async fn temperature_control_mode(&self) -> Result<TemperatureControlMode, Error> {
        self.read_enum(REG_TEMPERATURE_CONTROL_MODE, "temperature_control_mode").await
    }

    pub async fn set_temperature_control_mode(
        &self,
        mode: TemperatureControlMode,
    ) -> Result<(), Error> {
        self.write(REG_TEMPERATURE_CONTROL_MODE, mode.to_register()).await
    }

    pub async fn vav_status(&self) -> Result<VavStatus, Error> {
        self.read_enum(REG_VAV_STATUS, "vav_status").await
    }

    pub async fn start_vav_calibration(&self) -> Result<(), Error> {
        self.write(REG_VAV_STATUS, START_VAV_CALIBRATION).await
    }

    pub async fn vav_sensors_range(&self) -> Result<u16, Error> {
        self.read_extended(REG_VAV_SENSORS_RANGE, "VAV sensor range").await
    }

    pub async fn set_vav_sensors_range(&self, value: u16) -> Result<(), Error> {
        self.write_extended(REG_VAV_SENSORS_RANGE, value, "VAV sensor range").await
    }

    pub async fn nominal_supply_pressure(&self) -> Result<u16, Error> {
        self.read_extended(REG_NOMINAL_SUPPLY_PRESSURE, "nominal supply pressure").await
    }

    pub async fn set_nominal_supply_pressure(&self, value: u16) -> Result<(), Error> {
        self.write_extended(REG_NOMINAL_SUPPLY_PRESSURE, value, "nominal supply pressure").await
    }

    pub async fn nominal_exhaust_pressure(&self) -> Result<u16, Error> {
        self.read_extended(REG_NOMINAL_EXHAUST_PRESSURE, "nominal exhaust pressure").await
    }

    pub async fn set_nominal_exhaust_pressure(&self, value: u16) -> Result<(), Error> {
        self.write_extended(REG_NOMINAL_EXHAUST_PRESSURE, value, "nominal exhaust pressure").await
    }

    /// Setpoint registers of one of the [`OperationMode::selectable`] modes.
    pub fn mode(&self, mode: OperationMode) -> Result<ModeRegisters<'a, T>, Error> {
        let start = mode.setpoint_register().ok_or(Error::NotConfigurable(mode))?;
        let special = mode == OperationMode::Special;
        Ok(ModeRegisters { transport: self.transport, start, special })
    }

    pub fn special(&self) -> SpecialMode<'a, T> {
        SpecialMode {
            registers: ModeRegisters { transport: self.transport, start: REG_SPECIAL, special: true },
        }
    }

    async fn write(&self, address: u16, value: u16) -> Result<(), Error> {
        debug!(message = "writing", address, value);
        self.transport.write_u16(address, value).await.map_err(Error::Transport)
    }

    async fn read_enum<E: RegisterEnum>(
        &self,
        address: u16,
        field: &'static str,
    ) -> Result<E, Error> {
        let value = self.transport.read_u16(address).await.map_err(Error::Transport)?;
        decode_enum(value, field, address).map_err(Error::Decode)
    }

    async fn read_extended(&self, address: u16, what: &'static str) -> Result<u16, Error> {
        if !self.register_set.is_extended() {
            return Err(Error::Unsupported(what));
        }
        self.transport.read_u16(address).await.map_err(Error::Transport)
    }

    async fn write_extended(&self, address: u16, value: u16, what: &'static str) -> Result<(), Error> {
        if !self.register_set.is_extended() {
            return Err(Error::Unsupported(what));
        }
        self.write(address, value).await
    }
}

pub struct ModeRegisters<'a, T> {
    transport: &'a T,
    start: u16,
    special: bool,
}

impl<'a, T: Transport> ModeRegisters<'a, T> {
    pub async fn read_all(&self) -> Result<ModeState, Error> {
        let count = MODE_REGISTERS + usize::from(self.special);
        let words = self.transport.read_many(self.start, count).await.map_err(Error::Transport)?;
        let mut cursor = RegisterCursor::new(self.start, &words);
        let state = ModeState::decode(&mut cursor, self.special).map_err(Error::Decode)?;
        cursor.finish("mode").map_err(Error::Decode)?;
        Ok(state)
    }

    pub async fn supply_flow(&self) -> Result<u32, Error> {
        let address = self.start + OFFSET_SUPPLY_FLOW;
        self.transport.read_u32(address).await.map_err(Error::Transport)
    }

    pub async fn set_supply_flow(&self, value: u32) -> Result<(), Error> {
        let address = self.start + OFFSET_SUPPLY_FLOW;
        self.transport.write_u32(address, value).await.map_err(Error::Transport)
    }

    pub async fn extract_flow(&self) -> Result<u32, Error> {
        let address = self.start + OFFSET_EXTRACT_FLOW;
        self.transport.read_u32(address).await.map_err(Error::Transport)
    }

    pub async fn set_extract_flow(&self, value: u32) -> Result<(), Error> {
        let address = self.start + OFFSET_EXTRACT_FLOW;
        self.transport.write_u32(address, value).await.map_err(Error::Transport)
    }

    /// °C
    pub async fn setpoint_temperature(&self) -> Result<f32, Error> {
        let address = self.start + OFFSET_SETPOINT_TEMPERATURE;
        Ok(tenths(self.transport.read_u16(address).await.map_err(Error::Transport)?))
    }

    pub async fn set_setpoint_temperature(&self, celsius: f32) -> Result<(), Error> {
        let address = self.start + OFFSET_SETPOINT_TEMPERATURE;
        let value = Some(celsius)
            .filter(|celsius| celsius.is_finite())
            .and_then(|celsius| u16::try_from(to_tenths(celsius)).ok())
            .ok_or_else(|| Error::InvalidValue("setpoint temperature", celsius.to_string()))?;
        self.transport.write_u16(address, value).await.map_err(Error::Transport)
    }
}

/// The special mode, which in addition to setpoints also selects which functions may run.
pub struct SpecialMode<'a, T> {
    registers: ModeRegisters<'a, T>,
}

impl<'a, T: Transport> SpecialMode<'a, T> {
    pub fn setpoints(&self) -> &ModeRegisters<'a, T> {
        &self.registers
    }

    pub async fn read_all(&self) -> Result<ModeState, Error> {
        self.registers.read_all().await
    }

    pub async fn configuration(&self) -> Result<ConfigurationFlags, Error> {
        let address = REG_SPECIAL + OFFSET_CONFIGURATION;
        let raw = self.registers.transport.read_u16(address).await.map_err(Error::Transport)?;
        ConfigurationFlags::from_register(raw, address).map_err(Error::Decode)
    }

    pub async fn set_configuration(&self, flags: ConfigurationFlags) -> Result<(), Error> {
        let address = REG_SPECIAL + OFFSET_CONFIGURATION;
        self.registers
            .transport
            .write_u16(address, flags.bits())
            .await
            .map_err(Error::Transport)
    }

    /// Enable `enable` and disable `disable`, leaving the remaining flags as they are.
    pub async fn update_configuration(
        &self,
        enable: ConfigurationFlags,
        disable: ConfigurationFlags,
    ) -> Result<ConfigurationFlags, Error> {
        let current = self.configuration().await?;
        let updated = current.union(enable).difference(disable);
        if updated != current {
            self.set_configuration(updated).await?;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn image(transport: &MockTransport) {
        transport.set(REG_AHU_ON, 1);
        transport.set(REG_OPERATION_MODE, 2);
        for (slot, start) in [REG_COMFORT1, REG_COMFORT2, REG_ECONOMY1, REG_ECONOMY2, REG_SPECIAL]
            .into_iter()
            .enumerate()
        {
            let slot = slot as u32;
            transport.set_u32(start, 100 + slot);
            transport.set_u32(start + 2, 200 + slot);
            transport.set(start + 4, 200 + slot as u16);
        }
        transport.set(REG_SPECIAL + 5, 0b1_0001);
        transport.set_many(REG_FLOW_CONTROL_MODE, &[1, 2, 4, 25, 300, 310]);
    }

    #[tokio::test]
    async fn reads_basic_modes() {
        let transport = MockTransport::new();
        image(&transport);
        let modes = Modes::new(&transport, RegisterSet::Basic).read_all().await.unwrap();
        assert_eq!(transport.reads(), vec![(0, 1), (99, 30)]);
        assert!(modes.ahu_on);
        assert_eq!(modes.operation_mode, OperationMode::Comfort2);
        let active = modes.active_mode().unwrap();
        assert_eq!(active.supply_flow, 101);
        assert_eq!(active.extract_flow, 201);
        assert_eq!(active.setpoint_temperature, 20.1);
        assert_eq!(active.configuration, None);
        let special = modes.mode(OperationMode::Special).unwrap();
        assert_eq!(
            special.configuration,
            Some(ConfigurationFlags::DEHUMIDIFYING | ConfigurationFlags::HEATING)
        );
        assert_eq!(modes.flow_control_mode, FlowControlMode::Vav);
        assert_eq!(modes.temperature_control_mode, TemperatureControlMode::Room);
        assert_eq!(modes.vav_status, VavStatus::Double);
        assert_eq!(modes.vav_sensors_range, None);
        assert_eq!(modes.nominal_exhaust_pressure, None);
    }

    #[tokio::test]
    async fn reads_extended_modes() {
        let transport = MockTransport::new();
        image(&transport);
        let modes = Modes::new(&transport, RegisterSet::Extended).read_all().await.unwrap();
        assert_eq!(transport.reads(), vec![(0, 1), (99, 33)]);
        assert_eq!(modes.vav_sensors_range, Some(25));
        assert_eq!(modes.nominal_supply_pressure, Some(300));
        assert_eq!(modes.nominal_exhaust_pressure, Some(310));
    }

    #[tokio::test]
    async fn program_mode_has_no_active_setpoints() {
        let transport = MockTransport::new();
        image(&transport);
        transport.set(REG_OPERATION_MODE, 6);
        let modes = Modes::new(&transport, RegisterSet::Basic).read_all().await.unwrap();
        assert_eq!(modes.operation_mode, OperationMode::Program);
        assert!(modes.active_mode().is_none());
    }

    #[tokio::test]
    async fn unknown_mode_and_flags_are_rejected() {
        let transport = MockTransport::new();
        image(&transport);
        transport.set(REG_OPERATION_MODE, 9);
        let error = Modes::new(&transport, RegisterSet::Basic).read_all().await.unwrap_err();
        assert!(matches!(error, Error::Decode(DecodeError::UnknownValue { address: 99, .. })));
        transport.set(REG_OPERATION_MODE, 1);
        transport.set(REG_SPECIAL + 5, 0b10_0000);
        let error = Modes::new(&transport, RegisterSet::Basic).read_all().await.unwrap_err();
        assert!(matches!(error, Error::Decode(DecodeError::UnknownFlags { address: 125, .. })));
    }

    #[tokio::test]
    async fn setpoint_writes() {
        let transport = MockTransport::new();
        let modes = Modes::new(&transport, RegisterSet::Basic);
        let economy = modes.mode(OperationMode::Economy1).unwrap();
        economy.set_supply_flow(100_000).await.unwrap();
        economy.set_setpoint_temperature(21.46).await.unwrap();
        assert_eq!(transport.writes(), vec![(110, vec![0x0001, 0x86A0]), (114, vec![215])]);
        assert_eq!(economy.supply_flow().await.unwrap(), 100_000);
        assert!(matches!(
            modes.mode(OperationMode::Program),
            Err(Error::NotConfigurable(OperationMode::Program))
        ));
        for celsius in [-5.0, f32::NAN, f32::INFINITY, 1e9] {
            assert!(matches!(
                economy.set_setpoint_temperature(celsius).await,
                Err(Error::InvalidValue(..))
            ));
        }
        assert_eq!(transport.writes().len(), 2);
    }

    #[tokio::test]
    async fn special_configuration_is_read_modify_write() {
        let transport = MockTransport::new();
        transport.set(REG_SPECIAL + 5, 0b0_0011);
        let special = Modes::new(&transport, RegisterSet::Basic).special();
        let updated = special
            .update_configuration(ConfigurationFlags::RECIRCULATION, ConfigurationFlags::COOLING)
            .await
            .unwrap();
        assert_eq!(updated, ConfigurationFlags::HEATING | ConfigurationFlags::RECIRCULATION);
        assert_eq!(transport.get(REG_SPECIAL + 5), 0b0_0101);
        assert_eq!(special.read_all().await.unwrap().configuration, Some(updated));
    }

    #[tokio::test]
    async fn trigger_and_extended_only_operations() {
        let transport = MockTransport::new();
        let modes = Modes::new(&transport, RegisterSet::Basic);
        modes.start_vav_calibration().await.unwrap();
        assert_eq!(transport.writes(), vec![(128, vec![0x99C5])]);
        assert!(matches!(modes.set_nominal_exhaust_pressure(1).await, Err(Error::Unsupported(_))));
        let modes = Modes::new(&transport, RegisterSet::Extended);
        modes.set_nominal_exhaust_pressure(250).await.unwrap();
        assert_eq!(transport.get(REG_NOMINAL_EXHAUST_PRESSURE), 250);
        assert_eq!(transport.get(REG_VAV_SENSORS_RANGE), 0);
    }

    #[test]
    fn selectable_modes_map_to_slots() {
        for (slot, mode) in OperationMode::selectable().into_iter().enumerate() {
            assert_eq!(mode.slot(), Some(slot));
            assert_eq!(mode.setpoint_register(), Some(REG_COMFORT1 + 5 * slot as u16));
        }
        assert_eq!(OperationMode::Program.slot(), None);
    }
}

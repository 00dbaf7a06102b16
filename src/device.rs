//! The controller as a whole: capability detection, decoder access and the poll cycle.

pub mod alarm_codes;
pub mod alarms;
pub mod functions;
pub mod modes;
pub mod monitoring;
pub mod service;
pub mod settings;

use crate::ErrorKind;
use crate::connection::{self, Transport};
use crate::registers::DecodeError;
use alarms::{Alarm, Alarms};
use functions::{Functions, FunctionsState};
use modes::{Modes, ModesState, OperationMode};
use monitoring::{Monitoring, MonitoringState};
use service::Service;
use settings::{Settings, SettingsState};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lowest firmware version known to expose the extended register set.
///
/// This boundary was established by observing devices rather than from documentation.
pub const EXTENDED_SINCE_FIRMWARE: u16 = 2000;

pub fn is_extended(firmware_version: u16) -> bool {
    RegisterSet::for_firmware(Some(firmware_version), EXTENDED_SINCE_FIRMWARE).is_extended()
}

/// Which registers a controller implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegisterSet {
    Basic,
    Extended,
}

impl RegisterSet {
    /// An unknown firmware version is assumed to only implement the basic register set.
    pub fn for_firmware(firmware_version: Option<u16>, extended_since: u16) -> Self {
        match firmware_version {
            Some(version) if version >= extended_since => RegisterSet::Extended,
            _ => RegisterSet::Basic,
        }
    }

    pub fn is_extended(self) -> bool {
        self == RegisterSet::Extended
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "device::Options")]
pub struct Options {
    /// Firmware version starting with which the controller is treated as implementing the
    /// extended register set.
    #[arg(long, default_value_t = EXTENDED_SINCE_FIRMWARE)]
    pub extended_since_firmware: u16,
}

impl Default for Options {
    fn default() -> Self {
        Self { extended_since_firmware: EXTENDED_SINCE_FIRMWARE }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("register exchange with the controller failed")]
    Transport(#[source] connection::Error),
    #[error("could not decode the register values")]
    Decode(#[source] DecodeError),
    #[error("operation mode {0} has no configurable setpoints")]
    NotConfigurable(OperationMode),
    #[error("{0} is only available on controllers with the extended register set")]
    Unsupported(&'static str),
    #[error("{1} is not a valid value for {0}")]
    InvalidValue(&'static str, String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(e) => e.kind(),
            Error::Decode(_) => ErrorKind::Decoding,
            Error::NotConfigurable(_) | Error::Unsupported(_) | Error::InvalidValue(..) => {
                ErrorKind::Usage
            }
        }
    }

    /// Whether the same operation may succeed after reconnecting.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub name: String,
    pub firmware_version: Option<u16>,
    pub register_set: RegisterSet,
}

/// Everything read during a single poll cycle.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeviceState {
    pub settings: Arc<SettingsState>,
    pub modes: ModesState,
    pub monitoring: MonitoringState,
    pub functions: FunctionsState,
    pub active_alarms: Vec<Alarm>,
}

/// A polled controller.
///
/// The firmware version and settings are read once by [`Device::initialize`]; everything else is
/// re-read on each [`Device::refresh`]. Scheduling refreshes is up to the caller.
pub struct Device<T> {
    transport: T,
    firmware_version: Option<u16>,
    register_set: RegisterSet,
    settings: Mutex<Arc<SettingsState>>,
    state: watch::Sender<Option<Arc<DeviceState>>>,
}

impl<T: Transport> Device<T> {
    pub async fn initialize(transport: T, options: &Options) -> Result<Self, Error> {
        let firmware_version = match Service::new(&transport).read_firmware_version().await {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(
                    message = "could not read the firmware version, assuming basic register set",
                    error = (&e as &dyn std::error::Error)
                );
                None
            }
        };
        let register_set =
            RegisterSet::for_firmware(firmware_version, options.extended_since_firmware);
        info!(message = "detected controller", ?firmware_version, ?register_set);
        let settings = Settings::new(&transport, register_set).read_all().await?;
        let (state, _) = watch::channel(None);
        Ok(Self {
            transport,
            firmware_version,
            register_set,
            settings: Mutex::new(Arc::new(settings)),
            state,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn firmware_version(&self) -> Option<u16> {
        self.firmware_version
    }

    pub fn register_set(&self) -> RegisterSet {
        self.register_set
    }

    pub fn cached_settings(&self) -> Arc<SettingsState> {
        Arc::clone(&self.settings.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn identity(&self) -> DeviceIdentity {
        let settings = self.cached_settings();
        DeviceIdentity {
            serial_number: settings.serial_number.clone(),
            name: settings.name.clone(),
            firmware_version: self.firmware_version,
            register_set: self.register_set,
        }
    }

    pub async fn refresh_settings(&self) -> Result<Arc<SettingsState>, Error> {
        let settings = Arc::new(self.settings().read_all().await?);
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&settings);
        Ok(settings)
    }

    /// Read all blocks and publish the result as the latest snapshot.
    ///
    /// A failure of any read fails the whole cycle and leaves the previous snapshot in place.
    pub async fn refresh(&self) -> Result<Arc<DeviceState>, Error> {
        if !self.transport.is_connected() {
            info!(message = "reconnecting before refresh");
            self.transport.reconnect().await.map_err(Error::Transport)?;
        }
        let settings = self.cached_settings();
        let modes = self.modes().read_all().await?;
        let monitoring = self.monitoring().read_all(settings.flow_units).await?;
        let functions = self.functions().read_all().await?;
        let active_alarms = self.alarms().read_active().await?;
        let state = Arc::new(DeviceState { settings, modes, monitoring, functions, active_alarms });
        debug!(message = "refreshed", alarms = state.active_alarms.len());
        self.state.send_replace(Some(Arc::clone(&state)));
        Ok(state)
    }

    /// The latest successfully refreshed snapshot.
    pub fn snapshot(&self) -> Option<Arc<DeviceState>> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<DeviceState>>> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> Settings<'_, T> {
        Settings::new(&self.transport, self.register_set)
    }

    pub fn modes(&self) -> Modes<'_, T> {
        Modes::new(&self.transport, self.register_set)
    }

    pub fn monitoring(&self) -> Monitoring<'_, T> {
        Monitoring::new(&self.transport)
    }

    pub fn functions(&self) -> Functions<'_, T> {
        Functions::new(&self.transport)
    }

    pub fn alarms(&self) -> Alarms<'_, T> {
        Alarms::new(&self.transport)
    }
}

pub mod read {
    use crate::connection::{self, Connection};
    use crate::device::{self, Device};
    use crate::output;
    use tracing::warn;

    /// Read the current state of the controller.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        device: device::Options,
        #[clap(flatten)]
        output: output::Args,
        /// Keep reading the controller state at this interval.
        ///
        /// Requires a streaming output format (`jsonl` or `csv`).
        #[arg(long)]
        watch: Option<humantime::Duration>,
        /// Also read the alarm history.
        #[arg(long)]
        history: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not connect to the controller")]
        Connect(#[source] connection::Error),
        #[error("could not set up communication with `{1}`")]
        Initialize(#[source] device::Error, String),
        #[error("could not read the state of `{1}`")]
        Refresh(#[source] device::Error, String),
        #[error("could not read the alarm history of `{1}`")]
        History(#[source] device::Error, String),
        #[error("could not output the results")]
        Output(#[source] output::Error),
        #[error("--watch needs a streaming output format, such as `--format=jsonl`")]
        WatchNeedsStreamingFormat,
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        identity: device::DeviceIdentity,
        state: &'a device::DeviceState,
        #[serde(skip_serializing_if = "Option::is_none")]
        alarm_history: Option<Vec<device::alarms::AlarmHistoryEntry>>,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        if args.watch.is_some() && !args.output.is_streaming() {
            return Err(Error::WatchNeedsStreamingFormat);
        }
        let mut devices = Vec::new();
        for endpoint in args.connection.endpoints() {
            let address = endpoint.address.clone();
            let connection = Connection::connect(endpoint).await.map_err(Error::Connect)?;
            let device = Device::initialize(connection, &args.device)
                .await
                .map_err(|e| Error::Initialize(e, address.clone()))?;
            devices.push((address, device));
        }
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Device", "Field", "Value"]).map_err(Error::Output)?;
        let Some(period) = args.watch else {
            for (address, device) in &devices {
                let state = device.refresh().await.map_err(|e| Error::Refresh(e, address.clone()))?;
                let alarm_history = if args.history {
                    let history = device.alarms().read_history().await;
                    Some(history.map_err(|e| Error::History(e, address.clone()))?)
                } else {
                    None
                };
                let record = Record { identity: device.identity(), state: &state, alarm_history };
                output.record(address, &record).map_err(Error::Output)?;
            }
            return output.commit().map_err(Error::Output);
        };
        let mut interval = tokio::time::interval(*period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for (address, device) in &devices {
                let state = match device.refresh().await {
                    Ok(state) => state,
                    Err(e) if e.is_retryable() => {
                        warn!(
                            message = "refresh failed, will retry",
                            address = address.as_str(),
                            error = (&e as &dyn std::error::Error)
                        );
                        continue;
                    }
                    Err(e) => return Err(Error::Refresh(e, address.clone())),
                };
                let identity = device.identity();
                let record = Record { identity, state: &state, alarm_history: None };
                output.record(address, &record).map_err(Error::Output)?;
            }
            output.flush().map_err(Error::Output)?;
        }
    }
}

pub mod write {
    use crate::connection::{self, Connection, Endpoint};
    use crate::device::modes::{
        ConfigurationFlags, FlowControlMode, OperationMode, TemperatureControlMode,
    };
    use crate::device::settings::Language;
    use crate::device::{self, Device};
    use crate::output;
    use tracing::{error, info};

    #[derive(clap::ValueEnum, Clone, Copy, Debug)]
    pub enum Switch {
        On,
        Off,
    }

    impl From<Switch> for bool {
        fn from(value: Switch) -> bool {
            matches!(value, Switch::On)
        }
    }

    #[derive(clap::ValueEnum, Clone, Copy, Debug)]
    pub enum SpecialFunction {
        Heating,
        Cooling,
        Recirculation,
        Humidifying,
        Dehumidifying,
    }

    impl SpecialFunction {
        fn flags(functions: &[SpecialFunction]) -> ConfigurationFlags {
            functions.iter().fold(ConfigurationFlags::empty(), |flags, function| {
                flags
                    | match function {
                        SpecialFunction::Heating => ConfigurationFlags::HEATING,
                        SpecialFunction::Cooling => ConfigurationFlags::COOLING,
                        SpecialFunction::Recirculation => ConfigurationFlags::RECIRCULATION,
                        SpecialFunction::Humidifying => ConfigurationFlags::HUMIDIFYING,
                        SpecialFunction::Dehumidifying => ConfigurationFlags::DEHUMIDIFYING,
                    }
            })
        }
    }

    #[derive(clap::Subcommand, Clone, Debug)]
    pub enum Change {
        /// Start or stop the air handling unit.
        Ahu { switch: Switch },
        /// Select the active operation mode.
        OperationMode { mode: OperationMode },
        /// Set the supply flow setpoint of a mode, in the controller's flow units.
        SupplyFlow {
            #[arg(long, default_value = "special")]
            mode: OperationMode,
            value: u32,
        },
        /// Set the extract flow setpoint of a mode, in the controller's flow units.
        ExtractFlow {
            #[arg(long, default_value = "special")]
            mode: OperationMode,
            value: u32,
        },
        /// Set the temperature setpoint of a mode, in °C.
        Setpoint {
            #[arg(long, default_value = "special")]
            mode: OperationMode,
            celsius: f32,
        },
        /// Enable or disable functions available to the special mode.
        SpecialFunctions {
            #[arg(long, value_enum, value_delimiter = ',')]
            enable: Vec<SpecialFunction>,
            #[arg(long, value_enum, value_delimiter = ',')]
            disable: Vec<SpecialFunction>,
        },
        FlowControl { mode: FlowControlMode },
        TemperatureControl { mode: TemperatureControlMode },
        /// Enable or disable outdoor compensation.
        Ocv { switch: Switch },
        Language { language: Language },
        DaylightSavingTime { switch: Switch },
        /// Set the controller clock to the local time of this computer.
        SyncClock,
        /// Clear the active alarms.
        ResetAlarms,
        /// Start the VAV sensor calibration.
        CalibrateVav,
    }

    /// Change controller settings, on every given `--host`.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        device: device::Options,
        #[clap(flatten)]
        output: output::Args,
        #[command(subcommand)]
        change: Change,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not connect to the controller")]
        Connect(#[source] connection::Error),
        #[error("could not set up communication with the controller")]
        Initialize(#[source] device::Error),
        #[error("could not apply the change")]
        Apply(#[source] device::Error),
        #[error("could not output the results")]
        Output(#[source] output::Error),
        #[error("the change failed on {failed} out of {total} controllers")]
        Failed { failed: usize, total: usize },
    }

    #[derive(serde::Serialize)]
    struct Outcome<'a> {
        device: &'a str,
        ok: bool,
        result: &'a str,
    }

    pub async fn apply<T: connection::Transport>(
        device: &Device<T>,
        change: &Change,
    ) -> Result<(), device::Error> {
        let modes = device.modes();
        match change {
            Change::Ahu { switch } => modes.set_ahu_on((*switch).into()).await,
            Change::OperationMode { mode } => modes.set_operation_mode(*mode).await,
            Change::SupplyFlow { mode, value } => modes.mode(*mode)?.set_supply_flow(*value).await,
            Change::ExtractFlow { mode, value } => {
                modes.mode(*mode)?.set_extract_flow(*value).await
            }
            Change::Setpoint { mode, celsius } => {
                modes.mode(*mode)?.set_setpoint_temperature(*celsius).await
            }
            Change::SpecialFunctions { enable, disable } => {
                let enable = SpecialFunction::flags(enable);
                let disable = SpecialFunction::flags(disable);
                let flags = modes.special().update_configuration(enable, disable).await?;
                info!(message = "special mode functions", ?flags);
                Ok(())
            }
            Change::FlowControl { mode } => modes.set_flow_control_mode(*mode).await,
            Change::TemperatureControl { mode } => modes.set_temperature_control_mode(*mode).await,
            Change::Ocv { switch } => device.functions().set_ocv_enabled((*switch).into()).await,
            Change::Language { language } => device.settings().set_language(*language).await,
            Change::DaylightSavingTime { switch } => {
                device.settings().set_daylight_saving_time((*switch).into()).await
            }
            Change::SyncClock => device.settings().synchronize_clock().await.map(drop),
            Change::ResetAlarms => device.alarms().reset_active().await,
            Change::CalibrateVav => modes.start_vav_calibration().await,
        }
    }

    async fn apply_to(
        endpoint: Endpoint,
        options: &device::Options,
        change: &Change,
    ) -> Result<(), Error> {
        let connection = Connection::connect(endpoint).await.map_err(Error::Connect)?;
        let device = Device::initialize(connection, options).await.map_err(Error::Initialize)?;
        apply(&device, change).await.map_err(Error::Apply)?;
        if let Err(e) = device.transport().disconnect().await {
            tracing::debug!(message = "disconnect failed", error = (&e as &dyn std::error::Error));
        }
        Ok(())
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let endpoints = args.connection.endpoints().collect::<Vec<_>>();
        let results = futures::future::join_all(
            endpoints.iter().map(|endpoint| apply_to(endpoint.clone(), &args.device, &args.change)),
        )
        .await;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Device", "Result"]).map_err(Error::Output)?;
        let mut failed = 0;
        for (endpoint, result) in endpoints.iter().zip(&results) {
            let address = endpoint.address.as_str();
            let outcome = match result {
                Ok(()) => "ok".to_string(),
                Err(e) => {
                    failed += 1;
                    error!(message = "change failed", address, error = (e as &dyn std::error::Error));
                    error_chain(e)
                }
            };
            let record = || Outcome { device: address, ok: result.is_ok(), result: &outcome };
            output
                .result(|| vec![address.to_string(), outcome.clone()], record)
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)?;
        match failed {
            0 => Ok(()),
            failed => Err(Error::Failed { failed, total: endpoints.len() }),
        }
    }

    fn error_chain(error: &dyn std::error::Error) -> String {
        let mut message = error.to_string();
        let mut cause = error.source();
        while let Some(e) = cause {
            message.push_str(": ");
            message.push_str(&e.to_string());
            cause = e.source();
        }
        message
    }

}

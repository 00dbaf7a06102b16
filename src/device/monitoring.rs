use super::Error;
use super::modes::OperationMode;
use super::settings::FlowUnits;
use crate::connection::Transport;
use crate::registers::{DecodeError, RegisterCursor, register_enum, sentinel, tenths};

pub const REG_STATUS: u16 = 1999;
pub const REG_OPERATION_MODE: u16 = 2000;
pub const REG_SUPPLY_FLOW: u16 = 2001;
pub const REG_INTERNAL_SUPPLY_TEMPERATURE: u16 = 2023;
pub const REG_ENERGY_COUNTERS: u16 = 2199;
pub const REG_AIR_HEATER_OPERATION_ENERGY: u16 = 2221;

/// Registers between the live readings and the energy counters the driver does not use.
const RESERVED_REGISTERS: usize = 156;

/// The monitoring block spans registers 1999 through 2222.
pub const BLOCK_LENGTH: usize = (REG_AIR_HEATER_OPERATION_ENERGY - REG_STATUS) as usize + 2;

const NO_PERCENTAGE: u16 = 0xFF;
const NO_RECOVERY: u32 = 0xFFFF_FFFF;
const NO_TEMPERATURE: i16 = -0x8000;

register_enum! {
    pub enum C5Status {
        Stop = 0,
        EnabledNoFans = 1,
        Running = 2,
    }
}

register_enum! {
    pub enum AirQualitySensorType {
        #[strum(serialize = "co2")]
        #[serde(rename = "co2")]
        Co2 = 0,
        #[strum(serialize = "voc-q")]
        #[serde(rename = "voc-q")]
        VocQuality = 1,
        #[strum(serialize = "voc-p")]
        #[serde(rename = "voc-p")]
        VocPercentage = 2,
        #[strum(serialize = "rh")]
        #[serde(rename = "rh")]
        RelativeHumidity = 3,
        #[strum(serialize = "tmp")]
        #[serde(rename = "tmp")]
        Temperature = 4,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct AirQualitySensor {
    pub kind: AirQualitySensorType,
    /// Raw reading in the sensor's own unit (ppm, %, °C).
    pub value: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PanelSensor {
    /// °C
    pub temperature: f32,
    /// %RH
    pub humidity: u16,
}

/// kWh counters of a single consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EnergyCounters {
    pub day: u32,
    pub month: u32,
    pub total: u32,
}

impl EnergyCounters {
    fn decode(cursor: &mut RegisterCursor, field: &'static str) -> Result<Self, DecodeError> {
        Ok(Self { day: cursor.u32(field)?, month: cursor.u32(field)?, total: cursor.u32(field)? })
    }
}

/// Live readings of the unit.
///
/// Temperatures are in °C, levels in percent, flows in the configured flow units, pressures in Pa
/// and power in W.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MonitoringState {
    pub status: C5Status,
    pub operation_mode: OperationMode,
    pub supply_flow: f64,
    pub extract_flow: f64,
    pub supply_temperature: f32,
    pub extract_temperature: f32,
    pub outdoor_temperature: f32,
    pub exhaust_temperature: f32,
    pub return_water_temperature: f32,
    pub supply_pressure: u16,
    pub extract_pressure: u16,
    pub supply_fan_level: f32,
    pub extract_fan_level: f32,
    pub heat_exchanger_level: f32,
    pub electric_heater_level: f32,
    pub water_heater_level: f32,
    pub water_cooler_level: f32,
    pub dx_unit_level: f32,
    pub heat_exchanger_efficiency: Option<u16>,
    pub energy_saving: Option<u16>,
    pub heat_exchanger_recovery: Option<u32>,
    pub internal_supply_temperature: Option<f32>,
    pub air_quality_sensor1: AirQualitySensor,
    pub air_quality_sensor2: AirQualitySensor,
    pub indoor_humidity: u16,
    pub panel1: PanelSensor,
    pub panel2: PanelSensor,
    pub fire_alarm: bool,
    pub external_stop: bool,
    pub override_active: bool,
    pub boost_active: bool,
    pub supply_filter_clogging: u16,
    pub extract_filter_clogging: u16,
    pub supply_fan_power: u16,
    pub extract_fan_power: u16,
    pub heater_power: u16,
    /// W per m³/h
    pub specific_power_input: f32,
    pub fans_energy: EnergyCounters,
    pub heater_energy: EnergyCounters,
    pub recovered_energy: EnergyCounters,
    /// h
    pub ahu_operation_time: u32,
    /// h
    pub air_heater_operation_time: u32,
    /// kWh
    pub air_heater_energy: u32,
}

impl MonitoringState {
    pub fn decode(words: &[u16], flow_units: FlowUnits) -> Result<Self, DecodeError> {
        let mut c = RegisterCursor::new(REG_STATUS, words);
        let factor = flow_units.common_factor();
        let state = Self {
            status: c.enumeration("status")?,
            operation_mode: c.enumeration("operation_mode")?,
            supply_flow: f64::from(c.u32("supply_flow")?) * factor,
            extract_flow: f64::from(c.u32("extract_flow")?) * factor,
            supply_temperature: c.tenths_i16("supply_temperature")?,
            extract_temperature: c.tenths_i16("extract_temperature")?,
            outdoor_temperature: c.tenths_i16("outdoor_temperature")?,
            exhaust_temperature: c.tenths_i16("exhaust_temperature")?,
            return_water_temperature: c.tenths_i16("return_water_temperature")?,
            supply_pressure: c.u16("supply_pressure")?,
            extract_pressure: c.u16("extract_pressure")?,
            supply_fan_level: c.tenths_u16("supply_fan_level")?,
            extract_fan_level: c.tenths_u16("extract_fan_level")?,
            heat_exchanger_level: c.tenths_u16("heat_exchanger_level")?,
            electric_heater_level: c.tenths_u16("electric_heater_level")?,
            water_heater_level: c.tenths_u16("water_heater_level")?,
            water_cooler_level: c.tenths_u16("water_cooler_level")?,
            dx_unit_level: c.tenths_u16("dx_unit_level")?,
            heat_exchanger_efficiency: sentinel(
                c.u16("heat_exchanger_efficiency")?,
                NO_PERCENTAGE,
            ),
            energy_saving: sentinel(c.u16("energy_saving")?, NO_PERCENTAGE),
            heat_exchanger_recovery: sentinel(c.u32("heat_exchanger_recovery")?, NO_RECOVERY),
            internal_supply_temperature: sentinel(
                c.i16("internal_supply_temperature")?,
                NO_TEMPERATURE,
            )
            .map(tenths),
            air_quality_sensor1: AirQualitySensor {
                kind: c.enumeration("air_quality_sensor1.type")?,
                value: c.u16("air_quality_sensor1.value")?,
            },
            air_quality_sensor2: AirQualitySensor {
                kind: c.enumeration("air_quality_sensor2.type")?,
                value: c.u16("air_quality_sensor2.value")?,
            },
            indoor_humidity: c.u16("indoor_humidity")?,
            panel1: PanelSensor {
                temperature: c.tenths_i16("panel1.temperature")?,
                humidity: c.u16("panel1.humidity")?,
            },
            panel2: PanelSensor {
                temperature: c.tenths_i16("panel2.temperature")?,
                humidity: c.u16("panel2.humidity")?,
            },
            fire_alarm: c.bool("fire_alarm")?,
            external_stop: c.bool("external_stop")?,
            override_active: c.bool("override")?,
            boost_active: c.bool("boost")?,
            supply_filter_clogging: c.u16("supply_filter_clogging")?,
            extract_filter_clogging: c.u16("extract_filter_clogging")?,
            supply_fan_power: c.u16("supply_fan_power")?,
            extract_fan_power: c.u16("extract_fan_power")?,
            heater_power: c.u16("heater_power")?,
            specific_power_input: f32::from(c.u16("specific_power_input")?) / 1000.0,
            fans_energy: {
                c.skip(RESERVED_REGISTERS, "reserved")?;
                EnergyCounters::decode(&mut c, "fans_energy")?
            },
            heater_energy: EnergyCounters::decode(&mut c, "heater_energy")?,
            recovered_energy: EnergyCounters::decode(&mut c, "recovered_energy")?,
            ahu_operation_time: c.u32("ahu_operation_time")?,
            air_heater_operation_time: c.u32("air_heater_operation_time")?,
            air_heater_energy: c.u32("air_heater_energy")?,
        };
        c.finish("monitoring")?;
        Ok(state)
    }
}

/// Access to the read-only monitoring block.
pub struct Monitoring<'a, T> {
    transport: &'a T,
}

impl<'a, T: Transport> Monitoring<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Flows are scaled according to `flow_units`, which should match the controller settings.
    pub async fn read_all(&self, flow_units: FlowUnits) -> Result<MonitoringState, Error> {
        let words =
            self.transport.read_many(REG_STATUS, BLOCK_LENGTH).await.map_err(Error::Transport)?;
        MonitoringState::decode(&words, flow_units).map_err(Error::Decode)
    }

    pub async fn status(&self) -> Result<C5Status, Error> {
        let value = self.transport.read_u16(REG_STATUS).await.map_err(Error::Transport)?;
        crate::registers::decode_enum(value, "status", REG_STATUS).map_err(Error::Decode)
    }
}

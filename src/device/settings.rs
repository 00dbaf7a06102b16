use super::{Error, RegisterSet};
use crate::connection::Transport;
use crate::registers::{
    DecodeError, RegisterCursor, RegisterEnum, decode_enum, pack_u8_pair, register_enum,
};
use std::net::Ipv4Addr;
use tracing::info;

pub const REG_TIME: u16 = 449;
pub const REG_SECONDS: u16 = 450;
pub const REG_DAY_OF_WEEK: u16 = 451;
pub const REG_DATE: u16 = 452;
pub const REG_YEAR: u16 = 453;
pub const REG_LANGUAGE: u16 = 454;
pub const REG_MODBUS_ADDRESS: u16 = 455;
pub const REG_IP_ADDRESS: u16 = 456;
pub const REG_FLOW_UNITS: u16 = 458;
pub const REG_SERIAL_NUMBER: u16 = 459;
pub const REG_NAME: u16 = 467;
pub const REG_IP_MASK: u16 = 479;
pub const REG_RS485: u16 = 481;
pub const REG_DAYLIGHT_SAVING_TIME: u16 = 482;
pub const REG_BACNET_PORT: u16 = 484;
pub const REG_BACNET_ID: u16 = 485;

const SERIAL_NUMBER_REGISTERS: usize = 8;
const NAME_REGISTERS: usize = 12;

/// Number of registers in the settings block for the given register set.
pub fn block_length(register_set: RegisterSet) -> usize {
    let end = match register_set {
        RegisterSet::Basic => REG_IP_MASK - 1,
        RegisterSet::Extended => REG_BACNET_ID + 1,
    };
    usize::from(end - REG_TIME) + 1
}

register_enum! {
    /// Units the controller uses for flow setpoints and readings.
    pub enum FlowUnits {
        CubicMetersPerHour = 0,
        LitersPerSecond = 1,
        CubicMetersPerSecond = 2,
        Pascal = 3,
    }
}

impl FlowUnits {
    /// Multiplier applied to raw flow registers.
    ///
    /// In m³/s mode the controller reports flows with a granularity of a thousandth.
    pub fn common_factor(self) -> f64 {
        match self {
            FlowUnits::CubicMetersPerSecond => 1e-3,
            _ => 1.0,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            FlowUnits::CubicMetersPerHour => "m³/h",
            FlowUnits::LitersPerSecond => "L/s",
            FlowUnits::CubicMetersPerSecond => "m³/s",
            FlowUnits::Pascal => "Pa",
        }
    }
}

register_enum! {
    pub enum Language {
        English = 0,
        Lithuanian = 1,
        Russian = 2,
        Polish = 3,
        German = 4,
    }
}

register_enum! {
    pub enum Rs485Speed {
        S9600 = 0,
        S19200 = 1,
        S38400 = 2,
        S57600 = 3,
    }
}

impl Rs485Speed {
    pub fn baud_rate(self) -> u32 {
        match self {
            Rs485Speed::S9600 => 9600,
            Rs485Speed::S19200 => 19200,
            Rs485Speed::S38400 => 38400,
            Rs485Speed::S57600 => 57600,
        }
    }
}

register_enum! {
    pub enum Parity {
        None = 0,
        Even = 1,
    }
}

/// Serial line parameters of the controller's RS-485 port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Rs485 {
    pub speed: Rs485Speed,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Rs485 {
    /// Bit 0 holds the number of stop bits less one, bit 1 the parity and bits 3-4 the speed.
    pub fn from_register(raw: u16, address: u16) -> Result<Self, DecodeError> {
        let stop_bits = (raw & 0b0_0001) as u8 + 1;
        let parity = decode_enum((raw & 0b0_0010) >> 1, "rs485.parity", address)?;
        let speed = decode_enum((raw & 0b1_1000) >> 3, "rs485.speed", address)?;
        Ok(Self { speed, parity, stop_bits })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SettingsState {
    pub datetime: jiff::civil::DateTime,
    pub language: Language,
    pub modbus_address: u16,
    pub ip_address: Ipv4Addr,
    pub flow_units: FlowUnits,
    pub serial_number: String,
    pub name: String,
    // Extended register set only.
    pub ip_mask: Option<Ipv4Addr>,
    pub rs485: Option<Rs485>,
    pub daylight_saving_time: Option<bool>,
    pub bacnet_port: Option<u16>,
    pub bacnet_id: Option<u32>,
}

impl SettingsState {
    pub fn decode(words: &[u16], register_set: RegisterSet) -> Result<Self, DecodeError> {
        let mut cursor = RegisterCursor::new(REG_TIME, words);
        let time = cursor.time(true, "time")?;
        cursor.skip(1, "day_of_week")?;
        let date = cursor.date("date")?;
        let language = cursor.enumeration("language")?;
        let modbus_address = cursor.u16("modbus_address")?;
        let ip_address = cursor.ipv4("ip_address")?;
        let flow_units = cursor.enumeration("flow_units")?;
        let serial_number = cursor.string(SERIAL_NUMBER_REGISTERS, "serial_number")?;
        let name = cursor.string(NAME_REGISTERS, "name")?;
        let mut state = SettingsState {
            datetime: date.to_datetime(time),
            language,
            modbus_address,
            ip_address,
            flow_units,
            serial_number,
            name,
            ip_mask: None,
            rs485: None,
            daylight_saving_time: None,
            bacnet_port: None,
            bacnet_id: None,
        };
        if register_set.is_extended() {
            state.ip_mask = Some(cursor.ipv4("ip_mask")?);
            let address = cursor.address();
            state.rs485 = Some(Rs485::from_register(cursor.u16("rs485")?, address)?);
            state.daylight_saving_time = Some(cursor.bool("daylight_saving_time")?);
            // Undocumented.
            cursor.skip(1, "reserved")?;
            state.bacnet_port = Some(cursor.u16("bacnet_port")?);
            state.bacnet_id = Some(cursor.u32("bacnet_id")?);
        }
        cursor.finish("settings")?;
        Ok(state)
    }
}

/// Access to the controller settings block (registers 449 and onwards).
pub struct Settings<'a, T> {
    transport: &'a T,
    register_set: RegisterSet,
}

impl<'a, T: Transport> Settings<'a, T> {
    pub fn new(transport: &'a T, register_set: RegisterSet) -> Self {
        Self { transport, register_set }
    }

    pub async fn read_all(&self) -> Result<SettingsState, Error> {
        let words = self
            .transport
            .read_many(REG_TIME, block_length(self.register_set))
            .await
            .map_err(Error::Transport)?;
        SettingsState::decode(&words, self.register_set).map_err(Error::Decode)
    }

    pub async fn read_flow_units(&self) -> Result<FlowUnits, Error> {
        let value = self.transport.read_u16(REG_FLOW_UNITS).await.map_err(Error::Transport)?;
        decode_enum(value, "flow_units", REG_FLOW_UNITS).map_err(Error::Decode)
    }

    pub async fn set_time(&self, time: jiff::civil::Time) -> Result<(), Error> {
        let hour_minute = pack_u8_pair(time.hour() as u8, time.minute() as u8);
        let values = [hour_minute, time.second() as u16];
        self.transport.write_holdings(REG_TIME, &values).await.map_err(Error::Transport)
    }

    pub async fn set_date(&self, date: jiff::civil::Date) -> Result<(), Error> {
        let month_day = pack_u8_pair(date.month() as u8, date.day() as u8);
        let year = u16::try_from(date.year())
            .map_err(|_| Error::InvalidValue("date", date.to_string()))?;
        let values = [month_day, year];
        self.transport.write_holdings(REG_DATE, &values).await.map_err(Error::Transport)
    }

    /// Set the controller clock to the current local time of this host.
    pub async fn synchronize_clock(&self) -> Result<jiff::civil::DateTime, Error> {
        let now = jiff::Timestamp::now().to_zoned(jiff::tz::TimeZone::system()).datetime();
        info!(message = "synchronizing clock", %now);
        self.set_date(now.date()).await?;
        self.set_time(now.time()).await?;
        Ok(now)
    }

    pub async fn set_language(&self, language: Language) -> Result<(), Error> {
        self.transport
            .write_u16(REG_LANGUAGE, language.to_register())
            .await
            .map_err(Error::Transport)
    }

    pub async fn set_daylight_saving_time(&self, enabled: bool) -> Result<(), Error> {
        if !self.register_set.is_extended() {
            return Err(Error::Unsupported("daylight saving time"));
        }
        self.transport
            .write_u16(REG_DAYLIGHT_SAVING_TIME, enabled.into())
            .await
            .map_err(Error::Transport)
    }
}

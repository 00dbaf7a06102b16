use super::Error;
use super::alarm_codes::{code_str, message_for_code};
use crate::connection::Transport;
use crate::registers::{DecodeError, RegisterCursor, date_from_parts, narrow};

pub const REG_ACTIVE_COUNT: u16 = 999;
pub const REG_ACTIVE_CODES: u16 = 1000;
pub const REG_HISTORY_COUNT: u16 = 1099;
pub const REG_HISTORY_ENTRIES: u16 = 1100;

pub const MAX_ACTIVE: u16 = 10;
pub const MAX_HISTORY: u16 = 50;
const HISTORY_ENTRY_REGISTERS: usize = 5;

/// Writing this value to [`REG_ACTIVE_COUNT`] acknowledges and clears the active alarms.
const RESET_ACTIVE: u16 = 0x99C5;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Alarm {
    pub code: u16,
    pub message: &'static str,
}

impl Alarm {
    pub fn lookup(code: u16) -> Self {
        Self { code, message: message_for_code(code) }
    }

    /// The code as it is shown on the control panel, e.g. `5A`.
    pub fn code_str(&self) -> String {
        code_str(self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AlarmHistoryEntry {
    pub alarm: Alarm,
    pub timestamp: jiff::civil::DateTime,
}

impl AlarmHistoryEntry {
    /// Year, month/day, hour/minute, second and the alarm code.
    fn decode(cursor: &mut RegisterCursor) -> Result<Self, DecodeError> {
        let address = cursor.address();
        let year = narrow(cursor.u16("history.year")?, "history.year", address)?;
        let date_address = cursor.address();
        let (month, day) = cursor.u8_pair("history.date")?;
        let date = date_from_parts(year, month, day, "history.date", date_address)?;
        let time = cursor.time(true, "history.time")?;
        let code = cursor.u16("history.code")?;
        Ok(Self { alarm: Alarm::lookup(code), timestamp: date.to_datetime(time) })
    }
}

fn check_count(count: u16, max: u16, field: &'static str, address: u16) -> Result<u16, Error> {
    if count > max {
        return Err(Error::Decode(DecodeError::CountOutOfRange { field, address, count, max }));
    }
    Ok(count)
}

pub struct Alarms<'a, T> {
    transport: &'a T,
}

impl<'a, T: Transport> Alarms<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    pub async fn read_active(&self) -> Result<Vec<Alarm>, Error> {
        let count = self.transport.read_u16(REG_ACTIVE_COUNT).await.map_err(Error::Transport)?;
        let count = check_count(count, MAX_ACTIVE, "active_alarms", REG_ACTIVE_COUNT)?;
        let words = self
            .transport
            .read_many(REG_ACTIVE_CODES, count.into())
            .await
            .map_err(Error::Transport)?;
        Ok(words.into_iter().map(Alarm::lookup).collect())
    }

    pub async fn reset_active(&self) -> Result<(), Error> {
        self.transport.write_u16(REG_ACTIVE_COUNT, RESET_ACTIVE).await.map_err(Error::Transport)
    }

    pub async fn read_history(&self) -> Result<Vec<AlarmHistoryEntry>, Error> {
        let count = self.transport.read_u16(REG_HISTORY_COUNT).await.map_err(Error::Transport)?;
        let count = check_count(count, MAX_HISTORY, "alarm_history", REG_HISTORY_COUNT)?;
        let words = self
            .transport
            .read_many(REG_HISTORY_ENTRIES, usize::from(count) * HISTORY_ENTRY_REGISTERS)
            .await
            .map_err(Error::Transport)?;
        let mut cursor = RegisterCursor::new(REG_HISTORY_ENTRIES, &words);
        let entries = (0..count)
            .map(|_| AlarmHistoryEntry::decode(&mut cursor))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::Decode)?;
        cursor.finish("alarm_history").map_err(Error::Decode)?;
        Ok(entries)
    }
}

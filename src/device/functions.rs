use super::Error;
use crate::connection::Transport;
use crate::registers::{DecodeError, RegisterCursor};

pub const REG_AQC_SETPOINT1: u16 = 500;
pub const REG_AQC_MODE1: u16 = 501;
pub const REG_AQC_SETPOINT2: u16 = 502;
pub const REG_AQC_MODE2: u16 = 503;
pub const REG_OCV_ENABLED: u16 = 504;

const BLOCK_LENGTH: usize = (REG_OCV_ENABLED - REG_AQC_SETPOINT1) as usize + 1;

/// Air quality control and outdoor compensation settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FunctionsState {
    pub air_quality_setpoint1: u16,
    pub air_quality_mode1: u16,
    pub air_quality_setpoint2: u16,
    pub air_quality_mode2: u16,
    pub ocv_enabled: bool,
}

impl FunctionsState {
    pub fn decode(words: &[u16]) -> Result<Self, DecodeError> {
        let mut cursor = RegisterCursor::new(REG_AQC_SETPOINT1, words);
        let state = Self {
            air_quality_setpoint1: cursor.u16("air_quality_setpoint1")?,
            air_quality_mode1: cursor.u16("air_quality_mode1")?,
            air_quality_setpoint2: cursor.u16("air_quality_setpoint2")?,
            air_quality_mode2: cursor.u16("air_quality_mode2")?,
            ocv_enabled: cursor.bool("ocv_enabled")?,
        };
        cursor.finish("functions")?;
        Ok(state)
    }
}

pub struct Functions<'a, T> {
    transport: &'a T,
}

impl<'a, T: Transport> Functions<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    pub async fn read_all(&self) -> Result<FunctionsState, Error> {
        let words = self
            .transport
            .read_many(REG_AQC_SETPOINT1, BLOCK_LENGTH)
            .await
            .map_err(Error::Transport)?;
        FunctionsState::decode(&words).map_err(Error::Decode)
    }

    pub async fn set_ocv_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.transport.write_u16(REG_OCV_ENABLED, enabled.into()).await.map_err(Error::Transport)
    }
}

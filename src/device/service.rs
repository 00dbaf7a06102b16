use super::Error;
use crate::connection::Transport;

pub const REG_FIRMWARE_VERSION: u16 = 18003;

pub struct Service<'a, T> {
    transport: &'a T,
}

impl<'a, T: Transport> Service<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    pub async fn read_firmware_version(&self) -> Result<u16, Error> {
        self.transport.read_u16(REG_FIRMWARE_VERSION).await.map_err(Error::Transport)
    }
}

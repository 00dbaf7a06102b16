//! Modbus TCP driver for Komfovent C5 air handling unit controllers.

pub mod commands;
pub mod connection;
pub mod device;
pub mod modbus;
pub mod output;
pub mod registers;

#[cfg(test)]
mod testing;

/// Broad classification of failures, for deciding how to react to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection could not be established or was lost.
    Connection,
    /// Connecting or a request round trip took too long.
    Timeout,
    /// The controller rejected a request or answered with something unexpected.
    Protocol,
    /// Register contents do not match the expected layout, often due to a firmware mismatch.
    Decoding,
    /// The operation is not applicable to this controller or the arguments are invalid.
    Usage,
}

impl ErrorKind {
    /// Retrying after a reconnect may help.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::Timeout)
    }
}

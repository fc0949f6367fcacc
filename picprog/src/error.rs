//! Error types for picprog.

use std::io;
use thiserror::Error;

/// Result type for picprog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for picprog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The programmer did not answer the handshake as expected.
    #[error("Couldn't connect to the programmer: {0}")]
    Connection(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device ID read back from the target is not in the device table.
    #[error("MCU not recognized (device ID {0:#06x})")]
    DeviceNotRecognized(u16),

    /// Bulk erase was not acknowledged.
    #[error("Couldn't erase the chip (programmer answered {0:#04x})")]
    EraseFailed(u8),

    /// The programmer echoed a malformed frame.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Malformed Intel HEX input.
    #[error("Invalid HEX file at line {line}: {message}")]
    InvalidHex {
        /// 1-based line number of the offending record.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error means the programmer link itself is unusable.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(_) | Self::Connection(_) | Self::Timeout(_) => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }
}

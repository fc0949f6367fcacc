//! Port abstraction for the programmer's serial link.
//!
//! The session never touches a serial handle directly. Everything goes
//! through the [`Port`] trait so the protocol engine can be driven by the
//! native `serialport` backend or by an in-memory device in tests.
//!
//! ```text
//! +------------------+
//! |  Session / codec |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |    Port trait    |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | NativePort       |
//! |  (serialport)    |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use picprog::port::Port;
//!
//! fn hello<P: Port>(port: &mut P) -> picprog::Result<u8> {
//!     port.write_all_bytes(b"HX")?;
//!     port.read_byte()
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Baud rate spoken by the programmer firmware.
pub const DEFAULT_BAUD: u32 = 38400;

/// Serial timeout used when no read timeout is configured.
///
/// The programmer protocol has no timeouts of its own; a day is as close to
/// "block forever" as every serial backend accepts.
pub const BLOCKING_READ_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default serial port for the current platform.
#[cfg(windows)]
pub const DEFAULT_PORT: &str = "COM3";

/// Default serial port for the current platform.
#[cfg(not(windows))]
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout. `None` blocks until the requested bytes arrive.
    pub timeout: Option<Duration>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD,
            timeout: None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Timeout handed to the serial backend.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(BLOCKING_READ_TIMEOUT)
    }
}

/// Byte-stream transport to the programmer.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard any bytes received but not yet read.
    fn clear_input(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    /// Read exactly one byte.
    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_bytes(&mut buf)?;
        Ok(buf[0])
    }

    /// Fill `buf` completely, blocking until every byte has arrived.
    fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "port closed while reading",
                    )));
                },
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(Error::Timeout(format!(
                        "waited {:?} for {} more byte(s)",
                        self.timeout(),
                        buf.len() - filled
                    )));
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out at most `chunk` bytes per read call.
    struct ChunkedPort {
        data: VecDeque<u8>,
        chunk: usize,
    }

    impl Read for ChunkedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.data.is_empty() {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.chunk).min(self.data.len());
            for b in buf.iter_mut().take(n) {
                *b = self.data.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ChunkedPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for ChunkedPort {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(10)
        }
        fn baud_rate(&self) -> u32 {
            DEFAULT_BAUD
        }
        fn clear_input(&mut self) -> Result<()> {
            self.data.clear();
            Ok(())
        }
        fn name(&self) -> &str {
            "chunked"
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_exact_bytes_across_short_reads() {
        let mut port = ChunkedPort {
            data: b"R000000X".iter().copied().collect(),
            chunk: 3,
        };
        let mut buf = [0u8; 8];
        port.read_exact_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"R000000X");
    }

    #[test]
    fn test_read_byte_timeout() {
        let mut port = ChunkedPort {
            data: VecDeque::new(),
            chunk: 1,
        };
        assert!(matches!(port.read_byte(), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.port_name, DEFAULT_PORT);
        assert!(config.timeout.is_none());
        assert_eq!(config.effective_timeout(), BLOCKING_READ_TIMEOUT);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyUSB0", 9600)
            .with_timeout(Some(Duration::from_secs(5)));

        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.effective_timeout(), Duration::from_secs(5));
    }
}

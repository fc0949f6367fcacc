//! # picprog
//!
//! A library for programming PIC18 microcontrollers through a serial-attached
//! Arduino programmer.
//!
//! This crate provides:
//!
//! - The programmer's ASCII-hex frame codec
//! - Intel HEX image loading
//! - The device table and PIC18 memory map
//! - A programming session: erase, write, verify, fuses
//!
//! ## Supported Devices
//!
//! PIC18F2455, PIC18F2550, PIC18F4455, PIC18F4550, PIC18F2420, PIC18F2520,
//! PIC18F4420 and PIC18F4520.
//!
//! ## Features
//!
//! - `native` (default): Serial port support via the `serialport` crate
//! - `serde`: Serialization support for reports and data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use picprog::{HexImage, SerialConfig, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = HexImage::from_file("firmware.hex")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let serial = SerialConfig::new("/dev/ttyACM0", 38400);
//!         let mut session = picprog::open_session(&serial, SessionConfig::default())?;
//!         let report = session.run(Some(&image), &mut |state, current, total| {
//!             println!("{state}: {current}/{total}");
//!         })?;
//!         println!("Programmed {} windows", report.windows_written());
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
#[cfg(feature = "native")]
pub use session::open_session;
pub use {
    error::{Error, Result},
    image::{HexImage, SourceImage},
    port::{Port, SerialConfig},
    protocol::{AddressWidth, Frame, ReadResponse, ReadResponseDecoder},
    session::{
        Mismatch, RegionReport, Session, SessionConfig, SessionReport, SessionState, VerifyOutcome,
    },
    target::{DeviceDescriptor, DeviceTable, KNOWN_DEVICES, MemoryRegion},
};

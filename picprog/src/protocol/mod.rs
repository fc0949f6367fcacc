//! Programmer wire protocol.

pub mod frame;
pub mod response;

// Re-export common types
pub use frame::{AddressWidth, Frame, Opcode, TERMINATOR};
pub use response::{ReadResponse, ReadResponseDecoder};

/// Byte the programmer sends back to a successful handshake.
pub const HANDSHAKE_ACK: u8 = b'H';

/// Byte the programmer sends back to a successful erase.
pub const ERASE_ACK: u8 = Opcode::Ack as u8;

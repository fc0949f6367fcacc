//! Command frames for the Arduino programmer firmware.
//!
//! ## Frame Format
//!
//! ```text
//! +--------+----------------------------+------------+
//! | Opcode |        Hex payload         | Terminator |
//! +--------+----------------------------+------------+
//! | 1 char | even number of hex digits  |    'X'     |
//! +--------+----------------------------+------------+
//! ```
//!
//! | Frame      | Payload                                   |
//! |------------|-------------------------------------------|
//! | `HX`       | none (handshake)                          |
//! | `DX`       | none (device ID query)                    |
//! | `EX`       | none (bulk erase)                         |
//! | `W...X`    | address (4 or 6 digits) + data bytes      |
//! | `R...X`    | address (always 6 digits)                 |
//! | `C...X`    | fuse index (1+ digits) + value (2 digits) |
//!
//! Flash writes carry a 4-digit address while every other address on the
//! wire, flash reads included, is 6 digits wide. The programmer firmware
//! depends on this, so the width is an explicit [`AddressWidth`] on writes.

use std::fmt;

use crate::error::{Error, Result};

/// Frame terminator.
pub const TERMINATOR: u8 = b'X';

/// Protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Handshake, answered with `H`.
    Handshake = b'H',
    /// Device ID query, answered with two raw bytes.
    DeviceId = b'D',
    /// Bulk erase, answered with `K`.
    Erase = b'E',
    /// Memory write.
    Write = b'W',
    /// Memory read, echoed back as an `R` frame.
    Read = b'R',
    /// Configuration (fuse) byte write.
    Config = b'C',
    /// Success acknowledgement.
    Ack = b'K',
}

impl Opcode {
    /// Map a raw byte to an opcode (case-insensitive).
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte.to_ascii_uppercase() {
            b'H' => Some(Self::Handshake),
            b'D' => Some(Self::DeviceId),
            b'E' => Some(Self::Erase),
            b'W' => Some(Self::Write),
            b'R' => Some(Self::Read),
            b'C' => Some(Self::Config),
            b'K' => Some(Self::Ack),
            _ => None,
        }
    }

    /// The opcode byte as sent on the wire.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Number of hex digits used for an address field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
    /// 4 digits (flash writes only).
    Short,
    /// 6 digits (everything else, including all reads).
    Long,
}

impl AddressWidth {
    /// Digit count.
    pub fn digits(self) -> usize {
        match self {
            Self::Short => 4,
            Self::Long => 6,
        }
    }

    /// Largest address representable at this width.
    pub fn max_address(self) -> u32 {
        match self {
            Self::Short => 0xFFFF,
            Self::Long => 0xFF_FFFF,
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `HX`.
    Handshake,
    /// `DX`.
    DeviceIdQuery,
    /// `EX`.
    Erase,
    /// `W` + address + data + `X`.
    Write {
        /// Absolute target address.
        address: u32,
        /// Address field width.
        width: AddressWidth,
        /// Bytes to program.
        data: Vec<u8>,
    },
    /// `R` + 6-digit address + `X`.
    Read {
        /// Absolute address of the window to read back.
        address: u32,
    },
    /// `C` + index + value + `X`.
    FuseWrite {
        /// Fuse index (0..15).
        index: u8,
        /// Desired value.
        value: u8,
    },
}

impl Frame {
    /// Build a write frame.
    pub fn write(address: u32, width: AddressWidth, data: &[u8]) -> Self {
        Self::Write {
            address,
            width,
            data: data.to_vec(),
        }
    }

    /// Build a read frame.
    pub fn read(address: u32) -> Self {
        Self::Read { address }
    }

    /// Build a fuse write frame.
    pub fn fuse_write(index: u8, value: u8) -> Self {
        Self::FuseWrite { index, value }
    }

    /// The frame's opcode.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Handshake => Opcode::Handshake,
            Self::DeviceIdQuery => Opcode::DeviceId,
            Self::Erase => Opcode::Erase,
            Self::Write { .. } => Opcode::Write,
            Self::Read { .. } => Opcode::Read,
            Self::FuseWrite { .. } => Opcode::Config,
        }
    }

    /// Encode the frame to its wire bytes (uppercase ASCII).
    ///
    /// Address bits beyond the field width are truncated, matching what the
    /// firmware would parse.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = String::with_capacity(self.encoded_len());
        buf.push(char::from(self.opcode().byte()));

        match self {
            Self::Handshake | Self::DeviceIdQuery | Self::Erase => {},
            Self::Write {
                address,
                width,
                data,
            } => {
                push_hex(&mut buf, address & width.max_address(), width.digits());
                for byte in data {
                    push_hex(&mut buf, u32::from(*byte), 2);
                }
            },
            Self::Read { address } => {
                let width = AddressWidth::Long;
                push_hex(&mut buf, address & width.max_address(), width.digits());
            },
            Self::FuseWrite { index, value } => {
                push_hex(&mut buf, u32::from(*index), 1);
                push_hex(&mut buf, u32::from(*value), 2);
            },
        }

        buf.push(char::from(TERMINATOR));
        buf.into_bytes()
    }

    fn encoded_len(&self) -> usize {
        2 + match self {
            Self::Handshake | Self::DeviceIdQuery | Self::Erase => 0,
            Self::Write { width, data, .. } => width.digits() + data.len() * 2,
            Self::Read { .. } => 6,
            Self::FuseWrite { .. } => 3,
        }
    }

    /// Decode an encoded frame.
    ///
    /// `width` is the address width to assume for `W` frames; the wire format
    /// does not carry it. Hex digits are accepted in either case.
    pub fn decode(bytes: &[u8], width: AddressWidth) -> Result<Self> {
        let (&first, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Framing("empty frame".into()))?;
        let opcode = Opcode::from_byte(first)
            .ok_or_else(|| Error::Framing(format!("unknown opcode {:?}", char::from(first))))?;
        let payload = match rest.split_last() {
            Some((&TERMINATOR, payload)) => payload,
            Some((&b'x', payload)) => payload,
            _ => return Err(Error::Framing("missing terminator".into())),
        };

        match opcode {
            Opcode::Handshake | Opcode::DeviceId | Opcode::Erase => {
                if !payload.is_empty() {
                    return Err(Error::Framing(format!(
                        "unexpected payload on {opcode:?} frame"
                    )));
                }
                Ok(match opcode {
                    Opcode::Handshake => Self::Handshake,
                    Opcode::DeviceId => Self::DeviceIdQuery,
                    _ => Self::Erase,
                })
            },
            Opcode::Write => {
                let (address, data) = split_address(payload, width.digits())?;
                Ok(Self::Write {
                    address,
                    width,
                    data: parse_hex_bytes(data)?,
                })
            },
            Opcode::Read => {
                let (address, data) = split_address(payload, AddressWidth::Long.digits())?;
                if !data.is_empty() {
                    return Err(Error::Framing("trailing bytes after read address".into()));
                }
                Ok(Self::Read { address })
            },
            Opcode::Config => {
                if payload.len() < 3 {
                    return Err(Error::Framing("fuse frame too short".into()));
                }
                let (index, value) = payload.split_at(payload.len() - 2);
                let index = parse_hex(index)?;
                let index = u8::try_from(index)
                    .map_err(|_| Error::Framing(format!("fuse index {index:#x} out of range")))?;
                // Two digits always fit in a byte
                let value = (parse_hex(value)? & 0xFF) as u8;
                Ok(Self::FuseWrite { index, value })
            },
            Opcode::Ack => Err(Error::Framing("acknowledgement is not a command frame".into())),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.encode()))
    }
}

/// Append `value` as `digits` uppercase hex digits (more if it does not fit).
fn push_hex(buf: &mut String, value: u32, digits: usize) {
    use std::fmt::Write as _;
    // Writing to a String cannot fail
    let _ = write!(buf, "{value:0digits$X}");
}

/// Parse an ASCII hex field (case-insensitive).
pub(crate) fn parse_hex(field: &[u8]) -> Result<u32> {
    if field.is_empty() || field.len() > 8 {
        return Err(Error::Framing(format!(
            "bad hex field length {}",
            field.len()
        )));
    }
    field
        .iter()
        .try_fold(0u32, |acc, &c| {
            char::from(c)
                .to_digit(16)
                .map(|d| (acc << 4) | d)
        })
        .ok_or_else(|| {
            Error::Framing(format!(
                "invalid hex field {:?}",
                String::from_utf8_lossy(field)
            ))
        })
}

/// Parse pairs of hex digits into bytes.
pub(crate) fn parse_hex_bytes(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % 2 != 0 {
        return Err(Error::Framing("odd number of hex digits".into()));
    }
    data.chunks_exact(2)
        .map(|pair| parse_hex(pair).map(|v| (v & 0xFF) as u8))
        .collect()
}

/// Split a fixed-width address off the front of a payload.
pub(crate) fn split_address(payload: &[u8], digits: usize) -> Result<(u32, &[u8])> {
    if payload.len() < digits {
        return Err(Error::Framing(format!(
            "payload shorter than {digits}-digit address"
        )));
    }
    let (address, rest) = payload.split_at(digits);
    Ok((parse_hex(address)?, rest))
}

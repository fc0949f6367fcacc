//! Intel HEX images as produced by PIC18 toolchains.
//!
//! ## Record Format
//!
//! ```text
//! +-----+-------+---------+------+--------------+----------+
//! | ':' | Count | Address | Type |     Data     | Checksum |
//! +-----+-------+---------+------+--------------+----------+
//! |  1  |   2   |    4    |  2   | 2 * Count    |    2     |
//! +-----+-------+---------+------+--------------+----------+
//! ```
//!
//! Supported record types: `00` data, `01` end of file, `02` extended
//! segment address, `04` extended linear address. `03` and `05` (start
//! addresses) carry nothing worth programming and are skipped.
//!
//! The checksum is the two's complement of the sum of all record bytes.
//! Later records overwrite earlier ones byte by byte.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::image::SourceImage;
use crate::target::region::{BLANK, FUSE_COUNT, FUSE_DEFAULTS, MemoryRegion};

/// Intel HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Data bytes.
    Data,
    /// End of file.
    EndOfFile,
    /// Extended segment address (bits 4..19).
    ExtendedSegmentAddress,
    /// Start segment address.
    StartSegmentAddress,
    /// Extended linear address (upper 16 bits).
    ExtendedLinearAddress,
    /// Start linear address.
    StartLinearAddress,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::EndOfFile),
            0x02 => Some(Self::ExtendedSegmentAddress),
            0x03 => Some(Self::StartSegmentAddress),
            0x04 => Some(Self::ExtendedLinearAddress),
            0x05 => Some(Self::StartLinearAddress),
            _ => None,
        }
    }
}

/// A parsed Intel HEX image, keyed by absolute byte address.
#[derive(Debug, Clone, Default)]
pub struct HexImage {
    bytes: BTreeMap<u32, u8>,
}

impl HexImage {
    /// Load and parse a HEX file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), text.len());
        Self::parse(&text)
    }

    /// Parse HEX text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut image = Self::default();
        let mut upper: u32 = 0;
        let mut saw_eof = false;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let record = raw.trim();
            if record.is_empty() {
                continue;
            }
            if saw_eof {
                return Err(invalid(line, "record after end-of-file"));
            }

            let bytes = decode_record(record).map_err(|message| invalid(line, message))?;
            let count = usize::from(bytes[0]);
            let offset = u32::from(u16::from_be_bytes([bytes[1], bytes[2]]));
            let kind = RecordType::from_u8(bytes[3])
                .ok_or_else(|| invalid(line, format!("unknown record type {:02X}", bytes[3])))?;
            let data = &bytes[4..4 + count];

            match kind {
                RecordType::Data => {
                    let base = upper.wrapping_add(offset);
                    trace!("Data record: {count} bytes at {base:#08X}");
                    for (i, byte) in (0u32..).zip(data) {
                        image
                            .bytes
                            .insert(base.wrapping_add(i), *byte);
                    }
                },
                RecordType::EndOfFile => saw_eof = true,
                RecordType::ExtendedSegmentAddress => {
                    upper = u32::from(address_field(data, line)?) << 4;
                },
                RecordType::ExtendedLinearAddress => {
                    upper = u32::from(address_field(data, line)?) << 16;
                },
                RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {},
            }
        }

        if !saw_eof {
            return Err(invalid(
                text.lines().count().max(1),
                "missing end-of-file record",
            ));
        }

        debug!("HEX image holds {} bytes", image.bytes.len());
        Ok(image)
    }

    /// Byte at an absolute address, if the image provides it.
    pub fn get(&self, address: u32) -> Option<u8> {
        self.bytes
            .get(&address)
            .copied()
    }

    /// Number of bytes provided.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image provides no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of bytes provided inside a region.
    pub fn region_len(&self, region: MemoryRegion) -> usize {
        self.bytes
            .range(region.base()..region.base() + region.extent())
            .count()
    }

    /// Bytes provided outside every known region.
    pub fn stray_len(&self) -> usize {
        self.bytes
            .keys()
            .filter(|a| MemoryRegion::for_address(**a).is_none())
            .count()
    }

    fn region_byte(&self, region: MemoryRegion, offset: u32) -> u8 {
        self.get(region.absolute(offset))
            .unwrap_or(BLANK)
    }
}

impl SourceImage for HexImage {
    fn has_data_at(&self, address: u32) -> bool {
        address < MemoryRegion::Flash.extent()
            && self
                .bytes
                .contains_key(&MemoryRegion::Flash.absolute(address))
    }

    fn data_byte(&self, address: u32) -> u8 {
        self.region_byte(MemoryRegion::Flash, address)
    }

    fn has_id_data(&self) -> bool {
        self.region_len(MemoryRegion::DeviceId) > 0
    }

    fn id_byte(&self, offset: u32) -> u8 {
        self.region_byte(MemoryRegion::DeviceId, offset)
    }

    fn has_eeprom_data_at(&self, address: u32) -> bool {
        address < MemoryRegion::Eeprom.extent()
            && self
                .bytes
                .contains_key(&MemoryRegion::Eeprom.absolute(address))
    }

    fn eeprom_byte(&self, address: u32) -> u8 {
        self.region_byte(MemoryRegion::Eeprom, address)
    }

    fn fuse_changed(&self, index: u8) -> bool {
        if index >= FUSE_COUNT {
            return false;
        }
        self.get(MemoryRegion::Fuses.absolute(u32::from(index)))
            .is_some_and(|value| value != FUSE_DEFAULTS[usize::from(index)])
    }

    fn fuse_value(&self, index: u8) -> u8 {
        let default = FUSE_DEFAULTS
            .get(usize::from(index))
            .copied()
            .unwrap_or(BLANK);
        self.get(MemoryRegion::Fuses.absolute(u32::from(index)))
            .unwrap_or(default)
    }
}

impl FromIterator<(u32, u8)> for HexImage {
    fn from_iter<I: IntoIterator<Item = (u32, u8)>>(iter: I) -> Self {
        Self {
            bytes: iter
                .into_iter()
                .collect(),
        }
    }
}

impl Extend<(u32, u8)> for HexImage {
    fn extend<I: IntoIterator<Item = (u32, u8)>>(&mut self, iter: I) {
        self.bytes
            .extend(iter);
    }
}

fn invalid(line: usize, message: impl Into<String>) -> Error {
    Error::InvalidHex {
        line,
        message: message.into(),
    }
}

/// Decode one record into its raw bytes (count, address, type, data),
/// checksum verified and stripped.
fn decode_record(record: &str) -> std::result::Result<Vec<u8>, String> {
    let hex = record
        .strip_prefix(':')
        .ok_or("record does not start with ':'")?;
    if hex.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex at column {}", i + 2))
        })
        .collect::<std::result::Result<Vec<u8>, String>>()?;

    if bytes.len() < 5 {
        return Err("record too short".into());
    }
    let count = usize::from(bytes[0]);
    if bytes.len() != count + 5 {
        return Err(format!(
            "byte count {count} does not match record length {}",
            bytes.len() - 5
        ));
    }
    let sum = bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        let expected = bytes[..bytes.len() - 1]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            .wrapping_neg();
        return Err(format!(
            "checksum mismatch: expected {expected:02X}, got {:02X}",
            bytes[bytes.len() - 1]
        ));
    }

    let mut bytes = bytes;
    bytes.pop();
    Ok(bytes)
}

fn address_field(data: &[u8], line: usize) -> Result<u16> {
    match data {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(invalid(line, "address record must carry 2 bytes")),
    }
}

//! PIC18 memory regions as seen by the programmer.
//!
//! ```text
//! 0x000000 +---------------+
//!          | Flash (32K)   |  window 0x20, writes use 4-digit addresses
//! 0x008000 +---------------+
//!             ...
//! 0x200000 +---------------+
//!          | Device ID (8) |  window 0x08
//! 0x200008 +---------------+
//!             ...
//! 0x300000 +---------------+
//!          | Config (15)   |  one fuse frame per byte
//! 0x30000F +---------------+
//!             ...
//! 0xF00000 +---------------+
//!          | EEPROM (256)  |  window 0x20
//! 0xF00100 +---------------+
//! ```

use std::fmt;

use crate::protocol::AddressWidth;

/// Erased-state byte value.
pub const BLANK: u8 = 0xFF;

/// Number of configuration (fuse) entries.
pub const FUSE_COUNT: u8 = 15;

/// Reset values of the configuration bytes, CONFIG1L..CONFIG7H.
///
/// Index 14 has no configuration register behind it and reads as blank.
pub const FUSE_DEFAULTS: [u8; FUSE_COUNT as usize] = [
    0x00, // CONFIG1L
    0x05, // CONFIG1H
    0x1F, // CONFIG2L
    0x1F, // CONFIG2H
    0x00, // CONFIG3L
    0x83, // CONFIG3H
    0x85, // CONFIG4L
    0x00, // CONFIG4H
    0x0F, // CONFIG5L
    0xC0, // CONFIG5H
    0x0F, // CONFIG6L
    0xE0, // CONFIG6H
    0x0F, // CONFIG7L
    0x40, // CONFIG7H
    BLANK,
];

/// The addressable memory regions of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MemoryRegion {
    /// Program memory.
    Flash,
    /// User ID locations.
    DeviceId,
    /// Data EEPROM.
    Eeprom,
    /// Configuration bytes.
    Fuses,
}

impl MemoryRegion {
    /// Regions written and verified window by window, in session order.
    pub const WINDOWED: [Self; 3] = [Self::Flash, Self::DeviceId, Self::Eeprom];

    /// Absolute address of the region's first byte.
    pub const fn base(self) -> u32 {
        match self {
            Self::Flash => 0x00_0000,
            Self::DeviceId => 0x20_0000,
            Self::Fuses => 0x30_0000,
            Self::Eeprom => 0xF0_0000,
        }
    }

    /// Size of the region in bytes.
    pub const fn extent(self) -> u32 {
        match self {
            Self::Flash => 0x8000,
            Self::DeviceId => 0x08,
            Self::Eeprom => 0x100,
            Self::Fuses => FUSE_COUNT as u32,
        }
    }

    /// Bytes per write/read window.
    pub const fn window(self) -> u32 {
        match self {
            Self::Flash | Self::Eeprom => 0x20,
            Self::DeviceId => 0x08,
            Self::Fuses => 1,
        }
    }

    /// Address width of write frames for this region.
    pub const fn write_width(self) -> AddressWidth {
        match self {
            Self::Flash => AddressWidth::Short,
            _ => AddressWidth::Long,
        }
    }

    /// Absolute address of a region offset.
    pub const fn absolute(self, offset: u32) -> u32 {
        self.base() + offset
    }

    /// Whether an absolute address falls inside the region.
    pub const fn contains(self, address: u32) -> bool {
        address >= self.base() && address < self.base() + self.extent()
    }

    /// Region-relative offsets of every window start.
    pub fn window_offsets(self) -> impl Iterator<Item = u32> {
        (0..self.extent()).step_by(self.window() as usize)
    }

    /// Number of windows in the region.
    pub const fn window_count(self) -> u32 {
        self.extent().div_ceil(self.window())
    }

    /// Region owning an absolute address, if any.
    pub fn for_address(address: u32) -> Option<Self> {
        [Self::Flash, Self::DeviceId, Self::Fuses, Self::Eeprom]
            .into_iter()
            .find(|r| r.contains(address))
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash => write!(f, "flash"),
            Self::DeviceId => write!(f, "ID"),
            Self::Eeprom => write!(f, "EEPROM"),
            Self::Fuses => write!(f, "fuses"),
        }
    }
}

//! Source images: what gets programmed into the device.

pub mod hex;

pub use hex::HexImage;

use crate::target::region::{BLANK, MemoryRegion};

/// Query contract the programming session needs from a source image.
///
/// Addresses are region-relative: flash `0..0x8000`, ID `0..8`,
/// EEPROM `0..0x100`, fuse index `0..15`. Addresses the image does not
/// provide read as [`BLANK`].
pub trait SourceImage {
    /// Whether the image provides the flash byte at `address`.
    fn has_data_at(&self, address: u32) -> bool;

    /// Flash byte at `address`.
    fn data_byte(&self, address: u32) -> u8;

    /// Whether the image provides any ID location.
    fn has_id_data(&self) -> bool;

    /// ID byte at `offset`.
    fn id_byte(&self, offset: u32) -> u8;

    /// Whether the image provides the EEPROM byte at `address`.
    fn has_eeprom_data_at(&self, address: u32) -> bool;

    /// EEPROM byte at `address`.
    fn eeprom_byte(&self, address: u32) -> u8;

    /// Whether fuse `index` differs from the chip default.
    fn fuse_changed(&self, index: u8) -> bool;

    /// Desired value of fuse `index`.
    fn fuse_value(&self, index: u8) -> u8;
}

/// Region-level view over a [`SourceImage`].
///
/// For [`MemoryRegion::Fuses`] the offset is the fuse index and a byte is
/// programmed when it differs from its default.
pub(crate) trait RegionSource {
    /// Whether the region has a programmable (non-blank) byte at `offset`.
    fn is_programmed(&self, region: MemoryRegion, offset: u32) -> bool;

    /// Byte at `offset`.
    fn byte(&self, region: MemoryRegion, offset: u32) -> u8;

    /// Whether any byte of the window starting at `offset` needs programming.
    ///
    /// Stops at the first non-blank byte.
    fn window_needs_programming(&self, region: MemoryRegion, offset: u32) -> bool {
        (offset..offset + region.window()).any(|a| self.is_programmed(region, a))
    }

    /// All bytes of the window starting at `offset`.
    fn window_bytes(&self, region: MemoryRegion, offset: u32) -> Vec<u8> {
        (offset..offset + region.window())
            .map(|a| self.byte(region, a))
            .collect()
    }
}

impl<T: SourceImage + ?Sized> RegionSource for T {
    fn is_programmed(&self, region: MemoryRegion, offset: u32) -> bool {
        match region {
            MemoryRegion::Flash => self.has_data_at(offset) && self.data_byte(offset) != BLANK,
            // No per-address predicate for the ID locations
            MemoryRegion::DeviceId => self.id_byte(offset) != BLANK,
            MemoryRegion::Eeprom => {
                self.has_eeprom_data_at(offset) && self.eeprom_byte(offset) != BLANK
            },
            MemoryRegion::Fuses => u8::try_from(offset).is_ok_and(|i| self.fuse_changed(i)),
        }
    }

    fn byte(&self, region: MemoryRegion, offset: u32) -> u8 {
        match region {
            MemoryRegion::Flash => self.data_byte(offset),
            MemoryRegion::DeviceId => self.id_byte(offset),
            MemoryRegion::Eeprom => self.eeprom_byte(offset),
            MemoryRegion::Fuses => u8::try_from(offset).map_or(BLANK, |i| self.fuse_value(i)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuse_view_follows_defaults() {
        // CONFIG1H changed, CONFIG4L written at its default
        let image: HexImage = [(0x300001, 0x0E), (0x300006, 0x85)]
            .into_iter()
            .collect();

        assert!(image.is_programmed(MemoryRegion::Fuses, 1));
        assert!(!image.is_programmed(MemoryRegion::Fuses, 6));
        assert!(!image.is_programmed(MemoryRegion::Fuses, 2));
        assert!(!image.is_programmed(MemoryRegion::Fuses, 0x100));
        assert_eq!(image.byte(MemoryRegion::Fuses, 1), 0x0E);
        assert_eq!(image.byte(MemoryRegion::Fuses, 2), 0x1F);
        assert!(image.window_needs_programming(MemoryRegion::Fuses, 1));
    }
}

//! Target devices and their memory layout.

pub mod device;
pub mod region;

pub use device::{DeviceDescriptor, DeviceTable, KNOWN_DEVICES};
pub use region::{BLANK, FUSE_COUNT, FUSE_DEFAULTS, MemoryRegion};

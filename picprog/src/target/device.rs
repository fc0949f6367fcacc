//! Supported target devices.

use std::fmt;

/// A supported microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceDescriptor {
    /// Part name without the `pic` prefix (e.g. "18f4550").
    pub name: &'static str,
    /// Value reported by the device ID query.
    pub device_id: u16,
}

impl DeviceDescriptor {
    /// Part name as printed on the package.
    pub fn part_name(&self) -> String {
        format!("PIC{}", self.name.to_uppercase())
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pic{}", self.name)
    }
}

/// Devices the programmer firmware knows how to drive.
pub const KNOWN_DEVICES: &[DeviceDescriptor] = &[
    DeviceDescriptor { name: "18f2455", device_id: 0x1260 },
    DeviceDescriptor { name: "18f2550", device_id: 0x1240 },
    DeviceDescriptor { name: "18f4455", device_id: 0x1202 },
    DeviceDescriptor { name: "18f4550", device_id: 0x1200 },
    DeviceDescriptor { name: "18f2420", device_id: 0x1140 },
    DeviceDescriptor { name: "18f2520", device_id: 0x1100 },
    DeviceDescriptor { name: "18f4420", device_id: 0x10C0 },
    DeviceDescriptor { name: "18f4520", device_id: 0x1080 },
];

/// Read-only lookup table of devices.
#[derive(Debug, Clone, Copy)]
pub struct DeviceTable {
    devices: &'static [DeviceDescriptor],
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new(KNOWN_DEVICES)
    }
}

impl DeviceTable {
    /// Wrap a static device list.
    pub const fn new(devices: &'static [DeviceDescriptor]) -> Self {
        Self { devices }
    }

    /// All devices in table order.
    pub fn devices(&self) -> &'static [DeviceDescriptor] {
        self.devices
    }

    /// Find the device reporting `device_id`.
    pub fn by_id(&self, device_id: u16) -> Option<&'static DeviceDescriptor> {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
    }

    /// Find a device by name, case-insensitive, with or without `pic` prefix.
    pub fn by_name(&self, name: &str) -> Option<&'static DeviceDescriptor> {
        let name = name.trim().to_lowercase();
        let name = name
            .strip_prefix("pic")
            .unwrap_or(&name);
        self.devices
            .iter()
            .find(|d| d.name == name)
    }
}

//! Programming session state machine.
//!
//! A [`Session`] owns the port to the programmer for its whole life and
//! walks the device through a fixed sequence:
//!
//! ```text
//! Disconnected -> Handshaking -> IdentifyingDevice -> Erasing
//!   -> ProgrammingFlash -> ProgrammingDeviceId -> ProgrammingEeprom
//!   -> VerifyingFlash -> VerifyingDeviceId -> VerifyingEeprom
//!   -> ProgrammingFuses -> Done
//! ```
//!
//! Any fatal error drops the session into `Aborted`. Verification
//! mismatches are not fatal: they end up in the [`SessionReport`] and the
//! remaining steps still run.
//!
//! ## Example
//!
//! ```rust,no_run
//! use picprog::{HexImage, SerialConfig, SessionConfig, open_session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = HexImage::from_file("firmware.hex")?;
//!     let mut session = open_session(
//!         &SerialConfig::new("/dev/ttyACM0", 38400),
//!         SessionConfig::default(),
//!     )?;
//!
//!     let report = session.run(Some(&image), &mut |state, current, total| {
//!         println!("{state}: {current}/{total}");
//!     })?;
//!     println!("verified: {}", report.all_verified());
//!     Ok(())
//! }
//! ```

mod program;
mod verify;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::image::SourceImage;
use crate::port::{BLOCKING_READ_TIMEOUT, Port};
use crate::protocol::{ERASE_ACK, Frame, HANDSHAKE_ACK};
use crate::target::device::{DeviceDescriptor, DeviceTable};
use crate::target::region::MemoryRegion;

pub use verify::{Mismatch, VerifyOutcome};

/// Time the programmer needs after the port opens (it resets on connect).
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SessionState {
    /// Nothing sent yet.
    Disconnected,
    /// Waiting for the programmer's handshake reply.
    Handshaking,
    /// Querying the device ID.
    IdentifyingDevice,
    /// Bulk erase.
    Erasing,
    /// Writing program memory.
    ProgrammingFlash,
    /// Writing the ID locations.
    ProgrammingDeviceId,
    /// Writing data EEPROM.
    ProgrammingEeprom,
    /// Reading back program memory.
    VerifyingFlash,
    /// Reading back the ID locations.
    VerifyingDeviceId,
    /// Reading back data EEPROM.
    VerifyingEeprom,
    /// Writing changed configuration bytes.
    ProgrammingFuses,
    /// Finished successfully.
    Done,
    /// Stopped by a fatal error.
    Aborted,
}

impl SessionState {
    /// State that programs `region`.
    pub fn programming(region: MemoryRegion) -> Self {
        match region {
            MemoryRegion::Flash => Self::ProgrammingFlash,
            MemoryRegion::DeviceId => Self::ProgrammingDeviceId,
            MemoryRegion::Eeprom => Self::ProgrammingEeprom,
            MemoryRegion::Fuses => Self::ProgrammingFuses,
        }
    }

    /// State that verifies `region`, if the region is verified at all.
    pub fn verifying(region: MemoryRegion) -> Option<Self> {
        match region {
            MemoryRegion::Flash => Some(Self::VerifyingFlash),
            MemoryRegion::DeviceId => Some(Self::VerifyingDeviceId),
            MemoryRegion::Eeprom => Some(Self::VerifyingEeprom),
            MemoryRegion::Fuses => None,
        }
    }

    /// Whether the session can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Disconnected => "Disconnected",
            Self::Handshaking => "Connecting to programmer",
            Self::IdentifyingDevice => "Connecting to the MCU",
            Self::Erasing => "Erasing chip",
            Self::ProgrammingFlash => "Programming flash memory",
            Self::ProgrammingDeviceId => "Programming ID memory",
            Self::ProgrammingEeprom => "Programming EEPROM",
            Self::VerifyingFlash => "Verifying flash memory",
            Self::VerifyingDeviceId => "Verifying ID memory",
            Self::VerifyingEeprom => "Verifying EEPROM",
            Self::ProgrammingFuses => "Programming the fuse bits",
            Self::Done => "Done",
            Self::Aborted => "Aborted",
        };
        f.write_str(text)
    }
}

/// Immutable session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device name; when set, identification is skipped.
    pub device_name: Option<String>,
    /// Stop after the bulk erase.
    pub erase_only: bool,
    /// Delay between opening the port and the handshake.
    pub settle_delay: Duration,
    /// Read timeout. `None` blocks until the programmer answers.
    pub read_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            erase_only: false,
            settle_delay: DEFAULT_SETTLE_DELAY,
            read_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Name the target device instead of querying its ID.
    #[must_use]
    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Only erase the chip.
    #[must_use]
    pub fn with_erase_only(mut self, erase_only: bool) -> Self {
        self.erase_only = erase_only;
        self
    }

    /// Set the settle delay.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// What happened to one windowed region.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RegionReport {
    /// The region.
    pub region: MemoryRegion,
    /// Write frames sent.
    pub windows_written: usize,
    /// Region was skipped because the image has no data for it.
    pub skipped: bool,
    /// Read-back result, `None` when not verified.
    pub verification: Option<VerifyOutcome>,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SessionReport {
    /// Resolved device. `None` when a named target is not in the table.
    pub device: Option<DeviceDescriptor>,
    /// The bulk erase was acknowledged.
    pub erased: bool,
    /// Per-region results, in session order.
    pub regions: Vec<RegionReport>,
    /// Fuse indices written.
    pub fuses_written: Vec<u8>,
}

impl SessionReport {
    /// Report entry for a region.
    pub fn region(&self, region: MemoryRegion) -> Option<&RegionReport> {
        self.regions
            .iter()
            .find(|r| r.region == region)
    }

    /// Whether every verified region read back correctly.
    pub fn all_verified(&self) -> bool {
        self.regions
            .iter()
            .filter_map(|r| r.verification.as_ref())
            .all(VerifyOutcome::is_ok)
    }

    /// Regions whose verification failed.
    pub fn failed_regions(&self) -> impl Iterator<Item = &RegionReport> {
        self.regions
            .iter()
            .filter(|r| {
                r.verification
                    .as_ref()
                    .is_some_and(|v| !v.is_ok())
            })
    }

    /// Total write frames sent across regions.
    pub fn windows_written(&self) -> usize {
        self.regions
            .iter()
            .map(|r| r.windows_written)
            .sum()
    }

    fn region_mut(&mut self, region: MemoryRegion) -> &mut RegionReport {
        if let Some(i) = self
            .regions
            .iter()
            .position(|r| r.region == region)
        {
            return &mut self.regions[i];
        }
        self.regions
            .push(RegionReport {
                region,
                windows_written: 0,
                skipped: false,
                verification: None,
            });
        let last = self.regions.len() - 1;
        &mut self.regions[last]
    }
}

/// One programming session against one device.
///
/// Generic over the port type `P`; the session is the only user of the port
/// and closes it exactly once when [`Session::run`] returns.
pub struct Session<P: Port> {
    port: P,
    config: SessionConfig,
    devices: DeviceTable,
    state: SessionState,
    history: Vec<SessionState>,
    device: Option<DeviceDescriptor>,
    /// The next read is the first of the verification phase.
    first_read_pending: bool,
    closed: bool,
}

impl<P: Port> Session<P> {
    /// Create a session over an opened port.
    pub fn new(port: P, config: SessionConfig) -> Self {
        Self {
            port,
            config,
            devices: DeviceTable::default(),
            state: SessionState::Disconnected,
            history: vec![SessionState::Disconnected],
            device: None,
            first_read_pending: false,
            closed: false,
        }
    }

    /// Use a different device table for identification.
    #[must_use]
    pub fn with_device_table(mut self, devices: DeviceTable) -> Self {
        self.devices = devices;
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Resolved device, once identified.
    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.device
            .as_ref()
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Run the whole session to `Done` or `Aborted`.
    ///
    /// `image` may be `None` only in erase-only mode. `progress` receives
    /// `(state, current, total)` as windows are processed.
    pub fn run(
        &mut self,
        image: Option<&dyn SourceImage>,
        progress: &mut dyn FnMut(SessionState, usize, usize),
    ) -> Result<SessionReport> {
        if self.state != SessionState::Disconnected {
            return Err(Error::Config(format!(
                "session already ran (state: {})",
                self.state
            )));
        }

        let result = self.run_steps(image, progress);
        if let Err(ref e) = result {
            error!("Session aborted during {}: {e}", self.state);
            self.transition(SessionState::Aborted);
        }
        self.close();
        result
    }

    fn run_steps(
        &mut self,
        image: Option<&dyn SourceImage>,
        progress: &mut dyn FnMut(SessionState, usize, usize),
    ) -> Result<SessionReport> {
        let image = match image {
            Some(image) => Some(image),
            None if self.config.erase_only => None,
            None => return Err(Error::Config("no source image to program".into())),
        };

        let mut report = SessionReport::default();

        self.handshake()?;
        self.identify()?;
        report.device = self.device;
        self.erase()?;
        report.erased = true;

        let Some(image) = image.filter(|_| !self.config.erase_only) else {
            info!("Erase-only mode, stopping after erase");
            self.transition(SessionState::Done);
            return Ok(report);
        };

        for region in MemoryRegion::WINDOWED {
            if Self::skip_region(image, region) {
                info!("No {region} data in image, skipping");
                report
                    .region_mut(region)
                    .skipped = true;
                continue;
            }
            self.transition(SessionState::programming(region));
            let written = self.program_region(image, region, progress)?;
            report
                .region_mut(region)
                .windows_written = written;
        }

        self.first_read_pending = true;
        for region in MemoryRegion::WINDOWED {
            let Some(state) = SessionState::verifying(region) else {
                continue;
            };
            if Self::skip_region(image, region) {
                continue;
            }
            self.transition(state);
            let outcome = self.verify_region(image, region, progress)?;
            report
                .region_mut(region)
                .verification = Some(outcome);
        }

        self.transition(SessionState::ProgrammingFuses);
        report.fuses_written = self.program_fuses(image, progress)?;

        self.transition(SessionState::Done);
        Ok(report)
    }

    fn skip_region(image: &dyn SourceImage, region: MemoryRegion) -> bool {
        region == MemoryRegion::DeviceId && !image.has_id_data()
    }

    fn transition(&mut self, next: SessionState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
        self.history
            .push(next);
    }

    fn handshake(&mut self) -> Result<()> {
        self.transition(SessionState::Handshaking);
        self.port
            .set_timeout(
                self.config
                    .read_timeout
                    .unwrap_or(BLOCKING_READ_TIMEOUT),
            )?;

        if !self
            .config
            .settle_delay
            .is_zero()
        {
            debug!(
                "Waiting {:?} for the programmer to settle",
                self.config.settle_delay
            );
            thread::sleep(self.config.settle_delay);
        }

        info!("Connecting to programmer on {}...", self.port.name());
        self.send(&Frame::Handshake)
            .map_err(|e| Error::Connection(format!("handshake not sent: {e}")))?;
        let reply = self
            .port
            .read_byte()
            .map_err(|e| Error::Connection(format!("no handshake reply: {e}")))?;
        if reply != HANDSHAKE_ACK {
            return Err(Error::Connection(format!(
                "unexpected handshake reply {reply:#04x}"
            )));
        }

        info!("Programmer connected");
        Ok(())
    }

    fn identify(&mut self) -> Result<()> {
        // A named target is taken on trust, listed or not
        if let Some(name) = &self.config.device_name {
            self.device = self
                .devices
                .by_name(name)
                .copied();
            match &self.device {
                Some(device) => info!("Target set to {device}, skipping identification"),
                None => warn!("Target {name} is not in the device table, programming anyway"),
            }
            return Ok(());
        }

        self.transition(SessionState::IdentifyingDevice);
        self.port.clear_input()?;
        self.send(&Frame::DeviceIdQuery)?;
        let mut raw = [0u8; 2];
        self.port
            .read_exact_bytes(&mut raw)?;
        let device_id = LittleEndian::read_u16(&raw);
        trace!("Device ID bytes: {raw:02X?}");

        let device = self
            .devices
            .by_id(device_id)
            .ok_or(Error::DeviceNotRecognized(device_id))?;
        info!("Your MCU: {device} (ID {device_id:#06X})");
        self.device = Some(*device);
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        self.transition(SessionState::Erasing);
        info!("Erasing chip...");
        self.port.clear_input()?;
        self.send(&Frame::Erase)?;
        let reply = self.port.read_byte()?;
        if reply != ERASE_ACK {
            return Err(Error::EraseFailed(reply));
        }
        info!("Chip erased");
        Ok(())
    }

    /// Encode and write one frame.
    fn send(&mut self, frame: &Frame) -> Result<()> {
        debug!("Sending {frame}");
        self.port
            .write_all_bytes(&frame.encode())
    }

    /// Read and discard one acknowledgement byte.
    fn consume_ack(&mut self) -> Result<()> {
        let ack = self.port.read_byte()?;
        trace!("Ack {:?}", char::from(ack));
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }
    }
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{Result, Session, SessionConfig};
    use crate::port::{NativePort, SerialConfig};
    use log::debug;

    /// Open the programmer's serial port and create a session on it.
    pub fn open_session(serial: &SerialConfig, config: SessionConfig) -> Result<Session<NativePort>> {
        let serial = serial
            .clone()
            .with_timeout(config.read_timeout);
        let port = NativePort::open(&serial)?;
        debug!("Port {} opened", serial.port_name);
        Ok(Session::new(port, config))
    }
}

#[cfg(feature = "native")]
pub use native_impl::open_session;

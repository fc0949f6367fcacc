//! Read-back verification.

use log::{debug, info, warn};

use super::{Session, SessionState};
use crate::error::{Error, Result};
use crate::image::{RegionSource, SourceImage};
use crate::port::Port;
use crate::protocol::{Frame, ReadResponse, ReadResponseDecoder};
use crate::target::region::MemoryRegion;

/// One byte that read back differently from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Mismatch {
    /// Absolute address.
    pub address: u32,
    /// Byte in the image.
    pub expected: u8,
    /// Byte read from the device.
    pub actual: u8,
}

/// Result of verifying one region.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "status", rename_all = "snake_case"))]
pub enum VerifyOutcome {
    /// Every checked window matched.
    Verified {
        /// Windows read back.
        windows: usize,
    },
    /// At least one byte differed.
    Mismatch {
        /// Differing bytes, in address order.
        mismatches: Vec<Mismatch>,
    },
    /// A read response could not be decoded.
    Framing {
        /// Decoder error.
        cause: String,
    },
}

impl VerifyOutcome {
    /// Whether the region verified.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

impl<P: Port> Session<P> {
    /// Read back every programmed window of `region` and compare.
    ///
    /// Mismatches and undecodable responses end up in the outcome; only
    /// transport errors are returned as `Err`.
    pub(super) fn verify_region(
        &mut self,
        image: &dyn SourceImage,
        region: MemoryRegion,
        progress: &mut dyn FnMut(SessionState, usize, usize),
    ) -> Result<VerifyOutcome> {
        let state = self.state;
        let total = region.window_count() as usize;
        let mut mismatches = Vec::new();
        let mut windows = 0;

        for (n, offset) in region
            .window_offsets()
            .enumerate()
        {
            if image.window_needs_programming(region, offset) {
                let address = region.absolute(offset);
                let expected = image.window_bytes(region, offset);
                let response = match self.read_window(address, expected.len()) {
                    Ok(response) => response,
                    Err(Error::Framing(cause)) => {
                        warn!("Unreadable {region} response at {address:#08X}: {cause}");
                        // Drop whatever is left of the broken response
                        self.port.clear_input()?;
                        return Ok(VerifyOutcome::Framing { cause });
                    },
                    Err(e) => return Err(e),
                };

                for ((a, &want), &got) in (address..)
                    .zip(&expected)
                    .zip(&response.data)
                {
                    if want != got {
                        warn!("Verification mismatch at {a:#08X}: expected {want:#04X}, read {got:#04X}");
                        mismatches.push(Mismatch {
                            address: a,
                            expected: want,
                            actual: got,
                        });
                    }
                }
                windows += 1;
            }
            progress(state, n + 1, total);
        }

        if mismatches.is_empty() {
            info!("{region} verified ({windows} window(s))");
            Ok(VerifyOutcome::Verified { windows })
        } else {
            warn!("{region} verification failed: {} byte(s) differ", mismatches.len());
            Ok(VerifyOutcome::Mismatch { mismatches })
        }
    }

    /// Send a read frame for the window at `address` and decode the answer.
    fn read_window(&mut self, address: u32, len: usize) -> Result<ReadResponse> {
        self.send(&Frame::read(address))?;
        self.consume_ack()?;

        let mut decoder = if self.first_read_pending {
            ReadResponseDecoder::allowing_spurious_ack()
        } else {
            ReadResponseDecoder::new()
        };
        self.first_read_pending = false;

        let response = loop {
            let byte = self.port.read_byte()?;
            if let Some(response) = decoder.push(byte)? {
                break response;
            }
        };
        if decoder.skipped_ack() {
            debug!("Skipped stray 'K' before first read response");
        }

        if response.address != address {
            return Err(Error::Framing(format!(
                "read echoed address {:#08X}, expected {address:#08X}",
                response.address
            )));
        }
        if response.data.len() < len {
            return Err(Error::Framing(format!(
                "read returned {} byte(s), expected {len}",
                response.data.len()
            )));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::mock::{MockProgrammer, image_from};
    use super::super::SessionConfig;
    use super::*;
    use crate::image::HexImage;

    /// Session with `image` already written to the mock's memory.
    fn programmed(port: MockProgrammer, image: &HexImage) -> Session<MockProgrammer> {
        let mut session = Session::new(
            port,
            SessionConfig::default().with_settle_delay(Duration::ZERO),
        );
        for region in MemoryRegion::WINDOWED {
            session
                .program_region(image, region, &mut |_, _, _| {})
                .unwrap();
        }
        session.first_read_pending = true;
        session
    }

    fn verify(session: &mut Session<MockProgrammer>, image: &HexImage, region: MemoryRegion) -> VerifyOutcome {
        session
            .verify_region(image, region, &mut |_, _, _| {})
            .unwrap()
    }

    #[test]
    fn test_verified_counts_windows() {
        let image = image_from((0..0x50).map(|a| (a, 0x5A)));
        let mut s = programmed(MockProgrammer::new(0x1200), &image);
        assert_eq!(
            verify(&mut s, &image, MemoryRegion::Flash),
            VerifyOutcome::Verified { windows: 3 }
        );
        assert_eq!(s.port().frames_with('R'), vec!["R000000X", "R000020X", "R000040X"]);
    }

    #[test]
    fn test_reads_only_programmed_windows() {
        let image = image_from([(0xF000E5, 0x00)]);
        let mut s = programmed(MockProgrammer::new(0x1200), &image);
        assert!(verify(&mut s, &image, MemoryRegion::Eeprom).is_ok());
        assert_eq!(s.port().frames_with('R'), vec!["RF000E0X"]);
    }

    #[test]
    fn test_mismatch_reports_every_window() {
        let image = image_from((0..0x40).map(|a| (a, 0x00)));
        let mut s = programmed(MockProgrammer::new(0x1200).corrupt_echo_at(0x03), &image);
        let outcome = verify(&mut s, &image, MemoryRegion::Flash);

        assert_eq!(
            outcome,
            VerifyOutcome::Mismatch {
                mismatches: vec![Mismatch {
                    address: 0x03,
                    expected: 0x00,
                    actual: 0xFF,
                }],
            }
        );
        assert_eq!(s.port().frames_with('R').len(), 2);
    }

    #[test]
    fn test_first_read_tolerates_stray_ack() {
        let image = image_from([(0x200000, 0x42)]);
        let mut s = programmed(MockProgrammer::new(0x1200).with_spurious_ack(), &image);
        assert!(verify(&mut s, &image, MemoryRegion::DeviceId).is_ok());
        assert!(!s.first_read_pending);
    }

    #[test]
    fn test_stray_ack_after_first_read_is_framing() {
        let image = image_from([(0x0000, 0x01)]);
        let mut s = programmed(MockProgrammer::new(0x1200).with_spurious_ack(), &image);
        s.first_read_pending = false;
        assert!(matches!(
            verify(&mut s, &image, MemoryRegion::Flash),
            VerifyOutcome::Framing { .. }
        ));
    }

    #[test]
    fn test_framing_failure_resyncs_for_next_region() {
        let image = image_from([(0x0000, 0x01), (0xF00000, 0x02)]);
        let mut s = programmed(MockProgrammer::new(0x1200).garble_echo_below(0x8000), &image);
        assert!(matches!(
            verify(&mut s, &image, MemoryRegion::Flash),
            VerifyOutcome::Framing { .. }
        ));
        assert!(verify(&mut s, &image, MemoryRegion::Eeprom).is_ok());
    }

    #[test]
    fn test_transport_error_propagates() {
        let image = image_from([(0x0000, 0x01)]);
        // Answers the single write, then goes quiet
        let mut s = programmed(MockProgrammer::new(0x1200).silent_after_frames(1), &image);
        let result = s.verify_region(&image, MemoryRegion::Flash, &mut |_, _, _| {});
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_outcome_is_ok() {
        assert!(VerifyOutcome::Verified { windows: 0 }.is_ok());
        assert!(!VerifyOutcome::Framing { cause: "x".into() }.is_ok());
        assert!(
            !VerifyOutcome::Mismatch {
                mismatches: Vec::new()
            }
            .is_ok()
        );
    }
}

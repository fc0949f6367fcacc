//! Window and fuse programming.

use log::{debug, info};

use super::{Session, SessionState};
use crate::error::Result;
use crate::image::{RegionSource, SourceImage};
use crate::port::Port;
use crate::protocol::Frame;
use crate::target::region::{FUSE_COUNT, MemoryRegion};

impl<P: Port> Session<P> {
    /// Write every window of `region` that holds programmable data.
    ///
    /// Blank windows are skipped. Returns the number of write frames sent.
    pub(super) fn program_region(
        &mut self,
        image: &dyn SourceImage,
        region: MemoryRegion,
        progress: &mut dyn FnMut(SessionState, usize, usize),
    ) -> Result<usize> {
        let state = self.state;
        let total = region.window_count() as usize;
        let mut written = 0;

        for (n, offset) in region
            .window_offsets()
            .enumerate()
        {
            if image.window_needs_programming(region, offset) {
                let data = image.window_bytes(region, offset);
                let frame = Frame::write(region.absolute(offset), region.write_width(), &data);
                self.send(&frame)?;
                self.port.clear_input()?;
                self.consume_ack()?;
                written += 1;
            }
            progress(state, n + 1, total);
        }

        info!("Programmed {written} {region} window(s)");
        Ok(written)
    }

    /// Write every configuration byte that differs from its default.
    ///
    /// Returns the fuse indices written.
    pub(super) fn program_fuses(
        &mut self,
        image: &dyn SourceImage,
        progress: &mut dyn FnMut(SessionState, usize, usize),
    ) -> Result<Vec<u8>> {
        let total = usize::from(FUSE_COUNT);
        let mut written = Vec::new();

        for index in 0..FUSE_COUNT {
            let offset = u32::from(index);
            if image.is_programmed(MemoryRegion::Fuses, offset) {
                let value = image.byte(MemoryRegion::Fuses, offset);
                debug!("Fuse {index}: {value:#04X}");
                self.send(&Frame::fuse_write(index, value))?;
                self.port.clear_input()?;
                self.consume_ack()?;
                written.push(index);
            }
            progress(SessionState::ProgrammingFuses, usize::from(index) + 1, total);
        }

        if written.is_empty() {
            info!("Fuses left at their defaults");
        } else {
            info!("Programmed {} fuse(s)", written.len());
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::mock::{MockProgrammer, image_from};
    use super::super::SessionConfig;
    use super::*;
    use crate::error::Error;
    use crate::target::region::BLANK;

    fn session() -> Session<MockProgrammer> {
        let mut session = Session::new(
            MockProgrammer::new(0x1200),
            SessionConfig::default().with_settle_delay(Duration::ZERO),
        );
        session.state = SessionState::ProgrammingFlash;
        session
    }

    fn program(session: &mut Session<MockProgrammer>, image: &dyn SourceImage, region: MemoryRegion) -> usize {
        session
            .program_region(image, region, &mut |_, _, _| {})
            .unwrap()
    }

    #[test]
    fn test_blank_image_sends_nothing() {
        let image = image_from((0..0x8000).map(|a| (a, BLANK)));
        let mut s = session();
        assert_eq!(program(&mut s, &image, MemoryRegion::Flash), 0);
        assert_eq!(program(&mut s, &image, MemoryRegion::Eeprom), 0);
        assert!(s.port().frames().is_empty());
    }

    #[test]
    fn test_each_populated_window_written_once() {
        // Windows 0, 2 and the last one, plus one 0xFF-only window
        let mut image = image_from([(0x0001, 0x10), (0x0047, 0x20), (0x7FFF, 0x30)]);
        image.extend([(0x0060, BLANK)]);
        let mut s = session();
        assert_eq!(program(&mut s, &image, MemoryRegion::Flash), 3);

        let frames = s.port().frames_with('W');
        let addresses: Vec<&str> = frames
            .iter()
            .map(|f| &f[1..5])
            .collect();
        assert_eq!(addresses, vec!["0000", "0040", "7FE0"]);
        for frame in &frames {
            assert_eq!(frame.len(), 1 + 4 + 64 + 1);
        }
    }

    #[test]
    fn test_sparse_images_cover_every_byte_once() {
        let mut seed = 0x2545_F491u32;
        let scattered: Vec<u32> = (0..48)
            .map(|_| {
                seed = seed
                    .wrapping_mul(1_103_515_245)
                    .wrapping_add(12_345);
                (seed >> 8) % 0x8000
            })
            .collect();
        let layouts: Vec<(MemoryRegion, Vec<u32>)> = vec![
            (MemoryRegion::Flash, (0..0x400).step_by(7).collect()),
            (MemoryRegion::Flash, (0..0x8000).step_by(0x33).collect()),
            (MemoryRegion::Flash, vec![0x1F, 0x20, 0x3F, 0x40, 0x7FE0, 0x7FFF]),
            (MemoryRegion::Flash, scattered),
            (MemoryRegion::Eeprom, (0..0x100).step_by(0x11).collect()),
            (MemoryRegion::Eeprom, vec![0x00, 0x1F, 0x20, 0xFF]),
        ];

        for (region, offsets) in layouts {
            let value = |o: u32| (o % 0xFE) as u8;
            let image = image_from(
                offsets
                    .iter()
                    .map(|&o| (region.absolute(o), value(o))),
            );
            let mut s = session();
            let sent = program(&mut s, &image, region);

            let windows: Vec<u32> = s
                .port()
                .frames_with('W')
                .iter()
                .map(|f| match Frame::decode(f.as_bytes(), region.write_width()).unwrap() {
                    Frame::Write { address, .. } => address - region.base(),
                    other => panic!("unexpected frame {other}"),
                })
                .collect();
            assert_eq!(windows.len(), sent);

            let mut distinct = windows.clone();
            distinct.sort_unstable();
            distinct.dedup();
            assert_eq!(distinct.len(), windows.len(), "{region}: window written twice");

            let covers = |w: u32, o: u32| (w..w + region.window()).contains(&o);
            for &o in &offsets {
                let covering = windows
                    .iter()
                    .filter(|&&w| covers(w, o))
                    .count();
                assert_eq!(covering, 1, "{region}: offset {o:#X}");
                assert_eq!(
                    s.port()
                        .memory()
                        .get(&region.absolute(o)),
                    Some(&value(o))
                );
            }
            for &w in &windows {
                assert_eq!(w % region.window(), 0);
                assert!(
                    offsets
                        .iter()
                        .any(|&o| covers(w, o)),
                    "{region}: window {w:#X} holds no data"
                );
            }
        }
    }

    #[test]
    fn test_window_fills_unprovided_bytes_with_blank() {
        let image = image_from([(0x0021, 0xAB)]);
        let mut s = session();
        program(&mut s, &image, MemoryRegion::Flash);

        let frame = &s.port().frames()[0];
        assert!(frame.starts_with("W0020FFAB"));
        assert!(frame.ends_with("FFX"));
        assert_eq!(s.port().memory().get(&0x21), Some(&0xAB));
        assert_eq!(s.port().memory().get(&0x20), Some(&BLANK));
    }

    #[test]
    fn test_id_and_eeprom_use_long_addresses() {
        let image = image_from([(0x200000, 0x01), (0xF00020, 0x02)]);
        let mut s = session();
        assert_eq!(program(&mut s, &image, MemoryRegion::DeviceId), 1);
        assert_eq!(program(&mut s, &image, MemoryRegion::Eeprom), 1);

        let frames = s.port().frames();
        assert_eq!(frames[0], "W20000001FFFFFFFFFFFFFFX");
        assert!(frames[1].starts_with("WF0002002FF"));
        assert_eq!(frames[1].len(), 1 + 6 + 64 + 1);
    }

    #[test]
    fn test_progress_covers_all_windows() {
        let image = image_from([(0xF00000, 0x00)]);
        let mut s = session();
        s.state = SessionState::ProgrammingEeprom;
        let mut calls = Vec::new();
        s.program_region(&image, MemoryRegion::Eeprom, &mut |state, current, total| {
            calls.push((state, current, total));
        })
        .unwrap();
        assert_eq!(calls.len(), 8);
        assert_eq!(calls[7], (SessionState::ProgrammingEeprom, 8, 8));
    }

    #[test]
    fn test_missing_write_ack_times_out() {
        let image = image_from([(0x0000, 0x00)]);
        let mut s = Session::new(
            MockProgrammer::new(0x1200).silent(),
            SessionConfig::default(),
        );
        let result = s.program_region(&image, MemoryRegion::Flash, &mut |_, _, _| {});
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_only_changed_fuses_written() {
        // CONFIG1H default 0x05, CONFIG4L default 0x85
        let image = image_from([(0x300001, 0x0E), (0x300006, 0x85), (0x30000D, 0x00)]);
        let mut s = session();
        let written = s
            .program_fuses(&image, &mut |_, _, _| {})
            .unwrap();

        assert_eq!(written, vec![1, 13]);
        assert_eq!(s.port().frames(), vec!["C10EX", "CD00X"]);
        assert_eq!(s.port().fuses().get(&1), Some(&0x0E));
    }

    #[test]
    fn test_blank_fuse_value_is_still_written() {
        // CONFIG7L defaults to 0x0F, so 0xFF is a change
        let image = image_from([(0x30000C, BLANK), (0x30000E, BLANK)]);
        let mut s = session();
        let written = s
            .program_fuses(&image, &mut |_, _, _| {})
            .unwrap();

        assert_eq!(written, vec![12]);
        assert_eq!(s.port().frames(), vec!["CCFFX"]);
    }

    #[test]
    fn test_no_fuse_data_writes_nothing() {
        let image = image_from([(0x0000, 0x12)]);
        let mut s = session();
        assert!(
            s.program_fuses(&image, &mut |_, _, _| {})
                .unwrap()
                .is_empty()
        );
        assert!(s.port().frames().is_empty());
    }
}

//! In-memory programmer used by the session tests.
//!
//! Replies to a frame are queued as "in flight" and only arrive once the
//! host actually reads, so a `clear_input` issued right after a write does
//! not throw the acknowledgement away.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::Result;
use crate::image::HexImage;
use crate::port::{DEFAULT_BAUD, Port};
use crate::protocol::{AddressWidth, Frame, ReadResponse, TERMINATOR};
use crate::target::region::{BLANK, MemoryRegion};

/// Route library logs through the test harness.
pub(crate) fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

/// Build an image from absolute `(address, byte)` pairs.
pub(crate) fn image_from(bytes: impl IntoIterator<Item = (u32, u8)>) -> HexImage {
    bytes
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpuriousAck {
    Never,
    FirstRead,
    EveryRead,
}

pub(crate) struct MockProgrammer {
    device_id: u16,
    handshake_reply: u8,
    erase_reply: u8,
    spurious: SpuriousAck,
    spurious_sent: bool,
    corrupt_at: Option<u32>,
    garble_below: Option<u32>,
    silent_after: Option<usize>,

    memory: BTreeMap<u32, u8>,
    fuses: BTreeMap<u8, u8>,
    partial: Vec<u8>,
    frames: Vec<String>,
    pending: VecDeque<u8>,
    arrived: VecDeque<u8>,
    timeout: Duration,
    close_count: usize,
}

impl MockProgrammer {
    pub(crate) fn new(device_id: u16) -> Self {
        Self {
            device_id,
            handshake_reply: b'H',
            erase_reply: b'K',
            spurious: SpuriousAck::Never,
            spurious_sent: false,
            corrupt_at: None,
            garble_below: None,
            silent_after: None,
            memory: BTreeMap::new(),
            fuses: BTreeMap::new(),
            partial: Vec::new(),
            frames: Vec::new(),
            pending: VecDeque::new(),
            arrived: VecDeque::new(),
            timeout: Duration::from_millis(10),
            close_count: 0,
        }
    }

    pub(crate) fn with_handshake_reply(mut self, reply: u8) -> Self {
        self.handshake_reply = reply;
        self
    }

    pub(crate) fn with_erase_reply(mut self, reply: u8) -> Self {
        self.erase_reply = reply;
        self
    }

    /// Never answer anything.
    pub(crate) fn silent(self) -> Self {
        self.silent_after_frames(0)
    }

    /// Stop answering after `frames` frames.
    pub(crate) fn silent_after_frames(mut self, frames: usize) -> Self {
        self.silent_after = Some(frames);
        self
    }

    pub(crate) fn with_spurious_ack(mut self) -> Self {
        self.spurious = SpuriousAck::FirstRead;
        self
    }

    pub(crate) fn with_spurious_ack_on_every_read(mut self) -> Self {
        self.spurious = SpuriousAck::EveryRead;
        self
    }

    /// Flip the echoed byte at absolute `address`.
    pub(crate) fn corrupt_echo_at(mut self, address: u32) -> Self {
        self.corrupt_at = Some(address);
        self
    }

    /// Echo `W` instead of `R` for reads below `address`.
    pub(crate) fn garble_echo_below(mut self, address: u32) -> Self {
        self.garble_below = Some(address);
        self
    }

    /// Every frame received, as text.
    pub(crate) fn frames(&self) -> Vec<String> {
        self.frames
            .clone()
    }

    /// Frames starting with `opcode`.
    pub(crate) fn frames_with(&self, opcode: char) -> Vec<String> {
        self.frames
            .iter()
            .filter(|f| f.starts_with(opcode))
            .cloned()
            .collect()
    }

    pub(crate) fn memory(&self) -> &BTreeMap<u32, u8> {
        &self.memory
    }

    pub(crate) fn fuses(&self) -> &BTreeMap<u8, u8> {
        &self.fuses
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_count
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.pending
            .extend(bytes);
    }

    fn handle_frame(&mut self, raw: Vec<u8>) {
        self.frames
            .push(String::from_utf8_lossy(&raw).into_owned());
        if self
            .silent_after
            .is_some_and(|n| self.frames.len() > n)
        {
            return;
        }

        match raw[0] {
            b'H' => self.reply(&[self.handshake_reply]),
            b'D' => self.reply(&self.device_id.to_le_bytes()),
            b'E' => {
                self.memory.clear();
                self.fuses.clear();
                self.reply(&[self.erase_reply]);
            },
            b'W' => {
                // Only flash windows use the short form: 4 + 2 * 32 digits
                let width = if raw.len() - 2 == 4 + 64 {
                    AddressWidth::Short
                } else {
                    AddressWidth::Long
                };
                if let Ok(Frame::Write { address, data, .. }) = Frame::decode(&raw, width) {
                    for (i, byte) in (0u32..).zip(data) {
                        self.memory
                            .insert(address + i, byte);
                    }
                }
                self.reply(b"K");
            },
            b'R' => {
                let Ok(Frame::Read { address }) = Frame::decode(&raw, AddressWidth::Long) else {
                    return;
                };
                self.answer_read(address);
            },
            b'C' => {
                if let Ok(Frame::FuseWrite { index, value }) =
                    Frame::decode(&raw, AddressWidth::Long)
                {
                    self.fuses
                        .insert(index, value);
                }
                self.reply(b"K");
            },
            _ => {},
        }
    }

    fn answer_read(&mut self, address: u32) {
        let len = MemoryRegion::for_address(address).map_or(0x20, MemoryRegion::window);
        let mut data: Vec<u8> = (address..address + len)
            .map(|a| {
                self.memory
                    .get(&a)
                    .copied()
                    .unwrap_or(BLANK)
            })
            .collect();
        if let Some(bad) = self
            .corrupt_at
            .filter(|a| (address..address + len).contains(a))
        {
            data[(bad - address) as usize] ^= 0xFF;
        }

        let mut out = vec![b'K'];
        let stray = match self.spurious {
            SpuriousAck::Never => false,
            SpuriousAck::FirstRead => !self.spurious_sent,
            SpuriousAck::EveryRead => true,
        };
        if stray {
            self.spurious_sent = true;
            out.push(b'K');
        }

        let mut response = ReadResponse { address, data }.encode();
        if self
            .garble_below
            .is_some_and(|limit| address < limit)
        {
            response[0] = b'W';
        }
        out.extend(response);
        self.reply(&out);
    }
}

impl Read for MockProgrammer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.arrived.is_empty() {
            let pending: Vec<u8> = self.pending.drain(..).collect();
            self.arrived.extend(pending);
        }
        if self.arrived.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "programmer silent"));
        }
        let n = buf.len().min(self.arrived.len());
        for (slot, byte) in buf.iter_mut().zip(self.arrived.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockProgrammer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.partial.push(byte);
            if byte == TERMINATOR {
                let frame = std::mem::take(&mut self.partial);
                self.handle_frame(frame);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockProgrammer {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        DEFAULT_BAUD
    }

    fn clear_input(&mut self) -> Result<()> {
        self.arrived.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        self.close_count += 1;
        Ok(())
    }
}

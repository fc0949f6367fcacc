//! Read response decoding.
//!
//! The programmer answers a read frame with `R` + 6-digit address + data
//! + `X`. Responses are not length-prefixed; [`ReadResponseDecoder`] is fed
//! one byte at a time until the terminator shows up.
//!
//! Right after a bulk erase the programmer has been seen to leave a stray
//! `K` in front of the first read response. A decoder created with
//! [`ReadResponseDecoder::allowing_spurious_ack`] drops exactly one such
//! byte.

use log::trace;

use crate::error::{Error, Result};
use crate::protocol::frame::{
    AddressWidth, Opcode, TERMINATOR, parse_hex_bytes, split_address,
};

/// Largest window the programmer reads back.
const MAX_WINDOW: usize = 0x20;

/// Longest well-formed response: opcode, 6-digit address and a full window.
const LONGEST_RESPONSE: usize = 1 + 6 + 2 * MAX_WINDOW;

/// Bytes accumulated before a response without a terminator is rejected.
const MAX_RESPONSE_LEN: usize = 2 * LONGEST_RESPONSE;

/// A decoded read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    /// Address echoed by the programmer.
    pub address: u32,
    /// Data bytes returned for the window.
    pub data: Vec<u8>,
}

impl ReadResponse {
    /// Parse a complete response frame (with or without terminator).
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let frame = frame
            .strip_suffix(&[TERMINATOR])
            .unwrap_or(frame);
        let (&first, payload) = frame
            .split_first()
            .ok_or_else(|| Error::Framing("empty read response".into()))?;
        if first.to_ascii_uppercase() != Opcode::Read.byte() {
            return Err(Error::Framing(format!(
                "expected 'R' echo, got {:?}",
                char::from(first)
            )));
        }
        let (address, data) = split_address(payload, AddressWidth::Long.digits())?;
        Ok(Self {
            address,
            data: parse_hex_bytes(data)?,
        })
    }

    /// Encode as the programmer would send it.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("R{:06X}", self.address).into_bytes();
        for byte in &self.data {
            out.extend_from_slice(format!("{byte:02X}").as_bytes());
        }
        out.push(TERMINATOR);
        out
    }
}

/// Push decoder for a single read response.
#[derive(Debug)]
pub struct ReadResponseDecoder {
    allow_spurious_ack: bool,
    skipped_ack: bool,
    buf: Vec<u8>,
}

impl Default for ReadResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadResponseDecoder {
    /// Decoder that requires the response to start with `R`.
    pub fn new() -> Self {
        Self {
            allow_spurious_ack: false,
            skipped_ack: false,
            buf: Vec::with_capacity(LONGEST_RESPONSE),
        }
    }

    /// Decoder that tolerates one stray `K` before the `R`.
    pub fn allowing_spurious_ack() -> Self {
        Self {
            allow_spurious_ack: true,
            ..Self::new()
        }
    }

    /// Whether a stray `K` has been dropped.
    pub fn skipped_ack(&self) -> bool {
        self.skipped_ack
    }

    /// Feed one byte. Returns the response once the terminator arrives.
    pub fn push(&mut self, byte: u8) -> Result<Option<ReadResponse>> {
        if self.buf.is_empty() {
            if byte == Opcode::Ack.byte() && self.allow_spurious_ack && !self.skipped_ack {
                trace!("Dropping spurious 'K' before read response");
                self.skipped_ack = true;
                return Ok(None);
            }
            if byte.to_ascii_uppercase() != Opcode::Read.byte() {
                return Err(Error::Framing(format!(
                    "expected 'R' echo, got {:?}",
                    char::from(byte)
                )));
            }
        }

        if byte == TERMINATOR {
            let response = ReadResponse::parse(&self.buf)?;
            self.buf.clear();
            return Ok(Some(response));
        }

        if self.buf.len() >= MAX_RESPONSE_LEN {
            return Err(Error::Framing("read response not terminated".into()));
        }
        self.buf.push(byte);
        Ok(None)
    }

    /// Feed a whole byte slice, returning the response if it completed.
    pub fn push_all(&mut self, bytes: &[u8]) -> Result<Option<ReadResponse>> {
        for &byte in bytes {
            if let Some(response) = self.push(byte)? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

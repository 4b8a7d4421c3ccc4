//! Index-counter response decoding.
//!
//! Apollo reports its index counter as two ASCII hex digits, but firmware
//! variants disagree on digit order: some emit the low nibble first (so
//! `b"40"` means 0x04). There is no in-band way to ask which convention a
//! unit uses, so `decode_index_counter` computes both interpretations and
//! picks the one that fits the number of marks we know to be outstanding.

use std::collections::VecDeque;

use crate::error::{Result, SynthError};
use crate::queue::IndexMark;

fn parse_hex_pair(digits: &[u8]) -> Result<u8> {
    if digits.len() != 2 {
        return Err(SynthError::MalformedResponse(
            "expected 2 ASCII hex digits".into(),
        ));
    }
    let text = std::str::from_utf8(digits)
        .map_err(|_| SynthError::MalformedResponse("non-ASCII hex digits".into()))?;
    u8::from_str_radix(text, 16)
        .map_err(|_| SynthError::MalformedResponse(format!("invalid hex digits: {text:?}")))
}

/// Decode a low-nibble-first ASCII hex byte, e.g. `b"40"` => `0x04`.
pub fn decode_swapped_hex_byte(digits: &[u8]) -> Result<u8> {
    if digits.len() != 2 {
        return Err(SynthError::MalformedResponse(
            "expected 2 ASCII hex digits".into(),
        ));
    }
    parse_hex_pair(&[digits[1], digits[0]])
}

/// Decode an index-counter ("units remaining") response.
///
/// Tries both digit orders and prefers a value that fits `pending_count`.
/// When both fit, the larger wins so marks are not retired prematurely; when
/// neither fits, the smaller raw value is returned as a best effort.
pub fn decode_index_counter(digits: &[u8], pending_count: usize) -> Result<usize> {
    let normal = usize::from(parse_hex_pair(digits)?);
    let swapped = usize::from(decode_swapped_hex_byte(digits).unwrap_or(normal as u8));

    let in_range: Vec<usize> = [normal, swapped]
        .into_iter()
        .filter(|&v| v <= pending_count)
        .collect();
    if let Some(best) = in_range.into_iter().max() {
        return Ok(best);
    }
    Ok(normal.min(swapped))
}

/// FIFO of marks written to the device but not yet reported reached.
///
/// The writer pushes marks as their enable commands go out; the reader
/// retires them from the front when the device's counter drops. The counter
/// is "marks still pending", so a response of `remaining` retires entries
/// from the front until `remaining` are left; the device reaches marks in
/// the order they were sent.
#[derive(Debug, Default)]
pub struct IndexTracker {
    pending: VecDeque<IndexMark>,
}

impl IndexTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mark: IndexMark) {
        self.pending.push_back(mark);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Retire reached marks given the device's "remaining" count, returning
    /// them oldest first.
    pub fn acknowledge(&mut self, remaining: usize) -> Vec<IndexMark> {
        let mut reached = Vec::new();
        while self.pending.len() > remaining {
            match self.pending.pop_front() {
                Some(mark) => reached.push(mark),
                None => break,
            }
        }
        reached
    }

    /// Drop everything, e.g. on cancel or disconnect.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

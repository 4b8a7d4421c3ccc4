//! The reader thread: decodes everything the device sends back.
//!
//! The reader owns an independent clone of the serial handle so its blocking
//! 100 ms reads never hold up a writer. Clones are keyed by the link
//! sequence number; when the writer drops a failed connection the sequence
//! moves on and the reader discards its stale clone on the next pass.
//!
//! Inbound traffic is tiny: index-counter responses, language-table dumps
//! and the occasional NAK artifact, everything else is noise and ignored.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::connection::start_background_connect;
use crate::engine::{lock, Shared, SynthEvent};
use crate::indexing::{decode_index_counter, decode_swapped_hex_byte};
use crate::protocol::{
    INDEX_RESPONSE_MARKER, INDEX_RESPONSE_TERMINATORS, LANGUAGE_LIST_MARKER, NAK,
};
use crate::queue::IndexMark;
use crate::settings::{RomSlotInfo, ROM_INFO_TIMEOUT};
use crate::transport::Transport;

/// Pause after a read failure before looking for a fresh link.
const READ_ERROR_PAUSE: Duration = Duration::from_millis(500);
/// Idle pause while no link exists.
const NO_LINK_PAUSE: Duration = Duration::from_millis(100);
/// How long to wait for the remainder of an index response.
const RESPONSE_TAIL_TIMEOUT: Duration = Duration::from_millis(250);

/// Bytes the device may interleave between language-table fields.
const FIELD_SEPARATORS: &[u8] = b", \t\r\n";

pub(crate) fn run_reader(shared: Arc<Shared>) {
    let mut session: Option<(u64, Box<dyn Transport>)> = None;

    while !shared.is_stopping() {
        // Resynchronize the clone with the live link.
        let live_seq = {
            let link = lock(&shared.link);
            link.port.is_some().then_some(link.seq)
        };
        let held_seq = session.as_ref().map(|(seq, _)| *seq);
        match live_seq {
            None => {
                session = None;
                thread::sleep(NO_LINK_PAUSE);
                continue;
            }
            Some(seq) if held_seq == Some(seq) => {}
            Some(seq) => {
                let cloned = {
                    let link = lock(&shared.link);
                    link.port.as_ref().map(|port| port.try_clone())
                };
                match cloned {
                    Some(Ok(mut clone)) => {
                        if let Err(err) = clone.set_timeout(NO_LINK_PAUSE) {
                            debug!("Could not set reader timeout: {err}");
                        }
                        session = Some((seq, clone));
                    }
                    Some(Err(err)) => {
                        debug!("Could not clone serial handle for reading: {err}");
                        session = None;
                        thread::sleep(NO_LINK_PAUSE);
                        continue;
                    }
                    None => continue,
                }
            }
        }

        let Some((_, port)) = session.as_mut() else {
            continue;
        };
        let mut byte = [0u8; 1];
        match port.read(&mut byte) {
            Ok(0) => continue,
            Ok(_) => handle_byte(&shared, port.as_mut(), byte[0]),
            Err(err) => {
                warn!("Serial read failed, dropping connection: {err}");
                session = None;
                {
                    let mut link = lock(&shared.link);
                    link.port = None;
                    link.seq = link.seq.wrapping_add(1);
                }
                lock(&shared.tracker).clear();
                start_background_connect(&shared);
                thread::sleep(READ_ERROR_PAUSE);
            }
        }
    }
    debug!("Reader thread exiting");
}

fn handle_byte(shared: &Shared, port: &mut dyn Transport, byte: u8) {
    match byte {
        NAK => {}
        INDEX_RESPONSE_MARKER => handle_index_response(shared, port),
        LANGUAGE_LIST_MARKER => handle_language_table(shared, port),
        other => debug!("Ignoring unexpected byte from device: {other:#04x}"),
    }
}

/// Collect `count` bytes, bounded by `deadline`.
fn read_exact_within(
    port: &mut dyn Transport,
    count: usize,
    deadline: Instant,
) -> Option<Vec<u8>> {
    let mut collected = Vec::with_capacity(count);
    let mut buf = [0u8; 16];
    while collected.len() < count && Instant::now() < deadline {
        let want = (count - collected.len()).min(buf.len());
        match port.read(&mut buf[..want]) {
            Ok(0) => continue,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(_) => return None,
        }
    }
    (collected.len() == count).then_some(collected)
}

/// Like `read_exact_within` but skipping field-separator bytes.
fn read_field_within(
    port: &mut dyn Transport,
    count: usize,
    deadline: Instant,
) -> Option<Vec<u8>> {
    let mut collected = Vec::with_capacity(count);
    let mut buf = [0u8; 1];
    while collected.len() < count && Instant::now() < deadline {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(_) => {
                if !FIELD_SEPARATORS.contains(&buf[0]) {
                    collected.push(buf[0]);
                }
            }
            Err(_) => return None,
        }
    }
    (collected.len() == count).then_some(collected)
}

/// `I` seen: read the 2 hex digits and terminator, decode the counter and
/// retire reached marks.
fn handle_index_response(shared: &Shared, port: &mut dyn Transport) {
    let deadline = Instant::now() + RESPONSE_TAIL_TIMEOUT;
    let Some(tail) = read_exact_within(port, 3, deadline) else {
        debug!("Truncated index response");
        return;
    };
    if !tail[0].is_ascii_hexdigit()
        || !tail[1].is_ascii_hexdigit()
        || !INDEX_RESPONSE_TERMINATORS.contains(&tail[2])
    {
        debug!("Malformed index response tail: {tail:02X?}");
        return;
    }

    let (reached, drained) = {
        let mut tracker = lock(&shared.tracker);
        let remaining = match decode_index_counter(&tail[..2], tracker.pending_count()) {
            Ok(remaining) => remaining,
            Err(err) => {
                debug!("Undecodable index counter: {err}");
                return;
            }
        };
        let reached = tracker.acknowledge(remaining);
        let drained = tracker.is_empty();
        (reached, drained)
    };
    shared.note_index_response();

    let mut finished = false;
    for mark in reached {
        match mark {
            IndexMark::Caller(index) => shared.notify(SynthEvent::IndexReached(index)),
            IndexMark::EndOfUtterance => {
                shared.notify(SynthEvent::DoneSpeaking);
                finished = true;
            }
        }
    }
    if finished && drained {
        shared.speaking.store(false, Ordering::SeqCst);
    }
}

/// `L` seen: parse the ROM language table.
///
/// Layout: record count and record size as swapped-hex bytes, then that many
/// fixed-size records. The device interleaves separators freely, so fields
/// are collected from non-separator bytes only.
fn handle_language_table(shared: &Shared, port: &mut dyn Transport) {
    let deadline = Instant::now() + ROM_INFO_TIMEOUT;

    let Some(count_digits) = read_field_within(port, 2, deadline) else {
        debug!("Language table: missing record count");
        return;
    };
    let Ok(count) = decode_swapped_hex_byte(&count_digits) else {
        debug!("Language table: bad record count {count_digits:02X?}");
        return;
    };
    let Some(size_digits) = read_field_within(port, 2, deadline) else {
        debug!("Language table: missing record size");
        return;
    };
    let Ok(size) = decode_swapped_hex_byte(&size_digits) else {
        debug!("Language table: bad record size {size_digits:02X?}");
        return;
    };

    let mut slots = Vec::with_capacity(usize::from(count));
    for slot in 1..=count {
        let Some(record) = read_field_within(port, usize::from(size), deadline) else {
            debug!("Language table: truncated at record {slot}");
            break;
        };
        slots.push(RomSlotInfo::from_record(slot, &record));
    }
    if slots.is_empty() {
        return;
    }
    debug!("Language table: {} slot(s)", slots.len());
    lock(&shared.rom).slots = slots;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Transport double replaying a fixed inbound byte stream.
    struct Replay {
        data: Vec<u8>,
        pos: usize,
    }

    impl Replay {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl Transport for Replay {
        fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
        fn baud_rate(&self) -> u32 {
            9600
        }
        fn set_baud_rate(&mut self, _baud: u32) -> io::Result<()> {
            Ok(())
        }
        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }
        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn clear_output(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            Err(io::Error::other("not cloneable"))
        }
    }

    #[test]
    fn reads_exact_and_skips_separators() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let mut port = Replay::new(b"ab, c\r\nd");
        assert_eq!(
            read_field_within(&mut port, 4, deadline),
            Some(b"abcd".to_vec())
        );

        let mut port = Replay::new(b"xyz");
        assert_eq!(
            read_exact_within(&mut port, 3, deadline),
            Some(b"xyz".to_vec())
        );
        // Not enough data before the deadline.
        let deadline = Instant::now() + Duration::from_millis(5);
        let mut port = Replay::new(b"x");
        assert_eq!(read_exact_within(&mut port, 3, deadline), None);
    }
}

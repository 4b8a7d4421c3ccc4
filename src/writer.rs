//! The writer thread: drains the queue onto the serial link.
//!
//! Payloads go out in small chunks with the cancellation generation
//! re-checked between chunks, so a cancel takes effect mid-utterance instead
//! of after a multi-kilobyte write drains at 9600 baud. Any write failure
//! drops the link inline (under the link lock) and hands recovery to the
//! background reconnect thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::connection::start_background_connect;
use crate::engine::{lock, Shared, SynthEvent};
use crate::error::{Result, SynthError};
use crate::formants;
use crate::protocol::CR;
use crate::queue::{IndexMark, WriteItem, WriteKind};

/// Bytes per write chunk; cancellation is re-checked at this granularity.
pub const WRITE_CHUNK_SIZE: usize = 64;
/// Queue poll interval for the writer loop.
const POP_INTERVAL: Duration = Duration::from_millis(100);
/// Debounce before a settings sync snapshots, coalescing rapid changes.
pub const SETTINGS_DEBOUNCE: Duration = Duration::from_millis(50);
/// Cancelable speech older than this is dropped instead of retried offline.
pub const OFFLINE_MAX_AGE: Duration = Duration::from_secs(10);
/// Backoff between offline retries of a queued item.
pub const OFFLINE_RETRY: Duration = Duration::from_millis(250);

pub(crate) fn run_writer(shared: Arc<Shared>) {
    while !shared.is_stopping() {
        let Some(item) = shared.queue.pop_timeout(POP_INTERVAL) else {
            if shared.queue.is_closed() {
                break;
            }
            continue;
        };
        if item.cancelable && shared.is_stale(item.generation) {
            continue;
        }
        if !shared.is_connected() {
            handle_offline(&shared, item);
            continue;
        }

        let result = match item.kind {
            WriteKind::Normal => write_speech(&shared, &item),
            WriteKind::Mute => write_mute(&shared, &item),
            WriteKind::SettingsSync => write_settings_sync(&shared, &item),
            WriteKind::FormantSync => write_formant_sync(&shared),
        };
        if let Err(err) = result {
            handle_write_error(&shared, &err, item);
        }
    }
    debug!("Writer thread exiting");
}

/// Register the item's marks, then push its payload.
///
/// Marks go into the tracker before the bytes leave so a fast device cannot
/// answer a poll for marks the reader does not yet know about. The staleness
/// check shares the tracker lock with registration: a cancel either lands
/// before the check (nothing registers) or after it, in which case the
/// cancel's own tracker clear removes the marks again.
fn write_speech(shared: &Arc<Shared>, item: &WriteItem) -> Result<()> {
    {
        let mut tracker = lock(&shared.tracker);
        if item.cancelable && shared.is_stale(item.generation) {
            return Ok(());
        }
        for &mark in &item.marks {
            tracker.push(mark);
        }
    }
    let generation = item.cancelable.then_some(item.generation);
    write_bytes(shared, &item.payload, generation)?;
    Ok(())
}

/// Stop speech now: drop whatever the OS still buffers, then send the mute.
fn write_mute(shared: &Arc<Shared>, item: &WriteItem) -> Result<()> {
    {
        let mut link = lock(&shared.link);
        let Some(port) = link.port.as_mut() else {
            return Err(SynthError::NotConnected);
        };
        if let Err(err) = port.clear_output() {
            debug!("Could not clear TX buffer before mute: {err}");
        }
    }
    write_bytes(shared, &item.payload, None)
}

/// Re-assert the full device state: ROM slot, optional soft reset, then the
/// complete settings prefix.
fn write_settings_sync(shared: &Arc<Shared>, item: &WriteItem) -> Result<()> {
    let elapsed = item.created_at.elapsed();
    if elapsed < SETTINGS_DEBOUNCE {
        thread::sleep(SETTINGS_DEBOUNCE - elapsed);
    }

    // Snapshot under the lock and commit the applied state up front. If the
    // write fails the reconnect path forces another full sync anyway.
    let (payload, rom_switch, soft_reset) = {
        let mut voice = lock(&shared.voice);
        voice.settings_sync_queued = false;
        let rom_switch =
            (voice.applied_rom != voice.desired.rom_slot).then_some(voice.desired.rom_slot);
        let soft_reset = voice.needs_soft_reset || rom_switch.is_some();
        let formant_commands = if soft_reset {
            voice.desired.formant_commands()
        } else {
            formants::diff_commands(&voice.desired.formant_deltas, &voice.applied_formants)
        };
        let mut payload = voice.desired.prefix(&formant_commands);
        payload.push(CR);
        voice.applied_formants = voice.desired.formant_deltas;
        voice.applied_rom = voice.desired.rom_slot;
        voice.needs_soft_reset = false;
        (payload, rom_switch, soft_reset)
    };

    if let Some(slot) = rom_switch {
        let mut command = format!("@={slot}, ").into_bytes();
        command.push(CR);
        write_bytes(shared, &command, None)?;
        // The ROM switch swaps the device personality; the old session is
        // gone, including the probed index-command choice. Drop the link and
        // let the reconnect path re-probe and re-assert everything.
        {
            let mut link = lock(&shared.link);
            link.port = None;
            link.seq = link.seq.wrapping_add(1);
        }
        lock(&shared.tracker).clear();
        lock(&shared.voice).needs_soft_reset = true;
        start_background_connect(shared);
        return Ok(());
    }
    if soft_reset {
        // The reset must be flushed on its own before any follow-up state.
        write_bytes(shared, &[b'@', b'J', b' ', CR], None)?;
    }
    write_bytes(shared, &payload, None)
}

/// Apply pending formant diffs without touching the rest of the settings.
fn write_formant_sync(shared: &Arc<Shared>) -> Result<()> {
    let commands = {
        let mut voice = lock(&shared.voice);
        voice.formant_sync_queued = false;
        let commands =
            formants::diff_commands(&voice.desired.formant_deltas, &voice.applied_formants);
        voice.applied_formants = voice.desired.formant_deltas;
        commands
    };
    if commands.is_empty() {
        return Ok(());
    }
    let mut payload: Vec<u8> = commands.concat().into_bytes();
    payload.push(CR);
    write_bytes(shared, &payload, None)
}

/// Chunked write under the link lock.
///
/// With `generation` set, staleness is re-checked before every chunk and a
/// stale payload is abandoned silently. A failed write drops the link while
/// the lock is still held, so no other writer can race onto a dead port.
fn write_bytes(shared: &Shared, payload: &[u8], generation: Option<u64>) -> Result<()> {
    let mut link = lock(&shared.link);
    let Some(port) = link.port.as_mut() else {
        return Err(SynthError::NotConnected);
    };

    let mut written = 0usize;
    for chunk in payload.chunks(WRITE_CHUNK_SIZE) {
        if let Some(generation) = generation {
            if shared.is_stale(generation) {
                return Ok(());
            }
        }
        if let Err(err) = port.write_all(chunk) {
            let err = classify_io_error(err);
            link.port = None;
            link.seq = link.seq.wrapping_add(1);
            return Err(err);
        }
        written += chunk.len();
    }
    if let Err(err) = port.flush() {
        let err = classify_io_error(err);
        link.port = None;
        link.seq = link.seq.wrapping_add(1);
        return Err(err);
    }
    let baud = port.baud_rate().max(1);
    drop(link);

    // Hold off index polling while the UART drains: 10 bits per byte on the
    // wire, plus a small margin.
    let drain_ms = written as u64 * 10 * 1000 / u64::from(baud) + 50;
    shared.suspend_polling(Duration::from_millis(drain_ms));
    Ok(())
}

fn classify_io_error(err: std::io::Error) -> SynthError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        SynthError::WriteTimeout
    } else {
        SynthError::Io(err)
    }
}

/// After a failed write: reset speech state, escalate backoff on timeouts,
/// requeue interrupted speech and start reconnecting.
fn handle_write_error(shared: &Arc<Shared>, err: &SynthError, item: WriteItem) {
    warn!("Serial write failed, dropping connection: {err}");

    // Utterances already on the wire are gone for good; tell the host they
    // finished. The failed item's own marks are excluded because the item is
    // requeued and will report on its retry (or when it ages out).
    let own_end_marks = item
        .marks
        .iter()
        .filter(|mark| **mark == IndexMark::EndOfUtterance)
        .count();
    let lost_end_marks = lock(&shared.tracker)
        .acknowledge(0)
        .iter()
        .filter(|mark| **mark == IndexMark::EndOfUtterance)
        .count()
        .saturating_sub(own_end_marks);
    if lost_end_marks > 0 {
        shared.notify(SynthEvent::DoneSpeaking);
    }
    lock(&shared.voice).needs_soft_reset = true;

    if matches!(err, SynthError::WriteTimeout) {
        let mut conn = lock(&shared.conn);
        conn.write_timeout_count = conn.write_timeout_count.saturating_add(1);
        let backoff = crate::connection::reconnect_backoff(conn.write_timeout_count);
        conn.backoff_until = Some(std::time::Instant::now() + backoff);
    }

    // Speech survives the blip and retries after reconnect; sync items are
    // regenerated by the reconnect path itself.
    if item.kind == WriteKind::Normal {
        shared.queue.requeue(item);
    }
    start_background_connect(shared);
}

/// An item popped while the link is down: retry young speech, age out stale
/// speech, and keep sync items pending.
fn handle_offline(shared: &Arc<Shared>, item: WriteItem) {
    start_background_connect(shared);
    if item.cancelable && item.created_at.elapsed() > OFFLINE_MAX_AGE {
        debug!("Dropping speech queued for over {OFFLINE_MAX_AGE:?} while offline");
        if item.marks.contains(&IndexMark::EndOfUtterance) {
            shared.speaking.store(false, Ordering::SeqCst);
            shared.notify(SynthEvent::DoneSpeaking);
        }
        return;
    }
    shared.queue.requeue(item);
    thread::sleep(OFFLINE_RETRY);
}

/// The poll thread: asks for the index counter while marks are outstanding.
///
/// Queries go through the write queue like everything else, so they can
/// never interleave into the middle of a multi-part writer transaction.
/// Polling also pauses while a transmission drains (see `write_bytes`).
pub(crate) fn run_poller(shared: Arc<Shared>) {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    while !shared.is_stopping() {
        thread::sleep(POLL_INTERVAL);
        if !shared.is_connected() || shared.polling_suspended() {
            continue;
        }
        if lock(&shared.tracker).is_empty() {
            continue;
        }

        let mut query = lock(&shared.conn).index_commands.query.to_vec();
        query.push(b' ');
        query.push(CR);
        shared.queue.push(WriteItem {
            payload: query,
            marks: Vec::new(),
            generation: shared.current_generation(),
            created_at: Instant::now(),
            cancelable: false,
            kind: WriteKind::Normal,
        });
    }
    debug!("Poll thread exiting");
}

//! Connection management: port scanning, device probing and reconnection.
//!
//! A port "has an Apollo on it" when an index-counter query comes back in
//! the expected shape within the probe window. Probing tries the primary
//! `@I` command set first and falls back to the legacy `@1` set used by
//! older firmware. Reconnection after a failure runs on a background thread
//! with exponential backoff driven by the consecutive write-timeout count.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::engine::{lock, Shared};
use crate::error::{Result, SynthError};
use crate::protocol::{
    IndexCommandSet, CR, INDEX_COMMANDS_LEGACY, INDEX_COMMANDS_PRIMARY, INDEX_RESPONSE_MARKER,
    INDEX_RESPONSE_TERMINATORS, MUTE,
};
use crate::queue::{WriteItem, WriteKind};
use crate::settings::{
    baud_selector, AUTO_PORT, DEFAULT_BAUD_RATE, DEFAULT_PORT, SUPPORTED_BAUD_RATES,
};
use crate::transport::{is_port_busy_error, Transport};

/// Read timeout installed on a freshly opened port.
pub const PORT_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// How long a single probe waits for an index response.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(250);
/// Overall cap on a baud-switch handshake.
pub const BAUD_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1500);
/// Delay between connect attempts while a deadline is still running.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
/// First reconnect backoff step; doubles per consecutive write timeout.
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Rate limit for connection-failure warnings.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Ports to try, in order. A concrete configured port is tried alone; in
/// auto mode the last port a device was found on goes first, then the
/// system's enumeration, then the platform default as a last resort.
pub(crate) fn candidate_ports(shared: &Shared) -> Vec<String> {
    let configured = lock(&shared.config).port.clone();
    if configured != AUTO_PORT {
        return vec![configured];
    }

    let mut candidates = Vec::new();
    if let Some(cached) = lock(&shared.conn).cached_port.clone() {
        candidates.push(cached);
    }
    for port in shared.opener.available_ports() {
        if !candidates.contains(&port) {
            candidates.push(port);
        }
    }
    let fallback = DEFAULT_PORT.to_string();
    if !candidates.contains(&fallback) {
        candidates.push(fallback);
    }
    candidates
}

/// Whether `buf` contains a well-formed index response anywhere.
fn contains_index_response(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| {
        w[0] == INDEX_RESPONSE_MARKER
            && w[1].is_ascii_hexdigit()
            && w[2].is_ascii_hexdigit()
            && INDEX_RESPONSE_TERMINATORS.contains(&w[3])
    })
}

/// Send one index query and wait for a response in the expected shape.
///
/// The query is preceded by a mute so a unit left mid-utterance by a
/// previous session goes quiet instead of talking over the handshake.
fn probe_with(transport: &mut dyn Transport, commands: &IndexCommandSet) -> bool {
    if transport.clear_input().is_err() {
        return false;
    }
    let mut query = vec![MUTE];
    query.extend_from_slice(commands.query);
    query.push(b' ');
    query.push(CR);
    if transport.write_all(&query).is_err() || transport.flush().is_err() {
        return false;
    }

    let deadline = Instant::now() + PROBE_TIMEOUT;
    let mut seen = Vec::new();
    let mut byte = [0u8; 16];
    while Instant::now() < deadline {
        match transport.read(&mut byte) {
            Ok(0) => continue,
            Ok(n) => {
                seen.extend_from_slice(&byte[..n]);
                if contains_index_response(&seen) {
                    return true;
                }
            }
            Err(_) => return false,
        }
    }
    false
}

/// Find a command set the device answers to. Primary `@I` first, legacy
/// `@1` second.
pub fn detect_index_commands(
    transport: &mut dyn Transport,
) -> Option<&'static IndexCommandSet> {
    for commands in [&INDEX_COMMANDS_PRIMARY, &INDEX_COMMANDS_LEGACY] {
        if probe_with(transport, commands) {
            return Some(commands);
        }
    }
    None
}

/// The four `@Y` spellings accepted across firmware revisions.
fn baud_switch_variants(selector: char) -> [String; 4] {
    [
        format!("@Yf{selector}N8"),
        format!("@YF{selector}N8"),
        format!("@Y f {selector} N 8"),
        format!("@Y F {selector} N 8"),
    ]
}

/// Settle time after switching the host rate, before the probe.
const BAUD_SETTLE: Duration = Duration::from_millis(50);

/// Negotiate a device baud change with the `@Y` command.
///
/// Each spelling goes out at the current rate behind a mute, then the host
/// switches, sends sync bytes at the new rate and probes; on failure the
/// host rate is reverted and the next spelling tried. The whole handshake is
/// capped so a wedged device cannot stall connect.
pub fn switch_baud(transport: &mut dyn Transport, target: u32) -> Result<()> {
    if !SUPPORTED_BAUD_RATES.contains(&target) {
        return Err(SynthError::Configuration(format!(
            "unsupported baud rate {target}"
        )));
    }
    let selector = baud_selector(target).ok_or_else(|| {
        SynthError::Configuration(format!("no baud selector for {target}"))
    })?;
    if transport.baud_rate() == target {
        return Ok(());
    }

    let original = transport.baud_rate();
    let deadline = Instant::now() + BAUD_HANDSHAKE_TIMEOUT;
    for variant in baud_switch_variants(selector) {
        if Instant::now() >= deadline {
            break;
        }
        let mut command = vec![MUTE];
        command.extend_from_slice(variant.as_bytes());
        command.push(CR);
        transport.write_all(&command)?;
        transport.flush()?;
        transport.set_baud_rate(target)?;
        // Sync bytes let the device's UART lock onto the new rate.
        transport.write_all(&[0x55; 5])?;
        transport.flush()?;
        thread::sleep(BAUD_SETTLE);
        if probe_with(transport, &INDEX_COMMANDS_PRIMARY)
            || probe_with(transport, &INDEX_COMMANDS_LEGACY)
        {
            return Ok(());
        }
        transport.set_baud_rate(original)?;
    }

    // Handshake failed. If the unit no longer answers at the prior rate it
    // may have power-cycled back to its default; recover the session there.
    if !probe_with(transport, &INDEX_COMMANDS_PRIMARY)
        && !probe_with(transport, &INDEX_COMMANDS_LEGACY)
    {
        transport.set_baud_rate(DEFAULT_BAUD_RATE)?;
        let _ = probe_with(transport, &INDEX_COMMANDS_PRIMARY);
    }
    Err(SynthError::ResponseTimeout)
}

/// Open `port`, verify an Apollo answers, and install the link.
fn connect_to(shared: &Shared, port: &str, baud: u32) -> Result<()> {
    let mut transport = shared.opener.open(port, baud, PORT_READ_TIMEOUT)?;
    let commands = detect_index_commands(transport.as_mut()).ok_or_else(|| {
        SynthError::NotDetected {
            port: port.to_string(),
            baud,
        }
    })?;

    // Silence anything in flight and arm index reporting.
    let mut setup = vec![MUTE];
    setup.extend_from_slice(commands.enable);
    setup.push(CR);
    transport.write_all(&setup)?;
    transport.flush()?;

    {
        let mut link = lock(&shared.link);
        link.port = Some(transport);
        link.seq = link.seq.wrapping_add(1);
    }
    lock(&shared.tracker).clear();
    {
        let mut conn = lock(&shared.conn);
        conn.index_commands = commands;
        conn.cached_port = Some(port.to_string());
        conn.write_timeout_count = 0;
        conn.backoff_until = None;
    }
    // Device state after (re)power is unknown: force a full resync.
    let generation = shared.current_generation();
    {
        let mut voice = lock(&shared.voice);
        voice.needs_soft_reset = true;
        if !voice.settings_sync_queued {
            voice.settings_sync_queued = true;
            shared.queue.push(WriteItem::sync(WriteKind::SettingsSync, generation));
        }
    }
    info!(
        "Apollo detected on {port} at {baud} baud ({} indexing)",
        String::from_utf8_lossy(commands.query)
    );
    Ok(())
}

/// Rate-limited connection failure log.
fn log_connect_failure(shared: &Shared, message: &str) {
    let mut conn = lock(&shared.conn);
    let now = Instant::now();
    let due = conn
        .last_error_log
        .map_or(true, |last| now.duration_since(last) >= ERROR_LOG_INTERVAL);
    if due {
        conn.last_error_log = Some(now);
        drop(conn);
        warn!("{message}");
    } else {
        drop(conn);
        debug!("{message}");
    }
}

/// Synchronously connect, retrying busy ports until `deadline` elapses.
///
/// With no deadline a single pass over the candidates is made.
pub(crate) fn ensure_connected(shared: &Shared, deadline: Option<Duration>) -> Result<()> {
    if shared.is_connected() {
        return Ok(());
    }
    let baud = lock(&shared.config).baud_rate;
    let deadline_at = deadline.map(|d| Instant::now() + d);

    loop {
        let mut saw_busy = false;
        for port in candidate_ports(shared) {
            match connect_to(shared, &port, baud) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if is_port_busy_error(&err) {
                        saw_busy = true;
                    }
                    log_connect_failure(
                        shared,
                        &format!("No Apollo on {port} at {baud} baud: {err}"),
                    );
                }
            }
        }

        let retry_allowed = match deadline_at {
            Some(at) => saw_busy && Instant::now() + CONNECT_RETRY_INTERVAL < at,
            None => false,
        };
        if !retry_allowed {
            let configured = lock(&shared.config).port.clone();
            return Err(SynthError::NotDetected {
                port: configured,
                baud,
            });
        }
        thread::sleep(CONNECT_RETRY_INTERVAL);
    }
}

/// Backoff before the next reconnect attempt, scaled by consecutive write
/// timeouts.
pub fn reconnect_backoff(write_timeout_count: u32) -> Duration {
    if write_timeout_count == 0 {
        return Duration::ZERO;
    }
    let exponent = write_timeout_count.saturating_sub(1).min(8);
    let backoff = BACKOFF_BASE.saturating_mul(1 << exponent);
    backoff.min(BACKOFF_CAP)
}

/// Kick off a reconnect thread, unless one is already running.
pub(crate) fn start_background_connect(shared: &Arc<Shared>) {
    {
        let mut conn = lock(&shared.conn);
        if conn.connecting {
            return;
        }
        conn.connecting = true;
    }
    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("apollo-connect".into())
        .spawn(move || {
            while !worker.is_stopping() && !worker.is_connected() {
                let wait = {
                    let conn = lock(&worker.conn);
                    conn.backoff_until
                        .map(|until| until.saturating_duration_since(Instant::now()))
                        .unwrap_or(Duration::ZERO)
                };
                if !wait.is_zero() {
                    thread::sleep(wait.min(CONNECT_RETRY_INTERVAL));
                    continue;
                }
                if ensure_connected(&worker, None).is_ok() {
                    break;
                }
                let backoff = {
                    let mut conn = lock(&worker.conn);
                    let backoff = reconnect_backoff(conn.write_timeout_count.max(1));
                    conn.backoff_until = Some(Instant::now() + backoff);
                    backoff
                };
                debug!("Reconnect attempt failed; next try in {backoff:?}");
            }
            lock(&worker.conn).connecting = false;
        });
    if let Err(err) = spawned {
        lock(&shared.conn).connecting = false;
        warn!("Could not spawn reconnect thread: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Transport double recording every write and rate change, answering
    /// index queries only once the host runs at `answers_at` baud.
    struct Recorder {
        ops: Vec<RecordedOp>,
        baud: u32,
        answers_at: u32,
    }

    #[derive(Debug, PartialEq, Eq)]
    enum RecordedOp {
        Write { baud: u32, data: Vec<u8> },
        SetBaud(u32),
    }

    impl Recorder {
        fn new(baud: u32, answers_at: u32) -> Self {
            Self {
                ops: Vec::new(),
                baud,
                answers_at,
            }
        }
    }

    impl Transport for Recorder {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.ops.push(RecordedOp::Write {
                baud: self.baud,
                data: data.to_vec(),
            });
            Ok(())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.baud != self.answers_at {
                return Ok(0);
            }
            let response = b"I00T";
            let n = response.len().min(buf.len());
            buf[..n].copy_from_slice(&response[..n]);
            Ok(n)
        }
        fn baud_rate(&self) -> u32 {
            self.baud
        }
        fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
            self.baud = baud;
            self.ops.push(RecordedOp::SetBaud(baud));
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
    fn index_response_shape() {
        assert!(contains_index_response(b"I00T"));
        assert!(contains_index_response(b"\x15I3Fm trailing"));
        assert!(!contains_index_response(b"I0T"));
        assert!(!contains_index_response(b"IZZT"));
        assert!(!contains_index_response(b"00T"));
    }

    #[test]
    fn baud_variants_cover_all_spellings() {
        let variants = baud_switch_variants('3');
        assert_eq!(variants[0], "@Yf3N8");
        assert_eq!(variants[1], "@YF3N8");
        assert_eq!(variants[2], "@Y f 3 N 8");
        assert_eq!(variants[3], "@Y F 3 N 8");
    }

    #[test]
    fn baud_handshake_switches_host_rate_before_sync_bytes() {
        let mut port = Recorder::new(4800, 9600);
        switch_baud(&mut port, 9600).unwrap();

        let first_write = match &port.ops[0] {
            RecordedOp::Write { baud, data } => {
                assert_eq!(*baud, 4800, "command must go out at the old rate");
                data.clone()
            }
            other => panic!("expected the @Y command first, got {other:?}"),
        };
        assert_eq!(first_write[0], MUTE);
        assert!(first_write.windows(6).any(|w| w == b"@Yf3N8"));
        assert_eq!(*first_write.last().unwrap(), CR);

        let switch_at = port
            .ops
            .iter()
            .position(|op| *op == RecordedOp::SetBaud(9600))
            .expect("host rate switched");
        let sync_at = port
            .ops
            .iter()
            .position(|op| matches!(op, RecordedOp::Write { baud, data } if *baud == 9600 && data == &[0x55; 5]))
            .expect("sync bytes sent at the new rate");
        assert!(switch_at < sync_at, "sync bytes must follow the rate switch");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(reconnect_backoff(0), Duration::ZERO);
        assert_eq!(reconnect_backoff(1), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(4), Duration::from_secs(16));
        assert_eq!(reconnect_backoff(10), Duration::from_secs(30));
    }
}

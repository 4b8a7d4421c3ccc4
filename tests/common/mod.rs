//! In-memory Apollo device double for integration tests.
//!
//! `FakeDevice` models the observable protocol behavior: it accumulates
//! everything written, answers index-counter queries with a countdown (one
//! mark "spoken" per query), resets its counter on mute, and can dump a
//! canned ROM language table. `FakeOpener` hands out transports backed by
//! one shared device so writer and reader clones see the same state.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use apollo_synth::transport::{PortOpener, Transport};
use apollo_synth::{Result, SynthError};

const MUTE: u8 = 0x18;

#[derive(Default)]
struct DeviceState {
    written: Vec<u8>,
    parse: Vec<u8>,
    inbound: VecDeque<u8>,
    remaining_marks: usize,
}

impl DeviceState {
    fn respond(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    /// Consume newly written bytes, reacting to the commands we model.
    fn process(&mut self, data: &[u8], rom_table: &Option<Vec<u8>>) {
        self.written.extend_from_slice(data);
        self.parse.extend_from_slice(data);

        let mut i = 0;
        while i < self.parse.len() {
            let byte = self.parse[i];
            if byte == MUTE {
                self.remaining_marks = 0;
                i += 1;
                continue;
            }
            if byte != b'@' {
                i += 1;
                continue;
            }
            if i + 2 <= self.parse.len() && &self.parse[i..i + 2] == b"@L" {
                if let Some(table) = rom_table {
                    let table = table.clone();
                    self.respond(&table);
                }
                i += 2;
                continue;
            }
            if i + 3 > self.parse.len() {
                break; // partial command, wait for the next chunk
            }
            match &self.parse[i..i + 3] {
                b"@I+" | b"@1+" => {
                    self.remaining_marks += 1;
                    i += 3;
                }
                b"@I?" | b"@1?" => {
                    let response = format!("I{:02X}T", self.remaining_marks.min(0xFF));
                    self.respond(response.as_bytes());
                    // One mark is "reached" per poll.
                    self.remaining_marks = self.remaining_marks.saturating_sub(1);
                    i += 3;
                }
                _ => i += 1,
            }
        }
        self.parse.drain(..i);
    }
}

/// Shared fake device; every transport clone operates on the same state.
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
    rom_table: Option<Vec<u8>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
            rom_table: None,
        }
    }

    /// Encode a `@L` reply for the given fixed-size records (device emits
    /// counts and sizes as swapped hex).
    pub fn with_rom_table(mut self, records: &[&[u8]]) -> Self {
        let size = records.first().map_or(0, |r| r.len());
        let mut table = vec![b'L'];
        table.extend(swapped_hex(records.len() as u8));
        table.extend(swapped_hex(size as u8));
        for record in records {
            table.extend_from_slice(record);
            table.extend_from_slice(b", ");
        }
        self.rom_table = Some(table);
        self
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn written_contains(&self, needle: &[u8]) -> bool {
        let written = self.written();
        written.windows(needle.len()).any(|w| w == needle)
    }
}

fn swapped_hex(value: u8) -> [u8; 2] {
    let digits = format!("{value:02X}").into_bytes();
    [digits[1], digits[0]]
}

pub struct FakeTransport {
    device: FakeDevice,
}

impl Transport for FakeTransport {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let rom_table = self.device.rom_table.clone();
        self.device
            .state
            .lock()
            .unwrap()
            .process(data, &rom_table);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.device.state.lock().unwrap();
        let mut n = 0;
        while n < buf.len() {
            match state.inbound.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        drop(state);
        if n == 0 {
            // Behave like a serial timeout instead of spinning the reader.
            thread::sleep(Duration::from_millis(1));
        }
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
        self.device.state.lock().unwrap().inbound.clear();
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(FakeTransport {
            device: self.device.clone(),
        }))
    }
}

/// Opener producing transports onto one `FakeDevice`, with a switchable
/// availability flag to simulate the device being unplugged.
pub struct FakeOpener {
    device: FakeDevice,
    available: Arc<AtomicBool>,
    open_attempts: Arc<AtomicUsize>,
    busy: bool,
}

impl FakeOpener {
    pub fn new(device: FakeDevice) -> Self {
        Self {
            device,
            available: Arc::new(AtomicBool::new(true)),
            open_attempts: Arc::new(AtomicUsize::new(0)),
            busy: false,
        }
    }

    /// Failed opens report the port as busy instead of absent.
    pub fn busy_when_unavailable(mut self) -> Self {
        self.busy = true;
        self
    }

    pub fn availability_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.available)
    }

    pub fn attempts_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_attempts)
    }
}

impl PortOpener for FakeOpener {
    fn open(&self, _port: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn Transport>> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            let kind = if self.busy {
                io::ErrorKind::PermissionDenied
            } else {
                io::ErrorKind::NotFound
            };
            let message = if self.busy {
                "Access is denied"
            } else {
                "no such device"
            };
            return Err(SynthError::Io(io::Error::new(kind, message)));
        }
        Ok(Box::new(FakeTransport {
            device: self.device.clone(),
        }))
    }

    fn available_ports(&self) -> Vec<String> {
        vec!["FAKE0".to_string()]
    }
}

//! The driver engine: public API, shared state and the worker threads.
//!
//! `ApolloDriver` is the host-facing handle. Speech composition and the
//! voice-parameter setters run on the caller's thread and only ever touch
//! the queue and the shared state; the writer, reader and poll threads do
//! all the serial I/O. Events flow back to the host over an `mpsc` channel:
//! `IndexReached` as the device consumes marks, `DoneSpeaking` when the last
//! mark of an utterance is reached or speech is abandoned.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::SynthConfig;
use crate::connection::{self, start_background_connect};
use crate::error::{Result, SynthError};
use crate::formants::{FORMANT_COUNT, FORMANT_DELTA_MAX, FORMANT_DELTA_MIN};
use crate::indexing::IndexTracker;
use crate::protocol::{
    hex_digit, IndexCommandSet, CR, INDEX_COMMANDS_PRIMARY, LANGUAGE_LIST_COMMAND, MUTE,
};
use crate::queue::{IndexMark, WriteItem, WriteKind, WriteQueue};
use crate::settings::{
    self, RomSlotInfo, VoiceSettings, MAX_INFLECTION, MAX_MARK_SPACE_RATIO, MAX_PITCH, MAX_RATE,
    MAX_ROM_SLOT, MAX_SENTENCE_PAUSE, MAX_VOICE, MAX_VOICE_FILTER, MAX_VOICING, MAX_VOLUME,
    MAX_WORD_PAUSE, MIN_INFLECTION, MIN_MARK_SPACE_RATIO, MIN_PITCH, MIN_RATE, MIN_ROM_SLOT,
    MIN_SENTENCE_PAUSE, MIN_VOICE, MIN_VOICE_FILTER, MIN_VOICING, MIN_VOLUME, MIN_WORD_PAUSE,
    ROM_INFO_MIN_INTERVAL, ROM_INFO_TIMEOUT,
};
use crate::text::{sanitize, NumberExpander, TextEncoder};
use crate::transport::{PortOpener, SerialOpener, Transport};
use crate::{reader, writer};

/// Default bound on the initial, synchronous connect.
pub const INITIAL_CONNECT_DEADLINE: Duration = Duration::from_secs(2);
/// The startup announcement is only spoken within this window after
/// construction; a late first utterance means the host was already talking
/// through another synth.
const STARTUP_ANNOUNCE_WINDOW: Duration = Duration::from_secs(30);
/// How long `terminate` waits for the shutdown mute to reach the device.
const TERMINATE_DRAIN: Duration = Duration::from_millis(250);

/// Notifications delivered to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthEvent {
    /// The device reached a host-supplied index mark.
    IndexReached(u32),
    /// The current utterance finished or was abandoned.
    DoneSpeaking,
}

/// Relative pitch adjustment embedded in a speech sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PitchChange {
    /// Offset in percent of the full pitch range.
    Offset(i32),
    /// Multiplier on the current pitch parameter.
    Multiplier(f64),
}

/// One element of a speech sequence passed to [`ApolloDriver::speak`].
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechItem {
    Text(String),
    /// Host index mark, reported back via `SynthEvent::IndexReached`.
    Index(u32),
    /// Silence, rounded to the device's 100 ms break granularity.
    Break { millis: u32 },
    /// Pitch change scoped to the rest of the utterance.
    Pitch(PitchChange),
    /// Character (spell) mode on/off for the following text.
    CharacterMode(bool),
    /// Explicit utterance boundary.
    EndUtterance,
}

/// Lock helper that shrugs off poisoning: a panicked worker must not take
/// the whole engine down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The serial link. `seq` increments on every connect and disconnect so the
/// reader can tell its clone went stale.
pub(crate) struct LinkSlot {
    pub seq: u64,
    pub port: Option<Box<dyn Transport>>,
}

/// Desired vs. device-applied voice state.
pub(crate) struct VoiceState {
    pub desired: VoiceSettings,
    pub applied_formants: [i32; FORMANT_COUNT],
    pub applied_rom: u8,
    pub needs_soft_reset: bool,
    pub settings_sync_queued: bool,
    pub formant_sync_queued: bool,
}

/// Connection bookkeeping.
pub(crate) struct ConnState {
    pub cached_port: Option<String>,
    pub index_commands: &'static IndexCommandSet,
    pub write_timeout_count: u32,
    pub backoff_until: Option<Instant>,
    pub last_error_log: Option<Instant>,
    pub connecting: bool,
}

/// ROM language-table cache.
pub(crate) struct RomState {
    pub slots: Vec<RomSlotInfo>,
    pub last_request: Option<Instant>,
}

/// Poll-loop gating.
pub(crate) struct PollGate {
    pub suspend_until: Instant,
    pub last_index_response: Option<Instant>,
}

/// State shared between the host-facing API and the worker threads.
pub(crate) struct Shared {
    pub opener: Box<dyn PortOpener>,
    pub config: Mutex<SynthConfig>,
    pub link: Mutex<LinkSlot>,
    pub queue: WriteQueue,
    pub generation: AtomicU64,
    pub stop: AtomicBool,
    /// An utterance has been submitted and not yet finished or canceled.
    pub speaking: AtomicBool,
    pub tracker: Mutex<IndexTracker>,
    pub events: Mutex<mpsc::Sender<SynthEvent>>,
    pub voice: Mutex<VoiceState>,
    pub conn: Mutex<ConnState>,
    pub rom: Mutex<RomState>,
    pub poll: Mutex<PollGate>,
}

impl Shared {
    pub(crate) fn new(
        config: SynthConfig,
        events: mpsc::Sender<SynthEvent>,
        opener: Box<dyn PortOpener>,
    ) -> Self {
        let desired = VoiceSettings::default();
        let applied_rom = desired.rom_slot;
        Self {
            opener,
            config: Mutex::new(config),
            link: Mutex::new(LinkSlot { seq: 0, port: None }),
            queue: WriteQueue::new(),
            generation: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            speaking: AtomicBool::new(false),
            tracker: Mutex::new(IndexTracker::new()),
            events: Mutex::new(events),
            voice: Mutex::new(VoiceState {
                desired,
                applied_formants: [0; FORMANT_COUNT],
                applied_rom,
                needs_soft_reset: false,
                settings_sync_queued: false,
                formant_sync_queued: false,
            }),
            conn: Mutex::new(ConnState {
                cached_port: None,
                index_commands: &INDEX_COMMANDS_PRIMARY,
                write_timeout_count: 0,
                backoff_until: None,
                last_error_log: None,
                connecting: false,
            }),
            rom: Mutex::new(RomState {
                slots: Vec::new(),
                last_request: None,
            }),
            poll: Mutex::new(PollGate {
                suspend_until: Instant::now(),
                last_index_response: None,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.link).port.is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether a payload queued at `generation` has been canceled since.
    pub fn is_stale(&self, generation: u64) -> bool {
        self.current_generation() != generation
    }

    pub fn notify(&self, event: SynthEvent) {
        if lock(&self.events).send(event).is_err() {
            debug!("Event receiver dropped; discarding {event:?}");
        }
    }

    /// Extend the poll pause; never shortens an existing one.
    pub fn suspend_polling(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut poll = lock(&self.poll);
        if until > poll.suspend_until {
            poll.suspend_until = until;
        }
    }

    pub fn polling_suspended(&self) -> bool {
        lock(&self.poll).suspend_until > Instant::now()
    }

    pub fn note_index_response(&self) {
        lock(&self.poll).last_index_response = Some(Instant::now());
    }
}

/// Handle to a Dolphin Apollo speech synthesizer on a serial port.
pub struct ApolloDriver {
    shared: Arc<Shared>,
    encoder: TextEncoder,
    threads: Vec<JoinHandle<()>>,
    created_at: Instant,
    announced: AtomicBool,
}

impl ApolloDriver {
    /// Create a driver using real serial ports. Workers start immediately;
    /// call [`connect`](Self::connect) for a synchronous initial connect or
    /// just start speaking and let the background connect find the device.
    pub fn new(config: SynthConfig, events: mpsc::Sender<SynthEvent>) -> Self {
        Self::with_opener(config, events, Box::new(SerialOpener))
    }

    /// Create a driver with a custom transport factory (used by the tests to
    /// substitute an in-memory device).
    pub fn with_opener(
        config: SynthConfig,
        events: mpsc::Sender<SynthEvent>,
        opener: Box<dyn PortOpener>,
    ) -> Self {
        let shared = Arc::new(Shared::new(config, events, opener));
        let mut threads = Vec::with_capacity(3);

        for (name, entry) in [
            ("apollo-writer", writer::run_writer as fn(Arc<Shared>)),
            ("apollo-reader", reader::run_reader as fn(Arc<Shared>)),
            ("apollo-poller", writer::run_poller as fn(Arc<Shared>)),
        ] {
            let shared = Arc::clone(&shared);
            match thread::Builder::new().name(name.into()).spawn(move || entry(shared)) {
                Ok(handle) => threads.push(handle),
                Err(err) => warn!("Could not spawn {name}: {err}"),
            }
        }

        Self {
            shared,
            encoder: TextEncoder::default(),
            threads,
            created_at: Instant::now(),
            announced: AtomicBool::new(false),
        }
    }

    /// Install a locale-aware digit-run expander used when `expand_numbers`
    /// is enabled.
    pub fn set_number_expander(&mut self, expander: NumberExpander) {
        self.encoder = TextEncoder::new(Some(expander));
    }

    /// Synchronously connect within the default deadline.
    pub fn connect(&self) -> Result<()> {
        self.connect_within(INITIAL_CONNECT_DEADLINE)
    }

    /// Synchronously connect, retrying busy ports until `deadline` elapses.
    pub fn connect_within(&self, deadline: Duration) -> Result<()> {
        connection::ensure_connected(&self.shared, Some(deadline))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Time since the device last answered an index query, if it ever has.
    /// Useful as a liveness signal for host-side diagnostics.
    pub fn last_index_response_age(&self) -> Option<Duration> {
        lock(&self.shared.poll)
            .last_index_response
            .map(|at| at.elapsed())
    }

    /// Queue a speech sequence.
    ///
    /// A sequence with more than one character of text cancels whatever is
    /// still playing first; single-character sequences (typing echo) let the
    /// previous speech finish.
    pub fn speak(&self, items: &[SpeechItem]) -> Result<()> {
        if self.shared.is_stopping() {
            return Err(SynthError::ShuttingDown);
        }

        let text_chars: usize = items
            .iter()
            .map(|item| match item {
                SpeechItem::Text(text) => text.chars().count(),
                _ => 0,
            })
            .sum();
        if text_chars > 1 {
            self.cancel();
        }

        let generation = self.shared.current_generation();
        let mark_command = lock(&self.shared.conn).index_commands.mark;
        let (expand_numbers, announcement) = {
            let config = lock(&self.shared.config);
            (config.expand_numbers, config.startup_announcement.clone())
        };
        let settings = lock(&self.shared.voice).desired.clone();

        let mut payload: Vec<u8> = Vec::new();
        let mut marks: Vec<IndexMark> = Vec::new();

        if let Some(text) = announcement {
            let within_window = self.created_at.elapsed() < STARTUP_ANNOUNCE_WINDOW;
            if within_window && !self.announced.swap(true, Ordering::SeqCst) {
                payload.extend_from_slice(&self.encoder.encode(&sanitize(&text), false));
                payload.push(b' ');
            }
        }

        // Rate and pitch drift on some firmware; re-assert them per utterance.
        payload.extend_from_slice(format!("@W{} ", settings.rate).as_bytes());
        payload.extend_from_slice(format!("@F{} ", hex_digit(settings.pitch)).as_bytes());

        let mut char_mode = false;
        let mut pitch_override = false;
        let mut pending_pitch: Option<String> = None;
        let mut needs_space = false;

        for item in items {
            match item {
                SpeechItem::Text(text) => {
                    let clean = sanitize(text);
                    if clean.is_empty() {
                        continue;
                    }
                    if needs_space {
                        // Glue only word-like continuations; punctuation after
                        // spelled text reads fine unglued.
                        if !settings.spell_mode
                            && clean.chars().next().map_or(false, char::is_alphanumeric)
                        {
                            payload.push(b' ');
                        }
                        needs_space = false;
                    }
                    if let Some(command) = pending_pitch.take() {
                        payload.extend_from_slice(command.as_bytes());
                        pitch_override = true;
                    }
                    // Spelled digits must stay digits.
                    let expand = expand_numbers && !char_mode && !settings.spell_mode;
                    payload.extend_from_slice(&self.encoder.encode(&clean, expand));
                }
                SpeechItem::Index(index) => {
                    payload.extend_from_slice(mark_command);
                    marks.push(IndexMark::Caller(*index));
                }
                SpeechItem::Break { millis } => {
                    let reps = ((f64::from(*millis) / 100.0).round() as u32).max(1);
                    // Inside spelled text the separator itself would be read
                    // out, so the fillers go unseparated there.
                    let filler: &[u8] = if char_mode || settings.spell_mode {
                        b"@Tx"
                    } else {
                        b"@Tx "
                    };
                    for _ in 0..reps {
                        payload.extend_from_slice(filler);
                    }
                }
                SpeechItem::Pitch(change) => {
                    let target = match change {
                        PitchChange::Offset(percent) => {
                            let base = settings::param_to_percent(
                                settings.pitch,
                                MIN_PITCH,
                                MAX_PITCH,
                            );
                            settings::percent_to_param(base + percent, MIN_PITCH, MAX_PITCH)
                        }
                        PitchChange::Multiplier(factor) => {
                            let scaled = (f64::from(settings.pitch) * factor).round();
                            scaled.clamp(f64::from(MIN_PITCH), f64::from(MAX_PITCH)) as u8
                        }
                    };
                    // Held until the next text span; an override with nothing
                    // after it to speak is discarded.
                    pending_pitch = Some(format!("@F{} ", hex_digit(target)));
                }
                SpeechItem::CharacterMode(on) => {
                    payload.extend_from_slice(if *on { b"@S1 " } else { b"@S0 " });
                    if char_mode && !on {
                        // Glue the next word to spelled text and the device
                        // runs them together.
                        needs_space = true;
                    }
                    char_mode = *on;
                }
                SpeechItem::EndUtterance => {
                    pending_pitch = None;
                    self.finish_utterance(
                        &mut payload,
                        &mut marks,
                        &settings,
                        mark_command,
                        &mut pitch_override,
                        &mut char_mode,
                    );
                }
            }
        }

        self.finish_utterance(
            &mut payload,
            &mut marks,
            &settings,
            mark_command,
            &mut pitch_override,
            &mut char_mode,
        );

        self.shared.speaking.store(true, Ordering::SeqCst);
        self.shared.queue.push(WriteItem::speech(payload, marks, generation));
        if !self.shared.is_connected() {
            start_background_connect(&self.shared);
        }
        Ok(())
    }

    /// Restore overridden state, plant the end-of-utterance mark and
    /// terminate the utterance.
    fn finish_utterance(
        &self,
        payload: &mut Vec<u8>,
        marks: &mut Vec<IndexMark>,
        settings: &VoiceSettings,
        mark_command: &'static [u8],
        pitch_override: &mut bool,
        char_mode: &mut bool,
    ) {
        if payload.last() == Some(&CR) || (payload.is_empty() && marks.is_empty()) {
            return;
        }
        if *pitch_override {
            payload.extend_from_slice(format!("@F{} ", hex_digit(settings.pitch)).as_bytes());
            *pitch_override = false;
        }
        if *char_mode {
            payload.extend_from_slice(b"@S0 ");
            *char_mode = false;
        }
        payload.extend_from_slice(mark_command);
        marks.push(IndexMark::EndOfUtterance);
        payload.push(CR);
    }

    /// Stop speech immediately and flush everything queued.
    ///
    /// `DoneSpeaking` fires synchronously: the host must be free to submit
    /// the next utterance without waiting on the device.
    pub fn cancel(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        // Pending speech is either still queued (cancelable items), already
        // on the wire (unretired marks), or flagged in flight. Non-cancelable
        // commands in the queue are not speech and must not make an idle
        // cancel report done.
        let swept_speech = self.shared.queue.sweep_cancelable();
        let had_marks = {
            let mut tracker = lock(&self.shared.tracker);
            let had = !tracker.is_empty();
            tracker.clear();
            had
        };
        let was_speaking = self.shared.speaking.swap(false, Ordering::SeqCst);
        let had_pending = swept_speech || had_marks || was_speaking;

        if self.shared.is_connected() {
            let enable = lock(&self.shared.conn).index_commands.enable;
            let mut payload = vec![MUTE];
            payload.extend_from_slice(enable);
            payload.push(CR);
            self.shared.queue.push_front(WriteItem {
                payload,
                marks: Vec::new(),
                generation: self.shared.current_generation(),
                created_at: Instant::now(),
                cancelable: false,
                kind: WriteKind::Mute,
            });
        }
        if had_pending {
            self.shared.notify(SynthEvent::DoneSpeaking);
        }
    }

    /// The hardware cannot hold and resume mid-utterance, so pausing is a
    /// cancel and unpausing is a no-op; the host resubmits from where it
    /// wants to continue.
    pub fn pause(&self, paused: bool) {
        if paused {
            self.cancel();
        }
    }

    /// Current voice parameters as last requested by the host.
    pub fn settings(&self) -> VoiceSettings {
        lock(&self.shared.voice).desired.clone()
    }

    fn send_immediate(&self, command: String) {
        let mut payload = command.into_bytes();
        payload.push(CR);
        self.shared.queue.push(WriteItem {
            payload,
            marks: Vec::new(),
            generation: self.shared.current_generation(),
            created_at: Instant::now(),
            cancelable: false,
            kind: WriteKind::Normal,
        });
    }

    /// Queue a coalesced full settings re-assertion.
    fn queue_settings_sync(&self) {
        let generation = self.shared.current_generation();
        let mut voice = lock(&self.shared.voice);
        if !voice.settings_sync_queued {
            voice.settings_sync_queued = true;
            self.shared
                .queue
                .push(WriteItem::sync(WriteKind::SettingsSync, generation));
        }
    }

    pub fn set_rate(&self, rate: u8) {
        let rate = rate.clamp(MIN_RATE, MAX_RATE);
        lock(&self.shared.voice).desired.rate = rate;
        self.send_immediate(format!("@W{rate} "));
    }

    pub fn set_pitch(&self, pitch: u8) {
        let pitch = pitch.clamp(MIN_PITCH, MAX_PITCH);
        lock(&self.shared.voice).desired.pitch = pitch;
        self.send_immediate(format!("@F{} ", hex_digit(pitch)));
    }

    pub fn set_volume(&self, volume: u8) {
        let volume = volume.clamp(MIN_VOLUME, MAX_VOLUME);
        lock(&self.shared.voice).desired.volume = volume;
        self.send_immediate(format!("@A{} ", hex_digit(volume)));
    }

    pub fn set_inflection(&self, inflection: u8) {
        let inflection = inflection.clamp(MIN_INFLECTION, MAX_INFLECTION);
        lock(&self.shared.voice).desired.inflection = inflection;
        self.send_immediate(format!("@R{inflection} "));
    }

    pub fn set_voicing(&self, voicing: u8) {
        let voicing = voicing.clamp(MIN_VOICING, MAX_VOICING);
        lock(&self.shared.voice).desired.voicing = voicing;
        self.send_immediate(format!("@B{voicing} "));
    }

    pub fn set_sentence_pause(&self, pause: u8) {
        let pause = pause.clamp(MIN_SENTENCE_PAUSE, MAX_SENTENCE_PAUSE);
        lock(&self.shared.voice).desired.sentence_pause = pause;
        self.send_immediate(format!("@D{} ", hex_digit(pause)));
    }

    pub fn set_word_pause(&self, pause: u8) {
        let pause = pause.clamp(MIN_WORD_PAUSE, MAX_WORD_PAUSE);
        lock(&self.shared.voice).desired.word_pause = pause;
        self.send_immediate(format!("@Q{pause} "));
    }

    pub fn set_punctuation(&self, on: bool) {
        lock(&self.shared.voice).desired.punctuation = on;
        self.send_immediate(format!("@P{} ", u8::from(on)));
    }

    pub fn set_spell_mode(&self, on: bool) {
        lock(&self.shared.voice).desired.spell_mode = on;
        self.send_immediate(format!("@S{} ", u8::from(on)));
    }

    pub fn set_hypermode(&self, on: bool) {
        lock(&self.shared.voice).desired.hypermode = on;
        self.send_immediate(format!("@H{} ", u8::from(on)));
    }

    pub fn set_phonetic_mode(&self, on: bool) {
        lock(&self.shared.voice).desired.phonetic_mode = on;
        self.send_immediate(format!("@X{} ", u8::from(on)));
    }

    pub fn set_mark_space_ratio(&self, ratio: u8) {
        let ratio = ratio.clamp(MIN_MARK_SPACE_RATIO, MAX_MARK_SPACE_RATIO);
        lock(&self.shared.voice).desired.mark_space_ratio = ratio;
        self.send_immediate(format!("@M{ratio:02X} "));
    }

    /// Preset voice selection. Implies a full resync: `@V` resets the
    /// speaker table and filter on some firmware.
    pub fn set_voice(&self, voice: u8) {
        let voice = voice.clamp(MIN_VOICE, MAX_VOICE);
        {
            let mut state = lock(&self.shared.voice);
            state.desired.voice = voice;
            state.needs_soft_reset = true;
        }
        self.queue_settings_sync();
    }

    pub fn set_speaker_table(&self, table: u8) {
        let table = table.min(1);
        {
            let mut state = lock(&self.shared.voice);
            state.desired.speaker_table = table;
            state.needs_soft_reset = true;
        }
        self.queue_settings_sync();
    }

    pub fn set_voice_filter(&self, filter: u8) {
        let filter = filter.clamp(MIN_VOICE_FILTER, MAX_VOICE_FILTER);
        {
            let mut state = lock(&self.shared.voice);
            state.desired.voice_filter = filter;
            state.needs_soft_reset = true;
        }
        self.queue_settings_sync();
    }

    /// Switch the active language ROM slot. The switch flushes device state
    /// completely, so it runs through the full-resync path.
    pub fn set_rom_slot(&self, slot: u8) {
        let slot = slot.clamp(MIN_ROM_SLOT, MAX_ROM_SLOT);
        {
            let mut state = lock(&self.shared.voice);
            state.desired.rom_slot = slot;
        }
        self.queue_settings_sync();
    }

    /// Set one formant delta (tenths are the host's concern; the device gets
    /// the raw +-255 value).
    pub fn set_formant_delta(&self, index: usize, delta: i32) -> Result<()> {
        if index >= FORMANT_COUNT {
            return Err(SynthError::Configuration(format!(
                "formant index {index} out of range"
            )));
        }
        let delta = delta.clamp(FORMANT_DELTA_MIN, FORMANT_DELTA_MAX);
        let generation = self.shared.current_generation();
        let mut voice = lock(&self.shared.voice);
        voice.desired.formant_deltas[index] = delta;
        if !voice.formant_sync_queued {
            voice.formant_sync_queued = true;
            self.shared
                .queue
                .push(WriteItem::sync(WriteKind::FormantSync, generation));
        }
        Ok(())
    }

    pub fn formant_deltas(&self) -> [i32; FORMANT_COUNT] {
        lock(&self.shared.voice).desired.formant_deltas
    }

    /// Change the configured port. Drops any current connection so the next
    /// attempt uses the new setting.
    pub fn set_port(&self, port: &str) {
        let changed = {
            let mut config = lock(&self.shared.config);
            let changed = config.port != port;
            config.port = port.to_string();
            changed
        };
        if changed {
            lock(&self.shared.conn).cached_port = None;
            let mut link = lock(&self.shared.link);
            if link.port.is_some() {
                link.port = None;
                link.seq = link.seq.wrapping_add(1);
                drop(link);
                lock(&self.shared.tracker).clear();
                start_background_connect(&self.shared);
            }
        }
    }

    /// Change the configured baud rate. Only the power-up default is
    /// accepted; a change drops the connection so the next attempt opens at
    /// the new rate.
    pub fn set_baud_rate(&self, baud: u32) -> Result<()> {
        if !settings::SUPPORTED_BAUD_RATES.contains(&baud) {
            return Err(SynthError::Configuration(format!(
                "unsupported baud rate {baud}"
            )));
        }
        let changed = {
            let mut config = lock(&self.shared.config);
            let changed = config.baud_rate != baud;
            config.baud_rate = baud;
            changed
        };
        if changed {
            let mut link = lock(&self.shared.link);
            if link.port.is_some() {
                link.port = None;
                link.seq = link.seq.wrapping_add(1);
                drop(link);
                lock(&self.shared.tracker).clear();
                start_background_connect(&self.shared);
            }
        }
        Ok(())
    }

    pub fn set_expand_numbers(&self, on: bool) {
        lock(&self.shared.config).expand_numbers = on;
    }

    /// Negotiate a device baud change with the `@Y` handshake.
    pub fn request_baud_switch(&self, baud: u32) -> Result<()> {
        let mut link = lock(&self.shared.link);
        let port = link.port.as_mut().ok_or(SynthError::NotConnected)?;
        connection::switch_baud(port.as_mut(), baud)?;
        drop(link);
        lock(&self.shared.config).baud_rate = baud;
        Ok(())
    }

    /// Ask the device for its ROM language table. Rate limited; the reply is
    /// parsed by the reader and lands in [`rom_slots`](Self::rom_slots).
    pub fn request_rom_info(&self) {
        {
            let mut rom = lock(&self.shared.rom);
            let now = Instant::now();
            let recent = rom
                .last_request
                .map_or(false, |at| now.duration_since(at) < ROM_INFO_MIN_INTERVAL);
            if recent {
                return;
            }
            rom.last_request = Some(now);
        }
        let mut payload = LANGUAGE_LIST_COMMAND.to_vec();
        payload.push(CR);
        self.shared.queue.push(WriteItem {
            payload,
            marks: Vec::new(),
            generation: self.shared.current_generation(),
            created_at: Instant::now(),
            cancelable: false,
            kind: WriteKind::Normal,
        });
        // Keep index queries out of the table dump.
        self.shared.suspend_polling(ROM_INFO_TIMEOUT);
    }

    /// Last ROM language table received; the newest reply replaces the cache.
    pub fn rom_slots(&self) -> Vec<RomSlotInfo> {
        lock(&self.shared.rom).slots.clone()
    }

    /// Cancel speech, stop all workers and drop the connection. Idempotent.
    pub fn terminate(&mut self) {
        if !self.shared.is_stopping() {
            // Mute first so the device does not keep talking through its
            // buffered text after the host is gone.
            self.cancel();
            if self.shared.is_connected() {
                let drain_deadline = Instant::now() + TERMINATE_DRAIN;
                while !self.shared.queue.is_empty() && Instant::now() < drain_deadline {
                    thread::sleep(Duration::from_millis(10));
                }
                // The writer may still be pushing the popped mute out.
                thread::sleep(Duration::from_millis(50));
            }
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.queue.close();
        {
            let mut link = lock(&self.shared.link);
            link.port = None;
            link.seq = link.seq.wrapping_add(1);
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("A worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ApolloDriver {
    fn drop(&mut self) {
        self.terminate();
    }
}

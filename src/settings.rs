//! Voice parameter model and ROM slot metadata.
//!
//! `VoiceSettings` is the engine's view of every device-visible parameter.
//! The full settings prefix re-asserts all of them in one block; order
//! matters because selecting a preset voice (`@V`) resets the speaker table
//! and filter on some firmware, so `@V` always goes first.

use std::time::Duration;

use crate::formants::{self, FORMANT_COUNT};
use crate::protocol::hex_digit;

pub const AUTO_PORT: &str = "auto";
#[cfg(windows)]
pub const DEFAULT_PORT: &str = "COM3";
#[cfg(not(windows))]
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Apollo is most stable at its 9600 power-up default; the engine refuses to
/// probe or operate at other rates (false positives and unstable behavior on
/// some USB-serial adapters).
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const SUPPORTED_BAUD_RATES: &[u32] = &[9600];

/// `@Y` selector digit per baud rate.
pub fn baud_selector(baud: u32) -> Option<char> {
    match baud {
        9600 => Some('3'),
        _ => None,
    }
}

pub const MIN_RATE: u8 = 1;
pub const MAX_RATE: u8 = 9;
pub const MIN_PITCH: u8 = 0;
pub const MAX_PITCH: u8 = 15;
pub const MIN_VOLUME: u8 = 0;
pub const MAX_VOLUME: u8 = 15;
pub const MIN_INFLECTION: u8 = 0;
pub const MAX_INFLECTION: u8 = 7;
pub const MIN_VOICING: u8 = 1;
pub const MAX_VOICING: u8 = 8;
pub const MIN_SENTENCE_PAUSE: u8 = 0;
pub const MAX_SENTENCE_PAUSE: u8 = 15;
pub const MIN_WORD_PAUSE: u8 = 0;
pub const MAX_WORD_PAUSE: u8 = 9;
pub const MIN_MARK_SPACE_RATIO: u8 = 0;
pub const MAX_MARK_SPACE_RATIO: u8 = 0x3F;
pub const MIN_VOICE: u8 = 1;
pub const MAX_VOICE: u8 = 6;
pub const MIN_VOICE_FILTER: u8 = 0;
pub const MAX_VOICE_FILTER: u8 = 7;
pub const MIN_ROM_SLOT: u8 = 1;
pub const MAX_ROM_SLOT: u8 = 4;

/// Minimum interval between `@L` metadata requests.
pub const ROM_INFO_MIN_INTERVAL: Duration = Duration::from_secs(5);
/// Deadline for parsing an `@L` response.
pub const ROM_INFO_TIMEOUT: Duration = Duration::from_secs(2);

/// Percent <-> device parameter mapping, used for pitch override
/// commands expressed as percentage offsets.
pub fn percent_to_param(percent: i32, min: u8, max: u8) -> u8 {
    let percent = percent.clamp(0, 100) as f64;
    let span = f64::from(max) - f64::from(min);
    (percent / 100.0 * span + f64::from(min)).round() as u8
}

pub fn param_to_percent(param: u8, min: u8, max: u8) -> i32 {
    if max == min {
        return 0;
    }
    let span = f64::from(max) - f64::from(min);
    ((f64::from(param) - f64::from(min)) / span * 100.0).round() as i32
}

/// Current device-visible voice parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSettings {
    pub rate: u8,
    pub pitch: u8,
    pub volume: u8,
    pub inflection: u8,
    pub voicing: u8,
    pub sentence_pause: u8,
    pub word_pause: u8,
    /// Preset voice, '1'..'6' (1-3 male-based, 4-6 non-male-based).
    pub voice: u8,
    pub punctuation: bool,
    pub spell_mode: bool,
    pub hypermode: bool,
    pub phonetic_mode: bool,
    pub mark_space_ratio: u8,
    /// 0 = male table, 1 = non-male table.
    pub speaker_table: u8,
    pub voice_filter: u8,
    pub rom_slot: u8,
    pub formant_deltas: [i32; FORMANT_COUNT],
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            rate: 3,
            pitch: 8,
            volume: 0xA,
            inflection: 3,
            voicing: 8,
            sentence_pause: 0xB,
            word_pause: 0,
            voice: 1,
            punctuation: false,
            spell_mode: false,
            hypermode: false,
            phonetic_mode: false,
            mark_space_ratio: 0x16,
            speaker_table: 0,
            voice_filter: 0,
            rom_slot: 1,
            formant_deltas: [0; FORMANT_COUNT],
        }
    }
}

fn flag(value: bool) -> char {
    if value {
        '1'
    } else {
        '0'
    }
}

impl VoiceSettings {
    /// The full settings block re-asserting every parameter, followed by the
    /// given formant commands. `@V` first: it can implicitly reset the
    /// speaker table and filter.
    pub fn prefix(&self, formant_commands: &[String]) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("@V{} ", self.voice));
        out.push_str(&format!("@K{} ", self.speaker_table));
        out.push_str(&format!("@${} ", self.voice_filter));
        out.push_str(&format!("@P{} ", flag(self.punctuation)));
        out.push_str(&format!("@S{} ", flag(self.spell_mode)));
        out.push_str(&format!("@H{} ", flag(self.hypermode)));
        out.push_str(&format!("@X{} ", flag(self.phonetic_mode)));
        out.push_str(&format!("@M{:02X} ", self.mark_space_ratio));
        out.push_str(&format!("@W{} ", self.rate));
        out.push_str(&format!("@F{} ", hex_digit(self.pitch)));
        out.push_str(&format!("@A{} ", hex_digit(self.volume)));
        out.push_str(&format!("@R{} ", self.inflection));
        out.push_str(&format!("@B{} ", self.voicing));
        out.push_str(&format!("@D{} ", hex_digit(self.sentence_pause)));
        out.push_str(&format!("@Q{} ", self.word_pause));
        for command in formant_commands {
            out.push_str(command);
        }
        out.into_bytes()
    }

    /// Formant commands on a fresh baseline.
    pub fn formant_commands(&self) -> Vec<String> {
        formants::commands_from_deltas(&self.formant_deltas)
    }
}

/// Per-slot language metadata from a `@L` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomSlotInfo {
    pub slot: u8,
    /// 5-digit numeric language code (variant digit + calling code).
    pub language_code: Option<String>,
    pub extension: Option<char>,
    pub engine_version: Vec<u8>,
    pub language_version: Vec<u8>,
    /// Resolved `ll_CC`-style tag, when the code is recognized.
    pub language_tag: Option<String>,
}

impl RomSlotInfo {
    /// Parse one fixed-size record. Records are 5 language-code digits, an
    /// extension character, then 4+4 version bytes when long enough.
    pub fn from_record(slot: u8, record: &[u8]) -> Self {
        let code_bytes = record.get(..5).unwrap_or(&[]);
        let language_code = if code_bytes.len() == 5
            && code_bytes.iter().all(u8::is_ascii_digit)
        {
            String::from_utf8(code_bytes.to_vec()).ok()
        } else {
            None
        };

        let extension = record
            .get(5)
            .filter(|b| (0x20..=0x7E).contains(*b))
            .map(|&b| b as char);

        let engine_version = record.get(6..10).map(<[u8]>::to_vec).unwrap_or_default();
        let language_version = record.get(10..14).map(<[u8]>::to_vec).unwrap_or_default();

        let language_tag = language_code
            .as_deref()
            .and_then(language_tag_for_code)
            .map(str::to_string);

        Self {
            slot,
            language_code,
            extension,
            engine_version,
            language_version,
            language_tag,
        }
    }
}

/// Map the device's numeric language code to a language tag. The last four
/// digits are an international calling code; the manual says the first digit
/// disambiguates languages sharing one (Welsh is 1 + 0044).
pub fn language_tag_for_code(code: &str) -> Option<&'static str> {
    if code.len() < 5 || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let variant = &code[..1];
    let calling_code = &code[code.len() - 4..];
    if calling_code == "0044" && variant == "1" {
        return Some("cy");
    }
    match calling_code {
        "0001" => Some("en_US"),
        "0031" => Some("nl_NL"),
        "0033" => Some("fr_FR"),
        "0034" => Some("es_ES"),
        "0039" => Some("it_IT"),
        "0041" => Some("de_CH"),
        "0043" => Some("de_AT"),
        "0044" => Some("en_GB"),
        "0045" => Some("da_DK"),
        "0046" => Some("sv_SE"),
        "0047" => Some("nb_NO"),
        "0048" => Some("pl_PL"),
        "0049" => Some("de_DE"),
        "0055" => Some("pt_BR"),
        "0351" => Some("pt_PT"),
        "0353" => Some("en_IE"),
        "0358" => Some("fi_FI"),
        "0380" => Some("uk_UA"),
        "0420" => Some("cs_CZ"),
        "0421" => Some("sk_SK"),
        _ => None,
    }
}

//! Text sanitizing and encoding for the Apollo character set.
//!
//! Outbound text must never contain the `@` command prefix, and every
//! whitespace or control character is normalized to a plain ASCII space so
//! exotic separators (tabs, non-breaking spaces) still break words on the
//! device. Encoding goes through Windows-1250 with a lossy `?` fallback,
//! then a fixed remap of the Polish accented byte values to Apollo's
//! nonstandard positions for the same glyphs.

use std::sync::Arc;

/// Locale-specific digit-run expansion ("1" -> "jeden"), supplied by the host.
pub type NumberExpander = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Replace the command prefix and all whitespace/control characters.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .map(|ch| {
            if ch == '@' || ch.is_whitespace() || (ch as u32) < 0x20 || ch == '\u{7F}' {
                ' '
            } else {
                ch
            }
        })
        .collect()
}

/// cp1250 byte -> Apollo byte, for the Polish accented glyphs whose positions
/// differ between the standard codepage and the device character generator.
const APOLLO_REMAP: &[(u8, u8)] = &[
    (0xB9, 0x86), // ą
    (0xE6, 0x8D), // ć
    (0xEA, 0x91), // ę
    (0xB3, 0x92), // ł
    (0xF1, 0xA4), // ń
    (0xF3, 0xA2), // ó
    (0x9C, 0x9E), // ś
    (0x9F, 0xA6), // ź
    (0xBF, 0xA7), // ż
    (0xA5, 0x8F), // Ą
    (0xC6, 0x95), // Ć
    (0xCA, 0x90), // Ę
    (0xA3, 0x9C), // Ł
    (0xD1, 0xA5), // Ń
    (0xD3, 0xA3), // Ó
    (0x8C, 0x98), // Ś
    (0x8F, 0xA0), // Ź
    (0xAF, 0xA1), // Ż
];

/// Windows-1250 encoding for the non-ASCII range, lossy (`?`) for anything
/// the codepage cannot represent.
fn encode_cp1250_char(ch: char) -> u8 {
    if ch.is_ascii() {
        return ch as u8;
    }
    match ch {
        '\u{20AC}' => 0x80, // €
        '\u{201A}' => 0x82,
        '\u{201E}' => 0x84,
        '\u{2026}' => 0x85,
        '\u{2020}' => 0x86,
        '\u{2021}' => 0x87,
        '\u{2030}' => 0x89,
        'Š' => 0x8A,
        '\u{2039}' => 0x8B,
        'Ś' => 0x8C,
        'Ť' => 0x8D,
        'Ž' => 0x8E,
        'Ź' => 0x8F,
        '\u{2018}' => 0x91,
        '\u{2019}' => 0x92,
        '\u{201C}' => 0x93,
        '\u{201D}' => 0x94,
        '\u{2022}' => 0x95,
        '\u{2013}' => 0x96,
        '\u{2014}' => 0x97,
        '\u{2122}' => 0x99,
        'š' => 0x9A,
        '\u{203A}' => 0x9B,
        'ś' => 0x9C,
        'ť' => 0x9D,
        'ž' => 0x9E,
        'ź' => 0x9F,
        '\u{A0}' => 0xA0,
        'ˇ' => 0xA1,
        '˘' => 0xA2,
        'Ł' => 0xA3,
        '¤' => 0xA4,
        'Ą' => 0xA5,
        '¦' => 0xA6,
        '§' => 0xA7,
        '¨' => 0xA8,
        '©' => 0xA9,
        'Ş' => 0xAA,
        '«' => 0xAB,
        '¬' => 0xAC,
        '\u{AD}' => 0xAD,
        '®' => 0xAE,
        'Ż' => 0xAF,
        '°' => 0xB0,
        '±' => 0xB1,
        '˛' => 0xB2,
        'ł' => 0xB3,
        '´' => 0xB4,
        'µ' => 0xB5,
        '¶' => 0xB6,
        '·' => 0xB7,
        '¸' => 0xB8,
        'ą' => 0xB9,
        'ş' => 0xBA,
        '»' => 0xBB,
        'Ľ' => 0xBC,
        '˝' => 0xBD,
        'ľ' => 0xBE,
        'ż' => 0xBF,
        'Ŕ' => 0xC0,
        'Á' => 0xC1,
        'Â' => 0xC2,
        'Ă' => 0xC3,
        'Ä' => 0xC4,
        'Ĺ' => 0xC5,
        'Ć' => 0xC6,
        'Ç' => 0xC7,
        'Č' => 0xC8,
        'É' => 0xC9,
        'Ę' => 0xCA,
        'Ë' => 0xCB,
        'Ě' => 0xCC,
        'Í' => 0xCD,
        'Î' => 0xCE,
        'Ď' => 0xCF,
        'Đ' => 0xD0,
        'Ń' => 0xD1,
        'Ň' => 0xD2,
        'Ó' => 0xD3,
        'Ô' => 0xD4,
        'Ő' => 0xD5,
        'Ö' => 0xD6,
        '×' => 0xD7,
        'Ř' => 0xD8,
        'Ů' => 0xD9,
        'Ú' => 0xDA,
        'Ű' => 0xDB,
        'Ü' => 0xDC,
        'Ý' => 0xDD,
        'Ţ' => 0xDE,
        'ß' => 0xDF,
        'ŕ' => 0xE0,
        'á' => 0xE1,
        'â' => 0xE2,
        'ă' => 0xE3,
        'ä' => 0xE4,
        'ĺ' => 0xE5,
        'ć' => 0xE6,
        'ç' => 0xE7,
        'č' => 0xE8,
        'é' => 0xE9,
        'ę' => 0xEA,
        'ë' => 0xEB,
        'ě' => 0xEC,
        'í' => 0xED,
        'î' => 0xEE,
        'ď' => 0xEF,
        'đ' => 0xF0,
        'ń' => 0xF1,
        'ň' => 0xF2,
        'ó' => 0xF3,
        'ô' => 0xF4,
        'ő' => 0xF5,
        'ö' => 0xF6,
        '÷' => 0xF7,
        'ř' => 0xF8,
        'ů' => 0xF9,
        'ú' => 0xFA,
        'ű' => 0xFB,
        'ü' => 0xFC,
        'ý' => 0xFD,
        'ţ' => 0xFE,
        '˙' => 0xFF,
        _ => b'?',
    }
}

fn remap_to_apollo(byte: u8) -> u8 {
    APOLLO_REMAP
        .iter()
        .find(|(from, _)| *from == byte)
        .map_or(byte, |(_, to)| *to)
}

/// Encodes sanitized text into the device's 8-bit character set.
#[derive(Clone, Default)]
pub struct TextEncoder {
    number_expander: Option<NumberExpander>,
}

impl TextEncoder {
    pub fn new(number_expander: Option<NumberExpander>) -> Self {
        Self { number_expander }
    }

    /// Encode `text`, optionally expanding digit runs to spoken words first.
    ///
    /// Expansion only runs when the text actually contains a digit, and only
    /// when the host supplied an expander.
    pub fn encode(&self, text: &str, expand_numbers: bool) -> Vec<u8> {
        let expanded;
        let source = if expand_numbers
            && text.chars().any(|c| c.is_ascii_digit())
        {
            match &self.number_expander {
                Some(expander) => {
                    expanded = expander(text);
                    expanded.as_str()
                }
                None => text,
            }
        } else {
            text
        };

        source
            .chars()
            .map(|ch| remap_to_apollo(encode_cp1250_char(ch)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_command_prefix() {
        assert_eq!(sanitize("a@b"), "a b");
        assert_eq!(sanitize("@@"), "  ");
    }

    #[test]
    fn sanitize_normalizes_whitespace_and_controls() {
        assert_eq!(sanitize("a\tb\r\nc"), "a b  c");
        assert_eq!(sanitize("a\u{A0}b"), "a b");
        assert_eq!(sanitize("a\u{1B}b\u{7F}"), "a b ");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn encode_passes_ascii_through() {
        let encoder = TextEncoder::default();
        assert_eq!(encoder.encode("abc 123", false), b"abc 123".to_vec());
    }

    #[test]
    fn encode_expands_numbers_only_when_asked() {
        let encoder = TextEncoder::new(Some(Arc::new(|text: &str| {
            text.replace('1', "jeden")
        })));
        assert_eq!(encoder.encode("1", true), b"jeden".to_vec());
        assert_eq!(encoder.encode("1", false), b"1".to_vec());
        // No digits: the expander must not run.
        assert_eq!(encoder.encode("abc", true), b"abc".to_vec());
    }

    #[test]
    fn encode_remaps_accented_glyphs_to_apollo_positions() {
        let encoder = TextEncoder::default();
        assert_eq!(encoder.encode("ó", false), vec![0xA2]);
        assert_eq!(encoder.encode("Ż", false), vec![0xA1]);
        assert_eq!(encoder.encode("ąę", false), vec![0x86, 0x91]);
    }

    #[test]
    fn encode_is_lossy_for_unmappable_characters() {
        let encoder = TextEncoder::default();
        assert_eq!(encoder.encode("→", false), b"?".to_vec());
    }
}

//! Apollo serial protocol tokens.
//!
//! The command language is ASCII with `@` as the command prefix; every
//! utterance is terminated by a carriage return. Two indexing command
//! variants exist across firmware revisions; the connection layer probes for
//! the working one and the chosen set is kept for the rest of the session.

/// Utterance terminator.
pub const CR: u8 = b'\r';
/// Emitted by some firmware as a flow-control artifact; ignored on receive.
pub const NAK: u8 = 0x15;
/// Control-X: immediately silences the synthesizer and flushes its buffer.
pub const MUTE: u8 = 0x18;

/// First byte of an index-counter response (`I` + 2 hex digits + terminator).
pub const INDEX_RESPONSE_MARKER: u8 = b'I';
/// First byte of a language-list (`@L`) response.
pub const LANGUAGE_LIST_MARKER: u8 = b'L';
/// Accepted terminator bytes for an index-counter response.
pub const INDEX_RESPONSE_TERMINATORS: &[u8] = b"TMtm";

/// Requests the per-slot language ROM table.
pub const LANGUAGE_LIST_COMMAND: &[u8] = b"@L";

/// One firmware's spelling of the indexing commands.
///
/// The `@1?`/`@1+` variant caused stray "1" announcements on some units, so
/// the `@I` form is the default and the digit form is only a probe fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCommandSet {
    /// Query the index counter ("units remaining").
    pub query: &'static [u8],
    /// Enable index reporting.
    pub enable: &'static [u8],
    /// Insert an index mark into the speech stream.
    pub mark: &'static [u8],
}

/// Preferred indexing command variant.
pub const INDEX_COMMANDS_PRIMARY: IndexCommandSet = IndexCommandSet {
    query: b"@I?",
    enable: b"@I+ ",
    mark: b"@I+ ",
};

/// Fallback for firmware that only understands the digit form.
pub const INDEX_COMMANDS_LEGACY: IndexCommandSet = IndexCommandSet {
    query: b"@1?",
    enable: b"@1+ ",
    mark: b"@1+ ",
};

/// Uppercase hex digit for single-digit command arguments (`@F`, `@D`, ...).
pub fn hex_digit(value: u8) -> char {
    char::from_digit(u32::from(value & 0x0F), 16)
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tokens() {
        assert_eq!(CR, b'\r');
        assert_eq!(NAK, 0x15);
        assert_eq!(MUTE, 0x18);
        assert_eq!(INDEX_COMMANDS_PRIMARY.query, b"@I?");
        assert_eq!(INDEX_COMMANDS_PRIMARY.enable, b"@I+ ");
        assert_eq!(INDEX_COMMANDS_LEGACY.query, b"@1?");
    }

    #[test]
    fn hex_digits_are_uppercase() {
        assert_eq!(hex_digit(0x0), '0');
        assert_eq!(hex_digit(0xA), 'A');
        assert_eq!(hex_digit(0xF), 'F');
        // Only the low nibble matters.
        assert_eq!(hex_digit(0x1B), 'B');
    }
}

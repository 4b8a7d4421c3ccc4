//! # Apollo Synthesizer Driver
//!
//! Serial driver engine for the Dolphin Apollo family of hardware speech
//! synthesizers. The crate turns host speech requests (text, index marks,
//! breaks, inline pitch changes) into the device's `@`-prefixed command
//! language and tracks the hardware's index counter so the host learns, in
//! real time, how far speech has actually progressed.
//!
//! ## Crate Structure
//!
//! - **`engine`**: The public `ApolloDriver` handle, speech composition and
//!   the shared state the worker threads operate on.
//! - **`config`**: `SynthConfig`, loadable from TOML files.
//! - **`connection`**: Port scanning, device probing (primary and legacy
//!   index command sets), baud negotiation and background reconnection.
//! - **`queue`**: The cancel-aware outbound write queue.
//! - **`writer`** / **`reader`**: The worker threads doing the serial I/O.
//! - **`protocol`** / **`indexing`**: Wire tokens and the swapped-nibble
//!   index-counter decoding.
//! - **`settings`**: Voice parameter model, ranges and ROM slot metadata.
//! - **`formants`** / **`text`**: Formant nudge commands and text encoding
//!   into the device character set.
//! - **`transport`**: The serial seam (`Transport`, `PortOpener`) that lets
//!   tests substitute an in-memory device.
//! - **`error`**: The `SynthError` enum used across the crate.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod formants;
pub mod indexing;
pub mod protocol;
pub mod queue;
pub mod reader;
pub mod settings;
pub mod text;
pub mod transport;
pub mod writer;

pub use config::SynthConfig;
pub use engine::{ApolloDriver, PitchChange, SpeechItem, SynthEvent, INITIAL_CONNECT_DEADLINE};
pub use error::{Result, SynthError};
pub use queue::IndexMark;
pub use settings::{RomSlotInfo, VoiceSettings};
pub use text::NumberExpander;
pub use transport::{PortOpener, Transport};

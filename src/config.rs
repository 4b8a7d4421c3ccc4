//! Driver configuration.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::settings::{AUTO_PORT, DEFAULT_BAUD_RATE};

/// Configuration surface consumed by the engine.
///
/// The port may be a concrete device name or `"auto"` for detection. The
/// baud rate is effectively fixed at 9600 (the Apollo power-up default);
/// other values are coerced back to it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Serial port device name, or `"auto"` to scan.
    pub port: String,
    /// Serial baud rate; only 9600 is supported.
    pub baud_rate: u32,
    /// Expand digit runs to spoken words (requires a number expander).
    pub expand_numbers: bool,
    /// Spoken once, prefixed to the first utterance after startup.
    pub startup_announcement: Option<String>,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            port: AUTO_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            expand_numbers: false,
            startup_announcement: None,
        }
    }
}

impl SynthConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_to_auto_detection() {
        let cfg = SynthConfig::default();
        assert_eq!(cfg.port, "auto");
        assert_eq!(cfg.baud_rate, 9600);
        assert!(!cfg.expand_numbers);
        assert!(cfg.startup_announcement.is_none());
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apollo.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "port = \"COM5\"\nbaud_rate = 9600\nexpand_numbers = true"
        )
        .unwrap();

        let cfg = SynthConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.port, "COM5");
        assert!(cfg.expand_numbers);
    }
}

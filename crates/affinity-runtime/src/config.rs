use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for marshalled calls and home threads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Deadline for a marshalled call, in milliseconds. `None` waits forever.
    pub marshal_timeout_ms: Option<u64>,
    /// Name given to threads spawned by [`crate::HomeThread::spawn_with`].
    pub home_thread_name: String,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            marshal_timeout_ms: None,
            home_thread_name: "affinity-home".to_string(),
        }
    }
}

impl AffinityConfig {
    /// Default configuration with a bounded marshal deadline.
    pub fn with_marshal_timeout(timeout: Duration) -> Self {
        Self {
            marshal_timeout_ms: Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            ..Default::default()
        }
    }

    /// The marshal deadline, if any.
    pub fn marshal_timeout(&self) -> Option<Duration> {
        self.marshal_timeout_ms.map(Duration::from_millis)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as a TOML document.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let c = AffinityConfig::default();
        assert_eq!(c.marshal_timeout(), None);
        assert_eq!(c.home_thread_name, "affinity-home");
    }

    #[test]
    fn bounded_timeout() {
        let c = AffinityConfig::with_marshal_timeout(Duration::from_millis(10));
        assert_eq!(c.marshal_timeout_ms, Some(10));
        assert_eq!(c.marshal_timeout(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn oversized_timeout_saturates() {
        let c = AffinityConfig::with_marshal_timeout(Duration::MAX);
        assert_eq!(c.marshal_timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let c = AffinityConfig::from_toml_str("marshal_timeout_ms = 250\n").unwrap();
        assert_eq!(c.marshal_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(c.home_thread_name, "affinity-home");
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let err = AffinityConfig::from_toml_str("marshal_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "home_thread_name = \"ui\"").unwrap();
        let c = AffinityConfig::load(file.path()).unwrap();
        assert_eq!(c.home_thread_name, "ui");
        assert_eq!(c.marshal_timeout_ms, None);
    }

    #[test]
    fn toml_roundtrip_preserves_timeout() {
        let c = AffinityConfig::with_marshal_timeout(Duration::from_millis(40));
        let text = c.to_toml_string().unwrap();
        assert_eq!(AffinityConfig::from_toml_str(&text).unwrap(), c);
    }
}

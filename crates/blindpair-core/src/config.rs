use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "blindpair.toml";

/// Session timing and limits, the `[session]` table of `blindpair.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session_duration_secs: u64,
    pub extend_secs: u64,
    /// Countdown at or below this is shown as running low.
    pub low_time_threshold_secs: u64,
    pub search_timeout_secs: u64,
    /// Queue entries older than this are ignored by scans.
    pub queue_max_age_secs: u64,
    /// Pause between tearing down a skipped session and searching again.
    pub skip_debounce_ms: u64,
    pub partner_skipped_grace_ms: u64,
    pub partner_left_grace_ms: u64,
    pub max_message_chars: usize,
    pub max_reaction_chars: usize,
    pub resubscribe_attempts: u32,
    pub resubscribe_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_duration_secs: 300,
            extend_secs: 300,
            low_time_threshold_secs: 60,
            search_timeout_secs: 30,
            queue_max_age_secs: 30,
            skip_debounce_ms: 1000,
            partner_skipped_grace_ms: 2000,
            partner_left_grace_ms: 3000,
            max_message_chars: 200,
            max_reaction_chars: 8,
            resubscribe_attempts: 3,
            resubscribe_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    session: SessionConfig,
}

impl SessionConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn queue_max_age_ms(&self) -> u64 {
        self.queue_max_age_secs.saturating_mul(1000)
    }

    pub fn skip_debounce(&self) -> Duration {
        Duration::from_millis(self.skip_debounce_ms)
    }

    pub fn partner_skipped_grace(&self) -> Duration {
        Duration::from_millis(self.partner_skipped_grace_ms)
    }

    pub fn partner_left_grace(&self) -> Duration {
        Duration::from_millis(self.partner_left_grace_ms)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    /// Reject values that would make a session unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_duration_secs == 0 {
            return Err(ConfigError::must_be_positive("session.session_duration_secs"));
        }
        if self.extend_secs == 0 {
            return Err(ConfigError::must_be_positive("session.extend_secs"));
        }
        if self.search_timeout_secs == 0 {
            return Err(ConfigError::must_be_positive("session.search_timeout_secs"));
        }
        if self.queue_max_age_secs == 0 {
            return Err(ConfigError::must_be_positive("session.queue_max_age_secs"));
        }
        if self.max_message_chars == 0 {
            return Err(ConfigError::must_be_positive("session.max_message_chars"));
        }
        if self.max_reaction_chars == 0 {
            return Err(ConfigError::must_be_positive("session.max_reaction_chars"));
        }
        if self.low_time_threshold_secs >= self.session_duration_secs {
            tracing::warn!(
                low = self.low_time_threshold_secs,
                duration = self.session_duration_secs,
                "low_time_threshold_secs covers the whole session"
            );
        }
        Ok(())
    }

    /// Parse the `[session]` table out of a `blindpair.toml` document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str::<ConfigFile>(content)
            .map(|file| file.session)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from `BLINDPAIR_CONFIG` or `blindpair.toml` if present, then
    /// apply `BLINDPAIR_*` env overrides.
    pub fn load() -> Self {
        let path = std::env::var("BLINDPAIR_CONFIG").unwrap_or_else(|_| CONFIG_FILE.to_string());
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "Loaded session configuration");
                    cfg
                },
                Err(e) => {
                    tracing::warn!(path = %path, "{e}, using defaults");
                    SessionConfig::default()
                },
            },
            Err(_) => {
                tracing::info!(path = %path, "No config file found, using defaults");
                SessionConfig::default()
            },
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply `BLINDPAIR_*` overrides resolved through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("BLINDPAIR_SESSION_DURATION_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.session_duration_secs = n;
        }
        if let Some(val) = lookup("BLINDPAIR_EXTEND_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.extend_secs = n;
        }
        if let Some(val) = lookup("BLINDPAIR_SEARCH_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.search_timeout_secs = n;
        }
        if let Some(val) = lookup("BLINDPAIR_QUEUE_MAX_AGE_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.queue_max_age_secs = n;
        }
        if let Some(val) = lookup("BLINDPAIR_SKIP_DEBOUNCE_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.skip_debounce_ms = n;
        }
        if let Some(val) = lookup("BLINDPAIR_MAX_MESSAGE_CHARS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.max_message_chars = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.session_duration_secs, 300);
        assert_eq!(cfg.extend_secs, 300);
        assert_eq!(cfg.search_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.queue_max_age_ms(), 30_000);
        assert_eq!(cfg.skip_debounce(), Duration::from_millis(1000));
        assert_eq!(cfg.partner_skipped_grace(), Duration::from_millis(2000));
        assert_eq!(cfg.partner_left_grace(), Duration::from_millis(3000));
        assert_eq!(cfg.max_message_chars, 200);
    }

    #[test]
    fn default_config_validates() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn parse_session_table() {
        let toml_str = r#"
[session]
session_duration_secs = 120
max_message_chars = 80
"#;
        let cfg = SessionConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(cfg.session_duration_secs, 120);
        assert_eq!(cfg.max_message_chars, 80);
        assert_eq!(cfg.extend_secs, 300);
    }

    #[test]
    fn empty_document_gives_defaults() {
        let cfg = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = SessionConfig::from_toml_str("[session\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_search_timeout_rejected() {
        let cfg = SessionConfig {
            search_timeout_secs: 0,
            ..SessionConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.to_string(), "session.search_timeout_secs must be > 0");
    }

    #[test]
    fn zero_message_limit_rejected() {
        let cfg = SessionConfig {
            max_message_chars: 0,
            ..SessionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let mut cfg = SessionConfig::default();
        cfg.apply_overrides(|name| match name {
            "BLINDPAIR_SESSION_DURATION_SECS" => Some("90".to_string()),
            "BLINDPAIR_SEARCH_TIMEOUT_SECS" => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(cfg.session_duration_secs, 90);
        assert_eq!(cfg.search_timeout_secs, 30);
    }
}

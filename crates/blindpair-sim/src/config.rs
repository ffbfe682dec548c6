use std::time::Duration;

use serde::Deserialize;

use blindpair_core::config::{CONFIG_FILE, SessionConfig};
use blindpair_core::error::ConfigError;

/// Simulator settings. Top-level keys of `blindpair.toml`, next to the
/// `[session]` table the controllers read.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub clients: usize,
    pub run_secs: u64,
    /// Artificial delay on every store operation.
    pub store_latency_ms: u64,
    pub session: SessionConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clients: 6,
            run_secs: 120,
            store_latency_ms: 15,
            session: SessionConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn run_for(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    pub fn store_latency(&self) -> Duration {
        Duration::from_millis(self.store_latency_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients < 2 {
            return Err(ConfigError::Invalid {
                field: "clients",
                reason: "must be at least 2".to_string(),
            });
        }
        if self.run_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "run_secs",
                reason: "must be > 0".to_string(),
            });
        }
        self.session.validate()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from `BLINDPAIR_CONFIG` or `blindpair.toml`, then apply env
    /// overrides. The `[session]` table goes through [`SessionConfig::load`].
    pub fn load() -> Self {
        let path = std::env::var("BLINDPAIR_CONFIG").unwrap_or_else(|_| CONFIG_FILE.to_string());
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_toml_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path, "{e}, using defaults");
                SimConfig::default()
            }),
            Err(_) => {
                tracing::info!(path = %path, "No config file found, using defaults");
                SimConfig::default()
            },
        };
        config.session = SessionConfig::load();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply `BLINDPAIR_SIM_*` overrides resolved through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("BLINDPAIR_SIM_CLIENTS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.clients = n;
        }
        if let Some(val) = lookup("BLINDPAIR_SIM_RUN_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.run_secs = n;
        }
        if let Some(val) = lookup("BLINDPAIR_SIM_LATENCY_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.store_latency_ms = n;
        }
    }

    /// `--clients=N` and `--run-secs=N` win over file and env.
    pub fn apply_args(&mut self, args: impl IntoIterator<Item = String>) {
        for arg in args {
            if let Some(n) = arg
                .strip_prefix("--clients=")
                .and_then(|v| v.parse::<usize>().ok())
            {
                self.clients = n;
            } else if let Some(n) = arg
                .strip_prefix("--run-secs=")
                .and_then(|v| v.parse::<u64>().ok())
            {
                self.run_secs = n;
            } else {
                tracing::warn!(arg = %arg, "Ignoring unknown argument");
            }
        }
    }
}

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = ".codemode/config.toml";
pub const ENV_PREFIX: &str = "CODEMODE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeModeConfig {
    pub max_concurrent_sessions: usize,
    pub session_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub request_timeout_ms: u64,
    pub cancel_timeout_ms: u64,
    pub auto_validate_syntax: bool,
    pub event_capacity: usize,
}

impl Default for CodeModeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            session_timeout_secs: 10 * 60,
            sweep_interval_secs: 5 * 60,
            request_timeout_ms: 120_000,
            cancel_timeout_ms: 5_000,
            auto_validate_syntax: true,
            event_capacity: 256,
        }
    }
}

impl CodeModeConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    /// Reads `path` if it exists; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: err,
                });
            }
        };
        let parsed: Self = toml::from_str(&content)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// File, then `CODEMODE_*` environment overrides, then validation.
    pub fn from_env_and_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        }

        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = var("MAX_CONCURRENT_SESSIONS") {
            self.max_concurrent_sessions = parse(&key, &value)?;
        }
        if let Some((key, value)) = var("SESSION_TIMEOUT_SECS") {
            self.session_timeout_secs = parse(&key, &value)?;
        }
        if let Some((key, value)) = var("SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse(&key, &value)?;
        }
        if let Some((key, value)) = var("REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse(&key, &value)?;
        }
        if let Some((key, value)) = var("CANCEL_TIMEOUT_MS") {
            self.cancel_timeout_ms = parse(&key, &value)?;
        }
        if let Some((key, value)) = var("AUTO_VALIDATE_SYNTAX") {
            self.auto_validate_syntax = parse(&key, &value)?;
        }
        if let Some((key, value)) = var("EVENT_CAPACITY") {
            self.event_capacity = parse(&key, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("max_concurrent_sessions", self.max_concurrent_sessions as u64),
            ("session_timeout_secs", self.session_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("request_timeout_ms", self.request_timeout_ms),
            ("cancel_timeout_ms", self.cancel_timeout_ms),
            ("event_capacity", self.event_capacity as u64),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: "0".to_string(),
                });
            }
        }
        Ok(())
    }
}

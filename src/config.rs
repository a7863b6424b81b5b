use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::error::ConfigError;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Scoring artifact (scaler + classifier) JSON file.
    pub artifact_path: PathBuf,
    /// Vehicles tracked at once before the least recently seen is dropped.
    pub max_vehicles: usize,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub score_timeout_ms: u64,
    pub ws_ping_interval_secs: u64,
    pub ws_max_message_bytes: usize,
    /// Log every prediction at info level.
    pub log_predictions: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8000,
            artifact_path: PathBuf::from("artifacts/model.json"),
            max_vehicles: 10_000,
            idle_ttl_secs: 3600,
            sweep_interval_secs: 60,
            score_timeout_ms: 250,
            ws_ping_interval_secs: 30,
            ws_max_message_bytes: 64 * 1024,
            log_predictions: false,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// File named by `CONFIG_PATH` (or defaults), then `BIND_ADDR`, `PORT`,
    /// `ARTIFACT_PATH` and `LOG_PRED` from the environment on top.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("CONFIG_PATH") {
            Ok(p) => Self::load(Path::new(&p))?,
            Err(_) => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = get("PORT") {
            self.port = v.parse().map_err(|_| ConfigError::Env { key: "PORT", value: v })?;
        }
        if let Some(v) = get("ARTIFACT_PATH") {
            self.artifact_path = PathBuf::from(v);
        }
        if let Some(v) = get("LOG_PRED") {
            self.log_predictions = v == "1";
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if self.max_vehicles == 0 {
            errors.push("max_vehicles must be at least 1");
        }
        if self.score_timeout_ms == 0 {
            errors.push("score_timeout_ms must be at least 1");
        }
        if self.sweep_interval_secs == 0 {
            errors.push("sweep_interval_secs must be at least 1");
        }
        if self.ws_ping_interval_secs == 0 {
            errors.push("ws_ping_interval_secs must be at least 1");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn score_timeout(&self) -> Duration {
        Duration::from_millis(self.score_timeout_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs)
    }
}

//! Process configuration.
//!
//! Compiled defaults, then the JSON file deep-merged over them, then
//! `TETHER_*` environment overrides. A bad file is an error; a bad env value
//! is logged and ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use tether_engine::ControllerConfig;
use tether_telemetry::{data_dir, TelemetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub server: ServerConfig,
    pub controller: ControllerConfig,
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// Silence after which a session is dropped.
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 30,
            http_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("tether.db"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Principal name to token. Empty means any non-empty token is accepted.
    pub tokens: BTreeMap<String, String>,
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Load from `path` (or the default location) and apply env overrides.
pub fn load_config(path: Option<&Path>) -> Result<TetherConfig, ConfigError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let mut config = load_from_path(&path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// A missing file yields defaults.
pub fn load_from_path(path: &Path) -> Result<TetherConfig, ConfigError> {
    let defaults = serde_json::to_value(TetherConfig::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading config");
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&raw)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "no config file, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key; everything else is replaced. Nulls keep the target.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target), Value::Object(source)) => {
            for (key, value) in source {
                if value.is_null() {
                    continue;
                }
                let merged = match target.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                target.insert(key, merged);
            }
            Value::Object(target)
        }
        (_, source) => source,
    }
}

/// `lookup` is injected so tests don't touch the process environment.
pub fn apply_env_overrides(config: &mut TetherConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("TETHER_HOST") {
        config.server.host = v;
    }
    if let Some(v) = read("TETHER_PORT").and_then(|v| parse_or_warn("TETHER_PORT", &v)) {
        config.server.port = v;
    }
    if let Some(v) = read("TETHER_HEARTBEAT_INTERVAL").and_then(|v| parse_or_warn("TETHER_HEARTBEAT_INTERVAL", &v)) {
        config.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = read("TETHER_DB") {
        config.store.db_path = PathBuf::from(v);
    }
    if let Some(v) = read("TETHER_LOG") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = read("TETHER_SHELL_APPROVAL") {
        match parse_bool(&v) {
            Some(b) => config.controller.shell_requires_approval = b,
            None => warn!(key = "TETHER_SHELL_APPROVAL", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("TETHER_RESUME_RETENTION").and_then(|v| parse_or_warn("TETHER_RESUME_RETENTION", &v)) {
        config.controller.resume_retention_secs = v;
    }
}

pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_or_warn<T: std::str::FromStr>(name: &str, val: &str) -> Option<T> {
    let parsed = val.parse().ok();
    if parsed.is_none() {
        warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    parsed
}

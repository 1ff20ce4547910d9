mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{names, HistogramSummary, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default level directive. `RUST_LOG` wins when set.
    pub log_level: String,
    /// Per-target overrides, e.g. `("tether_engine", "debug")`.
    pub module_levels: Vec<(String, String)>,
    /// JSON lines on stdout instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: false,
            log_db_path: data_dir().join("logs.db"),
        }
    }
}

impl TelemetryConfig {
    fn filter_directive(&self) -> String {
        let mut directive = self.log_level.to_lowercase();
        for (module, level) in &self.module_levels {
            directive.push_str(&format!(",{module}={}", level.to_lowercase()));
        }
        directive
    }
}

/// Keeps the persistent log sink alive for the life of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Install the global subscriber. A second call keeps the first subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let log_sink = if config.log_to_sqlite {
        match SqliteLogSink::open(&config.log_db_path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("tether-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };
    let sqlite_layer = log_sink.clone().map(SqliteLogLayer::new);

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init();

    TelemetryGuard { log_sink }
}

/// `$HOME/.tether`, or `/tmp/.tether` without a home directory.
pub fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".tether")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_includes_overrides() {
        let config = TelemetryConfig {
            log_level: "WARN".into(),
            module_levels: vec![("tether_engine".into(), "DEBUG".into())],
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "warn,tether_engine=debug");
    }

    #[test]
    fn config_fills_defaults() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"json": false}"#).unwrap();
        assert!(!config.json);
        assert_eq!(config.log_level, "info");
        assert!(config.log_db_path.ends_with("logs.db"));
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = TelemetryConfig {
            log_to_sqlite: true,
            log_db_path: dir.path().join("logs.db"),
            ..Default::default()
        };
        let first = init_telemetry(&config);
        let second = init_telemetry(&config);
        assert!(first.logs().is_some());
        assert!(second.logs().is_some());
    }
}

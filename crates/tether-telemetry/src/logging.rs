//! Durable warn+ log trail.
//!
//! Events are tagged with the `job_id` and `session_id` found on the event
//! itself or on any enclosing span, so an operator can pull up everything
//! that went wrong for one job after the fact.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    job_id TEXT,
    session_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_job ON logs(job_id);
CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub job_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub job_id: Option<String>,
    pub session_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &Entry) {
        let conn = self.conn.lock();
        // Logging must never take the process down; a failed insert is dropped.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, job_id, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.ids.job_id,
                entry.ids.session_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, job_id, session_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::new();
        let filters = [
            ("level = ", &q.level),
            ("job_id = ", &q.job_id),
            ("session_id = ", &q.session_id),
            ("timestamp >= ", &q.since),
        ];
        for (clause, value) in &filters {
            if let Some(v) = value {
                params.push(v);
                sql.push_str(&format!(" AND {clause}?{}", params.len()));
            }
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                job_id: row.get(6)?,
                session_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct Entry {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    ids: CorrelationIds,
}

/// Correlation ids carried on spans and propagated to child events.
#[derive(Clone, Default)]
struct CorrelationIds {
    job_id: Option<String>,
    session_id: Option<String>,
}

impl CorrelationIds {
    fn is_empty(&self) -> bool {
        self.job_id.is_none() && self.session_id.is_none()
    }

    fn fill_from(&mut self, other: &CorrelationIds) {
        if self.job_id.is_none() {
            self.job_id.clone_from(&other.job_id);
        }
        if self.session_id.is_none() {
            self.session_id.clone_from(&other.session_id);
        }
    }

    fn complete(&self) -> bool {
        self.job_id.is_some() && self.session_id.is_some()
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
    ids: CorrelationIds,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "job_id" => self.ids.job_id = Some(value),
            "session_id" => self.ids.session_id = Some(value),
            name => {
                self.fields.insert(name.to_string(), Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}").trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

/// Layer persisting WARN and ERROR events through a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.ids);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if !visitor.ids.complete() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(ids) = span.extensions().get::<CorrelationIds>() {
                        visitor.ids.fill_from(ids);
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&Entry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            ids: visitor.ids,
        });
    }
}

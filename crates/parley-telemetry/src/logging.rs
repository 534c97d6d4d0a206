use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A warn+ log event persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`].
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub client_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite store for warn+ events, kept across restarts.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 session_id TEXT,
                 client_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_client ON logs(client_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, event: &CapturedEvent) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id, client_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                event.timestamp,
                event.level,
                event.target,
                event.message,
                event.fields_json(),
                event.session_id,
                event.client_id,
            ],
        )?;
        Ok(())
    }

    /// Most recent records first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, session_id, client_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();

        if let Some(level) = &q.level {
            params.push(level.to_uppercase());
            sql.push_str(&format!(" AND level = ?{}", params.len()));
        }
        if let Some(client_id) = &q.client_id {
            params.push(client_id.clone());
            sql.push_str(&format!(" AND client_id = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(since.clone());
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                session_id: row.get(6)?,
                client_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// tracing layer that writes warn+ events to a [`SqliteLogSink`].
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
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        if *event.metadata().level() > tracing::Level::WARN {
            return;
        }
        let captured = CapturedEvent::capture(event, &ctx);
        // Nowhere to report a failed log write without recursing into tracing.
        let _ = self.sink.insert(&captured);
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        record_span_fields(attrs, id, &ctx);
    }
}

/// Everything a sink needs from one tracing event.
pub(crate) struct CapturedEvent {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
}

impl CapturedEvent {
    pub fn capture<S>(event: &tracing::Event<'_>, ctx: &Context<'_, S>) -> Self
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        // Fall back to the session span for connection identity.
        if visitor.session_id.is_none() || visitor.client_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.session_id.is_none() {
                            visitor.session_id.clone_from(&fields.session_id);
                        }
                        if visitor.client_id.is_none() {
                            visitor.client_id.clone_from(&fields.client_id);
                        }
                    }
                }
            }
        }

        let metadata = event.metadata();
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level: metadata.level().to_string().to_uppercase(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            session_id: visitor.session_id,
            client_id: visitor.client_id,
        }
    }

    fn fields_json(&self) -> Option<String> {
        if self.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&self.fields).ok()
        }
    }

    /// Single human-readable line.
    pub fn to_line(&self) -> String {
        let mut line = format!("{} {:>5} {}: {}", self.timestamp, self.level, self.target, self.message);
        if let Some(client_id) = &self.client_id {
            line.push_str(&format!(" client_id={client_id}"));
        }
        for (key, value) in &self.fields {
            match value {
                serde_json::Value::String(s) => line.push_str(&format!(" {key}={s}")),
                other => line.push_str(&format!(" {key}={other}")),
            }
        }
        line
    }
}

/// Store connection identity from a new span so child events inherit it.
pub(crate) fn record_span_fields<S>(attrs: &span::Attributes<'_>, id: &span::Id, ctx: &Context<'_, S>)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let mut visitor = FieldVisitor::default();
    attrs.record(&mut visitor);
    if visitor.session_id.is_none() && visitor.client_id.is_none() {
        return;
    }
    if let Some(span) = ctx.span(id) {
        let mut extensions = span.extensions_mut();
        if extensions.get_mut::<SpanFields>().is_none() {
            extensions.insert(SpanFields {
                session_id: visitor.session_id,
                client_id: visitor.client_id,
            });
        }
    }
}

struct SpanFields {
    session_id: Option<String>,
    client_id: Option<String>,
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    session_id: Option<String>,
    client_id: Option<String>,
}

impl FieldVisitor {
    fn put_str(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "session_id" => self.session_id = Some(value),
            "client_id" => self.client_id = Some(value),
            other => {
                self.fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        let val = match field.name() {
            "session_id" | "client_id" => val.trim_matches('"').to_string(),
            _ => val,
        };
        self.put_str(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_str(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

//! WARN and ERROR events persisted to SQLite, tagged with the room and
//! session they happened in.

use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const LOGS_DDL: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at     TEXT NOT NULL,
        level         TEXT NOT NULL,
        target        TEXT NOT NULL,
        message       TEXT NOT NULL,
        fields        TEXT,
        room_id       TEXT,
        session_token TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_room ON logs(room_id, logged_at);
    CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_token);
";

/// Write-only `logs` table. Read it with any SQLite client.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(LOGS_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert failures are dropped; logging must never fail the caller.
    fn write(&self, entry: &Entry) {
        let _ = self.conn.lock().execute(
            "INSERT INTO logs (logged_at, level, target, message, fields, room_id, session_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                entry.level.as_str(),
                entry.target,
                entry.message,
                entry.fields,
                entry.tags.room_id,
                entry.tags.session_token,
            ],
        );
    }
}

struct Entry<'a> {
    level: Level,
    target: &'a str,
    message: String,
    fields: Option<String>,
    tags: Tags,
}

/// Room and session correlation, from the event itself or its spans.
#[derive(Clone, Debug, Default)]
struct Tags {
    room_id: Option<String>,
    session_token: Option<String>,
}

impl Tags {
    fn is_empty(&self) -> bool {
        self.room_id.is_none() && self.session_token.is_none()
    }

    fn is_complete(&self) -> bool {
        self.room_id.is_some() && self.session_token.is_some()
    }

    /// Fill gaps from an enclosing span. Values already set win.
    fn inherit(&mut self, outer: &Tags) {
        if self.room_id.is_none() {
            self.room_id.clone_from(&outer.room_id);
        }
        if self.session_token.is_none() {
            self.session_token.clone_from(&outer.session_token);
        }
    }
}

#[derive(Default)]
struct Collector {
    message: String,
    fields: Map<String, Value>,
    tags: Tags,
}

impl Collector {
    fn put(&mut self, field: &Field, value: Value) {
        let name = field.name();
        let as_text = || match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match name {
            "message" => self.message = as_text(),
            "room_id" => self.tags.room_id = Some(as_text()),
            "session_token" => self.tags.session_token = Some(as_text()),
            _ => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for Collector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }
}

/// `tracing` layer feeding a [`SqliteLogSink`]. Events below WARN are skipped.
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
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collector = Collector::default();
        attrs.record(&mut collector);
        if collector.tags.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collector.tags);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut collector = Collector::default();
        event.record(&mut collector);

        let mut tags = collector.tags;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if tags.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Tags>() {
                    tags.inherit(outer);
                }
            }
        }

        let fields = (!collector.fields.is_empty())
            .then(|| serde_json::to_string(&collector.fields).ok())
            .flatten();

        self.sink.write(&Entry {
            level,
            target: event.metadata().target(),
            message: collector.message,
            fields,
            tags,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tracing_subscriber::layer::SubscriberExt;

    type Row = (String, String, Option<String>, Option<String>, Option<String>);

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("huddle-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-logs.db")
    }

    /// (level, message, fields, room_id, session_token), oldest first.
    fn rows(sink: &SqliteLogSink) -> Vec<Row> {
        let conn = sink.conn.lock();
        let mut stmt = conn
            .prepare("SELECT level, message, fields, room_id, session_token FROM logs ORDER BY id")
            .unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)))
            .unwrap()
            .collect::<Result<Vec<Row>, _>>()
            .unwrap();
        rows
    }

    fn capture(f: impl FnOnce()) -> Vec<Row> {
        let sink = Arc::new(SqliteLogSink::open(&temp_db()).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        rows(&sink)
    }

    #[test]
    fn warn_inherits_room_and_session_from_spans() {
        let rows = capture(|| {
            let hub = tracing::info_span!("hub", room_id = 7_i64);
            let _hub = hub.enter();
            let session = tracing::info_span!("session", session_token = "abc123");
            let _session = session.enter();
            tracing::info!("admitted");
            tracing::warn!(queued = 256_u64, "slow consumer evicted");
        });

        assert_eq!(
            rows,
            vec![(
                "WARN".to_string(),
                "slow consumer evicted".to_string(),
                Some(r#"{"queued":256}"#.to_string()),
                Some("7".to_string()),
                Some("abc123".to_string()),
            )]
        );
    }

    #[test]
    fn event_tags_win_over_span_tags() {
        let rows = capture(|| {
            let span = tracing::info_span!("hub", room_id = 1_i64);
            let _entered = span.enter();
            tracing::error!(room_id = 2_i64, "cross-room failure");
        });

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "ERROR");
        assert_eq!(rows[0].2, None);
        assert_eq!(rows[0].3.as_deref(), Some("2"));
        assert_eq!(rows[0].4, None);
    }

    #[test]
    fn untagged_events_outside_spans_are_kept() {
        let rows = capture(|| tracing::warn!(error = %"disk full", "store write failed"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2.as_deref(), Some(r#"{"error":"disk full"}"#));
        assert_eq!(rows[0].3, None);
    }

    #[test]
    fn reopening_keeps_existing_rows() {
        let path = temp_db();
        let sink = Arc::new(SqliteLogSink::open(&path).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || tracing::warn!("first run"));
        drop(sink);

        let reopened = SqliteLogSink::open(&path).unwrap();
        assert_eq!(rows(&reopened)[0].1, "first run");
    }
}

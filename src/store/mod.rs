//! Durable event & feature store backed by SQLite
//!
//! One file, five tables: events (append-only engagement log), feature_windows
//! (one row per 15-min window with a little-endian f32 vector blob), cursors
//! (named ingestion pointers), calibration (singleton threshold), actions
//! (performed engagements, counted for budgets).
//!
//! Schema creation is idempotent; opening the same file twice is safe.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Decode(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "store error: {}", e),
            StoreError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

/// A stored engagement event.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub payload: String,
}

/// Handle to the embedded database. Clone-cheap; the connection is shared
/// behind a mutex (writes are short single statements).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                ts      INTEGER NOT NULL,
                type    TEXT NOT NULL,
                ref     TEXT UNIQUE,
                payload TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);

            CREATE TABLE IF NOT EXISTS feature_windows (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                window_start INTEGER NOT NULL,
                vector       BLOB NOT NULL,
                label        REAL,
                meta         TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_fw_start ON feature_windows(window_start);

            CREATE TABLE IF NOT EXISTS cursors (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS calibration (
                id        INTEGER PRIMARY KEY CHECK (id = 1),
                threshold REAL
            );

            CREATE TABLE IF NOT EXISTS actions (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                ts   INTEGER NOT NULL,
                type TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actions_ts ON actions(ts);
            "#,
        )?;
        Ok(())
    }

    /// Blind event insert. No idempotency guarantee; synthetic events only.
    pub fn put_event(
        &self,
        ts: DateTime<Utc>,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (ts, type, ref, payload) VALUES (?, ?, NULL, ?)",
            params![ts.timestamp(), kind, payload.to_string()],
        )?;
        Ok(())
    }

    /// Idempotent event upsert keyed by an externally supplied reference.
    /// Replaying the same ref overwrites in place and never duplicates.
    pub fn put_event_ref(
        &self,
        ts: DateTime<Utc>,
        kind: &str,
        event_ref: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO events (ts, type, ref, payload) VALUES (?, ?, ?, ?)
            ON CONFLICT(ref) DO UPDATE SET
                ts = excluded.ts,
                type = excluded.type,
                payload = excluded.payload
            "#,
            params![ts.timestamp(), kind, event_ref, payload.to_string()],
        )?;
        Ok(())
    }

    /// Returns events in `[start, end)` ordered by timestamp ascending.
    /// Pass `None` for `kind` to match all types.
    pub fn load_events_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match kind {
            Some(k) => {
                let mut stmt = conn.prepare(
                    "SELECT ts, type, payload FROM events
                     WHERE ts >= ? AND ts < ? AND type = ? ORDER BY ts",
                )?;
                let rows = stmt.query_map(params![start.timestamp(), end.timestamp(), k], row_to_event)?;
                for r in rows {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT ts, type, payload FROM events
                     WHERE ts >= ? AND ts < ? ORDER BY ts",
                )?;
                let rows = stmt.query_map(params![start.timestamp(), end.timestamp()], row_to_event)?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    /// Stores a feature vector for a window. The caller is responsible for
    /// not writing the same window_start twice.
    pub fn put_feature(
        &self,
        window_start: DateTime<Utc>,
        vector: &[f32],
        label: Option<f32>,
        meta: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO feature_windows (window_start, vector, label, meta) VALUES (?, ?, ?, ?)",
            params![
                window_start.timestamp(),
                encode_f32(vector),
                label,
                meta.map(|m| m.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Returns (window_starts, vectors, labels) for windows in `[start, end)`,
    /// ordered by window_start. Unset labels surface as -1.
    #[allow(clippy::type_complexity)]
    pub fn load_features(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<DateTime<Utc>>, Vec<Vec<f32>>, Vec<f32>), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT window_start, vector, COALESCE(label, -1.0) FROM feature_windows
             WHERE window_start >= ? AND window_start < ? ORDER BY window_start",
        )?;
        let mut starts = Vec::new();
        let mut vectors = Vec::new();
        let mut labels = Vec::new();
        let rows = stmt.query_map(params![start.timestamp(), end.timestamp()], |row| {
            let ws: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let label: f32 = row.get(2)?;
            Ok((ws, blob, label))
        })?;
        for r in rows {
            let (ws, blob, label) = r?;
            starts.push(Utc.timestamp_opt(ws, 0).single().ok_or_else(|| {
                StoreError::Decode(format!("window_start out of range: {}", ws))
            })?);
            vectors.push(decode_f32(&blob)?);
            labels.push(label);
        }
        Ok((starts, vectors, labels))
    }

    /// Sets the label for every row at `window_start`.
    pub fn update_label(&self, window_start: DateTime<Utc>, label: f32) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE feature_windows SET label = ? WHERE window_start = ?",
            params![label, window_start.timestamp()],
        )?;
        Ok(())
    }

    /// Loads a named cursor; Ok(None) when the cursor has never been written.
    pub fn load_cursor(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT value FROM cursors WHERE key = ?",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(v)
    }

    /// Last-writer-wins cursor upsert, applied as a single atomic statement.
    pub fn save_cursor(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cursors (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Overwrites the singleton calibration threshold.
    pub fn save_threshold(&self, threshold: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO calibration (id, threshold) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET threshold = excluded.threshold",
            params![threshold],
        )?;
        Ok(())
    }

    /// Loads the calibration threshold; Ok(None) if never calibrated.
    pub fn load_threshold(&self) -> Result<Option<f64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row("SELECT threshold FROM calibration WHERE id = 1", [], |row| {
                row.get::<_, Option<f64>>(0)
            })
            .optional()?;
        Ok(v.flatten())
    }

    /// Records a performed engagement action.
    pub fn put_action(&self, ts: DateTime<Utc>, kind: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO actions (ts, type) VALUES (?, ?)",
            params![ts.timestamp(), kind],
        )?;
        Ok(())
    }

    /// Counts actions of `kind` within `[start, end)`.
    pub fn count_actions_within(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM actions WHERE ts >= ? AND ts < ? AND type = ?",
            params![start.timestamp(), end.timestamp(), kind],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let ts: i64 = row.get(0)?;
    Ok(StoredEvent {
        ts: Utc.timestamp_opt(ts, 0).single().unwrap_or_default(),
        kind: row.get(1)?,
        payload: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
    })
}

/// Encodes f32 values as a little-endian blob, 4 bytes per value.
pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decodes a little-endian f32 blob. The blob length must be a multiple of 4.
pub fn decode_f32(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Decode(format!(
            "vector blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}

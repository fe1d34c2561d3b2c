//! SQLite handle shared by the rule store and the mention ledger. One
//! connection behind a mutex serializes every write, which also gives the
//! per-ticker ordering the ledger needs for its check-then-insert.

use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// Idempotent schema; every statement tolerates re-running.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tickers (
    symbol                TEXT PRIMARY KEY,
    exchange              TEXT,
    confirmed             INTEGER NOT NULL DEFAULT 0,
    confidence            REAL NOT NULL DEFAULT 0,
    last_reconciled_count INTEGER NOT NULL DEFAULT 0,
    created_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mentions (
    ticker       TEXT NOT NULL,
    message_id   TEXT NOT NULL,
    confidence   REAL NOT NULL,
    author_id    TEXT NOT NULL,
    author_name  TEXT NOT NULL,
    mentioned_at TEXT NOT NULL,
    PRIMARY KEY (ticker, message_id)
);

CREATE INDEX IF NOT EXISTS idx_mentions_ticker ON mentions(ticker);

CREATE TABLE IF NOT EXISTS ticker_aggregates (
    ticker              TEXT PRIMARY KEY,
    mention_count       INTEGER NOT NULL,
    unique_author_count INTEGER NOT NULL,
    first_message_id    TEXT,
    first_author        TEXT,
    first_mentioned_at  TEXT,
    last_mentioned_at   TEXT
);

CREATE TABLE IF NOT EXISTS ticker_rules (
    ticker           TEXT PRIMARY KEY,
    kind             TEXT NOT NULL,
    min_confidence   REAL,
    required_phrases TEXT NOT NULL DEFAULT '[]',
    excluded_phrases TEXT NOT NULL DEFAULT '[]',
    domain           TEXT,
    reason           TEXT NOT NULL,
    note             TEXT,
    created_at       TEXT NOT NULL
);
"#;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        info!("[Storage] Opened {} (WAL)", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("storage mutex poisoned")
    }
}

//! Durable, deduplicated mention counts. All mutation of mention rows and
//! their aggregates goes through here; inserts are idempotent on
//! (ticker, message_id) and the aggregate recompute commits in the same
//! transaction as the insert.

use crate::storage::Db;
use crate::types::{FirstMention, PipelineError, SnapshotEntry, Ticker, TickerAggregate};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub inserted: bool,
    pub aggregate: TickerAggregate,
}

#[derive(Clone)]
pub struct MentionLedger {
    db: Db,
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn read_aggregate(tx: &Transaction<'_>, symbol: &str) -> rusqlite::Result<Option<TickerAggregate>> {
    tx.query_row(
        r#"
        SELECT mention_count, unique_author_count, first_message_id,
               first_author, first_mentioned_at, last_mentioned_at
        FROM ticker_aggregates WHERE ticker = ?1
        "#,
        params![symbol],
        |row| {
            let first_message_id: Option<String> = row.get(2)?;
            let first_author: Option<String> = row.get(3)?;
            let first_at: Option<String> = row.get(4)?;
            let last_at: Option<String> = row.get(5)?;
            Ok(TickerAggregate {
                ticker: symbol.to_string(),
                mention_count: row.get::<_, i64>(0)? as u64,
                unique_author_count: row.get::<_, i64>(1)? as u64,
                first_mention: match (first_message_id, first_author, first_at) {
                    (Some(message_id), Some(author_name), Some(at)) => {
                        parse_ts(&at).map(|mentioned_at| FirstMention {
                            message_id,
                            author_name,
                            mentioned_at,
                        })
                    }
                    _ => None,
                },
                last_mention_at: last_at.as_deref().and_then(parse_ts),
            })
        },
    )
    .optional()
}

/// Rebuild the materialized row from mention rows. COUNT DISTINCT, never an
/// increment, so replays cannot inflate the counts.
fn recompute_aggregate(tx: &Transaction<'_>, symbol: &str) -> rusqlite::Result<()> {
    tx.execute(
        r#"
        INSERT INTO ticker_aggregates (
            ticker, mention_count, unique_author_count,
            first_message_id, first_author, first_mentioned_at, last_mentioned_at
        )
        SELECT
            ?1,
            COUNT(DISTINCT message_id),
            COUNT(DISTINCT author_id),
            (SELECT message_id FROM mentions WHERE ticker = ?1
               ORDER BY mentioned_at ASC, message_id ASC LIMIT 1),
            (SELECT author_name FROM mentions WHERE ticker = ?1
               ORDER BY mentioned_at ASC, message_id ASC LIMIT 1),
            (SELECT mentioned_at FROM mentions WHERE ticker = ?1
               ORDER BY mentioned_at ASC, message_id ASC LIMIT 1),
            MAX(mentioned_at)
        FROM mentions WHERE ticker = ?1
        ON CONFLICT(ticker) DO UPDATE SET
            mention_count = excluded.mention_count,
            unique_author_count = excluded.unique_author_count,
            first_message_id = excluded.first_message_id,
            first_author = excluded.first_author,
            first_mentioned_at = excluded.first_mentioned_at,
            last_mentioned_at = excluded.last_mentioned_at
        "#,
        params![symbol],
    )?;
    Ok(())
}

fn set_reconciled_count(conn: &rusqlite::Connection, symbol: &str) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        UPDATE tickers SET last_reconciled_count = COALESCE(
            (SELECT mention_count FROM ticker_aggregates WHERE ticker = ?1), 0)
        WHERE symbol = ?1
        "#,
        params![symbol],
    )?;
    Ok(())
}

fn empty_aggregate(symbol: &str) -> TickerAggregate {
    TickerAggregate {
        ticker: symbol.to_string(),
        mention_count: 0,
        unique_author_count: 0,
        first_mention: None,
        last_mention_at: None,
    }
}

impl MentionLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Idempotently persist one accepted detection. A duplicate
    /// (ticker, message_id) returns `inserted: false` and mutates nothing.
    /// On insert the ticker row is upserted (created and marked confirmed)
    /// and the aggregate recomputed, all in one transaction.
    pub fn record(
        &self,
        symbol: &str,
        message_id: &str,
        confidence: f64,
        author_id: &str,
        author_name: &str,
        mentioned_at: DateTime<Utc>,
        exchange: Option<&str>,
    ) -> Result<RecordOutcome, PipelineError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO mentions (
                ticker, message_id, confidence, author_id, author_name, mentioned_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                symbol,
                message_id,
                confidence,
                author_id,
                author_name,
                mentioned_at.to_rfc3339(),
            ],
        )? > 0;

        if inserted {
            tx.execute(
                r#"
                INSERT INTO tickers (symbol, exchange, confirmed, confidence, created_at)
                VALUES (?1, ?2, 1, ?3, ?4)
                ON CONFLICT(symbol) DO UPDATE SET
                    confirmed = 1,
                    confidence = MAX(tickers.confidence, excluded.confidence),
                    exchange = COALESCE(tickers.exchange, excluded.exchange)
                "#,
                params![symbol, exchange, confidence, Utc::now().to_rfc3339()],
            )?;
            recompute_aggregate(&tx, symbol)?;
        }

        let aggregate = read_aggregate(&tx, symbol)?.unwrap_or_else(|| empty_aggregate(symbol));
        tx.commit()?;
        Ok(RecordOutcome { inserted, aggregate })
    }

    pub fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>, PipelineError> {
        let conn = self.db.lock();
        let ticker = conn
            .query_row(
                r#"
                SELECT symbol, exchange, confirmed, confidence, last_reconciled_count
                FROM tickers WHERE symbol = ?1
                "#,
                params![symbol],
                |row| {
                    Ok(Ticker {
                        symbol: row.get(0)?,
                        exchange: row.get(1)?,
                        confirmed: row.get::<_, i64>(2)? != 0,
                        confidence: row.get(3)?,
                        last_reconciled_count: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(ticker)
    }

    pub fn get_aggregate(&self, symbol: &str) -> Result<Option<TickerAggregate>, PipelineError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let agg = read_aggregate(&tx, symbol)?;
        tx.commit()?;
        Ok(agg)
    }

    pub fn mention_count(&self, symbol: &str) -> Result<u64, PipelineError> {
        Ok(self
            .get_aggregate(symbol)?
            .map(|a| a.mention_count)
            .unwrap_or(0))
    }

    /// Top tickers by mention count, unfiltered; the pipeline applies the
    /// blacklist before handing the snapshot out.
    pub fn snapshot(&self, limit: usize) -> Result<Vec<SnapshotEntry>, PipelineError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT t.symbol, t.exchange, t.confirmed, t.confidence, t.last_reconciled_count,
                   a.mention_count, a.unique_author_count,
                   a.first_message_id, a.first_author, a.first_mentioned_at, a.last_mentioned_at
            FROM tickers t
            JOIN ticker_aggregates a ON a.ticker = t.symbol
            ORDER BY a.mention_count DESC, t.symbol ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let symbol: String = row.get(0)?;
            let first_message_id: Option<String> = row.get(7)?;
            let first_author: Option<String> = row.get(8)?;
            let first_at: Option<String> = row.get(9)?;
            let last_at: Option<String> = row.get(10)?;
            Ok(SnapshotEntry {
                ticker: Ticker {
                    symbol: symbol.clone(),
                    exchange: row.get(1)?,
                    confirmed: row.get::<_, i64>(2)? != 0,
                    confidence: row.get(3)?,
                    last_reconciled_count: row.get::<_, i64>(4)? as u64,
                },
                aggregate: TickerAggregate {
                    ticker: symbol,
                    mention_count: row.get::<_, i64>(5)? as u64,
                    unique_author_count: row.get::<_, i64>(6)? as u64,
                    first_mention: match (first_message_id, first_author, first_at) {
                        (Some(message_id), Some(author_name), Some(at)) => {
                            parse_ts(&at).map(|mentioned_at| FirstMention {
                                message_id,
                                author_name,
                                mentioned_at,
                            })
                        }
                        _ => None,
                    },
                    last_mention_at: last_at.as_deref().and_then(parse_ts),
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Tickers whose mention count grew at least `step` since they were last
    /// reconciled.
    pub fn tickers_due(&self, step: u64) -> Result<Vec<String>, PipelineError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT t.symbol FROM tickers t
            JOIN ticker_aggregates a ON a.ticker = t.symbol
            WHERE a.mention_count - t.last_reconciled_count >= ?1
            ORDER BY a.mention_count DESC
            "#,
        )?;
        let rows = stmt.query_map(params![step as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Reconciliation write-back: adjusts the ticker's confidence and
    /// confirmed flag, optionally rewrites mention confidences in place, and
    /// marks the ticker reconciled at its current count. Mention history rows
    /// are never deleted.
    ///
    /// The confidence the caller rescored against may be stale by the time
    /// this runs (a live `record` can raise it mid-flight), so the delta is
    /// re-checked against the current row inside the transaction. Returns
    /// `None` when the move no longer clears `min_delta`; the ticker is still
    /// marked reconciled in that case.
    pub fn apply_correction(
        &self,
        symbol: &str,
        confidence: f64,
        confirmed: bool,
        mention_confidence: Option<f64>,
        min_delta: f64,
    ) -> Result<Option<TickerAggregate>, PipelineError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let current: Option<f64> = tx
            .query_row(
                "SELECT confidence FROM tickers WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };
        if (confidence - current).abs() < min_delta {
            set_reconciled_count(&tx, symbol)?;
            tx.commit()?;
            return Ok(None);
        }

        tx.execute(
            r#"
            UPDATE tickers SET
                confidence = ?2,
                confirmed = ?3,
                last_reconciled_count = COALESCE(
                    (SELECT mention_count FROM ticker_aggregates WHERE ticker = ?1), 0)
            WHERE symbol = ?1
            "#,
            params![symbol, confidence, confirmed as i64],
        )?;
        if let Some(mc) = mention_confidence {
            tx.execute(
                "UPDATE mentions SET confidence = ?2 WHERE ticker = ?1",
                params![symbol, mc],
            )?;
        }
        recompute_aggregate(&tx, symbol)?;
        let aggregate = read_aggregate(&tx, symbol)?.unwrap_or_else(|| empty_aggregate(symbol));
        tx.commit()?;
        info!(
            "[Ledger] Correction for {}: confidence {:.2} -> {:.2}, confirmed {}",
            symbol, current, confidence, confirmed
        );
        Ok(Some(aggregate))
    }

    /// Mark a ticker reconciled without changing its state (no material
    /// confidence move).
    pub fn mark_reconciled(&self, symbol: &str) -> Result<(), PipelineError> {
        let conn = self.db.lock();
        set_reconciled_count(&conn, symbol)?;
        Ok(())
    }

    pub fn ticker_count(&self) -> Result<u64, PipelineError> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM tickers", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn total_mentions(&self) -> Result<u64, PipelineError> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM mentions", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> MentionLedger {
        MentionLedger::new(Db::open_in_memory().unwrap())
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn record_is_idempotent_on_ticker_and_message() {
        let ledger = ledger();
        let first = ledger
            .record("TSLA", "msg-1", 0.95, "u1", "alice", ts("2024-03-01T10:00:00Z"), Some("NASDAQ"))
            .unwrap();
        assert!(first.inserted);
        assert_eq!(first.aggregate.mention_count, 1);

        let second = ledger
            .record("TSLA", "msg-1", 0.95, "u1", "alice", ts("2024-03-01T10:00:00Z"), Some("NASDAQ"))
            .unwrap();
        assert!(!second.inserted);
        assert_eq!(second.aggregate.mention_count, 1);
        assert_eq!(ledger.total_mentions().unwrap(), 1);
    }

    #[test]
    fn aggregate_counts_distinct_authors_and_tracks_first_mention() {
        let ledger = ledger();
        ledger
            .record("XPON", "m1", 0.9, "u1", "alice", ts("2024-03-01T10:00:00Z"), None)
            .unwrap();
        ledger
            .record("XPON", "m2", 0.8, "u2", "bob", ts("2024-03-01T11:00:00Z"), None)
            .unwrap();
        let out = ledger
            .record("XPON", "m3", 0.85, "u1", "alice", ts("2024-03-01T12:00:00Z"), None)
            .unwrap();

        assert_eq!(out.aggregate.mention_count, 3);
        assert_eq!(out.aggregate.unique_author_count, 2);
        let first = out.aggregate.first_mention.unwrap();
        assert_eq!(first.message_id, "m1");
        assert_eq!(first.author_name, "alice");
        assert_eq!(out.aggregate.last_mention_at, Some(ts("2024-03-01T12:00:00Z")));
    }

    #[test]
    fn first_record_confirms_the_ticker() {
        let ledger = ledger();
        assert!(ledger.get_ticker("RIVN").unwrap().is_none());
        ledger
            .record("RIVN", "m1", 0.8, "u1", "alice", Utc::now(), Some("NASDAQ"))
            .unwrap();
        let ticker = ledger.get_ticker("RIVN").unwrap().unwrap();
        assert!(ticker.confirmed);
        assert_eq!(ticker.exchange.as_deref(), Some("NASDAQ"));
    }

    #[test]
    fn correction_downgrades_without_deleting_history() {
        let ledger = ledger();
        for i in 0..5 {
            ledger
                .record("RUN", &format!("m{i}"), 0.72, "u1", "alice", Utc::now(), None)
                .unwrap();
        }
        let agg = ledger
            .apply_correction("RUN", 0.4, false, Some(0.4), 0.15)
            .unwrap()
            .expect("material move writes a correction");
        assert_eq!(agg.mention_count, 5);
        assert_eq!(ledger.total_mentions().unwrap(), 5);

        let ticker = ledger.get_ticker("RUN").unwrap().unwrap();
        assert!(!ticker.confirmed);
        assert!((ticker.confidence - 0.4).abs() < 1e-9);
        assert_eq!(ticker.last_reconciled_count, 5);
    }

    #[test]
    fn concurrent_confidence_bump_cancels_a_stale_correction() {
        let ledger = ledger();
        ledger
            .record("XPON", "m1", 0.6, "u1", "alice", Utc::now(), None)
            .unwrap();
        // a second mention raises the confidence after the reconciler's read
        ledger
            .record("XPON", "m2", 0.9, "u2", "bob", Utc::now(), None)
            .unwrap();

        // rescored against the stale 0.6, but only 0.1 away from the row now
        let out = ledger.apply_correction("XPON", 0.8, true, None, 0.15).unwrap();
        assert!(out.is_none());

        let ticker = ledger.get_ticker("XPON").unwrap().unwrap();
        assert!((ticker.confidence - 0.9).abs() < 1e-9);
        assert_eq!(ticker.last_reconciled_count, 2);
    }

    #[test]
    fn correction_for_unknown_ticker_is_a_no_op() {
        let ledger = ledger();
        assert!(ledger.apply_correction("GHOST", 0.2, false, None, 0.15).unwrap().is_none());
    }

    #[test]
    fn tickers_due_respects_step() {
        let ledger = ledger();
        for i in 0..3 {
            ledger
                .record("AAA", &format!("a{i}"), 0.9, "u1", "alice", Utc::now(), None)
                .unwrap();
        }
        ledger
            .record("BBB", "b0", 0.9, "u1", "alice", Utc::now(), None)
            .unwrap();

        assert_eq!(ledger.tickers_due(3).unwrap(), vec!["AAA".to_string()]);
        ledger.mark_reconciled("AAA").unwrap();
        assert!(ledger.tickers_due(3).unwrap().is_empty());
    }

    #[test]
    fn snapshot_orders_by_mention_count() {
        let ledger = ledger();
        for i in 0..2 {
            ledger
                .record("LOW", &format!("l{i}"), 0.9, "u1", "a", Utc::now(), None)
                .unwrap();
        }
        for i in 0..4 {
            ledger
                .record("TOP", &format!("t{i}"), 0.9, "u1", "a", Utc::now(), None)
                .unwrap();
        }
        let snap = ledger.snapshot(10).unwrap();
        assert_eq!(snap[0].ticker.symbol, "TOP");
        assert_eq!(snap[0].aggregate.mention_count, 4);
        assert_eq!(snap[1].ticker.symbol, "LOW");

        let limited = ledger.snapshot(1).unwrap();
        assert_eq!(limited.len(), 1);
    }
}

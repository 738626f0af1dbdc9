//! SQLite-backed similarity store.
//!
//! RULE: Only this file talks to the database.
//! One connection behind a mutex; every statement that changes a
//! fingerprint's history runs inside a single transaction.

use crate::{
    clock::SharedClock,
    context::{Backoff, OpContext},
    error::{StoreError, StoreOp, StoreResult},
    store::{decode_records, SimilarityStore},
    sweeper::Sweeper,
    types::{window_start, TransactionRecord, TransactionStatus},
};
use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

pub struct SqliteStore {
    inner:   Arc<SqliteInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

struct SqliteInner {
    /// `None` once the store is closed.
    conn:        Mutex<Option<Connection>>,
    max_records: usize,
    clock:       SharedClock,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and sweep records older
    /// than `window` every `sweep_interval`.
    pub fn open(
        path: &str,
        clock: SharedClock,
        max_records: usize,
        window: Duration,
        sweep_interval: std::time::Duration,
    ) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| StoreError::database(StoreOp::Connect, e))?;
        // WAL mode only for real files; :memory: ignores it.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        let store = Self::with_connection(conn, clock, max_records)?;

        let inner = Arc::clone(&store.inner);
        let sweeper = Sweeper::spawn("sqlite-store", sweep_interval, move || {
            match inner.cleanup(&OpContext::background(), window) {
                Ok(0) => {}
                Ok(removed) => log::debug!("dedup: sqlite sweep removed {removed} expired records"),
                Err(e) => log::warn!("dedup: sqlite sweep failed: {e}"),
            }
        })?;
        *store.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);
        Ok(store)
    }

    /// Open an in-memory database with no sweeper (used in tests).
    pub fn in_memory(clock: SharedClock, max_records: usize) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::database(StoreOp::Connect, e))?;
        Self::with_connection(conn, clock, max_records)
    }

    fn with_connection(conn: Connection, clock: SharedClock, max_records: usize) -> StoreResult<Self> {
        conn.execute_batch(include_str!("../../../migrations/001_txn_record.sql"))
            .map_err(|e| StoreError::database(StoreOp::Connect, e))?;
        Ok(Self {
            inner: Arc::new(SqliteInner {
                conn: Mutex::new(Some(conn)),
                max_records: max_records.max(1),
                clock,
            }),
            sweeper: Mutex::new(None),
        })
    }
}

impl SqliteInner {
    fn lock(&self, ctx: &OpContext, op: StoreOp) -> StoreResult<MutexGuard<'_, Option<Connection>>> {
        let mut backoff = Backoff::new();
        loop {
            ctx.check(op)?;
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => backoff.snooze(),
                Err(TryLockError::Poisoned(_)) => return Err(StoreError::Poisoned { op }),
            }
        }
    }

    fn with_conn<R>(
        &self,
        ctx: &OpContext,
        op: StoreOp,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>,
    ) -> StoreResult<R> {
        let mut guard = self.lock(ctx, op)?;
        let conn = guard.as_mut().ok_or(StoreError::Closed { op })?;
        f(conn).map_err(|e| StoreError::database(op, e))
    }

    fn store(&self, ctx: &OpContext, fingerprint: &str, record: &TransactionRecord) -> StoreResult<()> {
        let op = StoreOp::Store;
        let payload = serde_json::to_string(record).map_err(|e| StoreError::serialization(op, e))?;
        let created_ms = record.created_at.map(|at| at.timestamp_millis());
        let keep = self.max_records as i64;

        self.with_conn(ctx, op, |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO txn_record (fingerprint, transaction_id, created_at_ms, status, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    fingerprint,
                    record.transaction_id,
                    created_ms,
                    record.status.as_str(),
                    payload,
                ],
            )?;
            tx.execute(
                "DELETE FROM txn_record
                 WHERE fingerprint = ?1
                   AND seq NOT IN (
                       SELECT seq FROM txn_record WHERE fingerprint = ?1
                       ORDER BY seq DESC LIMIT ?2
                   )",
                params![fingerprint, keep],
            )?;
            tx.commit()
        })
    }

    fn get_similar(
        &self,
        ctx: &OpContext,
        fingerprint: &str,
        window: Duration,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let now = self.clock.now();
        let from = window_start(now, window).timestamp_millis();
        let to = now.timestamp_millis();

        let payloads = self.with_conn(ctx, StoreOp::GetSimilar, |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM txn_record
                 WHERE fingerprint = ?1 AND created_at_ms BETWEEN ?2 AND ?3
                 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map(params![fingerprint, from, to], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(decode_records("sqlite", payloads))
    }

    fn cleanup(&self, ctx: &OpContext, window: Duration) -> StoreResult<usize> {
        let cutoff = window_start(self.clock.now(), window).timestamp_millis();
        self.with_conn(ctx, StoreOp::Cleanup, |conn| {
            conn.execute(
                "DELETE FROM txn_record WHERE created_at_ms IS NULL OR created_at_ms < ?1",
                params![cutoff],
            )
        })
    }

    fn update_status(
        &self,
        ctx: &OpContext,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        self.with_conn(ctx, StoreOp::UpdateStatus, |conn| {
            let tx = conn.transaction()?;
            let latest: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, payload FROM txn_record
                     WHERE transaction_id = ?1
                     ORDER BY seq DESC LIMIT 1",
                    params![transaction_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((seq, payload)) = latest else {
                return Ok(false);
            };
            let mut record = match serde_json::from_str::<TransactionRecord>(&payload) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("dedup: sqlite store cannot update malformed record {transaction_id}: {e}");
                    return Ok(false);
                }
            };
            record.status = status;
            record.updated_at = Some(now);
            let payload = serde_json::to_string(&record)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

            tx.execute(
                "UPDATE txn_record SET status = ?1, payload = ?2 WHERE seq = ?3",
                params![status.as_str(), payload, seq],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }
}

impl SimilarityStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn store(&self, ctx: &OpContext, fingerprint: &str, record: &TransactionRecord) -> StoreResult<()> {
        self.inner.store(ctx, fingerprint, record)
    }

    fn get_similar(
        &self,
        ctx: &OpContext,
        fingerprint: &str,
        window: Duration,
    ) -> StoreResult<Vec<TransactionRecord>> {
        self.inner.get_similar(ctx, fingerprint, window)
    }

    fn cleanup(&self, ctx: &OpContext, window: Duration) -> StoreResult<usize> {
        self.inner.cleanup(ctx, window)
    }

    fn update_status(
        &self,
        ctx: &OpContext,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> StoreResult<bool> {
        self.inner.update_status(ctx, transaction_id, status)
    }

    fn close(&self) -> StoreResult<()> {
        let sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut sweeper) = sweeper {
            sweeper.stop();
        }
        let conn = self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| StoreError::database(StoreOp::Close, e))?;
        }
        Ok(())
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("dedup: sqlite store close failed: {e}");
        }
    }
}

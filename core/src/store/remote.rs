//! Redis-backed similarity store.
//!
//! Layout:
//!   {prefix}tx:{fingerprint}   sorted set, member = record JSON,
//!                              score = created_at in epoch millis
//!   {prefix}txid:{id}          string, the fingerprint holding `id`
//!
//! Both keys carry a native TTL (`key_ttl_secs`), so `cleanup` is only
//! a best-effort trim on top of Redis expiry. Every network call is
//! bounded by the caller's `OpContext`.

use crate::{
    clock::SharedClock,
    config::RedisConfig,
    context::OpContext,
    error::{StoreError, StoreOp, StoreResult},
    store::{decode_records, SimilarityStore},
    types::{window_start, TransactionRecord, TransactionStatus},
};
use chrono::Duration;
use redis::{Client, Commands, Connection, RedisResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

pub struct RedisStore {
    client:          Client,
    /// Idle connections, reused across calls.
    pool:            Mutex<Vec<Connection>>,
    pool_size:       usize,
    key_prefix:      String,
    key_ttl_secs:    i64,
    connect_timeout: StdDuration,
    io_timeout:      StdDuration,
    max_records:     usize,
    clock:           SharedClock,
    closed:          AtomicBool,
}

pub(crate) fn history_key(prefix: &str, fingerprint: &str) -> String {
    format!("{prefix}tx:{fingerprint}")
}

pub(crate) fn index_key(prefix: &str, transaction_id: &str) -> String {
    format!("{prefix}txid:{transaction_id}")
}

/// Sort score for a record: creation time in epoch milliseconds.
pub(crate) fn score(record: &TransactionRecord) -> i64 {
    record.created_at.map_or(0, |at| at.timestamp_millis())
}

/// One atomic append: add the record, trim the set to the newest `keep`
/// members, refresh the key's TTL, and point the id index at it.
pub(crate) fn append_pipeline(
    prefix: &str,
    fingerprint: &str,
    record: &TransactionRecord,
    payload: &str,
    keep: usize,
    ttl_secs: i64,
) -> redis::Pipeline {
    let key = history_key(prefix, fingerprint);
    let keep = keep as i64;

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("ZADD").arg(&key).arg(score(record)).arg(payload).ignore()
        .cmd("ZREMRANGEBYRANK").arg(&key).arg(0).arg(-(keep + 1)).ignore()
        .cmd("EXPIRE").arg(&key).arg(ttl_secs).ignore();
    if !record.transaction_id.is_empty() {
        let index = index_key(prefix, &record.transaction_id);
        pipe.cmd("SET").arg(&index).arg(fingerprint)
            .arg("EX").arg(ttl_secs).ignore();
    }
    pipe
}

impl RedisStore {
    /// Connect and verify the server answers PING within the connect
    /// timeout.
    pub fn connect(config: &RedisConfig, clock: SharedClock, max_records: usize) -> StoreResult<Self> {
        let op = StoreOp::Connect;
        let client =
            Client::open(config.connection_url()).map_err(|e| StoreError::redis(op, e))?;

        let store = Self {
            client,
            pool: Mutex::new(Vec::with_capacity(config.pool_size)),
            pool_size: config.pool_size.max(1),
            key_prefix: config.key_prefix.clone(),
            key_ttl_secs: config.key_ttl_secs.max(1),
            connect_timeout: StdDuration::from_millis(config.connect_timeout_ms.max(1)),
            io_timeout: StdDuration::from_millis(config.io_timeout_ms.max(1)),
            max_records: max_records.max(1),
            clock,
            closed: AtomicBool::new(false),
        };

        let ctx = OpContext::with_timeout(store.connect_timeout);
        store.with_conn(&ctx, op, |conn| redis::cmd("PING").query::<String>(conn))?;
        log::info!("dedup: connected to redis at {}", config.address);
        Ok(store)
    }

    fn checkout(&self, ctx: &OpContext, op: StoreOp) -> StoreResult<Connection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed { op });
        }
        ctx.check(op)?;

        let pooled = self
            .pool
            .lock()
            .map_err(|_| StoreError::Poisoned { op })?
            .pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => self
                .client
                .get_connection_with_timeout(ctx.bound(self.connect_timeout))
                .map_err(|e| StoreError::redis(op, e))?,
        };

        let io_timeout = Some(ctx.bound(self.io_timeout));
        conn.set_read_timeout(io_timeout)
            .and_then(|_| conn.set_write_timeout(io_timeout))
            .map_err(|e| StoreError::redis(op, e))?;
        Ok(conn)
    }

    fn checkin(&self, conn: Connection) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < self.pool_size {
                pool.push(conn);
            }
        }
    }

    /// Run one round trip on a pooled connection. Connections that saw
    /// an error are dropped rather than returned to the pool.
    fn with_conn<R>(
        &self,
        ctx: &OpContext,
        op: StoreOp,
        f: impl FnOnce(&mut Connection) -> RedisResult<R>,
    ) -> StoreResult<R> {
        let mut conn = self.checkout(ctx, op)?;
        match f(&mut conn) {
            Ok(value) => {
                self.checkin(conn);
                Ok(value)
            }
            Err(e) => {
                // A deadline that expired mid-call surfaces as a timeout.
                ctx.check(op)?;
                Err(StoreError::redis(op, e))
            }
        }
    }
}

impl SimilarityStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn store(&self, ctx: &OpContext, fingerprint: &str, record: &TransactionRecord) -> StoreResult<()> {
        let op = StoreOp::Store;
        let payload = serde_json::to_string(record).map_err(|e| StoreError::serialization(op, e))?;
        let pipe = append_pipeline(
            &self.key_prefix,
            fingerprint,
            record,
            &payload,
            self.max_records,
            self.key_ttl_secs,
        );

        self.with_conn(ctx, op, |conn| pipe.query::<()>(conn))
    }

    fn get_similar(
        &self,
        ctx: &OpContext,
        fingerprint: &str,
        window: Duration,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let now = self.clock.now();
        let min = window_start(now, window).timestamp_millis();
        let max = now.timestamp_millis();
        let key = history_key(&self.key_prefix, fingerprint);

        let payloads: Vec<String> = self.with_conn(ctx, StoreOp::GetSimilar, |conn| {
            redis::cmd("ZRANGEBYSCORE").arg(&key).arg(min).arg(max).query(conn)
        })?;
        Ok(decode_records("redis", payloads))
    }

    fn cleanup(&self, ctx: &OpContext, window: Duration) -> StoreResult<usize> {
        let op = StoreOp::Cleanup;
        let cutoff = window_start(self.clock.now(), window).timestamp_millis();
        let pattern = history_key(&self.key_prefix, "*");

        let keys: Vec<String> = self.with_conn(ctx, op, |conn| {
            let keys = conn.scan_match::<_, String>(&pattern)?.collect::<Vec<_>>();
            Ok(keys)
        })?;

        let mut removed = 0;
        for key in keys {
            removed += self.with_conn(ctx, op, |conn| {
                redis::cmd("ZREMRANGEBYSCORE")
                    .arg(&key)
                    .arg("-inf")
                    .arg(format!("({cutoff}"))
                    .query::<usize>(conn)
            })?;
        }
        log::debug!("dedup: redis cleanup removed {removed} expired records");
        Ok(removed)
    }

    fn update_status(
        &self,
        ctx: &OpContext,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> StoreResult<bool> {
        let op = StoreOp::UpdateStatus;
        let index = index_key(&self.key_prefix, transaction_id);
        let fingerprint: Option<String> = self.with_conn(ctx, op, |conn| conn.get(&index))?;
        let Some(fingerprint) = fingerprint else {
            return Ok(false);
        };

        let key = history_key(&self.key_prefix, &fingerprint);
        let members: Vec<(String, f64)> =
            self.with_conn(ctx, op, |conn| conn.zrange_withscores(&key, 0, -1))?;

        let found = members.into_iter().rev().find_map(|(payload, score)| {
            let record: TransactionRecord = serde_json::from_str(&payload).ok()?;
            (record.transaction_id == transaction_id).then_some((payload, score, record))
        });
        let Some((old_payload, score, mut record)) = found else {
            return Ok(false);
        };

        record.status = status;
        record.updated_at = Some(self.clock.now());
        let new_payload = serde_json::to_string(&record).map_err(|e| StoreError::serialization(op, e))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREM").arg(&key).arg(&old_payload).ignore()
            .cmd("ZADD").arg(&key).arg(score).arg(&new_payload).ignore();
        self.with_conn(ctx, op, |conn| pipe.query::<()>(conn))?;
        Ok(true)
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool
            .lock()
            .map_err(|_| StoreError::Poisoned { op: StoreOp::Close })?
            .clear();
        Ok(())
    }
}

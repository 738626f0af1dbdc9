//! In-process similarity store.
//!
//! Histories live in a sharded `DashMap`, so writers to fingerprints in
//! different shards never wait on each other and readers of one shard
//! proceed together. Lock waits poll `try_get*` with a yield-then-sleep
//! backoff and re-check the caller's `OpContext`, so a contended call
//! fails fast on cancellation instead of blocking.
//!
//! The transaction-id index is only touched under the owning history's
//! write guard. An id stays indexed while any record in that history
//! still carries it.
//!
//! Cleanup never holds more than one fingerprint's guard at a time:
//! the surviving records of each history are swapped in under that
//! history's write guard.

use crate::{
    clock::SharedClock,
    context::{Backoff, OpContext},
    error::{StoreError, StoreOp, StoreResult},
    store::SimilarityStore,
    sweeper::Sweeper,
    types::{window_start, TransactionRecord, TransactionStatus},
};
use chrono::Duration;
use dashmap::{try_result::TryResult, DashMap};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type History = VecDeque<TransactionRecord>;

pub struct MemoryStore {
    inner:   Arc<MemoryInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

struct MemoryInner {
    histories:   DashMap<String, History>,
    /// transaction id → fingerprint of its most recent record.
    by_txn_id:   DashMap<String, String>,
    max_records: usize,
    clock:       SharedClock,
    closed:      AtomicBool,
}

impl MemoryStore {
    /// A store with no background sweeper. Expiry happens only through
    /// explicit `cleanup` calls.
    pub fn new(clock: SharedClock, max_records: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                histories: DashMap::new(),
                by_txn_id: DashMap::new(),
                max_records: max_records.max(1),
                clock,
                closed: AtomicBool::new(false),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// A store that sweeps records older than `window` every
    /// `sweep_interval` until it is closed or dropped.
    pub fn start(
        clock: SharedClock,
        max_records: usize,
        window: Duration,
        sweep_interval: std::time::Duration,
    ) -> StoreResult<Self> {
        let store = Self::new(clock, max_records);
        let inner = Arc::clone(&store.inner);
        let sweeper = Sweeper::spawn("memory-store", sweep_interval, move || {
            match inner.cleanup(&OpContext::background(), window) {
                Ok(0) => {}
                Ok(removed) => log::debug!("dedup: memory sweep removed {removed} expired records"),
                Err(e) => log::warn!("dedup: memory sweep failed: {e}"),
            }
        })?;
        *store.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);
        Ok(store)
    }

    /// Number of fingerprints currently holding history.
    pub fn fingerprint_count(&self) -> usize {
        self.inner.histories.len()
    }

    /// Records held under `fingerprint`, expired or not.
    pub fn history_len(&self, fingerprint: &str) -> usize {
        self.inner.histories.get(fingerprint).map_or(0, |h| h.len())
    }
}

impl MemoryInner {
    fn ensure_open(&self, op: StoreOp) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed { op });
        }
        Ok(())
    }

    /// Run `f` under the read guard of one history.
    fn read_history<R>(
        &self,
        ctx: &OpContext,
        op: StoreOp,
        fingerprint: &str,
        f: impl FnOnce(&History) -> R,
    ) -> StoreResult<Option<R>> {
        let mut backoff = Backoff::new();
        loop {
            ctx.check(op)?;
            match self.histories.try_get(fingerprint) {
                TryResult::Present(history) => return Ok(Some(f(&*history))),
                TryResult::Absent => return Ok(None),
                TryResult::Locked => backoff.snooze(),
            }
        }
    }

    /// Run `f` under the write guard of one history.
    fn write_history<R>(
        &self,
        ctx: &OpContext,
        op: StoreOp,
        fingerprint: &str,
        f: impl FnOnce(&mut History) -> R,
    ) -> StoreResult<Option<R>> {
        let mut backoff = Backoff::new();
        loop {
            ctx.check(op)?;
            match self.histories.try_get_mut(fingerprint) {
                TryResult::Present(mut history) => return Ok(Some(f(&mut *history))),
                TryResult::Absent => return Ok(None),
                TryResult::Locked => backoff.snooze(),
            }
        }
    }

    fn store(&self, ctx: &OpContext, fingerprint: &str, record: &TransactionRecord) -> StoreResult<()> {
        self.ensure_open(StoreOp::Store)?;
        let appended = self.write_history(ctx, StoreOp::Store, fingerprint, |history| {
            self.append(fingerprint, history, record.clone())
        })?;

        if appended.is_none() {
            ctx.check(StoreOp::Store)?;
            let mut history = self.histories.entry(fingerprint.to_string()).or_default();
            self.append(fingerprint, &mut *history, record.clone());
        }
        Ok(())
    }

    /// Push `record`, evict past the cap, and keep the id index in step.
    /// Caller holds the history's write guard.
    fn append(&self, fingerprint: &str, history: &mut History, record: TransactionRecord) {
        let id = record.transaction_id.clone();
        history.push_back(record);
        let overflow = history.len().saturating_sub(self.max_records);
        let evicted: Vec<_> = history.drain(..overflow).collect();

        self.unindex_gone(fingerprint, history, &evicted);
        if !id.is_empty() {
            self.by_txn_id.insert(id, fingerprint.to_string());
        }
    }

    fn get_similar(
        &self,
        ctx: &OpContext,
        fingerprint: &str,
        window: Duration,
    ) -> StoreResult<Vec<TransactionRecord>> {
        self.ensure_open(StoreOp::GetSimilar)?;
        let now = self.clock.now();
        let similar = self.read_history(ctx, StoreOp::GetSimilar, fingerprint, |history| {
            history
                .iter()
                .filter(|r| r.created_within(now, window))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        Ok(similar.unwrap_or_default())
    }

    fn cleanup(&self, ctx: &OpContext, window: Duration) -> StoreResult<usize> {
        self.ensure_open(StoreOp::Cleanup)?;
        let cutoff = window_start(self.clock.now(), window);
        let fingerprints: Vec<String> = self.histories.iter().map(|e| e.key().clone()).collect();

        let mut removed = 0;
        for fingerprint in fingerprints {
            let swept = self.write_history(ctx, StoreOp::Cleanup, &fingerprint, |history| {
                let (kept, expired): (Vec<_>, Vec<_>) = std::mem::take(history)
                    .into_iter()
                    .partition(|r| r.created_at.is_some_and(|at| at >= cutoff));
                *history = History::from(kept);
                self.unindex_gone(&fingerprint, history, &expired);
                (expired.len(), history.is_empty())
            })?;

            let Some((expired, emptied)) = swept else { continue };
            if emptied {
                self.histories.remove_if(&fingerprint, |_, h| h.is_empty());
            }
            removed += expired;
        }
        Ok(removed)
    }

    fn update_status(
        &self,
        ctx: &OpContext,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> StoreResult<bool> {
        self.ensure_open(StoreOp::UpdateStatus)?;
        let Some(fingerprint) = self.by_txn_id.get(transaction_id).map(|fp| fp.value().clone()) else {
            return Ok(false);
        };

        let now = self.clock.now();
        let updated = self.write_history(ctx, StoreOp::UpdateStatus, &fingerprint, |history| {
            match history.iter_mut().rev().find(|r| r.transaction_id == transaction_id) {
                Some(record) => {
                    record.status = status;
                    record.updated_at = Some(now);
                    true
                }
                None => false,
            }
        })?;
        Ok(updated.unwrap_or(false))
    }

    /// Forget the ids of `gone` records that no surviving record in
    /// `history` carries. Ids since re-indexed under another fingerprint
    /// are left alone.
    fn unindex_gone(&self, fingerprint: &str, history: &History, gone: &[TransactionRecord]) {
        for old in gone {
            let id = old.transaction_id.as_str();
            if id.is_empty() || history.iter().any(|r| r.transaction_id == id) {
                continue;
            }
            self.by_txn_id.remove_if(id, |_, fp| fp == fingerprint);
        }
    }
}

impl SimilarityStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
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
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut sweeper) = sweeper {
            sweeper.stop();
        }
        self.inner.histories.clear();
        self.inner.by_txn_id.clear();
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

//! Similarity stores: time-windowed history per fingerprint.
//!
//! RULE: The detector only sees `dyn SimilarityStore`.
//! Backends are picked once, by `open_store`, from the config's
//! `storage_type` and never assumed anywhere else.

mod memory;
mod remote;
mod sqlite;

pub use self::memory::MemoryStore;
pub use self::remote::RedisStore;
pub use self::sqlite::SqliteStore;

use crate::{
    clock::SharedClock,
    config::{DetectorConfig, StorageType},
    context::OpContext,
    error::{ConfigError, DedupError, DedupResult, StoreResult},
    types::{TransactionRecord, TransactionStatus},
};
use chrono::Duration;

/// The capability every backend provides.
///
/// Lookups return records created inside `[now - window, now]`, oldest
/// insertion first, so the last element is the most recent match.
/// Histories are capped per fingerprint; the oldest insertion goes first.
/// The Redis backend orders and caps by creation time instead, which
/// matches insertion order for records the detector timestamps itself.
pub trait SimilarityStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn store(
        &self,
        ctx: &OpContext,
        fingerprint: &str,
        record: &TransactionRecord,
    ) -> StoreResult<()>;

    fn get_similar(
        &self,
        ctx: &OpContext,
        fingerprint: &str,
        window: Duration,
    ) -> StoreResult<Vec<TransactionRecord>>;

    /// Drop every record created before `now - window`.
    /// Returns how many records were removed.
    fn cleanup(&self, ctx: &OpContext, window: Duration) -> StoreResult<usize>;

    /// Set the status of the most recent record with this id.
    /// Returns `false` when no such record is held.
    fn update_status(
        &self,
        ctx: &OpContext,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> StoreResult<bool>;

    /// Release resources. Safe to call more than once.
    fn close(&self) -> StoreResult<()>;
}

/// Build the backend named by `config.storage_type`.
pub fn open_store(
    config: &DetectorConfig,
    clock: SharedClock,
) -> DedupResult<Box<dyn SimilarityStore>> {
    let store: Box<dyn SimilarityStore> = match config.storage_type()? {
        StorageType::Memory => Box::new(
            MemoryStore::start(
                clock,
                config.max_records(),
                config.time_window(),
                config.cleanup_interval(),
            )
            .map_err(DedupError::Storage)?,
        ),
        StorageType::Redis => {
            let redis_config = config.redis.as_ref().ok_or(ConfigError::MissingRedisConfig)?;
            Box::new(
                RedisStore::connect(redis_config, clock, config.max_records())
                    .map_err(DedupError::Storage)?,
            )
        }
        StorageType::Sqlite => {
            let sqlite_config = config.sqlite.as_ref().ok_or(ConfigError::MissingSqliteConfig)?;
            Box::new(
                SqliteStore::open(
                    &sqlite_config.path,
                    clock,
                    config.max_records(),
                    config.time_window(),
                    config.cleanup_interval(),
                )
                .map_err(DedupError::Storage)?,
            )
        }
    };

    log::info!(
        "dedup: opened {} store (max_records_per_key={})",
        store.name(),
        config.max_records()
    );
    Ok(store)
}

/// Deserialize stored payloads. Payloads that no longer parse are
/// logged and skipped.
pub(crate) fn decode_records<I>(backend: &str, payloads: I) -> Vec<TransactionRecord>
where
    I: IntoIterator<Item = String>,
{
    payloads
        .into_iter()
        .filter_map(|payload| match serde_json::from_str::<TransactionRecord>(&payload) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("dedup: {backend} store skipped malformed record: {e}");
                None
            }
        })
        .collect()
}

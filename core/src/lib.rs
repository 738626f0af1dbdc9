//! Transaction duplicate detection.
//!
//! A `Detector` fingerprints a proposed transaction, looks up recent
//! transactions with the same fingerprint in a `SimilarityStore`, and
//! runs an ordered rule list over them to produce a verdict.

pub mod clock;
pub mod config;
pub mod context;
pub mod detector;
pub mod error;
pub mod fingerprint;
pub mod risk;
pub mod store;
pub mod types;

mod sweeper;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{DetectorConfig, FingerprintConfig, RiskRule};
pub use context::{CancelToken, OpContext};
pub use detector::Detector;
pub use error::{ConfigError, DedupError, DedupResult, StoreError, StoreOp};
pub use types::{
    DuplicateCheckResult, RiskLevel, SuggestedAction, TransactionRecord, TransactionRequest,
    TransactionStatus,
};

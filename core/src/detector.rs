//! The duplicate detector: fingerprint, look up, assess.
//!
//! FLOW (check):
//!   1. Fingerprint the request's enabled business fields.
//!   2. Fetch similar records inside `time_window` from the store.
//!   3. Hand them to the risk assessor; first matching rule wins.
//!
//! RULES:
//!   - A failed lookup is an error, never "no duplicates".
//!   - The fingerprint on a recorded transaction is always recomputed.
//!   - The detector holds no locks of its own. Check-then-record is
//!     not atomic across callers.

use crate::{
    clock::{system_clock, SharedClock},
    config::DetectorConfig,
    context::OpContext,
    error::{DedupError, DedupResult},
    fingerprint::FingerprintGenerator,
    risk::RiskAssessor,
    store::{open_store, SimilarityStore},
    types::{DuplicateCheckResult, Fingerprint, TransactionRecord, TransactionRequest, TransactionStatus},
};
use uuid::Uuid;

pub struct Detector {
    config:       DetectorConfig,
    store:        Box<dyn SimilarityStore>,
    fingerprints: FingerprintGenerator,
    assessor:     RiskAssessor,
    clock:        SharedClock,
}

impl Detector {
    /// Build a detector on the system clock with the configured backend.
    pub fn new(config: DetectorConfig) -> DedupResult<Self> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: DetectorConfig, clock: SharedClock) -> DedupResult<Self> {
        config.validate()?;
        let store = open_store(&config, clock.clone())?;
        Self::with_store(config, store, clock)
    }

    /// Use a store built by the caller. The config's storage settings
    /// are still validated but otherwise ignored.
    pub fn with_store(
        config: DetectorConfig,
        store: Box<dyn SimilarityStore>,
        clock: SharedClock,
    ) -> DedupResult<Self> {
        config.validate()?;
        Ok(Self {
            fingerprints: FingerprintGenerator::new(config.fingerprint.clone()),
            assessor:     RiskAssessor::new(config.risk_rules.clone(), clock.clone()),
            store,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn SimilarityStore {
        self.store.as_ref()
    }

    pub fn fingerprint(&self, request: &TransactionRequest) -> Fingerprint {
        self.fingerprints.generate(&request.business_fields())
    }

    /// Assess a proposed transaction against recent history.
    pub fn check_duplicate(
        &self,
        ctx: &OpContext,
        request: &TransactionRequest,
    ) -> DedupResult<DuplicateCheckResult> {
        let fingerprint = self.fingerprint(request);
        let similar = self
            .store
            .get_similar(ctx, &fingerprint, self.config.time_window())
            .map_err(DedupError::Lookup)?;

        let assessment = self.assessor.assess(request, &similar);
        log::info!(
            "dedup: check fp={} similar={} risk={} action={} rule={}",
            short(&fingerprint),
            similar.len(),
            assessment.risk_level,
            assessment.action,
            assessment.matched_rule.as_deref().unwrap_or("-"),
        );

        Ok(DuplicateCheckResult {
            is_duplicate:         !similar.is_empty(),
            similar_transactions: similar,
            risk_level:           assessment.risk_level,
            suggested_action:     assessment.action,
            message:              assessment.message,
            matched_rule:         assessment.matched_rule,
            fingerprint,
            checked_at:           self.clock.now(),
        })
    }

    /// Store a transaction so later checks can see it. Returns the record
    /// as stored, with id, timestamps and fingerprint filled in.
    pub fn record_transaction(
        &self,
        ctx: &OpContext,
        mut record: TransactionRecord,
    ) -> DedupResult<TransactionRecord> {
        let now = self.clock.now();
        if record.transaction_id.is_empty() {
            record.transaction_id = Uuid::new_v4().to_string();
        }
        if record.created_at.is_none() {
            record.created_at = Some(now);
        }
        record.updated_at = Some(now);
        record.fingerprint = self.fingerprints.generate(&record.business_fields());

        self.store
            .store(ctx, &record.fingerprint, &record)
            .map_err(DedupError::Record)?;

        log::info!(
            "dedup: recorded {} fp={} status={}",
            record.transaction_id,
            short(&record.fingerprint),
            record.status,
        );
        Ok(record)
    }

    /// Move a recorded transaction to a new status.
    pub fn update_transaction_status(
        &self,
        ctx: &OpContext,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> DedupResult<()> {
        let not_found = || DedupError::TransactionNotFound {
            transaction_id: transaction_id.to_string(),
        };
        if transaction_id.is_empty() {
            return Err(not_found());
        }

        let updated = self
            .store
            .update_status(ctx, transaction_id, status)
            .map_err(DedupError::StatusUpdate)?;
        if !updated {
            return Err(not_found());
        }

        log::info!("dedup: {transaction_id} -> {status}");
        Ok(())
    }

    /// Stop background work and release the store.
    pub fn close(&self) -> DedupResult<()> {
        self.store.close().map_err(DedupError::Storage)
    }
}

/// First 8 hex chars, enough to correlate log lines.
fn short(fingerprint: &str) -> &str {
    fingerprint.get(..8).unwrap_or(fingerprint)
}

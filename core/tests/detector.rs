//! End-to-end duplicate detection through the public `Detector` API.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Instant;
use txn_dedup_core::{
    store::SqliteStore, Clock, ConfigError, DedupError, Detector, DetectorConfig, ManualClock,
    OpContext, RiskLevel, SharedClock, SuggestedAction, TransactionRecord, TransactionRequest,
    TransactionStatus,
};

fn request() -> TransactionRequest {
    TransactionRequest {
        from_account:  "ACC-1001".into(),
        to_account:    "ACC-2002".into(),
        amount:        250.0,
        currency:      "USD".into(),
        business_type: "transfer".into(),
        user_ip:       "10.0.0.7".into(),
        device_id:     "device-a".into(),
        ..Default::default()
    }
}

fn build() -> (Arc<ManualClock>, Detector) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    let shared: SharedClock = clock.clone();
    let detector = Detector::with_clock(DetectorConfig::default(), shared).expect("detector");
    (clock, detector)
}

fn record(detector: &Detector, status: TransactionStatus, req: &TransactionRequest) -> TransactionRecord {
    detector
        .record_transaction(&OpContext::background(), TransactionRecord::from_request(req, status))
        .expect("record")
}

#[test]
fn first_submission_is_not_a_duplicate() {
    let (_, detector) = build();
    let result = detector.check_duplicate(&OpContext::background(), &request()).unwrap();

    assert!(!result.is_duplicate);
    assert!(result.similar_transactions.is_empty());
    assert_eq!(result.risk_level, RiskLevel::Low);
    assert_eq!(result.suggested_action, SuggestedAction::Allow);
    assert_eq!(result.fingerprint, detector.fingerprint(&request()));
}

#[test]
fn resubmission_after_success_from_same_origin_is_rapid_duplicate() {
    let (clock, detector) = build();
    record(&detector, TransactionStatus::Success, &request());
    clock.advance(Duration::seconds(5));

    let result = detector.check_duplicate(&OpContext::background(), &request()).unwrap();
    assert!(result.is_duplicate);
    assert_eq!(result.similar_transactions.len(), 1);
    assert_eq!(result.matched_rule.as_deref(), Some("rapid_duplicate"));
    assert_eq!(result.risk_level, RiskLevel::High);
    assert_eq!(result.suggested_action, SuggestedAction::Warn);
    assert!(result.message.contains("5 seconds ago"), "{}", result.message);
}

/// Immediate resubmission; lowercase currency matches the stored record.
#[test]
fn immediate_resubmission_is_seen() {
    let (_, detector) = build();
    let req = TransactionRequest {
        from_account:  "a".into(),
        to_account:    "b".into(),
        amount:        100.00,
        currency:      "usd".into(),
        business_type: "transfer".into(),
        ..Default::default()
    };
    record(&detector, TransactionStatus::Success, &req);

    let result = detector.check_duplicate(&OpContext::background(), &req).unwrap();
    assert!(result.is_duplicate);
    assert_eq!(result.similar_transactions.len(), 1);
    assert_eq!(result.matched_rule.as_deref(), Some("rapid_duplicate"));
    assert!(result.message.contains("0 seconds ago"), "{}", result.message);
}

/// A longer lookup window lets `pending_duplicate` use its full 30 minutes.
#[test]
fn pending_blocks_across_a_widened_lookup_window() {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    let shared: SharedClock = clock.clone();
    let config = DetectorConfig { time_window_secs: 30 * 60, ..DetectorConfig::default() };
    let detector = Detector::with_clock(config, shared).unwrap();

    record(&detector, TransactionStatus::Pending, &request());
    clock.advance(Duration::minutes(20));

    let result = detector.check_duplicate(&OpContext::background(), &request()).unwrap();
    assert_eq!(result.matched_rule.as_deref(), Some("pending_duplicate"));
    assert_eq!(result.suggested_action, SuggestedAction::Block);
}

/// A single prior success from another IP is similar but not risky; a
/// second one trips `frequent_duplicate`.
#[test]
fn resubmission_from_other_ip_escalates_with_count() {
    let (clock, detector) = build();
    let elsewhere = TransactionRequest { user_ip: "10.9.9.9".into(), ..request() };

    record(&detector, TransactionStatus::Success, &request());
    clock.advance(Duration::seconds(5));
    let once = detector.check_duplicate(&OpContext::background(), &elsewhere).unwrap();
    assert!(once.is_duplicate);
    assert_eq!(once.risk_level, RiskLevel::Low);
    assert_eq!(once.suggested_action, SuggestedAction::Allow);
    assert!(once.matched_rule.is_none());

    record(&detector, TransactionStatus::Success, &request());
    clock.advance(Duration::seconds(5));
    let twice = detector.check_duplicate(&OpContext::background(), &elsewhere).unwrap();
    assert_eq!(twice.matched_rule.as_deref(), Some("frequent_duplicate"));
    assert_eq!(twice.risk_level, RiskLevel::Medium);
    assert_eq!(twice.suggested_action, SuggestedAction::Warn);
}

#[test]
fn pending_transaction_blocks_resubmission() {
    let (clock, detector) = build();
    record(&detector, TransactionStatus::Pending, &request());
    clock.advance(Duration::seconds(60));

    let result = detector.check_duplicate(&OpContext::background(), &request()).unwrap();
    assert_eq!(result.matched_rule.as_deref(), Some("pending_duplicate"));
    assert_eq!(result.risk_level, RiskLevel::High);
    assert_eq!(result.suggested_action, SuggestedAction::Block);
}

#[test]
fn records_outside_the_window_are_forgotten() {
    let (clock, detector) = build();
    record(&detector, TransactionStatus::Success, &request());
    clock.advance(Duration::minutes(6));

    let result = detector.check_duplicate(&OpContext::background(), &request()).unwrap();
    assert!(!result.is_duplicate);
    assert_eq!(result.suggested_action, SuggestedAction::Allow);
}

#[test]
fn different_amount_is_not_similar() {
    let (_, detector) = build();
    record(&detector, TransactionStatus::Success, &request());

    let other = TransactionRequest { amount: 251.0, ..request() };
    let result = detector.check_duplicate(&OpContext::background(), &other).unwrap();
    assert!(!result.is_duplicate);
}

#[test]
fn record_fills_identity_and_timestamps() {
    let (clock, detector) = build();
    let mut incoming = TransactionRecord::from_request(&request(), TransactionStatus::Success);
    incoming.fingerprint = "caller-supplied".into();

    let stored = detector.record_transaction(&OpContext::background(), incoming).unwrap();
    assert!(!stored.transaction_id.is_empty());
    assert_eq!(stored.created_at, Some(clock.now()));
    assert_eq!(stored.updated_at, Some(clock.now()));
    assert_eq!(stored.fingerprint, detector.fingerprint(&request()));

    // Caller-provided id and creation time are kept.
    let at = clock.now() - Duration::seconds(30);
    let explicit = TransactionRecord::from_request(&request(), TransactionStatus::Success)
        .with_id("tx-explicit")
        .created(at);
    let stored = detector.record_transaction(&OpContext::background(), explicit).unwrap();
    assert_eq!(stored.transaction_id, "tx-explicit");
    assert_eq!(stored.created_at, Some(at));
}

#[test]
fn status_update_changes_the_verdict() {
    let (clock, detector) = build();
    let ctx = OpContext::background();
    let pending = record(&detector, TransactionStatus::Pending, &request());
    clock.advance(Duration::seconds(5));

    let before = detector.check_duplicate(&ctx, &request()).unwrap();
    assert_eq!(before.matched_rule.as_deref(), Some("pending_duplicate"));

    detector
        .update_transaction_status(&ctx, &pending.transaction_id, TransactionStatus::Failed)
        .unwrap();
    let after = detector.check_duplicate(&ctx, &request()).unwrap();
    assert!(after.is_duplicate);
    assert!(after.matched_rule.is_none());
    assert_eq!(after.similar_transactions[0].status, TransactionStatus::Failed);
}

#[test]
fn unknown_transaction_id_is_not_found() {
    let (_, detector) = build();
    let err = detector
        .update_transaction_status(&OpContext::background(), "missing", TransactionStatus::Success)
        .unwrap_err();
    assert!(
        matches!(&err, DedupError::TransactionNotFound { transaction_id } if transaction_id == "missing"),
        "unexpected error: {err}"
    );
}

#[test]
fn expired_context_is_an_error_not_an_empty_result() {
    let (_, detector) = build();
    record(&detector, TransactionStatus::Success, &request());

    let err = detector
        .check_duplicate(&OpContext::with_deadline(Instant::now()), &request())
        .unwrap_err();
    assert!(matches!(err, DedupError::Lookup(_)), "unexpected error: {err}");
    assert!(err.store_error().is_some_and(|e| e.is_timeout()));
}

#[test]
fn closed_detector_reports_store_errors() {
    let (_, detector) = build();
    detector.close().unwrap();

    let err = detector
        .check_duplicate(&OpContext::background(), &request())
        .unwrap_err();
    assert!(matches!(err, DedupError::Lookup(_)), "unexpected error: {err}");
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let config = DetectorConfig { time_window_secs: 0, ..DetectorConfig::default() };
    let err = Detector::new(config).err().expect("should fail");
    assert!(matches!(err, DedupError::Config(ConfigError::InvalidTimeWindow)));

    let config = DetectorConfig { storage_type: "mongo".into(), ..DetectorConfig::default() };
    let err = Detector::new(config).err().expect("should fail");
    assert!(matches!(err, DedupError::Config(ConfigError::UnsupportedStorageType(name)) if name == "mongo"));
}

#[test]
fn detector_runs_on_an_injected_sqlite_store() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    let shared: SharedClock = clock.clone();
    let store = SqliteStore::in_memory(shared.clone(), 100).unwrap();
    let detector = Detector::with_store(DetectorConfig::default(), Box::new(store), shared).unwrap();
    assert_eq!(detector.store().name(), "sqlite");

    record(&detector, TransactionStatus::Pending, &request());
    clock.advance(Duration::seconds(1));
    let result = detector.check_duplicate(&OpContext::background(), &request()).unwrap();
    assert_eq!(result.suggested_action, SuggestedAction::Block);
}

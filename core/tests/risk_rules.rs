//! Rule evaluation: ordering, filters, and verdict messages.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use txn_dedup_core::{
    config::default_risk_rules,
    risk::RiskAssessor,
    Clock, ManualClock, RiskLevel, RiskRule, SharedClock, SuggestedAction, TransactionRecord,
    TransactionRequest, TransactionStatus,
};

fn request() -> TransactionRequest {
    TransactionRequest {
        from_account: "ACC-1".into(),
        to_account:   "ACC-2".into(),
        amount:       100.0,
        currency:     "USD".into(),
        user_ip:      "10.0.0.1".into(),
        device_id:    "dev-1".into(),
        ..Default::default()
    }
}

fn setup() -> (Arc<ManualClock>, RiskAssessor) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    let shared: SharedClock = clock.clone();
    (clock, RiskAssessor::new(default_risk_rules(), shared))
}

/// A prior record created `secs_ago` seconds before the clock's now.
fn prior(clock: &ManualClock, secs_ago: i64, status: TransactionStatus, ip: &str) -> TransactionRecord {
    let mut record = TransactionRecord::from_request(&request(), status)
        .with_id(format!("t-{secs_ago}"))
        .created(clock.now() - Duration::seconds(secs_ago));
    record.user_ip = ip.into();
    record
}

#[test]
fn no_similar_records_is_low_allow() {
    let (_, assessor) = setup();
    let verdict = assessor.assess(&request(), &[]);
    assert_eq!(verdict.risk_level, RiskLevel::Low);
    assert_eq!(verdict.action, SuggestedAction::Allow);
    assert!(verdict.message.is_empty());
    assert!(verdict.matched_rule.is_none());
}

#[test]
fn pending_duplicate_blocks() {
    let (clock, assessor) = setup();
    let similar = [prior(&clock, 10, TransactionStatus::Pending, "10.9.9.9")];

    let verdict = assessor.assess(&request(), &similar);
    assert_eq!(verdict.matched_rule.as_deref(), Some("pending_duplicate"));
    assert_eq!(verdict.risk_level, RiskLevel::High);
    assert_eq!(verdict.action, SuggestedAction::Block);
    assert!(verdict.message.contains("still being processed"), "{}", verdict.message);
}

#[test]
fn rapid_duplicate_needs_same_ip_and_device() {
    let (clock, assessor) = setup();

    let same_origin = [prior(&clock, 10, TransactionStatus::Success, "10.0.0.1")];
    let verdict = assessor.assess(&request(), &same_origin);
    assert_eq!(verdict.matched_rule.as_deref(), Some("rapid_duplicate"));
    assert_eq!(verdict.risk_level, RiskLevel::High);
    assert_eq!(verdict.action, SuggestedAction::Warn);
    assert!(verdict.message.contains("10 seconds ago"), "{}", verdict.message);

    // One success from another IP stays under every threshold.
    let other_ip = [prior(&clock, 10, TransactionStatus::Success, "10.9.9.9")];
    let verdict = assessor.assess(&request(), &other_ip);
    assert_eq!(verdict.risk_level, RiskLevel::Low);
    assert_eq!(verdict.action, SuggestedAction::Allow);
    assert!(verdict.matched_rule.is_none());
}

#[test]
fn frequent_duplicate_needs_two_prior_successes() {
    let (clock, assessor) = setup();
    let similar = [
        prior(&clock, 20, TransactionStatus::Success, "10.9.9.9"),
        prior(&clock, 10, TransactionStatus::Success, "10.9.9.9"),
    ];

    let verdict = assessor.assess(&request(), &similar);
    assert_eq!(verdict.matched_rule.as_deref(), Some("frequent_duplicate"));
    assert_eq!(verdict.risk_level, RiskLevel::Medium);
    assert_eq!(verdict.action, SuggestedAction::Warn);
}

#[test]
fn recent_duplicate_reports_minutes_since_latest_match() {
    let (clock, assessor) = setup();
    let similar = [
        prior(&clock, 260, TransactionStatus::Success, "10.9.9.9"),
        prior(&clock, 250, TransactionStatus::Success, "10.9.9.9"),
        prior(&clock, 240, TransactionStatus::Success, "10.9.9.9"),
    ];

    let verdict = assessor.assess(&request(), &similar);
    assert_eq!(verdict.matched_rule.as_deref(), Some("recent_duplicate"));
    assert_eq!(verdict.risk_level, RiskLevel::Low);
    assert_eq!(verdict.action, SuggestedAction::Allow);
    assert!(verdict.message.contains("4 minutes ago"), "{}", verdict.message);
}

#[test]
fn failed_records_never_count() {
    let (clock, assessor) = setup();
    let similar: Vec<_> = (1..=5)
        .map(|i| prior(&clock, i * 5, TransactionStatus::Failed, "10.0.0.1"))
        .collect();

    let verdict = assessor.assess(&request(), &similar);
    assert!(verdict.matched_rule.is_none());
    assert_eq!(verdict.action, SuggestedAction::Allow);
}

#[test]
fn earlier_rule_wins_when_several_match() {
    let (clock, assessor) = setup();
    let similar = [
        prior(&clock, 30, TransactionStatus::Success, "10.0.0.1"),
        prior(&clock, 20, TransactionStatus::Success, "10.0.0.1"),
        prior(&clock, 10, TransactionStatus::Pending, "10.0.0.1"),
    ];

    let verdict = assessor.assess(&request(), &similar);
    assert_eq!(verdict.matched_rule.as_deref(), Some("pending_duplicate"));
}

/// Each rule filters by its own window, not the caller's lookup window.
#[test]
fn rule_window_is_applied_per_rule() {
    let (clock, assessor) = setup();
    let similar = [prior(&clock, 45, TransactionStatus::Success, "10.0.0.1")];

    let verdict = assessor.assess(&request(), &similar);
    assert!(verdict.matched_rule.is_none(), "45s is outside the 30s rapid window");

    // Future-dated records are outside every window.
    let future = [prior(&clock, -5, TransactionStatus::Pending, "10.0.0.1")];
    assert!(assessor.assess(&request(), &future).matched_rule.is_none());
}

#[test]
fn custom_rule_with_empty_status_list_counts_everything() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    let shared: SharedClock = clock.clone();
    let rule = RiskRule {
        name:              "device_burst".into(),
        time_window_secs:  60,
        max_count:         1,
        risk_level:        RiskLevel::Medium,
        action:            SuggestedAction::Block,
        check_same_ip:     false,
        check_same_device: true,
        check_status:      vec![],
        message_template:  Some("{elapsed_secs}s since last attempt".into()),
    };
    let assessor = RiskAssessor::new(vec![rule], shared);

    let mut other_device = prior(&clock, 15, TransactionStatus::Failed, "10.0.0.1");
    other_device.device_id = "dev-2".into();
    let similar = [
        prior(&clock, 30, TransactionStatus::Failed, "10.0.0.1"),
        other_device,
        prior(&clock, 5, TransactionStatus::Cancelled, "10.0.0.1"),
    ];

    let verdict = assessor.assess(&request(), &similar);
    assert_eq!(verdict.matched_rule.as_deref(), Some("device_burst"));
    assert_eq!(verdict.action, SuggestedAction::Block);
    assert_eq!(verdict.message, "5s since last attempt");
}

//! Rule-based risk assessment over similar transactions.
//!
//! RULES:
//!   - Rules are evaluated in configured order. The first match wins.
//!   - Each rule re-filters the similar set by its own window; the
//!     lookup window used by the caller is never trusted.
//!   - A rule matches when strictly more than `max_count` prior records
//!     survive its window, status, same-IP and same-device filters.

use crate::{
    clock::SharedClock,
    config::RiskRule,
    types::{RiskLevel, SuggestedAction, TransactionRecord, TransactionRequest},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verdict for one proposed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub risk_level:   RiskLevel,
    pub action:       SuggestedAction,
    pub message:      String,
    pub matched_rule: Option<String>,
}

impl Assessment {
    /// Low risk, allow, nothing to say.
    pub fn allow() -> Self {
        Self {
            risk_level:   RiskLevel::Low,
            action:       SuggestedAction::Allow,
            message:      String::new(),
            matched_rule: None,
        }
    }
}

pub struct RiskAssessor {
    rules: Vec<RiskRule>,
    clock: SharedClock,
}

impl RiskAssessor {
    pub fn new(rules: Vec<RiskRule>, clock: SharedClock) -> Self {
        Self { rules, clock }
    }

    pub fn rules(&self) -> &[RiskRule] {
        &self.rules
    }

    pub fn assess(&self, request: &TransactionRequest, similar: &[TransactionRecord]) -> Assessment {
        if similar.is_empty() {
            return Assessment::allow();
        }

        let now = self.clock.now();
        for rule in &self.rules {
            let matching = matching_records(rule, request, similar, now);
            if matching.len() as i64 > rule.max_count {
                // `matching` is never empty here: max_count >= 0.
                let latest = matching.last().and_then(|r| r.created_at).unwrap_or(now);
                return Assessment {
                    risk_level:   rule.risk_level,
                    action:       rule.action,
                    message:      render_message(rule, now - latest),
                    matched_rule: Some(rule.name.clone()),
                };
            }
        }

        Assessment::allow()
    }
}

/// Records from `similar` that count toward `rule`, in input order.
fn matching_records<'a>(
    rule: &RiskRule,
    request: &TransactionRequest,
    similar: &'a [TransactionRecord],
    now: DateTime<Utc>,
) -> Vec<&'a TransactionRecord> {
    let window = rule.time_window();
    similar
        .iter()
        .filter(|r| r.created_within(now, window))
        .filter(|r| rule.check_status.is_empty() || rule.check_status.contains(&r.status))
        .filter(|r| !rule.check_same_ip || r.user_ip == request.user_ip)
        .filter(|r| !rule.check_same_device || r.device_id == request.device_id)
        .collect()
}

fn render_message(rule: &RiskRule, elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
    let mins = secs / 60.0;

    if let Some(template) = &rule.message_template {
        return template
            .replace("{elapsed_secs}", &format!("{secs:.0}"))
            .replace("{elapsed_mins}", &format!("{mins:.0}"));
    }

    match rule.name.as_str() {
        "pending_duplicate" => {
            "An identical transaction is still being processed. Do not submit it again.".to_string()
        }
        "rapid_duplicate" => format!(
            "An identical transaction completed {secs:.0} seconds ago. Confirm before continuing."
        ),
        "frequent_duplicate" => {
            "Several similar transactions were made recently. Check the transaction details.".to_string()
        }
        "recent_duplicate" => format!(
            "Note: a similar transaction was made {mins:.0} minutes ago."
        ),
        _ => "Similar transaction detected.".to_string(),
    }
}

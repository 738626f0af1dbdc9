//! Shared transaction types used across the detector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A stable, unique identifier for a recorded transaction.
pub type TransactionId = String;

/// Hex-encoded fingerprint digest.
pub type Fingerprint = String;

/// Free-form extension attributes. Never fingerprinted, never evaluated.
pub type ExtraAttributes = HashMap<String, serde_json::Value>;

/// A proposed transaction, checked before submission. Never stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransactionRequest {
    pub from_account:  String,
    pub to_account:    String,
    pub amount:        f64,
    pub currency:      String,
    pub business_type: String,
    pub channel:       String,
    pub user_ip:       String,
    pub device_id:     String,
    pub user_agent:    String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra:         ExtraAttributes,
}

impl TransactionRequest {
    pub fn business_fields(&self) -> BusinessFields<'_> {
        BusinessFields {
            from_account:  &self.from_account,
            to_account:    &self.to_account,
            amount:        self.amount,
            currency:      &self.currency,
            business_type: &self.business_type,
            channel:       &self.channel,
        }
    }
}

/// A transaction as held by a similarity store.
///
/// `fingerprint` is always overwritten by the detector at record time;
/// whatever the caller puts there is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionRecord {
    #[serde(default)]
    pub transaction_id: TransactionId,
    #[serde(default)]
    pub fingerprint:    Fingerprint,
    pub from_account:   String,
    pub to_account:     String,
    pub amount:         f64,
    pub currency:       String,
    #[serde(default)]
    pub business_type:  String,
    #[serde(default)]
    pub channel:        String,
    pub status:         TransactionStatus,
    /// Filled with "now" at record time when absent.
    #[serde(default)]
    pub created_at:     Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at:     Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_ip:        String,
    #[serde(default)]
    pub device_id:      String,
    #[serde(default)]
    pub user_agent:     String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra:          ExtraAttributes,
}

impl TransactionRecord {
    /// Start a record from the request it settles. Identifier and
    /// timestamps are left for the detector to fill.
    pub fn from_request(request: &TransactionRequest, status: TransactionStatus) -> Self {
        Self {
            transaction_id: String::new(),
            fingerprint:    String::new(),
            from_account:   request.from_account.clone(),
            to_account:     request.to_account.clone(),
            amount:         request.amount,
            currency:       request.currency.clone(),
            business_type:  request.business_type.clone(),
            channel:        request.channel.clone(),
            status,
            created_at:     None,
            updated_at:     None,
            user_ip:        request.user_ip.clone(),
            device_id:      request.device_id.clone(),
            user_agent:     request.user_agent.clone(),
            extra:          request.extra.clone(),
        }
    }

    pub fn with_id(mut self, transaction_id: impl Into<TransactionId>) -> Self {
        self.transaction_id = transaction_id.into();
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn business_fields(&self) -> BusinessFields<'_> {
        BusinessFields {
            from_account:  &self.from_account,
            to_account:    &self.to_account,
            amount:        self.amount,
            currency:      &self.currency,
            business_type: &self.business_type,
            channel:       &self.channel,
        }
    }

    /// True when the record was created inside `[now - window, now]`.
    /// Records without a creation time never match.
    pub fn created_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.created_at {
            Some(at) => at >= window_start(now, window) && at <= now,
            None => false,
        }
    }
}

/// `now - window`, saturating at the earliest representable instant.
pub fn window_start(now: DateTime<Utc>, window: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The fingerprint-eligible slice of a request or record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusinessFields<'a> {
    pub from_account:  &'a str,
    pub to_account:    &'a str,
    pub amount:        f64,
    pub currency:      &'a str,
    pub business_type: &'a str,
    pub channel:       &'a str,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending   => "PENDING",
            TransactionStatus::Success   => "SUCCESS",
            TransactionStatus::Failed    => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low    => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High   => "HIGH",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestedAction {
    Allow,
    Warn,
    Block,
}

impl fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SuggestedAction::Allow => "ALLOW",
            SuggestedAction::Warn  => "WARN",
            SuggestedAction::Block => "BLOCK",
        })
    }
}

/// Outcome of one `check_duplicate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCheckResult {
    /// Any similar record exists, whatever the verdict.
    pub is_duplicate:         bool,
    pub similar_transactions: Vec<TransactionRecord>,
    pub risk_level:           RiskLevel,
    pub suggested_action:     SuggestedAction,
    pub message:              String,
    /// Name of the rule that produced the verdict, if any.
    pub matched_rule:         Option<String>,
    pub fingerprint:          Fingerprint,
    pub checked_at:           DateTime<Utc>,
}

use crate::error::ConfigError;
use crate::types::{RiskLevel, SuggestedAction, TransactionStatus};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Longest window accepted anywhere: 100 years.
pub const MAX_WINDOW_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Most decimal places an amount is rounded to before hashing.
pub const MAX_AMOUNT_PRECISION: i32 = 15;

/// Window in seconds, clamped to `[0, MAX_WINDOW_SECS]`.
fn window_secs(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(0, MAX_WINDOW_SECS))
}

// ── Fingerprint ────────────────────────────────────────────────────

/// Which business fields participate in the fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FingerprintConfig {
    pub include_from_account:  bool,
    pub include_to_account:    bool,
    pub include_amount:        bool,
    pub include_currency:      bool,
    pub include_business_type: bool,
    pub include_channel:       bool,
    /// Decimal places kept before hashing. Non-positive means exact match.
    pub amount_precision:      i32,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            include_from_account:  true,
            include_to_account:    true,
            include_amount:        true,
            include_currency:      true,
            include_business_type: true,
            include_channel:       false,
            amount_precision:      2, // cents
        }
    }
}

// ── Risk rules ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRule {
    pub name:              String,
    pub time_window_secs:  i64,
    /// Prior matches tolerated before the rule fires. 0 = none allowed.
    pub max_count:         i64,
    pub risk_level:        RiskLevel,
    pub action:            SuggestedAction,
    #[serde(default)]
    pub check_same_ip:     bool,
    #[serde(default)]
    pub check_same_device: bool,
    /// Prior records only count if their status is listed. Empty = any.
    #[serde(default)]
    pub check_status:      Vec<TransactionStatus>,
    /// Overrides the built-in wording. Supports `{elapsed_secs}` and
    /// `{elapsed_mins}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template:  Option<String>,
}

impl RiskRule {
    pub fn time_window(&self) -> Duration {
        window_secs(self.time_window_secs)
    }
}

/// The stock rule list, ordered from most to least severe.
pub fn default_risk_rules() -> Vec<RiskRule> {
    vec![
        RiskRule {
            name:              "pending_duplicate".into(),
            time_window_secs:  30 * 60,
            max_count:         0,
            risk_level:        RiskLevel::High,
            action:            SuggestedAction::Block,
            check_same_ip:     false,
            check_same_device: false,
            check_status:      vec![TransactionStatus::Pending],
            message_template:  None,
        },
        RiskRule {
            name:              "rapid_duplicate".into(),
            time_window_secs:  30,
            max_count:         0,
            risk_level:        RiskLevel::High,
            action:            SuggestedAction::Warn,
            check_same_ip:     true,
            check_same_device: true,
            check_status:      vec![TransactionStatus::Success, TransactionStatus::Pending],
            message_template:  None,
        },
        RiskRule {
            name:              "frequent_duplicate".into(),
            time_window_secs:  2 * 60,
            max_count:         1,
            risk_level:        RiskLevel::Medium,
            action:            SuggestedAction::Warn,
            check_same_ip:     false,
            check_same_device: false,
            check_status:      vec![TransactionStatus::Success],
            message_template:  None,
        },
        RiskRule {
            name:              "recent_duplicate".into(),
            time_window_secs:  5 * 60,
            max_count:         2,
            risk_level:        RiskLevel::Low,
            action:            SuggestedAction::Allow,
            check_same_ip:     false,
            check_same_device: false,
            check_status:      vec![TransactionStatus::Success],
            message_template:  None,
        },
    ]
}

// ── Storage ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Memory,
    Redis,
    Sqlite,
}

impl FromStr for StorageType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StorageType::Memory),
            "redis"  => Ok(StorageType::Redis),
            "sqlite" => Ok(StorageType::Sqlite),
            other    => Err(ConfigError::UnsupportedStorageType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port`
    pub address:            String,
    pub password:           Option<String>,
    pub db:                 i64,
    /// Idle connections kept for reuse.
    pub pool_size:          usize,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms:      u64,
    pub key_prefix:         String,
    /// Native expiry on every fingerprint key. Should cover the widest
    /// rule window in use.
    pub key_ttl_secs:       i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address:            "127.0.0.1:6379".into(),
            password:           None,
            db:                 0,
            pool_size:          10,
            connect_timeout_ms: 5_000,
            io_timeout_ms:      3_000,
            key_prefix:         "txndedup:".into(),
            key_ttl_secs:       30 * 60,
        }
    }
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => format!("redis://:{pw}@{}/{}", self.address, self.db),
            _ => format!("redis://{}/{}", self.address, self.db),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqliteConfig {
    /// Database file, or `:memory:`.
    pub path: String,
}

// ── Detector ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Lookback used by `check_duplicate` and by the sweeper.
    pub time_window_secs:      i64,
    pub cleanup_interval_secs: i64,
    pub max_records_per_key:   i64,
    pub fingerprint:           FingerprintConfig,
    /// Evaluated in order; first match wins.
    pub risk_rules:            Vec<RiskRule>,
    /// "memory" | "redis" | "sqlite"
    pub storage_type:          String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis:                 Option<RedisConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite:                Option<SqliteConfig>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            time_window_secs:      5 * 60,
            cleanup_interval_secs: 60,
            max_records_per_key:   100,
            fingerprint:           FingerprintConfig::default(),
            risk_rules:            default_risk_rules(),
            storage_type:          "memory".into(),
            redis:                 None,
            sqlite:                None,
        }
    }
}

impl DetectorConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: DetectorConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_window_secs <= 0 || self.time_window_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::InvalidTimeWindow);
        }
        if self.cleanup_interval_secs <= 0 {
            return Err(ConfigError::InvalidCleanupInterval);
        }
        if self.max_records_per_key < 1 {
            return Err(ConfigError::InvalidMaxRecords);
        }
        if self.fingerprint.amount_precision > MAX_AMOUNT_PRECISION {
            return Err(ConfigError::InvalidAmountPrecision);
        }

        for rule in &self.risk_rules {
            if rule.time_window_secs <= 0 {
                return Err(ConfigError::InvalidRule {
                    name: rule.name.clone(),
                    reason: "time window must be positive".into(),
                });
            }
            if rule.time_window_secs > MAX_WINDOW_SECS {
                return Err(ConfigError::InvalidRule {
                    name: rule.name.clone(),
                    reason: format!("time window must be at most {MAX_WINDOW_SECS} seconds"),
                });
            }
            if rule.max_count < 0 {
                return Err(ConfigError::InvalidRule {
                    name: rule.name.clone(),
                    reason: "max count must not be negative".into(),
                });
            }
        }

        match self.storage_type()? {
            StorageType::Redis if self.redis.is_none() => Err(ConfigError::MissingRedisConfig),
            StorageType::Sqlite if self.sqlite.is_none() => Err(ConfigError::MissingSqliteConfig),
            _ => Ok(()),
        }
    }

    pub fn storage_type(&self) -> Result<StorageType, ConfigError> {
        self.storage_type.parse()
    }

    pub fn time_window(&self) -> Duration {
        window_secs(self.time_window_secs)
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval_secs.max(0) as u64)
    }

    pub fn max_records(&self) -> usize {
        self.max_records_per_key.max(1) as usize
    }

    /// Widest window any rule looks back over.
    pub fn max_rule_window(&self) -> Duration {
        self.risk_rules
            .iter()
            .map(RiskRule::time_window)
            .max()
            .unwrap_or_else(|| self.time_window())
    }
}

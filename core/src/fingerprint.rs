//! Transaction fingerprinting.
//!
//! A fingerprint is a pure function of the enabled business fields.
//! Timestamps, status, identifiers, IP and device never participate.
//!
//!   1. Each enabled field becomes a `label:value` component.
//!      Amounts are rounded half away from zero to `amount_precision`
//!      places; currency is uppercased.
//!   2. Components are sorted lexicographically, not by field order.
//!   3. Sorted components are joined with `|` and hashed with SHA-256.

use crate::config::FingerprintConfig;
use crate::types::{BusinessFields, Fingerprint};
use sha2::{Digest, Sha256};

const SEPARATOR: &str = "|";

#[derive(Debug, Clone)]
pub struct FingerprintGenerator {
    config: FingerprintConfig,
}

impl FingerprintGenerator {
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FingerprintConfig {
        &self.config
    }

    pub fn generate(&self, fields: &BusinessFields<'_>) -> Fingerprint {
        let canonical = self.canonical_form(fields);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// The exact string that gets hashed.
    pub fn canonical_form(&self, fields: &BusinessFields<'_>) -> String {
        let mut components = self.components(fields);
        components.sort();
        components.join(SEPARATOR)
    }

    /// Round to the configured precision. Idempotent.
    /// Amounts that cannot be scaled without overflow are left exact.
    pub fn normalize_amount(&self, amount: f64) -> f64 {
        let precision = self.config.amount_precision;
        if precision <= 0 {
            return amount;
        }
        let multiplier = 10f64.powi(precision);
        let scaled = amount * multiplier;
        if !scaled.is_finite() {
            return amount;
        }
        scaled.round() / multiplier
    }

    fn format_amount(&self, amount: f64) -> String {
        let normalized = self.normalize_amount(amount);
        match usize::try_from(self.config.amount_precision) {
            Ok(places) if places > 0 => format!("{normalized:.places$}"),
            _ => format!("{normalized}"),
        }
    }

    fn components(&self, fields: &BusinessFields<'_>) -> Vec<String> {
        let c = &self.config;
        let mut components = Vec::with_capacity(6);

        if c.include_from_account {
            components.push(format!("from:{}", fields.from_account));
        }
        if c.include_to_account {
            components.push(format!("to:{}", fields.to_account));
        }
        if c.include_amount {
            components.push(format!("amount:{}", self.format_amount(fields.amount)));
        }
        if c.include_currency {
            components.push(format!("currency:{}", fields.currency.to_uppercase()));
        }
        if c.include_business_type {
            components.push(format!("type:{}", fields.business_type));
        }
        if c.include_channel {
            components.push(format!("channel:{}", fields.channel));
        }

        components
    }
}

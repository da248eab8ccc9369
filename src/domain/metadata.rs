use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Keys the wallet itself reads or writes
///
/// Callers may attach other keys, they are stored and returned untouched.
pub mod keys {
    /// Free-text justification, set on `admin_adjustment` and reversal entries
    pub const REASON: &str = "reason";
    /// Identity of the administrator behind an `admin_adjustment`
    pub const ADMIN_ID: &str = "admin_id";
    /// Campaign code of a `promotional_credit`
    pub const CAMPAIGN_CODE: &str = "campaign_code";
    /// Grant type label of a `promotional_credit` or `welcome_bonus`
    pub const GRANT_TYPE: &str = "grant_type";
    /// Gateway reference of a `topup`
    pub const PAYMENT_REFERENCE: &str = "payment_reference";
    /// Fiat amount paid for a `topup`, in the smallest fiat unit
    pub const FIAT_AMOUNT: &str = "fiat_amount";
}

/// A single metadata value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

/// Typed key-value annotations attached to transactions and grants
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            MetadataValue::Text(text) => Some(text),
            MetadataValue::Bool(_) | MetadataValue::Integer(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speculoos::prelude::*;

    #[test]
    fn test_json_shape() {
        let metadata = Metadata::default()
            .with(keys::REASON, "goodwill")
            .with(keys::FIAT_AMOUNT, 2500_i64)
            .with("manual", true);

        let json = serde_json::to_value(&metadata).unwrap();

        assert_that!(json).is_equal_to(serde_json::json!({
            "fiat_amount": 2500,
            "manual": true,
            "reason": "goodwill",
        }));
        let parsed: Metadata = serde_json::from_value(json).unwrap();
        assert_that!(parsed.text(keys::REASON)).is_equal_to(Some("goodwill"));
        assert_that!(parsed.get(keys::FIAT_AMOUNT)).is_equal_to(Some(&MetadataValue::Integer(2500)));
    }

    #[test]
    fn test_text_of_non_text_value() {
        let metadata = Metadata::default().with(keys::FIAT_AMOUNT, 10_i64);

        assert_that!(metadata.text(keys::FIAT_AMOUNT)).is_none();
    }
}

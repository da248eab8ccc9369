use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{WalletStatus, WalletTier};

string_enum! {
    pub enum AuditAction {
        Freeze => "freeze",
        Unfreeze => "unfreeze",
        Suspend => "suspend",
        Close => "close",
        AdminCredit => "admin_credit",
        AdminDebit => "admin_debit",
        TierChange => "tier_change",
        LimitChange => "limit_change",
    }
}

/// Structured view of the wallet fields an administrative action touched
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WalletStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<WalletTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditSnapshot {
    pub fn status(status: WalletStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn tier(tier: WalletTier) -> Self {
        Self {
            tier: Some(tier),
            ..Default::default()
        }
    }

    pub fn balance(balance: u64) -> Self {
        Self {
            balance: Some(balance),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Append-only record of a sensitive administrative action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub wallet_id: Uuid,
    pub action: AuditAction,
    pub performed_by: String,
    pub old_value: Option<AuditSnapshot>,
    pub new_value: Option<AuditSnapshot>,
    pub reason: String,
    /// Network address the request originated from
    pub source_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

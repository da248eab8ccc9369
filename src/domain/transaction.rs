use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, Rejection};

string_enum! {
    /// Business reason for a ledger entry
    pub enum TransactionType {
        Topup => "topup",
        Purchase => "purchase",
        Refund => "refund",
        WelcomeBonus => "welcome_bonus",
        PromotionalCredit => "promotional_credit",
        ReferralCredit => "referral_credit",
        AdminAdjustment => "admin_adjustment",
        TransferIn => "transfer_in",
        TransferOut => "transfer_out",
        Penalty => "penalty",
        Reward => "reward",
        Expiry => "expiry",
    }
}

string_enum! {
    pub enum Direction {
        Credit => "credit",
        Debit => "debit",
    }
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Credit => Direction::Debit,
            Direction::Debit => Direction::Credit,
        }
    }
}

string_enum! {
    /// Status of a ledger entry
    ///
    /// The engine only ever writes `Completed` entries. Reversals are new entries pointing at the
    /// original through `reversal_of`, the original row is never edited.
    pub enum TransactionStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Reversed => "reversed",
    }
}

/// Link from a ledger entry back to the business object that caused it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Kind of object, e.g. `topup`, `grant` or `store_order`
    pub kind: String,
    pub id: String,
}

impl Reference {
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

/// Request to move bubbles in or out of a wallet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Posting {
    pub member_auth_id: String,
    pub direction: Direction,
    /// Amount in bubbles, must be positive
    pub amount: u64,
    /// Caller-supplied key, unique across all wallets
    pub idempotency_key: String,
    pub transaction_type: TransactionType,
    pub description: String,
    /// Name of the service that requested the posting
    pub service_source: String,
    pub reference: Option<Reference>,
    pub initiated_by: Option<String>,
    pub reversal_of: Option<Uuid>,
    pub metadata: Metadata,
}

/// Immutable ledger entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub transaction_id: Uuid,
    pub wallet_id: Uuid,
    pub idempotency_key: String,
    pub transaction_type: TransactionType,
    pub direction: Direction,
    pub amount: u64,
    pub balance_before: u64,
    pub balance_after: u64,
    pub status: TransactionStatus,
    pub description: String,
    pub service_source: String,
    pub reference: Option<Reference>,
    pub initiated_by: Option<String>,
    /// Entry this one reverses, if any
    pub reversal_of: Option<Uuid>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    /// Accept this stored entry as the answer to a retried `posting` on `wallet_id`
    ///
    /// Keys are unique across all wallets, so a key reused by another wallet or for the opposite
    /// direction is refused instead of replayed.
    pub fn ensure_replay_of(&self, wallet_id: Uuid, posting: &Posting) -> Result<(), Rejection> {
        if self.wallet_id != wallet_id || self.direction != posting.direction {
            return Err(Rejection::IdempotencyKeyReused {
                key: self.idempotency_key.clone(),
            });
        }
        Ok(())
    }
}

/// Result of storing a posting
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostingOutcome {
    pub transaction: WalletTransaction,
    /// `true` when the idempotency key already existed and nothing was applied
    pub replayed: bool,
}

/// Aggregates over the ledger of a single wallet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub credits: u64,
    pub debits: u64,
    pub count: u64,
    /// `balance_after` of the most recent entry
    pub last_balance_after: Option<u64>,
}

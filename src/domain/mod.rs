use std::fmt;

/// Declares a fieldless enum persisted as a lowercase string.
///
/// Both directions of the mapping are exhaustive matches, so adding a variant without a storage
/// label is a compile error rather than a silently mishandled row.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $label)] $variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::domain::UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($label => Ok($name::$variant),)+
                    other => Err($crate::domain::UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

mod audit;
mod grant;
mod metadata;
mod stats;
mod topup;
mod transaction;
mod wallet;

pub use audit::{AuditAction, AuditEntry, AuditSnapshot};
pub use grant::{GrantType, PromotionalGrant};
pub use metadata::{keys, Metadata, MetadataValue};
pub use stats::{month_start, SystemStats};
pub use topup::{PaymentMethod, TopupFilter, TopupStatus, WalletTopup};
pub use transaction::{
    Direction, LedgerTotals, Posting, PostingOutcome, Reference, TransactionStatus,
    TransactionType, WalletTransaction,
};
pub use wallet::{
    FreezeInfo, ReconciliationReport, Wallet, WalletFilter, WalletStatus, WalletTier,
    WalletTransition,
};

/// Reasons the domain refuses to apply a change
///
/// These are raised before anything is written, so a rejected change never leaves a partial
/// update behind.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// Zero amounts, or amounts that would overflow a counter
    #[error("amount must be a positive number of bubbles")]
    InvalidAmount,

    /// Debits require an active wallet
    #[error("wallet is {status}")]
    WalletInactive { status: WalletStatus },

    /// The debit exceeds the current balance
    ///
    /// Carries both numbers so the caller can show how many bubbles are missing.
    #[error("not enough bubbles: need {required} but have {balance}")]
    InsufficientFunds { balance: u64, required: u64 },

    #[error("cannot {action} a wallet that is {from}")]
    InvalidWalletTransition {
        from: WalletStatus,
        action: &'static str,
    },

    #[error("cannot move a topup from {from} to {to}")]
    InvalidTopupTransition { from: TopupStatus, to: TopupStatus },

    /// The idempotency key belongs to a posting on another wallet or in the other direction
    #[error("idempotency key {key} already used for another operation")]
    IdempotencyKeyReused { key: String },

    /// The expiry date cannot be represented
    #[error("an expiry in {days} days is out of range")]
    ExpiryOutOfRange { days: u32 },
}

/// A stored label that does not match any known variant
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Offset pagination for listings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 200;

    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset={} limit={}", self.offset, self.limit)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Direction, LedgerTotals, Posting, Rejection, TransactionStatus, TransactionType, WalletTransaction};

string_enum! {
    /// Lifecycle state of a wallet
    ///
    /// Only `Active` wallets can be debited. Every state still accepts credits so that refunds
    /// reach frozen wallets.
    pub enum WalletStatus {
        Active => "active",
        Frozen => "frozen",
        Suspended => "suspended",
        Closed => "closed",
    }
}

string_enum! {
    /// Cosmetic tier shown to the member
    pub enum WalletTier {
        Standard => "standard",
        Premium => "premium",
        Vip => "vip",
    }
}

/// Why and by whom a wallet was frozen
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeInfo {
    pub reason: String,
    pub frozen_at: DateTime<Utc>,
    pub frozen_by: String,
}

/// Bubble account of a single member
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: Uuid,
    /// Identifier of the member in the membership service
    pub member_id: Uuid,
    /// External auth identifier of the member
    ///
    /// Other services address wallets through this identifier, and there is at most one wallet
    /// per value.
    pub member_auth_id: String,

    /// Current balance in bubbles
    ///
    /// This is a cache of the ledger and always equals the `balance_after` of the latest
    /// transaction of this wallet.
    pub balance: u64,
    pub lifetime_purchased: u64,
    pub lifetime_spent: u64,
    pub lifetime_received: u64,

    pub status: WalletStatus,
    pub tier: WalletTier,
    /// Set while the wallet is frozen
    pub freeze: Option<FreezeInfo>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Administrative change to the state of a wallet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletTransition {
    Freeze { reason: String, actor: String },
    Unfreeze,
    Suspend,
    Close,
    ChangeTier(WalletTier),
}

impl WalletTransition {
    pub fn action(&self) -> &'static str {
        match self {
            WalletTransition::Freeze { .. } => "freeze",
            WalletTransition::Unfreeze => "unfreeze",
            WalletTransition::Suspend => "suspend",
            WalletTransition::Close => "close",
            WalletTransition::ChangeTier(_) => "change the tier of",
        }
    }
}

impl Wallet {
    pub fn new(member_id: Uuid, member_auth_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            wallet_id: Uuid::new_v4(),
            member_id,
            member_auth_id: member_auth_id.into(),
            balance: 0,
            lifetime_purchased: 0,
            lifetime_spent: 0,
            lifetime_received: 0,
            status: WalletStatus::Active,
            tier: WalletTier::Standard,
            freeze: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a posting to this wallet and return the resulting ledger entry
    ///
    /// The wallet is only modified when the posting is accepted. Callers must hold the wallet's
    /// lock from the read that produced `self` until both the wallet and the returned
    /// transaction are stored.
    pub fn post(
        &mut self,
        posting: &Posting,
        now: DateTime<Utc>,
    ) -> Result<WalletTransaction, Rejection> {
        if posting.amount == 0 {
            return Err(Rejection::InvalidAmount);
        }

        let balance_before = self.balance;
        let balance_after = match posting.direction {
            Direction::Debit => {
                if self.status != WalletStatus::Active {
                    return Err(Rejection::WalletInactive {
                        status: self.status,
                    });
                }
                if self.balance < posting.amount {
                    return Err(Rejection::InsufficientFunds {
                        balance: self.balance,
                        required: posting.amount,
                    });
                }
                self.balance - posting.amount
            }
            Direction::Credit => self
                .balance
                .checked_add(posting.amount)
                .ok_or(Rejection::InvalidAmount)?,
        };

        // A counter overflow returns before the balance is assigned
        match (posting.direction, posting.transaction_type) {
            (Direction::Debit, _) => {
                self.lifetime_spent = self
                    .lifetime_spent
                    .checked_add(posting.amount)
                    .ok_or(Rejection::InvalidAmount)?;
            }
            (Direction::Credit, TransactionType::Topup) => {
                self.lifetime_purchased = self
                    .lifetime_purchased
                    .checked_add(posting.amount)
                    .ok_or(Rejection::InvalidAmount)?;
            }
            (Direction::Credit, _) => {
                self.lifetime_received = self
                    .lifetime_received
                    .checked_add(posting.amount)
                    .ok_or(Rejection::InvalidAmount)?;
            }
        }
        self.balance = balance_after;
        self.updated_at = now;

        Ok(WalletTransaction {
            transaction_id: Uuid::new_v4(),
            wallet_id: self.wallet_id,
            idempotency_key: posting.idempotency_key.clone(),
            transaction_type: posting.transaction_type,
            direction: posting.direction,
            amount: posting.amount,
            balance_before,
            balance_after,
            status: TransactionStatus::Completed,
            description: posting.description.clone(),
            service_source: posting.service_source.clone(),
            reference: posting.reference.clone(),
            initiated_by: posting.initiated_by.clone(),
            reversal_of: posting.reversal_of,
            metadata: posting.metadata.clone(),
            created_at: now,
        })
    }

    /// Apply an administrative transition
    ///
    /// Closed wallets are terminal. Suspended wallets can only be closed.
    pub fn apply_transition(
        &mut self,
        transition: &WalletTransition,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        let invalid = Rejection::InvalidWalletTransition {
            from: self.status,
            action: transition.action(),
        };

        match (transition, self.status) {
            (_, WalletStatus::Closed) => return Err(invalid),
            (WalletTransition::Freeze { reason, actor }, WalletStatus::Active) => {
                self.status = WalletStatus::Frozen;
                self.freeze = Some(FreezeInfo {
                    reason: reason.clone(),
                    frozen_at: now,
                    frozen_by: actor.clone(),
                });
            }
            (WalletTransition::Freeze { .. }, _) => return Err(invalid),
            (WalletTransition::Unfreeze, WalletStatus::Frozen) => {
                self.status = WalletStatus::Active;
                self.freeze = None;
            }
            (WalletTransition::Unfreeze, _) => return Err(invalid),
            (WalletTransition::Suspend, WalletStatus::Active | WalletStatus::Frozen) => {
                self.status = WalletStatus::Suspended;
            }
            (WalletTransition::Suspend, WalletStatus::Suspended) => return Err(invalid),
            (WalletTransition::Close, _) => {
                self.status = WalletStatus::Closed;
            }
            (WalletTransition::ChangeTier(tier), _) => {
                self.tier = *tier;
            }
        }
        self.updated_at = now;

        Ok(())
    }

    /// Balance implied by the lifetime counters
    ///
    /// Returns `None` if the counters are inconsistent enough to go negative.
    pub fn counters_balance(&self) -> Option<u64> {
        self.lifetime_received
            .checked_add(self.lifetime_purchased)?
            .checked_sub(self.lifetime_spent)
    }

    pub fn reconcile(&self, totals: &LedgerTotals) -> ReconciliationReport {
        let ledger_balance = totals.credits.checked_sub(totals.debits);
        let cache_matches_last = match totals.last_balance_after {
            Some(last) => last == self.balance,
            // A wallet without transactions must still be empty
            None => self.balance == 0,
        };

        ReconciliationReport {
            wallet_id: self.wallet_id,
            cached_balance: self.balance,
            ledger_balance,
            last_balance_after: totals.last_balance_after,
            counters_balance: self.counters_balance(),
            transaction_count: totals.count,
            consistent: cache_matches_last
                && ledger_balance == Some(self.balance)
                && self.counters_balance() == Some(self.balance),
        }
    }
}

/// Comparison between a wallet's cached balance and its ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub wallet_id: Uuid,
    pub cached_balance: u64,
    /// Sum of credits minus sum of debits, `None` if debits exceed credits
    pub ledger_balance: Option<u64>,
    pub last_balance_after: Option<u64>,
    pub counters_balance: Option<u64>,
    pub transaction_count: u64,
    pub consistent: bool,
}

/// Administrative wallet search
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalletFilter {
    pub status: Option<WalletStatus>,
    /// Case-insensitive fragment of the member auth id
    pub search: Option<String>,
}

impl WalletFilter {
    pub fn matches(&self, wallet: &Wallet) -> bool {
        self.status.map_or(true, |status| wallet.status == status)
            && self.search.as_deref().map_or(true, |fragment| {
                wallet
                    .member_auth_id
                    .to_lowercase()
                    .contains(&fragment.to_lowercase())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Metadata;
    use rstest::*;
    use speculoos::prelude::*;

    fn posting(direction: Direction, transaction_type: TransactionType, amount: u64) -> Posting {
        Posting {
            member_auth_id: "auth-1".to_string(),
            direction,
            amount,
            idempotency_key: Uuid::new_v4().to_string(),
            transaction_type,
            description: "test".to_string(),
            service_source: "tests".to_string(),
            reference: None,
            initiated_by: None,
            reversal_of: None,
            metadata: Metadata::default(),
        }
    }

    #[fixture]
    fn wallet() -> Wallet {
        Wallet::new(Uuid::new_v4(), "auth-1", Utc::now())
    }

    #[rstest]
    fn test_topup_then_purchase(mut wallet: Wallet) {
        // GIVEN an empty wallet

        // WHEN crediting a topup then debiting a purchase
        let credit = wallet.post(
            &posting(Direction::Credit, TransactionType::Topup, 500),
            Utc::now(),
        );
        let debit = wallet.post(
            &posting(Direction::Debit, TransactionType::Purchase, 150),
            Utc::now(),
        );

        // THEN balances and counters follow both entries
        assert_that!(credit).is_ok().matches(|txn| {
            txn.balance_before == 0 && txn.balance_after == 500 && txn.amount == 500
        });
        assert_that!(debit).is_ok().matches(|txn| {
            txn.balance_before == 500 && txn.balance_after == 350 && txn.amount == 150
        });
        assert_that!(wallet.balance).is_equal_to(350);
        assert_that!(wallet.lifetime_purchased).is_equal_to(500);
        assert_that!(wallet.lifetime_spent).is_equal_to(150);
        assert_that!(wallet.lifetime_received).is_equal_to(0);
        assert_that!(wallet.counters_balance()).is_equal_to(Some(350));
    }

    #[rstest]
    fn test_credit_non_topup_counts_as_received(
        mut wallet: Wallet,
        #[values(
            TransactionType::Refund,
            TransactionType::WelcomeBonus,
            TransactionType::PromotionalCredit,
            TransactionType::AdminAdjustment
        )]
        transaction_type: TransactionType,
    ) {
        let res = wallet.post(&posting(Direction::Credit, transaction_type, 40), Utc::now());

        assert_that!(res).is_ok();
        assert_that!(wallet.lifetime_received).is_equal_to(40);
        assert_that!(wallet.lifetime_purchased).is_equal_to(0);
    }

    #[rstest]
    fn test_insufficient_funds(mut wallet: Wallet) {
        wallet
            .post(&posting(Direction::Credit, TransactionType::Topup, 30), Utc::now())
            .unwrap();
        let before = wallet.clone();

        let res = wallet.post(
            &posting(Direction::Debit, TransactionType::Purchase, 31),
            Utc::now(),
        );

        assert_that!(res).is_err().is_equal_to(Rejection::InsufficientFunds {
            balance: 30,
            required: 31,
        });
        assert_that!(wallet).is_equal_to(before);
    }

    #[rstest]
    #[case(WalletStatus::Frozen)]
    #[case(WalletStatus::Suspended)]
    #[case(WalletStatus::Closed)]
    fn test_inactive_wallet_rejects_debits_accepts_credits(
        mut wallet: Wallet,
        #[case] status: WalletStatus,
    ) {
        wallet.balance = 100;
        wallet.lifetime_received = 100;
        wallet.status = status;

        let debit = wallet.post(&posting(Direction::Debit, TransactionType::Purchase, 10), Utc::now());
        let credit = wallet.post(&posting(Direction::Credit, TransactionType::Refund, 10), Utc::now());

        assert_that!(debit)
            .is_err()
            .is_equal_to(Rejection::WalletInactive { status });
        assert_that!(credit).is_ok();
        assert_that!(wallet.balance).is_equal_to(110);
    }

    #[rstest]
    fn test_zero_amount(mut wallet: Wallet, #[values(Direction::Credit, Direction::Debit)] direction: Direction) {
        let res = wallet.post(&posting(direction, TransactionType::Purchase, 0), Utc::now());

        assert_that!(res).is_err().is_equal_to(Rejection::InvalidAmount);
    }

    #[rstest]
    fn test_credit_overflow_leaves_wallet_untouched(mut wallet: Wallet) {
        wallet.balance = u64::MAX - 1;
        wallet.lifetime_received = u64::MAX - 1;
        let before = wallet.clone();

        let res = wallet.post(&posting(Direction::Credit, TransactionType::Reward, 5), Utc::now());

        assert_that!(res).is_err().is_equal_to(Rejection::InvalidAmount);
        assert_that!(wallet).is_equal_to(before);
    }

    #[rstest]
    fn test_freeze_unfreeze(mut wallet: Wallet) {
        let freeze = WalletTransition::Freeze {
            reason: "suspicious activity".to_string(),
            actor: "admin-1".to_string(),
        };

        assert_that!(wallet.apply_transition(&freeze, Utc::now())).is_ok();
        assert_that!(wallet.status).is_equal_to(WalletStatus::Frozen);
        assert_that!(wallet.freeze)
            .is_some()
            .matches(|info| info.frozen_by == "admin-1");

        // Freezing twice is refused
        assert_that!(wallet.apply_transition(&freeze, Utc::now()))
            .is_err()
            .is_equal_to(Rejection::InvalidWalletTransition {
                from: WalletStatus::Frozen,
                action: "freeze",
            });

        assert_that!(wallet.apply_transition(&WalletTransition::Unfreeze, Utc::now())).is_ok();
        assert_that!(wallet.status).is_equal_to(WalletStatus::Active);
        assert_that!(wallet.freeze).is_none();
    }

    #[rstest]
    #[case(WalletStatus::Active, WalletTransition::Unfreeze)]
    #[case(WalletStatus::Suspended, WalletTransition::Suspend)]
    #[case(WalletStatus::Suspended, WalletTransition::Unfreeze)]
    #[case(WalletStatus::Closed, WalletTransition::Close)]
    #[case(WalletStatus::Closed, WalletTransition::ChangeTier(WalletTier::Vip))]
    fn test_invalid_transitions(
        mut wallet: Wallet,
        #[case] status: WalletStatus,
        #[case] transition: WalletTransition,
    ) {
        wallet.status = status;

        let res = wallet.apply_transition(&transition, Utc::now());

        assert_that!(res).is_err().matches(|err| {
            matches!(err, Rejection::InvalidWalletTransition { from, .. } if *from == status)
        });
        assert_that!(wallet.status).is_equal_to(status);
    }

    #[rstest]
    fn test_reconcile(mut wallet: Wallet) {
        wallet
            .post(&posting(Direction::Credit, TransactionType::Topup, 80), Utc::now())
            .unwrap();
        wallet
            .post(&posting(Direction::Debit, TransactionType::Purchase, 30), Utc::now())
            .unwrap();
        let totals = LedgerTotals {
            credits: 80,
            debits: 30,
            count: 2,
            last_balance_after: Some(50),
        };

        assert_that!(wallet.reconcile(&totals).consistent).is_true();

        // A cache that drifted from the ledger is reported
        wallet.balance = 55;
        let report = wallet.reconcile(&totals);
        assert_that!(report.consistent).is_false();
        assert_that!(report.ledger_balance).is_equal_to(Some(50));
    }

    #[rstest]
    #[case(WalletFilter::default(), true)]
    #[case(WalletFilter { status: Some(WalletStatus::Active), search: None }, true)]
    #[case(WalletFilter { status: Some(WalletStatus::Frozen), search: None }, false)]
    #[case(WalletFilter { status: None, search: Some("UTH-".to_string()) }, true)]
    #[case(WalletFilter { status: Some(WalletStatus::Active), search: Some("auth-2".to_string()) }, false)]
    fn test_wallet_filter(wallet: Wallet, #[case] filter: WalletFilter, #[case] expected: bool) {
        assert_that!(filter.matches(&wallet)).is_equal_to(expected);
    }
}

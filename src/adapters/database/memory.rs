use crate::{
    domain::{
        AuditEntry, Direction, GrantType, LedgerTotals, Page, Posting, PostingOutcome,
        PromotionalGrant, Rejection, SystemStats, TopupFilter, TopupStatus, TransactionType,
        Wallet, WalletFilter, WalletStatus, WalletTopup, WalletTransaction, WalletTransition,
    },
    ports::{
        audit::{self, AuditPort},
        database::{DatabasePort, Error},
    },
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use uuid::Uuid;

/// In-process ledger store
///
/// A single mutex guards every table, so postings on different wallets are serialized too.
/// That is stricter than the row locks of the PostgreSQL adapter but gives the same guarantees.
#[derive(Clone, Debug, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    wallets: HashMap<Uuid, Wallet>,
    wallets_by_auth_id: HashMap<String, Uuid>,
    /// Append-only, in commit order
    transactions: Vec<WalletTransaction>,
    transactions_by_key: HashMap<String, usize>,
    topups: HashMap<Uuid, WalletTopup>,
    topups_by_reference: HashMap<String, Uuid>,
    grants: Vec<PromotionalGrant>,
    audit_entries: Vec<AuditEntry>,
}

fn paginate<T: Clone>(items: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    items
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

#[async_trait::async_trait]
impl DatabasePort for MemoryDatabase {
    async fn create_wallet(&self, wallet: Wallet) -> Result<Wallet, Error> {
        let mut state = self.state.lock()?;
        if let Some(existing) = state
            .wallets_by_auth_id
            .get(&wallet.member_auth_id)
            .and_then(|wallet_id| state.wallets.get(wallet_id))
        {
            return Ok(existing.clone());
        }

        state
            .wallets_by_auth_id
            .insert(wallet.member_auth_id.clone(), wallet.wallet_id);
        state.wallets.insert(wallet.wallet_id, wallet.clone());
        Ok(wallet)
    }

    async fn find_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, Error> {
        Ok(self.state.lock()?.wallets.get(&wallet_id).cloned())
    }

    async fn find_wallet_by_auth_id(&self, member_auth_id: String) -> Result<Option<Wallet>, Error> {
        let state = self.state.lock()?;
        Ok(state
            .wallets_by_auth_id
            .get(&member_auth_id)
            .and_then(|wallet_id| state.wallets.get(wallet_id))
            .cloned())
    }

    async fn list_wallet_ids(&self, page: Page) -> Result<Vec<Uuid>, Error> {
        let state = self.state.lock()?;
        let mut wallets: Vec<&Wallet> = state.wallets.values().collect();
        wallets.sort_by_key(|wallet| (wallet.created_at, wallet.wallet_id));
        Ok(paginate(wallets.into_iter().map(|wallet| wallet.wallet_id), page))
    }

    async fn list_wallets(&self, filter: WalletFilter, page: Page) -> Result<Vec<Wallet>, Error> {
        let state = self.state.lock()?;
        let mut wallets: Vec<&Wallet> = state
            .wallets
            .values()
            .filter(|wallet| filter.matches(wallet))
            .collect();
        wallets.sort_by_key(|wallet| std::cmp::Reverse((wallet.created_at, wallet.wallet_id)));
        Ok(paginate(wallets.into_iter().cloned(), page))
    }

    async fn system_stats(&self, since: DateTime<Utc>) -> Result<SystemStats, Error> {
        let state = self.state.lock()?;
        let count_status = |status: WalletStatus| {
            state
                .wallets
                .values()
                .filter(|wallet| wallet.status == status)
                .count() as u64
        };

        Ok(SystemStats {
            total_wallets: state.wallets.len() as u64,
            active_wallets: count_status(WalletStatus::Active),
            frozen_wallets: count_status(WalletStatus::Frozen),
            bubbles_in_circulation: state.wallets.values().map(|wallet| wallet.balance).sum(),
            bubbles_spent: state
                .transactions
                .iter()
                .filter(|txn| txn.direction == Direction::Debit && txn.created_at >= since)
                .map(|txn| txn.amount)
                .sum(),
            topup_revenue: state
                .topups
                .values()
                .filter(|topup| {
                    topup.status == TopupStatus::Completed
                        && topup.completed_at.is_some_and(|at| at >= since)
                })
                .map(|topup| topup.fiat_amount)
                .sum(),
            period_start: since,
        })
    }

    async fn post_transaction(&self, posting: Posting) -> Result<PostingOutcome, Error> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        let wallet = state
            .wallets_by_auth_id
            .get(&posting.member_auth_id)
            .copied()
            .and_then(|wallet_id| state.wallets.get_mut(&wallet_id))
            .ok_or_else(|| Error::WalletNotFound(posting.member_auth_id.clone()))?;
        if let Some(&index) = state.transactions_by_key.get(&posting.idempotency_key) {
            let transaction = state.transactions[index].clone();
            transaction.ensure_replay_of(wallet.wallet_id, &posting)?;
            return Ok(PostingOutcome {
                transaction,
                replayed: true,
            });
        }

        let transaction = wallet.post(&posting, Utc::now())?;

        state
            .transactions_by_key
            .insert(transaction.idempotency_key.clone(), state.transactions.len());
        state.transactions.push(transaction.clone());

        Ok(PostingOutcome {
            transaction,
            replayed: false,
        })
    }

    async fn transition_wallet(
        &self,
        wallet_id: Uuid,
        transition: WalletTransition,
    ) -> Result<(Wallet, Wallet), Error> {
        let mut state = self.state.lock()?;
        let wallet = state
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;

        let before = wallet.clone();
        wallet.apply_transition(&transition, Utc::now())?;
        Ok((before, wallet.clone()))
    }

    async fn find_transaction(&self, transaction_id: Uuid) -> Result<Option<WalletTransaction>, Error> {
        Ok(self
            .state
            .lock()?
            .transactions
            .iter()
            .find(|txn| txn.transaction_id == transaction_id)
            .cloned())
    }

    async fn find_transaction_by_key(
        &self,
        idempotency_key: String,
    ) -> Result<Option<WalletTransaction>, Error> {
        let state = self.state.lock()?;
        Ok(state
            .transactions_by_key
            .get(&idempotency_key)
            .map(|&index| state.transactions[index].clone()))
    }

    async fn list_transactions(
        &self,
        wallet_id: Uuid,
        transaction_type: Option<TransactionType>,
        page: Page,
    ) -> Result<Vec<WalletTransaction>, Error> {
        let state = self.state.lock()?;
        Ok(paginate(
            state
                .transactions
                .iter()
                .rev()
                .filter(|txn| txn.wallet_id == wallet_id)
                .filter(|txn| transaction_type.map_or(true, |kind| txn.transaction_type == kind))
                .cloned(),
            page,
        ))
    }

    async fn ledger_totals(&self, wallet_id: Uuid) -> Result<LedgerTotals, Error> {
        let state = self.state.lock()?;
        let totals = state
            .transactions
            .iter()
            .filter(|txn| txn.wallet_id == wallet_id)
            .fold(LedgerTotals::default(), |mut totals, txn| {
                match txn.direction {
                    Direction::Credit => totals.credits += txn.amount,
                    Direction::Debit => totals.debits += txn.amount,
                }
                totals.count += 1;
                totals.last_balance_after = Some(txn.balance_after);
                totals
            });
        Ok(totals)
    }

    async fn insert_topup(&self, topup: WalletTopup) -> Result<WalletTopup, Error> {
        let mut state = self.state.lock()?;
        if state.topups_by_reference.contains_key(&topup.reference) {
            return Err(Error::DuplicateTopupReference(topup.reference));
        }

        state
            .topups_by_reference
            .insert(topup.reference.clone(), topup.topup_id);
        state.topups.insert(topup.topup_id, topup.clone());
        Ok(topup)
    }

    async fn update_topup(&self, topup: WalletTopup, expected: TopupStatus) -> Result<WalletTopup, Error> {
        let mut state = self.state.lock()?;
        let stored = state
            .topups
            .get_mut(&topup.topup_id)
            .ok_or_else(|| Error::TopupNotFound(topup.reference.clone()))?;
        if stored.status != expected {
            return Err(Rejection::InvalidTopupTransition {
                from: stored.status,
                to: topup.status,
            }
            .into());
        }
        *stored = topup.clone();
        Ok(topup)
    }

    async fn find_topup(&self, topup_id: Uuid) -> Result<Option<WalletTopup>, Error> {
        Ok(self.state.lock()?.topups.get(&topup_id).cloned())
    }

    async fn find_topup_by_reference(&self, reference: String) -> Result<Option<WalletTopup>, Error> {
        let state = self.state.lock()?;
        Ok(state
            .topups_by_reference
            .get(&reference)
            .and_then(|topup_id| state.topups.get(topup_id))
            .cloned())
    }

    async fn list_topups(&self, filter: TopupFilter, page: Page) -> Result<Vec<WalletTopup>, Error> {
        let state = self.state.lock()?;
        let mut topups: Vec<&WalletTopup> = state
            .topups
            .values()
            .filter(|topup| filter.matches(topup))
            .collect();
        topups.sort_by_key(|topup| std::cmp::Reverse((topup.created_at, topup.topup_id)));
        Ok(paginate(topups.into_iter().cloned(), page))
    }

    async fn list_open_topups(&self, created_before: DateTime<Utc>) -> Result<Vec<WalletTopup>, Error> {
        let state = self.state.lock()?;
        let mut topups: Vec<WalletTopup> = state
            .topups
            .values()
            .filter(|topup| topup.status.is_open() && topup.created_at < created_before)
            .cloned()
            .collect();
        topups.sort_by_key(|topup| topup.created_at);
        Ok(topups)
    }

    async fn insert_grant(&self, grant: PromotionalGrant) -> Result<PromotionalGrant, Error> {
        self.state.lock()?.grants.push(grant.clone());
        Ok(grant)
    }

    async fn attach_grant_transaction(
        &self,
        grant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<PromotionalGrant, Error> {
        let mut state = self.state.lock()?;
        let grant = state
            .grants
            .iter_mut()
            .find(|grant| grant.grant_id == grant_id)
            .ok_or(Error::GrantNotFound(grant_id))?;
        grant.transaction_id = Some(transaction_id);
        Ok(grant.clone())
    }

    async fn list_grants(
        &self,
        wallet_id: Option<Uuid>,
        grant_type: Option<GrantType>,
        page: Page,
    ) -> Result<Vec<PromotionalGrant>, Error> {
        let state = self.state.lock()?;
        Ok(paginate(
            state
                .grants
                .iter()
                .rev()
                .filter(|grant| wallet_id.map_or(true, |id| grant.wallet_id == id))
                .filter(|grant| grant_type.map_or(true, |kind| grant.grant_type == kind))
                .cloned(),
            page,
        ))
    }
}

#[async_trait::async_trait]
impl AuditPort for MemoryDatabase {
    async fn record(&self, entry: AuditEntry) -> Result<(), audit::Error> {
        self.state.lock()?.audit_entries.push(entry);
        Ok(())
    }

    async fn list_entries(&self, wallet_id: Option<Uuid>, page: Page) -> Result<Vec<AuditEntry>, audit::Error> {
        let state = self.state.lock()?;
        Ok(paginate(
            state
                .audit_entries
                .iter()
                .rev()
                .filter(|entry| wallet_id.map_or(true, |id| entry.wallet_id == id))
                .cloned(),
            page,
        ))
    }
}

/// Erased [`PoisonError`]
///
/// `PoisonError` keeps the `MutexGuard` internally, which is not send. Thus we erase the error
/// and only keep the string representation instead.
#[derive(Debug, thiserror::Error)]
#[error("poison error: {0}")]
pub struct ErasedPoisonError(String);

/// We need to create a custom `From` implementation here for an error that's specific to this
/// adapter.
impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Self::Adapter(Box::new(ErasedPoisonError(err.to_string())))
    }
}

impl<T> From<PoisonError<T>> for audit::Error {
    fn from(err: PoisonError<T>) -> Self {
        Self::Adapter(Box::new(ErasedPoisonError(err.to_string())))
    }
}

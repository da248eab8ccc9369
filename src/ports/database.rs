use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    GrantType, LedgerTotals, Page, Posting, PostingOutcome, PromotionalGrant, Rejection,
    SystemStats, TopupFilter, TopupStatus, TransactionType, Wallet, WalletFilter, WalletTopup,
    WalletTransaction, WalletTransition,
};

/// Durable storage for wallets and their ledger
///
/// This is the only component that writes wallet rows. Balance changes go exclusively through
/// [`DatabasePort::post_transaction`] and state changes through
/// [`DatabasePort::transition_wallet`], both of which validate against the locked row.
#[mockall::automock]
#[async_trait::async_trait]
pub trait DatabasePort: Send + Sync {
    /// Store a new wallet
    ///
    /// If a wallet already exists for the same `member_auth_id`, that wallet is returned
    /// instead and nothing is written.
    async fn create_wallet(&self, wallet: Wallet) -> Result<Wallet, Error>;
    async fn find_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, Error>;
    async fn find_wallet_by_auth_id(&self, member_auth_id: String) -> Result<Option<Wallet>, Error>;
    async fn list_wallet_ids(&self, page: Page) -> Result<Vec<Uuid>, Error>;
    /// Wallets matching `filter`, newest first
    async fn list_wallets(&self, filter: WalletFilter, page: Page) -> Result<Vec<Wallet>, Error>;
    /// Aggregates over every wallet, with activity counted from `since`
    async fn system_stats(&self, since: DateTime<Utc>) -> Result<SystemStats, Error>;

    /// Atomically apply a posting to the wallet of `posting.member_auth_id`
    ///
    /// The wallet row is locked for the whole read-validate-write sequence, so concurrent
    /// postings on the same wallet are serialized. If the idempotency key already exists, the
    /// stored transaction is returned with `replayed` set and nothing is applied.
    async fn post_transaction(&self, posting: Posting) -> Result<PostingOutcome, Error>;

    /// Atomically apply an administrative transition
    ///
    /// Returns the wallet as it was before and after the transition.
    async fn transition_wallet(
        &self,
        wallet_id: Uuid,
        transition: WalletTransition,
    ) -> Result<(Wallet, Wallet), Error>;

    async fn find_transaction(&self, transaction_id: Uuid) -> Result<Option<WalletTransaction>, Error>;
    async fn find_transaction_by_key(
        &self,
        idempotency_key: String,
    ) -> Result<Option<WalletTransaction>, Error>;
    /// Transactions of a wallet, newest first, optionally of a single type
    async fn list_transactions(
        &self,
        wallet_id: Uuid,
        transaction_type: Option<TransactionType>,
        page: Page,
    ) -> Result<Vec<WalletTransaction>, Error>;
    async fn ledger_totals(&self, wallet_id: Uuid) -> Result<LedgerTotals, Error>;

    /// Store a new topup
    ///
    /// Fails with [`Error::DuplicateTopupReference`] if the reference is already taken.
    async fn insert_topup(&self, topup: WalletTopup) -> Result<WalletTopup, Error>;
    /// Store a topup whose stored status is still `expected`
    ///
    /// Fails with [`Rejection::InvalidTopupTransition`] if another writer moved the topup first.
    async fn update_topup(&self, topup: WalletTopup, expected: TopupStatus) -> Result<WalletTopup, Error>;
    async fn find_topup(&self, topup_id: Uuid) -> Result<Option<WalletTopup>, Error>;
    async fn find_topup_by_reference(&self, reference: String) -> Result<Option<WalletTopup>, Error>;
    /// Topups matching `filter`, newest first
    async fn list_topups(&self, filter: TopupFilter, page: Page) -> Result<Vec<WalletTopup>, Error>;
    /// Pending or processing topups created before `created_before`
    async fn list_open_topups(&self, created_before: DateTime<Utc>) -> Result<Vec<WalletTopup>, Error>;

    async fn insert_grant(&self, grant: PromotionalGrant) -> Result<PromotionalGrant, Error>;
    /// Record the ledger entry a grant produced
    async fn attach_grant_transaction(
        &self,
        grant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<PromotionalGrant, Error>;
    /// Grants, newest first
    async fn list_grants(
        &self,
        wallet_id: Option<Uuid>,
        grant_type: Option<GrantType>,
        page: Page,
    ) -> Result<Vec<PromotionalGrant>, Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No wallet matches the given identity
    #[error("wallet {0} does not exist")]
    WalletNotFound(String),

    #[error("topup {0} does not exist")]
    TopupNotFound(String),

    #[error("grant {0} does not exist")]
    GrantNotFound(Uuid),

    #[error("topup reference {0} already exists")]
    DuplicateTopupReference(String),

    /// The domain refused the change
    ///
    /// Nothing was written.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}

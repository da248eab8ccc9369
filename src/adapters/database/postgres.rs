//! PostgreSQL ledger store
//!
//! Every balance change runs in a single database transaction that holds a `FOR UPDATE` lock on
//! the wallet row from the read until the commit. The idempotency key is checked once the lock is
//! held and enforced again by the unique constraint on insert.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    types::Json,
    FromRow,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::{env_var, required_env_var, ConfigError},
    domain::{
        AuditEntry, AuditSnapshot, FreezeInfo, GrantType, LedgerTotals, Metadata, Page, Posting,
        PostingOutcome, PromotionalGrant, Reference, Rejection, SystemStats, TopupFilter,
        TopupStatus, TransactionType, UnknownVariant, Wallet, WalletFilter, WalletTopup,
        WalletTransaction, WalletTransition,
    },
    ports::{
        audit::{self, AuditPort},
        database::{DatabasePort, Error},
    },
};

/// Connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/wallet".to_string(),
            max_connections: 20,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl DatabaseConfig {
    /// Create config from environment variables
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS`
    /// - `DATABASE_ACQUIRE_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            url: required_env_var("DATABASE_URL")?,
            max_connections: env_var("DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            acquire_timeout: env_var("DATABASE_ACQUIRE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
        })
    }

    /// URL with the password replaced, for logging
    pub fn url_masked(&self) -> String {
        mask_url(&self.url)
    }
}

fn mask_url(url: &str) -> String {
    let (Some(scheme_end), Some(at_pos)) = (url.find("://"), url.rfind('@')) else {
        return url.to_string();
    };
    let credentials = &url[scheme_end + 3..at_pos];
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}{user}:***{}", &url[..scheme_end + 3], &url[at_pos..]),
        None => url.to_string(),
    }
}

#[derive(Clone, Debug)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, Error> {
        info!(url = %config.url_masked(), "connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), Error> {
        info!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| Error::Adapter(Box::new(err)))
    }

    async fn transaction_by_key<'e, E>(executor: E, key: &str) -> Result<Option<WalletTransaction>, Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(executor)
        .await?
        .map(WalletTransaction::try_from)
        .transpose()
        .map_err(Error::from)
    }
}

const WALLET_COLUMNS: &str = "id, member_id, member_auth_id, balance, lifetime_purchased, \
    lifetime_spent, lifetime_received, status, tier, frozen_reason, frozen_at, frozen_by, \
    created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, wallet_id, idempotency_key, transaction_type, direction, \
    amount, balance_before, balance_after, status, description, service_source, reference_type, \
    reference_id, initiated_by, reversal_of, txn_metadata, created_at";

const TOPUP_COLUMNS: &str = "id, wallet_id, member_auth_id, reference, bubbles_amount, \
    fiat_amount, exchange_rate, payment_method, status, payment_reference, checkout_url, \
    access_code, completed_at, failed_at, failure_reason, created_at, updated_at";

const GRANT_COLUMNS: &str = "id, wallet_id, member_auth_id, grant_type, amount, remaining, \
    reason, campaign_code, expires_at, transaction_id, granted_by, grant_metadata, created_at";

const AUDIT_COLUMNS: &str = "id, wallet_id, action, performed_by, old_value, new_value, reason, \
    ip_address, created_at";

#[async_trait::async_trait]
impl DatabasePort for PostgresDatabase {
    async fn create_wallet(&self, wallet: Wallet) -> Result<Wallet, Error> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO wallets (id, member_id, member_auth_id, balance, lifetime_purchased,
                lifetime_spent, lifetime_received, status, tier, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (member_auth_id) DO NOTHING
            "#,
        )
        .bind(wallet.wallet_id)
        .bind(wallet.member_id)
        .bind(&wallet.member_auth_id)
        .bind(to_db(wallet.balance)?)
        .bind(to_db(wallet.lifetime_purchased)?)
        .bind(to_db(wallet.lifetime_spent)?)
        .bind(to_db(wallet.lifetime_received)?)
        .bind(wallet.status.as_str())
        .bind(wallet.tier.as_str())
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(wallet);
        }
        debug!(member_auth_id = %wallet.member_auth_id, "wallet already exists");
        self.find_wallet_by_auth_id(wallet.member_auth_id.clone())
            .await?
            .ok_or(Error::WalletNotFound(wallet.member_auth_id))
    }

    async fn find_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, Error> {
        sqlx::query_as::<_, WalletRow>(&format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE id = $1"))
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Wallet::try_from)
            .transpose()
            .map_err(Error::from)
    }

    async fn find_wallet_by_auth_id(&self, member_auth_id: String) -> Result<Option<Wallet>, Error> {
        sqlx::query_as::<_, WalletRow>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE member_auth_id = $1"
        ))
        .bind(member_auth_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Wallet::try_from)
        .transpose()
        .map_err(Error::from)
    }

    async fn list_wallet_ids(&self, page: Page) -> Result<Vec<Uuid>, Error> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM wallets ORDER BY created_at, id OFFSET $1 LIMIT $2",
        )
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn list_wallets(&self, filter: WalletFilter, page: Page) -> Result<Vec<Wallet>, Error> {
        sqlx::query_as::<_, WalletRow>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets \
             WHERE ($1::TEXT IS NULL OR status = $1) \
               AND ($2::TEXT IS NULL OR member_auth_id ILIKE '%' || $2 || '%') \
             ORDER BY created_at DESC, id DESC OFFSET $3 LIMIT $4"
        ))
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.search.as_deref().map(escape_like))
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Wallet::try_from(row).map_err(Error::from))
        .collect()
    }

    async fn system_stats(&self, since: DateTime<Utc>) -> Result<SystemStats, Error> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM wallets) AS total_wallets,
                (SELECT COUNT(*) FROM wallets WHERE status = 'active') AS active_wallets,
                (SELECT COUNT(*) FROM wallets WHERE status = 'frozen') AS frozen_wallets,
                (SELECT COALESCE(SUM(balance), 0)::BIGINT FROM wallets) AS bubbles_in_circulation,
                (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM wallet_transactions
                 WHERE direction = 'debit' AND created_at >= $1) AS bubbles_spent,
                (SELECT COALESCE(SUM(fiat_amount), 0)::BIGINT FROM wallet_topups
                 WHERE status = 'completed' AND completed_at >= $1) AS topup_revenue
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(SystemStats {
            total_wallets: from_db("total_wallets", row.total_wallets)?,
            active_wallets: from_db("active_wallets", row.active_wallets)?,
            frozen_wallets: from_db("frozen_wallets", row.frozen_wallets)?,
            bubbles_in_circulation: from_db("bubbles_in_circulation", row.bubbles_in_circulation)?,
            bubbles_spent: from_db("bubbles_spent", row.bubbles_spent)?,
            topup_revenue: from_db("topup_revenue", row.topup_revenue)?,
            period_start: since,
        })
    }

    async fn post_transaction(&self, posting: Posting) -> Result<PostingOutcome, Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, WalletRow>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE member_auth_id = $1 FOR UPDATE"
        ))
        .bind(&posting.member_auth_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::WalletNotFound(posting.member_auth_id.clone()))?;
        let mut wallet = Wallet::try_from(row)?;

        if let Some(transaction) = Self::transaction_by_key(&mut *tx, &posting.idempotency_key).await? {
            tx.rollback().await?;
            transaction.ensure_replay_of(wallet.wallet_id, &posting)?;
            return Ok(PostingOutcome {
                transaction,
                replayed: true,
            });
        }
        let transaction = wallet.post(&posting, Utc::now())?;

        let (reference_type, reference_id) = match &transaction.reference {
            Some(reference) => (Some(reference.kind.clone()), Some(reference.id.clone())),
            None => (None, None),
        };
        let inserted = sqlx::query(
            r#"
            INSERT INTO wallet_transactions (id, wallet_id, idempotency_key, transaction_type,
                direction, amount, balance_before, balance_after, status, description,
                service_source, reference_type, reference_id, initiated_by, reversal_of,
                txn_metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(transaction.transaction_id)
        .bind(transaction.wallet_id)
        .bind(&transaction.idempotency_key)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.direction.as_str())
        .bind(to_db(transaction.amount)?)
        .bind(to_db(transaction.balance_before)?)
        .bind(to_db(transaction.balance_after)?)
        .bind(transaction.status.as_str())
        .bind(&transaction.description)
        .bind(&transaction.service_source)
        .bind(reference_type)
        .bind(reference_id)
        .bind(&transaction.initiated_by)
        .bind(transaction.reversal_of)
        .bind(Json(transaction.metadata.clone()))
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // A concurrent request with the same key committed while this one waited on the lock
            tx.rollback().await?;
            let transaction = Self::transaction_by_key(&self.pool, &posting.idempotency_key)
                .await?
                .ok_or_else(|| Error::Adapter(Box::new(MissingTransaction(posting.idempotency_key.clone()))))?;
            transaction.ensure_replay_of(wallet.wallet_id, &posting)?;
            return Ok(PostingOutcome {
                transaction,
                replayed: true,
            });
        }

        sqlx::query(
            r#"
            UPDATE wallets
            SET balance = $2, lifetime_purchased = $3, lifetime_spent = $4,
                lifetime_received = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(wallet.wallet_id)
        .bind(to_db(wallet.balance)?)
        .bind(to_db(wallet.lifetime_purchased)?)
        .bind(to_db(wallet.lifetime_spent)?)
        .bind(to_db(wallet.lifetime_received)?)
        .bind(wallet.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, WalletRow>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE id = $1 FOR UPDATE"
        ))
        .bind(wallet_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;
        let before = Wallet::try_from(row)?;
        let mut after = before.clone();
        after.apply_transition(&transition, Utc::now())?;

        let freeze = after.freeze.as_ref();
        sqlx::query(
            r#"
            UPDATE wallets
            SET status = $2, tier = $3, frozen_reason = $4, frozen_at = $5, frozen_by = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(after.wallet_id)
        .bind(after.status.as_str())
        .bind(after.tier.as_str())
        .bind(freeze.map(|info| info.reason.clone()))
        .bind(freeze.map(|info| info.frozen_at))
        .bind(freeze.map(|info| info.frozen_by.clone()))
        .bind(after.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((before, after))
    }

    async fn find_transaction(&self, transaction_id: Uuid) -> Result<Option<WalletTransaction>, Error> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?
        .map(WalletTransaction::try_from)
        .transpose()
        .map_err(Error::from)
    }

    async fn find_transaction_by_key(
        &self,
        idempotency_key: String,
    ) -> Result<Option<WalletTransaction>, Error> {
        Self::transaction_by_key(&self.pool, &idempotency_key).await
    }

    async fn list_transactions(
        &self,
        wallet_id: Uuid,
        transaction_type: Option<TransactionType>,
        page: Page,
    ) -> Result<Vec<WalletTransaction>, Error> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions \
             WHERE wallet_id = $1 AND ($2::TEXT IS NULL OR transaction_type = $2) \
             ORDER BY seq DESC OFFSET $3 LIMIT $4"
        ))
        .bind(wallet_id)
        .bind(transaction_type.map(|kind| kind.as_str()))
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| WalletTransaction::try_from(row).map_err(Error::from))
        .collect()
    }

    async fn ledger_totals(&self, wallet_id: Uuid) -> Result<LedgerTotals, Error> {
        let row = sqlx::query_as::<_, TotalsRow>(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE direction = 'credit'), 0)::BIGINT AS credits,
                COALESCE(SUM(amount) FILTER (WHERE direction = 'debit'), 0)::BIGINT AS debits,
                COUNT(*) AS count,
                (SELECT balance_after FROM wallet_transactions
                 WHERE wallet_id = $1 ORDER BY seq DESC LIMIT 1) AS last_balance_after
            FROM wallet_transactions
            WHERE wallet_id = $1
            "#,
        )
        .bind(wallet_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerTotals::try_from(row)?)
    }

    async fn insert_topup(&self, topup: WalletTopup) -> Result<WalletTopup, Error> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO wallet_topups ({TOPUP_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT (reference) DO NOTHING"
        ))
        .bind(topup.topup_id)
        .bind(topup.wallet_id)
        .bind(&topup.member_auth_id)
        .bind(&topup.reference)
        .bind(to_db(topup.bubbles_amount)?)
        .bind(to_db(topup.fiat_amount)?)
        .bind(to_db(topup.exchange_rate)?)
        .bind(topup.payment_method.as_str())
        .bind(topup.status.as_str())
        .bind(&topup.payment_reference)
        .bind(&topup.checkout_url)
        .bind(&topup.access_code)
        .bind(topup.completed_at)
        .bind(topup.failed_at)
        .bind(&topup.failure_reason)
        .bind(topup.created_at)
        .bind(topup.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(Error::DuplicateTopupReference(topup.reference));
        }
        Ok(topup)
    }

    async fn update_topup(&self, topup: WalletTopup, expected: TopupStatus) -> Result<WalletTopup, Error> {
        let updated = sqlx::query(
            r#"
            UPDATE wallet_topups
            SET status = $2, payment_reference = $3, checkout_url = $4, access_code = $5,
                completed_at = $6, failed_at = $7, failure_reason = $8, updated_at = $9
            WHERE id = $1 AND status = $10
            "#,
        )
        .bind(topup.topup_id)
        .bind(topup.status.as_str())
        .bind(&topup.payment_reference)
        .bind(&topup.checkout_url)
        .bind(&topup.access_code)
        .bind(topup.completed_at)
        .bind(topup.failed_at)
        .bind(&topup.failure_reason)
        .bind(topup.updated_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(topup);
        }
        match self.find_topup(topup.topup_id).await? {
            Some(stored) => Err(Rejection::InvalidTopupTransition {
                from: stored.status,
                to: topup.status,
            }
            .into()),
            None => Err(Error::TopupNotFound(topup.reference)),
        }
    }

    async fn find_topup(&self, topup_id: Uuid) -> Result<Option<WalletTopup>, Error> {
        sqlx::query_as::<_, TopupRow>(&format!("SELECT {TOPUP_COLUMNS} FROM wallet_topups WHERE id = $1"))
            .bind(topup_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WalletTopup::try_from)
            .transpose()
            .map_err(Error::from)
    }

    async fn find_topup_by_reference(&self, reference: String) -> Result<Option<WalletTopup>, Error> {
        sqlx::query_as::<_, TopupRow>(&format!(
            "SELECT {TOPUP_COLUMNS} FROM wallet_topups WHERE reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?
        .map(WalletTopup::try_from)
        .transpose()
        .map_err(Error::from)
    }

    async fn list_topups(&self, filter: TopupFilter, page: Page) -> Result<Vec<WalletTopup>, Error> {
        sqlx::query_as::<_, TopupRow>(&format!(
            "SELECT {TOPUP_COLUMNS} FROM wallet_topups \
             WHERE ($1::UUID IS NULL OR wallet_id = $1) \
               AND ($2::TEXT IS NULL OR member_auth_id = $2) \
               AND ($3::TEXT IS NULL OR status = $3) \
             ORDER BY created_at DESC, id DESC OFFSET $4 LIMIT $5"
        ))
        .bind(filter.wallet_id)
        .bind(filter.member_auth_id)
        .bind(filter.status.map(|status| status.as_str()))
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| WalletTopup::try_from(row).map_err(Error::from))
        .collect()
    }

    async fn list_open_topups(&self, created_before: DateTime<Utc>) -> Result<Vec<WalletTopup>, Error> {
        sqlx::query_as::<_, TopupRow>(&format!(
            "SELECT {TOPUP_COLUMNS} FROM wallet_topups \
             WHERE status IN ('pending', 'processing') AND created_at < $1 \
             ORDER BY created_at"
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| WalletTopup::try_from(row).map_err(Error::from))
        .collect()
    }

    async fn insert_grant(&self, grant: PromotionalGrant) -> Result<PromotionalGrant, Error> {
        sqlx::query(&format!(
            "INSERT INTO promotional_bubble_grants ({GRANT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(grant.grant_id)
        .bind(grant.wallet_id)
        .bind(&grant.member_auth_id)
        .bind(grant.grant_type.as_str())
        .bind(to_db(grant.amount)?)
        .bind(to_db(grant.remaining)?)
        .bind(&grant.reason)
        .bind(&grant.campaign_code)
        .bind(grant.expires_at)
        .bind(grant.transaction_id)
        .bind(&grant.granted_by)
        .bind(Json(grant.metadata.clone()))
        .bind(grant.created_at)
        .execute(&self.pool)
        .await?;

        Ok(grant)
    }

    async fn attach_grant_transaction(
        &self,
        grant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<PromotionalGrant, Error> {
        sqlx::query_as::<_, GrantRow>(&format!(
            "UPDATE promotional_bubble_grants SET transaction_id = $2 WHERE id = $1 \
             RETURNING {GRANT_COLUMNS}"
        ))
        .bind(grant_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::GrantNotFound(grant_id))
        .and_then(|row| PromotionalGrant::try_from(row).map_err(Error::from))
    }

    async fn list_grants(
        &self,
        wallet_id: Option<Uuid>,
        grant_type: Option<GrantType>,
        page: Page,
    ) -> Result<Vec<PromotionalGrant>, Error> {
        sqlx::query_as::<_, GrantRow>(&format!(
            "SELECT {GRANT_COLUMNS} FROM promotional_bubble_grants \
             WHERE ($1::UUID IS NULL OR wallet_id = $1) AND ($2::TEXT IS NULL OR grant_type = $2) \
             ORDER BY created_at DESC, id OFFSET $3 LIMIT $4"
        ))
        .bind(wallet_id)
        .bind(grant_type.map(|kind| kind.as_str()))
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| PromotionalGrant::try_from(row).map_err(Error::from))
        .collect()
    }
}

#[async_trait::async_trait]
impl AuditPort for PostgresDatabase {
    async fn record(&self, entry: AuditEntry) -> Result<(), audit::Error> {
        sqlx::query(&format!(
            "INSERT INTO wallet_audit_logs ({AUDIT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(entry.entry_id)
        .bind(entry.wallet_id)
        .bind(entry.action.as_str())
        .bind(&entry.performed_by)
        .bind(entry.old_value.map(Json))
        .bind(entry.new_value.map(Json))
        .bind(&entry.reason)
        .bind(&entry.source_address)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_entries(&self, wallet_id: Option<Uuid>, page: Page) -> Result<Vec<AuditEntry>, audit::Error> {
        sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {AUDIT_COLUMNS} FROM wallet_audit_logs \
             WHERE ($1::UUID IS NULL OR wallet_id = $1) \
             ORDER BY created_at DESC, id OFFSET $2 LIMIT $3"
        ))
        .bind(wallet_id)
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| AuditEntry::try_from(row).map_err(|err| audit::Error::Adapter(Box::new(err))))
        .collect()
    }
}

#[derive(Debug, FromRow)]
struct WalletRow {
    id: Uuid,
    member_id: Uuid,
    member_auth_id: String,
    balance: i64,
    lifetime_purchased: i64,
    lifetime_spent: i64,
    lifetime_received: i64,
    status: String,
    tier: String,
    frozen_reason: Option<String>,
    frozen_at: Option<DateTime<Utc>>,
    frozen_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WalletRow> for Wallet {
    type Error = RowError;

    fn try_from(row: WalletRow) -> Result<Self, Self::Error> {
        let freeze = match (row.frozen_reason, row.frozen_at, row.frozen_by) {
            (Some(reason), Some(frozen_at), Some(frozen_by)) => Some(FreezeInfo {
                reason,
                frozen_at,
                frozen_by,
            }),
            _ => None,
        };

        Ok(Wallet {
            wallet_id: row.id,
            member_id: row.member_id,
            member_auth_id: row.member_auth_id,
            balance: from_db("balance", row.balance)?,
            lifetime_purchased: from_db("lifetime_purchased", row.lifetime_purchased)?,
            lifetime_spent: from_db("lifetime_spent", row.lifetime_spent)?,
            lifetime_received: from_db("lifetime_received", row.lifetime_received)?,
            status: row.status.parse()?,
            tier: row.tier.parse()?,
            freeze,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    wallet_id: Uuid,
    idempotency_key: String,
    transaction_type: String,
    direction: String,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    status: String,
    description: String,
    service_source: String,
    reference_type: Option<String>,
    reference_id: Option<String>,
    initiated_by: Option<String>,
    reversal_of: Option<Uuid>,
    txn_metadata: Json<Metadata>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for WalletTransaction {
    type Error = RowError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let reference = match (row.reference_type, row.reference_id) {
            (Some(kind), Some(id)) => Some(Reference { kind, id }),
            _ => None,
        };

        Ok(WalletTransaction {
            transaction_id: row.id,
            wallet_id: row.wallet_id,
            idempotency_key: row.idempotency_key,
            transaction_type: row.transaction_type.parse()?,
            direction: row.direction.parse()?,
            amount: from_db("amount", row.amount)?,
            balance_before: from_db("balance_before", row.balance_before)?,
            balance_after: from_db("balance_after", row.balance_after)?,
            status: row.status.parse()?,
            description: row.description,
            service_source: row.service_source,
            reference,
            initiated_by: row.initiated_by,
            reversal_of: row.reversal_of,
            metadata: row.txn_metadata.0,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TotalsRow {
    credits: i64,
    debits: i64,
    count: i64,
    last_balance_after: Option<i64>,
}

impl TryFrom<TotalsRow> for LedgerTotals {
    type Error = RowError;

    fn try_from(row: TotalsRow) -> Result<Self, Self::Error> {
        Ok(LedgerTotals {
            credits: from_db("credits", row.credits)?,
            debits: from_db("debits", row.debits)?,
            count: from_db("count", row.count)?,
            last_balance_after: row
                .last_balance_after
                .map(|value| from_db("last_balance_after", value))
                .transpose()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct StatsRow {
    total_wallets: i64,
    active_wallets: i64,
    frozen_wallets: i64,
    bubbles_in_circulation: i64,
    bubbles_spent: i64,
    topup_revenue: i64,
}

#[derive(Debug, FromRow)]
struct TopupRow {
    id: Uuid,
    wallet_id: Uuid,
    member_auth_id: String,
    reference: String,
    bubbles_amount: i64,
    fiat_amount: i64,
    exchange_rate: i64,
    payment_method: String,
    status: String,
    payment_reference: Option<String>,
    checkout_url: Option<String>,
    access_code: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TopupRow> for WalletTopup {
    type Error = RowError;

    fn try_from(row: TopupRow) -> Result<Self, Self::Error> {
        Ok(WalletTopup {
            topup_id: row.id,
            wallet_id: row.wallet_id,
            member_auth_id: row.member_auth_id,
            reference: row.reference,
            bubbles_amount: from_db("bubbles_amount", row.bubbles_amount)?,
            fiat_amount: from_db("fiat_amount", row.fiat_amount)?,
            exchange_rate: from_db("exchange_rate", row.exchange_rate)?,
            payment_method: row.payment_method.parse()?,
            status: row.status.parse()?,
            payment_reference: row.payment_reference,
            checkout_url: row.checkout_url,
            access_code: row.access_code,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct GrantRow {
    id: Uuid,
    wallet_id: Uuid,
    member_auth_id: String,
    grant_type: String,
    amount: i64,
    remaining: i64,
    reason: String,
    campaign_code: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    transaction_id: Option<Uuid>,
    granted_by: String,
    grant_metadata: Json<Metadata>,
    created_at: DateTime<Utc>,
}

impl TryFrom<GrantRow> for PromotionalGrant {
    type Error = RowError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        Ok(PromotionalGrant {
            grant_id: row.id,
            wallet_id: row.wallet_id,
            member_auth_id: row.member_auth_id,
            grant_type: row.grant_type.parse()?,
            amount: from_db("amount", row.amount)?,
            remaining: from_db("remaining", row.remaining)?,
            reason: row.reason,
            campaign_code: row.campaign_code,
            expires_at: row.expires_at,
            transaction_id: row.transaction_id,
            granted_by: row.granted_by,
            metadata: row.grant_metadata.0,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: Uuid,
    wallet_id: Uuid,
    action: String,
    performed_by: String,
    old_value: Option<Json<AuditSnapshot>>,
    new_value: Option<Json<AuditSnapshot>>,
    reason: String,
    ip_address: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = RowError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditEntry {
            entry_id: row.id,
            wallet_id: row.wallet_id,
            action: row.action.parse()?,
            performed_by: row.performed_by,
            old_value: row.old_value.map(|value| value.0),
            new_value: row.new_value.map(|value| value.0),
            reason: row.reason,
            source_address: row.ip_address,
            created_at: row.created_at,
        })
    }
}

/// Escape `ILIKE` wildcards so a search fragment matches literally
fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn to_db(value: u64) -> Result<i64, RowError> {
    i64::try_from(value).map_err(|_| RowError::OutOfRange {
        column: "amount",
        value: value.to_string(),
    })
}

fn from_db(column: &'static str, value: i64) -> Result<u64, RowError> {
    u64::try_from(value).map_err(|_| RowError::OutOfRange {
        column,
        value: value.to_string(),
    })
}

/// A stored row that cannot be represented in the domain model
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error(transparent)]
    UnknownVariant(#[from] UnknownVariant),

    #[error("{column} value {value} is out of range")]
    OutOfRange { column: &'static str, value: String },
}

/// The unique constraint reported a duplicate that could not be read back
#[derive(Debug, thiserror::Error)]
#[error("transaction with idempotency key {0} vanished after a conflict")]
pub struct MissingTransaction(String);

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Adapter(Box::new(err))
    }
}

impl From<RowError> for Error {
    fn from(err: RowError) -> Self {
        Self::Adapter(Box::new(err))
    }
}

impl From<sqlx::Error> for audit::Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Adapter(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, MetadataValue, TransactionType, WalletStatus, WalletTier};
    use rstest::*;
    use speculoos::prelude::*;

    #[fixture]
    fn wallet_row() -> WalletRow {
        WalletRow {
            id: Uuid::new_v4(),
            member_id: Uuid::new_v4(),
            member_auth_id: "auth-1".to_string(),
            balance: 350,
            lifetime_purchased: 0,
            lifetime_spent: 150,
            lifetime_received: 500,
            status: "frozen".to_string(),
            tier: "vip".to_string(),
            frozen_reason: Some("chargeback".to_string()),
            frozen_at: Some(Utc::now()),
            frozen_by: Some("admin-1".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[rstest]
    fn test_wallet_row(wallet_row: WalletRow) {
        let res = Wallet::try_from(wallet_row);

        assert_that!(res).is_ok().matches(|wallet| {
            wallet.balance == 350
                && wallet.status == WalletStatus::Frozen
                && wallet.tier == WalletTier::Vip
                && wallet.freeze.as_ref().map(|info| info.frozen_by.as_str()) == Some("admin-1")
        });
    }

    #[rstest]
    fn test_wallet_row_negative_balance(mut wallet_row: WalletRow) {
        wallet_row.balance = -1;

        let res = Wallet::try_from(wallet_row);

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, RowError::OutOfRange { column: "balance", .. }));
    }

    #[rstest]
    fn test_wallet_row_unknown_status(mut wallet_row: WalletRow) {
        wallet_row.status = "deleted".to_string();

        let res = Wallet::try_from(wallet_row);

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, RowError::UnknownVariant(_)));
    }

    #[test]
    fn test_transaction_row() {
        let row = TransactionRow {
            id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            idempotency_key: "order-42".to_string(),
            transaction_type: "purchase".to_string(),
            direction: "debit".to_string(),
            amount: 150,
            balance_before: 500,
            balance_after: 350,
            status: "completed".to_string(),
            description: "Course purchase".to_string(),
            service_source: "store".to_string(),
            reference_type: Some("store_order".to_string()),
            reference_id: Some("42".to_string()),
            initiated_by: None,
            reversal_of: None,
            txn_metadata: Json(Metadata::default().with("course", "rust-101")),
            created_at: Utc::now(),
        };

        let res = WalletTransaction::try_from(row);

        assert_that!(res).is_ok().matches(|txn| {
            txn.direction == Direction::Debit
                && txn.transaction_type == TransactionType::Purchase
                && txn.reference == Some(Reference::new("store_order", 42))
                && txn.metadata.get("course") == Some(&MetadataValue::Text("rust-101".to_string()))
        });
    }

    #[test]
    fn test_empty_ledger_totals() {
        let row = TotalsRow {
            credits: 0,
            debits: 0,
            count: 0,
            last_balance_after: None,
        };

        assert_that!(LedgerTotals::try_from(row))
            .is_ok()
            .is_equal_to(LedgerTotals::default());
    }

    #[rstest]
    #[case("auth-1", "auth-1")]
    #[case("100%", "100\\%")]
    #[case("a_b\\c", "a\\_b\\\\c")]
    fn test_escape_like(#[case] fragment: &str, #[case] expected: &str) {
        assert_that!(escape_like(fragment).as_str()).is_equal_to(expected);
    }

    #[rstest]
    #[case("postgresql://wallet:s3cret@db:5432/wallet", "postgresql://wallet:***@db:5432/wallet")]
    #[case("postgresql://wallet@db/wallet", "postgresql://wallet@db/wallet")]
    #[case("postgresql://localhost/wallet", "postgresql://localhost/wallet")]
    fn test_mask_url(#[case] url: &str, #[case] expected: &str) {
        assert_that!(mask_url(url).as_str()).is_equal_to(expected);
    }
}

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::{
    domain::{
        month_start, AuditEntry, Page, SystemStats, TransactionType, Wallet, WalletFilter,
        WalletTransaction,
    },
    ports::{
        audit::AuditPort, database::DatabasePort, member::MemberPort, payment::PaymentGatewayPort,
    },
};

use super::{DomainLogic, Error};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetWalletRequest {
    ByAuthId(String),
    ById(Uuid),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListTransactionsRequest {
    pub wallet_id: Uuid,
    pub transaction_type: Option<TransactionType>,
    pub page: Page,
}

/// A single transaction, visible only to the wallet owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetTransactionRequest {
    pub transaction_id: Uuid,
    pub member_auth_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListWalletsRequest {
    pub filter: WalletFilter,
    pub page: Page,
}

/// Dashboard figures, with monthly activity counted from the start of the month of `now`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemStatsRequest {
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListAuditLogRequest {
    pub wallet_id: Option<Uuid>,
    pub page: Page,
}

impl<D, A, M, P> DomainLogic<D, A, M, P>
where
    D: DatabasePort,
    A: AuditPort,
    M: MemberPort,
    P: PaymentGatewayPort,
{
    pub async fn get_wallet(&self, request: GetWalletRequest) -> Result<Wallet, Error> {
        let wallet = match &request {
            GetWalletRequest::ByAuthId(member_auth_id) => {
                self.database
                    .find_wallet_by_auth_id(member_auth_id.clone())
                    .await?
            }
            GetWalletRequest::ById(wallet_id) => self.database.find_wallet(*wallet_id).await?,
        };

        wallet.ok_or_else(|| match request {
            GetWalletRequest::ByAuthId(member_auth_id) => Error::NotFound(member_auth_id),
            GetWalletRequest::ById(wallet_id) => Error::NotFound(wallet_id.to_string()),
        })
    }

    /// Transactions of a wallet, newest first
    pub async fn list_transactions(
        &self,
        request: ListTransactionsRequest,
    ) -> Result<Vec<WalletTransaction>, Error> {
        if self.database.find_wallet(request.wallet_id).await?.is_none() {
            return Err(Error::NotFound(request.wallet_id.to_string()));
        }

        Ok(self
            .database
            .list_transactions(request.wallet_id, request.transaction_type, request.page)
            .await?)
    }

    pub async fn get_transaction(
        &self,
        request: GetTransactionRequest,
    ) -> Result<WalletTransaction, Error> {
        let wallet = self
            .database
            .find_wallet_by_auth_id(request.member_auth_id.clone())
            .await?
            .ok_or(Error::NotFound(request.member_auth_id))?;

        // Other members' transactions look exactly like missing ones
        self.database
            .find_transaction(request.transaction_id)
            .await?
            .filter(|txn| txn.wallet_id == wallet.wallet_id)
            .ok_or_else(|| Error::TransactionNotFound(request.transaction_id.to_string()))
    }

    /// Wallets for administration, newest first
    pub async fn list_wallets(&self, request: ListWalletsRequest) -> Result<Vec<Wallet>, Error> {
        Ok(self.database.list_wallets(request.filter, request.page).await?)
    }

    pub async fn system_stats(&self, request: SystemStatsRequest) -> Result<SystemStats, Error> {
        let since = month_start(request.now);
        let stats = self.database.system_stats(since).await?;
        debug!(
            total_wallets = stats.total_wallets,
            bubbles_in_circulation = stats.bubbles_in_circulation,
            %since,
            "computed system stats"
        );

        Ok(stats)
    }

    pub async fn list_audit_log(&self, request: ListAuditLogRequest) -> Result<Vec<AuditEntry>, Error> {
        Ok(self
            .audit
            .list_entries(request.wallet_id, request.page)
            .await?)
    }
}

service!(GetWalletRequest => Wallet, |logic, request| logic.get_wallet(request));
service!(ListTransactionsRequest => Vec<WalletTransaction>, |logic, request| logic.list_transactions(request));
service!(GetTransactionRequest => WalletTransaction, |logic, request| logic.get_transaction(request));
service!(ListWalletsRequest => Vec<Wallet>, |logic, request| logic.list_wallets(request));
service!(SystemStatsRequest => SystemStats, |logic, request| logic.system_stats(request));
service!(ListAuditLogRequest => Vec<AuditEntry>, |logic, request| logic.list_audit_log(request));

//! Transaction engine: the only way bubbles enter or leave a wallet

use tracing::info;
use uuid::Uuid;

use crate::{
    domain::{Direction, Metadata, Posting, Reference, TransactionType, WalletStatus, WalletTransaction},
    ports::{
        audit::AuditPort, database::DatabasePort, member::MemberPort, payment::PaymentGatewayPort,
    },
};

use super::{DomainLogic, Error};

/// Details of a debit or credit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostingRequest {
    pub member_auth_id: String,
    pub amount: u64,
    /// Retrying with the same key returns the first result instead of posting again
    pub idempotency_key: String,
    pub transaction_type: TransactionType,
    pub description: String,
    pub service_source: String,
    pub reference: Option<Reference>,
    pub initiated_by: Option<String>,
    pub metadata: Metadata,
}

impl PostingRequest {
    pub fn new(
        member_auth_id: impl Into<String>,
        amount: u64,
        idempotency_key: impl Into<String>,
        transaction_type: TransactionType,
        service_source: impl Into<String>,
    ) -> Self {
        Self {
            member_auth_id: member_auth_id.into(),
            amount,
            idempotency_key: idempotency_key.into(),
            transaction_type,
            description: String::new(),
            service_source: service_source.into(),
            reference: None,
            initiated_by: None,
            metadata: Metadata::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn initiated_by(mut self, actor: impl Into<String>) -> Self {
        self.initiated_by = Some(actor.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub(super) fn into_posting(self, direction: Direction, reversal_of: Option<Uuid>) -> Posting {
        Posting {
            member_auth_id: self.member_auth_id,
            direction,
            amount: self.amount,
            idempotency_key: self.idempotency_key,
            transaction_type: self.transaction_type,
            description: self.description,
            service_source: self.service_source,
            reference: self.reference,
            initiated_by: self.initiated_by,
            reversal_of,
            metadata: self.metadata,
        }
    }
}

pub struct DebitRequest(pub PostingRequest);
pub struct CreditRequest(pub PostingRequest);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostingResponse {
    pub transaction_id: Uuid,
    pub balance_after: u64,
    /// `true` when the idempotency key had already been used
    pub replayed: bool,
    pub transaction: WalletTransaction,
}

impl PostingResponse {
    fn new(transaction: WalletTransaction, replayed: bool) -> Self {
        Self {
            transaction_id: transaction.transaction_id,
            balance_after: transaction.balance_after,
            replayed,
            transaction,
        }
    }
}

pub struct CheckBalanceRequest {
    pub member_auth_id: String,
    pub required_amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceCheck {
    pub sufficient: bool,
    pub current_balance: u64,
    pub status: WalletStatus,
}

impl<D, A, M, P> DomainLogic<D, A, M, P>
where
    D: DatabasePort,
    A: AuditPort,
    M: MemberPort,
    P: PaymentGatewayPort,
{
    /// Remove bubbles from an active wallet
    #[tracing::instrument(skip_all, fields(member_auth_id = %request.member_auth_id, key = %request.idempotency_key, amount = request.amount))]
    pub async fn debit(&self, request: PostingRequest) -> Result<PostingResponse, Error> {
        self.post(request.into_posting(Direction::Debit, None)).await
    }

    /// Add bubbles to a wallet in any status
    #[tracing::instrument(skip_all, fields(member_auth_id = %request.member_auth_id, key = %request.idempotency_key, amount = request.amount))]
    pub async fn credit(&self, request: PostingRequest) -> Result<PostingResponse, Error> {
        self.post(request.into_posting(Direction::Credit, None)).await
    }

    /// Read-only balance check
    ///
    /// The answer can be stale by the time the caller debits, so callers must still handle
    /// [`Error::InsufficientFunds`].
    pub async fn check_balance(&self, request: CheckBalanceRequest) -> Result<BalanceCheck, Error> {
        let wallet = self
            .database
            .find_wallet_by_auth_id(request.member_auth_id.clone())
            .await?
            .ok_or(Error::NotFound(request.member_auth_id))?;

        Ok(BalanceCheck {
            sufficient: wallet.balance >= request.required_amount,
            current_balance: wallet.balance,
            status: wallet.status,
        })
    }

    pub(super) async fn post(&self, posting: Posting) -> Result<PostingResponse, Error> {
        if posting.amount == 0 {
            return Err(Error::InvalidAmount("amount must be positive".into()));
        }

        // Cheap path for retries, the store enforces the key again under the lock
        if let Some(existing) = self
            .database
            .find_transaction_by_key(posting.idempotency_key.clone())
            .await?
        {
            let wallet = self
                .database
                .find_wallet_by_auth_id(posting.member_auth_id.clone())
                .await?
                .ok_or_else(|| Error::NotFound(posting.member_auth_id.clone()))?;
            existing.ensure_replay_of(wallet.wallet_id, &posting)?;
            info!(
                transaction_id = %existing.transaction_id,
                key = %existing.idempotency_key,
                "replaying existing transaction"
            );
            return Ok(PostingResponse::new(existing, true));
        }

        let outcome = self.database.post_transaction(posting).await?;
        let txn = &outcome.transaction;
        if outcome.replayed {
            info!(transaction_id = %txn.transaction_id, key = %txn.idempotency_key, "replaying existing transaction");
        } else {
            info!(
                wallet_id = %txn.wallet_id,
                transaction_id = %txn.transaction_id,
                key = %txn.idempotency_key,
                direction = %txn.direction,
                amount = txn.amount,
                balance_before = txn.balance_before,
                balance_after = txn.balance_after,
                "posted transaction"
            );
        }

        Ok(PostingResponse::new(outcome.transaction, outcome.replayed))
    }
}

service!(DebitRequest => PostingResponse, |logic, request| logic.debit(request.0));
service!(CreditRequest => PostingResponse, |logic, request| logic.credit(request.0));
service!(CheckBalanceRequest => BalanceCheck, |logic, request| logic.check_balance(request));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::database::memory::MemoryDatabase,
        commands::tests::{credit, debit, logic, logic_with_wallet},
        domain::WalletTransition,
    };
    use rstest::*;
    use speculoos::prelude::*;
    use std::sync::Arc;
    use tower::{BoxError, Service, ServiceExt};

    #[tokio::test]
    async fn test_topup_then_purchase() {
        // GIVEN an empty wallet
        let (logic, database, wallet) = logic_with_wallet().await;

        // WHEN crediting 500 then debiting 150
        let credited = logic.credit(credit("auth-1", 500, "topup-1")).await.unwrap();
        let debited = logic.debit(debit("auth-1", 150, "order-1")).await.unwrap();

        // THEN the balances and counters follow
        assert_that!(credited.balance_after).is_equal_to(500);
        assert_that!(debited.balance_after).is_equal_to(350);
        let stored = database.find_wallet(wallet.wallet_id).await.unwrap().unwrap();
        assert_that!(stored.balance).is_equal_to(350);
        assert_that!(stored.lifetime_purchased).is_equal_to(500);
        assert_that!(stored.lifetime_spent).is_equal_to(150);
        assert_that!(stored.lifetime_received).is_equal_to(0);
    }

    #[tokio::test]
    async fn test_frozen_wallet_rejects_debit_accepts_credit() {
        // GIVEN a frozen wallet with 20 bubbles
        let (logic, database, wallet) = logic_with_wallet().await;
        logic.credit(credit("auth-1", 20, "topup-1")).await.unwrap();
        database
            .transition_wallet(
                wallet.wallet_id,
                WalletTransition::Freeze {
                    reason: "chargeback".to_string(),
                    actor: "admin-1".to_string(),
                },
            )
            .await
            .unwrap();

        // WHEN debiting then crediting 10
        let debit_res = logic.debit(debit("auth-1", 10, "order-1")).await;
        let credit_res = logic
            .credit(
                PostingRequest::new("auth-1", 10, "refund-1", TransactionType::Refund, "store"),
            )
            .await;

        // THEN only the credit is applied
        assert_that!(debit_res).is_err().matches(|err| {
            matches!(err, Error::WalletInactive { status: WalletStatus::Frozen })
        });
        assert_that!(credit_res)
            .is_ok()
            .matches(|res| res.balance_after == 30);
    }

    #[tokio::test]
    async fn test_same_key_applies_once() {
        // GIVEN a wallet with 100 bubbles
        let (logic, database, wallet) = logic_with_wallet().await;
        logic.credit(credit("auth-1", 100, "topup-1")).await.unwrap();

        // WHEN debiting twice with the same key and different amounts
        let first = logic.debit(debit("auth-1", 30, "order-1")).await.unwrap();
        let second = logic.debit(debit("auth-1", 70, "order-1")).await.unwrap();

        // THEN the second call returns the first transaction
        assert_that!(first.replayed).is_false();
        assert_that!(second.replayed).is_true();
        assert_that!(second.transaction_id).is_equal_to(first.transaction_id);
        assert_that!(second.transaction.amount).is_equal_to(30);
        assert_that!(database.find_wallet(wallet.wallet_id).await.unwrap().unwrap().balance)
            .is_equal_to(70);
    }

    #[tokio::test]
    async fn test_key_reused_by_another_wallet() {
        // GIVEN auth-1 credited 500 with a key and an empty wallet for auth-2
        let (logic, database, _) = logic_with_wallet().await;
        let other = logic
            .create_wallet(crate::commands::CreateWalletRequest {
                member_id: Uuid::new_v4(),
                member_auth_id: "auth-2".to_string(),
            })
            .await
            .unwrap();
        logic.credit(credit("auth-1", 500, "shared-key")).await.unwrap();
        logic.credit(credit("auth-2", 20, "topup-2")).await.unwrap();

        // WHEN auth-2 debits with the same key
        let res = logic.debit(debit("auth-2", 10, "shared-key")).await;

        // THEN the debit is refused without exposing the first transaction
        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidState(_)));
        assert_that!(database.find_wallet(other.wallet_id).await.unwrap().unwrap().balance)
            .is_equal_to(20);
    }

    #[tokio::test]
    async fn test_key_reused_in_other_direction() {
        let (logic, _, _) = logic_with_wallet().await;
        logic.credit(credit("auth-1", 100, "key-1")).await.unwrap();

        let res = logic.debit(debit("auth-1", 100, "key-1")).await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_insufficient_funds_reports_balance() {
        let (logic, _, _) = logic_with_wallet().await;
        logic.credit(credit("auth-1", 5, "topup-1")).await.unwrap();

        let res = logic.debit(debit("auth-1", 8, "order-1")).await;

        assert_that!(res).is_err().matches(|err| {
            matches!(err, Error::InsufficientFunds { balance: 5, required: 8 })
        });
    }

    #[rstest]
    #[tokio::test]
    async fn test_zero_amount(#[values(true, false)] is_credit: bool) {
        let (logic, _, _) = logic_with_wallet().await;

        let res = if is_credit {
            logic.credit(credit("auth-1", 0, "key-1")).await
        } else {
            logic.debit(debit("auth-1", 0, "key-1")).await
        };

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let database = MemoryDatabase::default();
        let logic = logic(&database);

        let res = logic.credit(credit("nobody", 5, "key-1")).await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::NotFound(id) if id == "nobody"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits() {
        // GIVEN a wallet holding enough for N-1 debits of `a`
        const N: u64 = 16;
        const A: u64 = 7;
        let (logic, database, wallet) = logic_with_wallet().await;
        logic.credit(credit("auth-1", A * (N - 1), "topup-1")).await.unwrap();
        let logic = Arc::new(logic);

        // WHEN N debits race
        let handles: Vec<_> = (0..N)
            .map(|index| {
                let logic = logic.clone();
                tokio::spawn(async move {
                    logic.debit(debit("auth-1", A, &format!("order-{index}"))).await
                })
            })
            .collect();
        let mut succeeded = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(Error::InsufficientFunds { .. }) => insufficient += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }

        // THEN exactly one fails and no update is lost
        assert_that!(succeeded).is_equal_to(N - 1);
        assert_that!(insufficient).is_equal_to(1);
        let stored = database.find_wallet(wallet.wallet_id).await.unwrap().unwrap();
        assert_that!(stored.balance).is_equal_to(0);
        let totals = database.ledger_totals(wallet.wallet_id).await.unwrap();
        assert_that!(totals.last_balance_after).is_some().is_equal_to(0);
        assert_that!(totals.count).is_equal_to(N);
    }

    #[tokio::test]
    async fn test_balance_follows_latest_transaction() {
        let (logic, database, wallet) = logic_with_wallet().await;
        for (index, amount) in [40, 25, 10].into_iter().enumerate() {
            logic
                .credit(credit("auth-1", amount, &format!("topup-{index}")))
                .await
                .unwrap();
            logic
                .debit(debit("auth-1", amount / 2, &format!("order-{index}")))
                .await
                .unwrap();

            let stored = database.find_wallet(wallet.wallet_id).await.unwrap().unwrap();
            let latest = database
                .list_transactions(wallet.wallet_id, None, crate::domain::Page::new(0, 1))
                .await
                .unwrap();
            assert_that!(latest[0].balance_after).is_equal_to(stored.balance);
        }
    }

    #[tokio::test]
    async fn test_check_balance() {
        let (logic, _, _) = logic_with_wallet().await;
        logic.credit(credit("auth-1", 50, "topup-1")).await.unwrap();

        let res = logic
            .check_balance(CheckBalanceRequest {
                member_auth_id: "auth-1".to_string(),
                required_amount: 60,
            })
            .await;

        assert_that!(res).is_ok().is_equal_to(BalanceCheck {
            sufficient: false,
            current_balance: 50,
            status: WalletStatus::Active,
        });
    }

    #[tokio::test]
    async fn test_as_service() -> Result<(), BoxError> {
        let (mut logic, _, _) = logic_with_wallet().await;

        let res = ServiceExt::<CreditRequest>::ready(&mut logic)
            .await?
            .call(CreditRequest(credit("auth-1", 12, "topup-1")))
            .await;

        assert_that!(res).is_ok().matches(|res| res.balance_after == 12 && !res.replayed);
        Ok(())
    }
}

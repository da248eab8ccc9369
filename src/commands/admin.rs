//! Administrative actions on wallets
//!
//! Every action that changes a wallet is recorded to the audit trail. Audit writes are
//! best-effort: a failure is logged and the action still succeeds.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    domain::{
        keys, AuditAction, AuditEntry, AuditSnapshot, Direction, Metadata, Reference,
        TransactionType, Wallet, WalletTier, WalletTransition,
    },
    ports::{
        audit::AuditPort, database::DatabasePort, member::MemberPort, payment::PaymentGatewayPort,
    },
};

use super::{validate_reason, DomainLogic, Error, PostingRequest, PostingResponse};

/// Who changes the status of which wallet, and why
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChangeRequest {
    pub wallet_id: Uuid,
    pub reason: String,
    pub actor: String,
    pub source_address: Option<String>,
}

pub struct FreezeWalletRequest(pub StatusChangeRequest);
pub struct UnfreezeWalletRequest(pub StatusChangeRequest);
pub struct SuspendWalletRequest(pub StatusChangeRequest);
pub struct CloseWalletRequest(pub StatusChangeRequest);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeTierRequest {
    pub wallet_id: Uuid,
    pub tier: WalletTier,
    pub reason: String,
    pub actor: String,
    pub source_address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdjustBalanceRequest {
    pub wallet_id: Uuid,
    /// Positive amounts credit the wallet, negative amounts debit it
    pub amount: i64,
    pub reason: String,
    pub actor: String,
    /// Generated when missing, in which case the adjustment cannot be retried safely
    pub idempotency_key: Option<String>,
    pub source_address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReverseTransactionRequest {
    pub transaction_id: Uuid,
    pub reason: String,
    pub actor: String,
}

fn audit_entry(
    wallet_id: Uuid,
    action: AuditAction,
    performed_by: &str,
    reason: &str,
    source_address: Option<String>,
) -> AuditEntry {
    AuditEntry {
        entry_id: Uuid::new_v4(),
        wallet_id,
        action,
        performed_by: performed_by.to_string(),
        old_value: None,
        new_value: None,
        reason: reason.to_string(),
        source_address,
        created_at: Utc::now(),
    }
}

impl<D, A, M, P> DomainLogic<D, A, M, P>
where
    D: DatabasePort,
    A: AuditPort,
    M: MemberPort,
    P: PaymentGatewayPort,
{
    /// Block debits on an active wallet
    pub async fn freeze_wallet(&self, request: StatusChangeRequest) -> Result<Wallet, Error> {
        validate_reason(&request.reason)?;
        let transition = WalletTransition::Freeze {
            reason: request.reason.clone(),
            actor: request.actor.clone(),
        };
        self.change_status(request, transition, AuditAction::Freeze).await
    }

    pub async fn unfreeze_wallet(&self, request: StatusChangeRequest) -> Result<Wallet, Error> {
        self.change_status(request, WalletTransition::Unfreeze, AuditAction::Unfreeze)
            .await
    }

    pub async fn suspend_wallet(&self, request: StatusChangeRequest) -> Result<Wallet, Error> {
        self.change_status(request, WalletTransition::Suspend, AuditAction::Suspend)
            .await
    }

    /// Close a wallet for good
    pub async fn close_wallet(&self, request: StatusChangeRequest) -> Result<Wallet, Error> {
        self.change_status(request, WalletTransition::Close, AuditAction::Close)
            .await
    }

    #[tracing::instrument(skip_all, fields(wallet_id = %request.wallet_id, actor = %request.actor, action = %action))]
    async fn change_status(
        &self,
        request: StatusChangeRequest,
        transition: WalletTransition,
        action: AuditAction,
    ) -> Result<Wallet, Error> {
        let (before, after) = self
            .database
            .transition_wallet(request.wallet_id, transition)
            .await?;
        info!(from = %before.status, to = %after.status, "wallet status changed");

        self.record_audit(AuditEntry {
            old_value: Some(AuditSnapshot::status(before.status)),
            new_value: Some(AuditSnapshot::status(after.status).with_reason(request.reason.as_str())),
            ..audit_entry(
                after.wallet_id,
                action,
                &request.actor,
                &request.reason,
                request.source_address,
            )
        })
        .await;

        Ok(after)
    }

    #[tracing::instrument(skip_all, fields(wallet_id = %request.wallet_id, actor = %request.actor, tier = %request.tier))]
    pub async fn change_tier(&self, request: ChangeTierRequest) -> Result<Wallet, Error> {
        let (before, after) = self
            .database
            .transition_wallet(request.wallet_id, WalletTransition::ChangeTier(request.tier))
            .await?;
        info!(from = %before.tier, to = %after.tier, "wallet tier changed");

        self.record_audit(AuditEntry {
            old_value: Some(AuditSnapshot::tier(before.tier)),
            new_value: Some(AuditSnapshot::tier(after.tier)),
            ..audit_entry(
                after.wallet_id,
                AuditAction::TierChange,
                &request.actor,
                &request.reason,
                request.source_address,
            )
        })
        .await;

        Ok(after)
    }

    /// Credit or debit a wallet by hand
    ///
    /// Goes through the transaction engine like any other posting, so debits still require an
    /// active wallet and enough bubbles.
    #[tracing::instrument(skip_all, fields(wallet_id = %request.wallet_id, actor = %request.actor, amount = request.amount))]
    pub async fn adjust_balance(&self, request: AdjustBalanceRequest) -> Result<PostingResponse, Error> {
        if request.amount == 0 {
            return Err(Error::InvalidAmount("adjustment cannot be zero".into()));
        }
        validate_reason(&request.reason)?;
        let wallet = self
            .database
            .find_wallet(request.wallet_id)
            .await?
            .ok_or_else(|| Error::NotFound(request.wallet_id.to_string()))?;

        let (direction, action, verb) = if request.amount > 0 {
            (Direction::Credit, AuditAction::AdminCredit, "credited")
        } else {
            (Direction::Debit, AuditAction::AdminDebit, "debited")
        };
        let amount = request.amount.unsigned_abs();
        let idempotency_key = request
            .idempotency_key
            .unwrap_or_else(|| format!("admin-adjust-{}", Uuid::new_v4()));
        let posting = PostingRequest::new(
            wallet.member_auth_id,
            amount,
            idempotency_key,
            TransactionType::AdminAdjustment,
            self.config.service_name.clone(),
        )
        .with_description(format!("Adjustment - {verb} by admin ({amount} bubbles)"))
        .initiated_by(request.actor.clone())
        .with_metadata(
            Metadata::default()
                .with(keys::REASON, request.reason.as_str())
                .with(keys::ADMIN_ID, request.actor.as_str()),
        );
        let posted = self.post(posting.into_posting(direction, None)).await?;

        if !posted.replayed {
            self.record_audit(AuditEntry {
                old_value: Some(AuditSnapshot::balance(posted.transaction.balance_before)),
                new_value: Some(AuditSnapshot::balance(posted.transaction.balance_after)),
                ..audit_entry(
                    wallet.wallet_id,
                    action,
                    &request.actor,
                    &request.reason,
                    request.source_address,
                )
            })
            .await;
        }

        Ok(posted)
    }

    /// Post the opposite of an existing transaction
    ///
    /// The original entry is left untouched. The reversal links to it through `reversal_of` and
    /// uses the key `reversal-{id}`, so a transaction is reversed at most once.
    #[tracing::instrument(skip_all, fields(transaction_id = %request.transaction_id, actor = %request.actor))]
    pub async fn reverse_transaction(
        &self,
        request: ReverseTransactionRequest,
    ) -> Result<PostingResponse, Error> {
        validate_reason(&request.reason)?;
        let original = self
            .database
            .find_transaction(request.transaction_id)
            .await?
            .ok_or_else(|| Error::TransactionNotFound(request.transaction_id.to_string()))?;
        if original.reversal_of.is_some() {
            return Err(Error::InvalidState("a reversal cannot be reversed".into()));
        }
        let wallet = self
            .database
            .find_wallet(original.wallet_id)
            .await?
            .ok_or_else(|| Error::NotFound(original.wallet_id.to_string()))?;

        let direction = original.direction.opposite();
        let (transaction_type, action) = match direction {
            Direction::Credit => (TransactionType::Refund, AuditAction::AdminCredit),
            Direction::Debit => (TransactionType::AdminAdjustment, AuditAction::AdminDebit),
        };
        let posting = PostingRequest::new(
            wallet.member_auth_id,
            original.amount,
            format!("reversal-{}", original.transaction_id),
            transaction_type,
            self.config.service_name.clone(),
        )
        .with_description(format!("Reversal - {} ({} bubbles)", request.reason, original.amount))
        .with_reference(Reference::new("transaction", original.transaction_id))
        .initiated_by(request.actor.clone())
        .with_metadata(
            Metadata::default()
                .with(keys::REASON, request.reason.as_str())
                .with(keys::ADMIN_ID, request.actor.as_str()),
        );
        let posted = self
            .post(posting.into_posting(direction, Some(original.transaction_id)))
            .await?;

        if !posted.replayed {
            self.record_audit(AuditEntry {
                old_value: Some(AuditSnapshot::balance(posted.transaction.balance_before)),
                new_value: Some(AuditSnapshot::balance(posted.transaction.balance_after)),
                ..audit_entry(wallet.wallet_id, action, &request.actor, &request.reason, None)
            })
            .await;
        }

        Ok(posted)
    }

    async fn record_audit(&self, entry: AuditEntry) {
        let (wallet_id, action) = (entry.wallet_id, entry.action);
        if let Err(err) = self.audit.record(entry).await {
            warn!(%wallet_id, %action, error = %err, "cannot record audit entry");
        }
    }
}

service!(FreezeWalletRequest => Wallet, |logic, request| logic.freeze_wallet(request.0));
service!(UnfreezeWalletRequest => Wallet, |logic, request| logic.unfreeze_wallet(request.0));
service!(SuspendWalletRequest => Wallet, |logic, request| logic.suspend_wallet(request.0));
service!(CloseWalletRequest => Wallet, |logic, request| logic.close_wallet(request.0));
service!(ChangeTierRequest => Wallet, |logic, request| logic.change_tier(request));
service!(AdjustBalanceRequest => PostingResponse, |logic, request| logic.adjust_balance(request));
service!(ReverseTransactionRequest => PostingResponse, |logic, request| logic.reverse_transaction(request));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commands::tests::{credit, debit, logic_with_wallet},
        domain::{Page, WalletStatus},
        ports::{
            audit::{self, MockAuditPort},
            member::MockMemberPort,
            payment::MockPaymentGatewayPort,
        },
    };
    use rstest::*;
    use speculoos::prelude::*;
    use std::sync::Arc;

    fn status_change(wallet: &Wallet, reason: &str) -> StatusChangeRequest {
        StatusChangeRequest {
            wallet_id: wallet.wallet_id,
            reason: reason.to_string(),
            actor: "admin-1".to_string(),
            source_address: Some("10.0.0.1".to_string()),
        }
    }

    fn adjustment(wallet: &Wallet, amount: i64, key: Option<&str>) -> AdjustBalanceRequest {
        AdjustBalanceRequest {
            wallet_id: wallet.wallet_id,
            amount,
            reason: "goodwill gesture".to_string(),
            actor: "admin-1".to_string(),
            idempotency_key: key.map(str::to_string),
            source_address: None,
        }
    }

    #[tokio::test]
    async fn test_freeze_and_unfreeze() {
        // GIVEN an active wallet
        let (logic, database, wallet) = logic_with_wallet().await;

        // WHEN freezing then unfreezing it
        let frozen = logic
            .freeze_wallet(status_change(&wallet, "suspicious chargebacks"))
            .await
            .unwrap();
        let unfrozen = logic
            .unfreeze_wallet(status_change(&wallet, "cleared by support"))
            .await
            .unwrap();

        // THEN both changes are applied and audited, newest first
        assert_that!(frozen.status).is_equal_to(WalletStatus::Frozen);
        assert_that!(frozen.freeze.as_ref().map(|info| info.frozen_by.as_str()))
            .is_equal_to(Some("admin-1"));
        assert_that!(unfrozen.status).is_equal_to(WalletStatus::Active);
        assert_that!(unfrozen.freeze).is_none();

        let entries = database
            .list_entries(Some(wallet.wallet_id), Page::default())
            .await
            .unwrap();
        assert_that!(entries).has_length(2);
        assert_that!(entries[0].action).is_equal_to(AuditAction::Unfreeze);
        assert_that!(entries[1].action).is_equal_to(AuditAction::Freeze);
        assert_that!(entries[1].old_value).is_equal_to(Some(AuditSnapshot::status(WalletStatus::Active)));
        assert_that!(entries[1].source_address.as_deref()).is_equal_to(Some("10.0.0.1"));
    }

    #[rstest]
    #[case("")]
    #[case("bad")]
    #[case("    ")]
    #[tokio::test]
    async fn test_freeze_requires_reason(#[case] reason: &str) {
        let (logic, database, wallet) = logic_with_wallet().await;

        let res = logic.freeze_wallet(status_change(&wallet, reason)).await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidReason(_)));
        assert_that!(database.find_wallet(wallet.wallet_id).await.unwrap().unwrap().status)
            .is_equal_to(WalletStatus::Active);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (logic, _, wallet) = logic_with_wallet().await;

        let unfreeze_active = logic
            .unfreeze_wallet(status_change(&wallet, "not frozen"))
            .await;
        logic
            .close_wallet(status_change(&wallet, "member request"))
            .await
            .unwrap();
        let suspend_closed = logic
            .suspend_wallet(status_change(&wallet, "too late"))
            .await;

        assert_that!(unfreeze_active)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidTransition(_)));
        assert_that!(suspend_closed)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let (logic, _, _) = logic_with_wallet().await;

        let res = logic
            .suspend_wallet(StatusChangeRequest {
                wallet_id: Uuid::new_v4(),
                reason: "fraud ring".to_string(),
                actor: "admin-1".to_string(),
                source_address: None,
            })
            .await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_change_tier() {
        let (logic, database, wallet) = logic_with_wallet().await;

        let res = logic
            .change_tier(ChangeTierRequest {
                wallet_id: wallet.wallet_id,
                tier: WalletTier::Vip,
                reason: "top supporter".to_string(),
                actor: "admin-1".to_string(),
                source_address: None,
            })
            .await;

        assert_that!(res).is_ok().matches(|wallet| wallet.tier == WalletTier::Vip);
        let entries = database.list_entries(None, Page::default()).await.unwrap();
        assert_that!(entries).has_length(1);
        assert_that!(entries[0].new_value).is_equal_to(Some(AuditSnapshot::tier(WalletTier::Vip)));
    }

    #[tokio::test]
    async fn test_adjust_balance() {
        // GIVEN an empty wallet
        let (logic, database, wallet) = logic_with_wallet().await;

        // WHEN crediting 50 then debiting 20 by hand
        let credited = logic.adjust_balance(adjustment(&wallet, 50, None)).await.unwrap();
        let debited = logic.adjust_balance(adjustment(&wallet, -20, None)).await.unwrap();

        // THEN both go through the ledger and are audited with the balances
        assert_that!(credited.balance_after).is_equal_to(50);
        assert_that!(debited.balance_after).is_equal_to(30);
        assert_that!(debited.transaction.transaction_type).is_equal_to(TransactionType::AdminAdjustment);
        assert_that!(debited.transaction.description.as_str())
            .is_equal_to("Adjustment - debited by admin (20 bubbles)");
        assert_that!(debited.transaction.metadata.text(keys::ADMIN_ID)).is_equal_to(Some("admin-1"));

        let entries = database
            .list_entries(Some(wallet.wallet_id), Page::default())
            .await
            .unwrap();
        assert_that!(entries).has_length(2);
        assert_that!(entries[0].action).is_equal_to(AuditAction::AdminDebit);
        assert_that!(entries[0].old_value).is_equal_to(Some(AuditSnapshot::balance(50)));
        assert_that!(entries[0].new_value).is_equal_to(Some(AuditSnapshot::balance(30)));
        assert_that!(entries[1].action).is_equal_to(AuditAction::AdminCredit);
    }

    #[tokio::test]
    async fn test_adjust_balance_replay_is_audited_once() {
        let (logic, database, wallet) = logic_with_wallet().await;

        let first = logic
            .adjust_balance(adjustment(&wallet, 40, Some("ticket-981")))
            .await
            .unwrap();
        let second = logic
            .adjust_balance(adjustment(&wallet, 40, Some("ticket-981")))
            .await
            .unwrap();

        assert_that!(second.replayed).is_true();
        assert_that!(second.transaction_id).is_equal_to(first.transaction_id);
        assert_that!(database.list_entries(None, Page::default()).await)
            .is_ok()
            .has_length(1);
    }

    #[rstest]
    #[case(0, "InvalidAmount")]
    #[case(-1, "InsufficientFunds")]
    #[tokio::test]
    async fn test_adjust_balance_refused(#[case] amount: i64, #[case] expected: &str) {
        let (logic, _, wallet) = logic_with_wallet().await;

        let res = logic.adjust_balance(adjustment(&wallet, amount, None)).await;

        assert_that!(res)
            .is_err()
            .matches(|err| format!("{err:?}").starts_with(expected));
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_action() {
        // GIVEN an audit trail that is down
        let (_, database, wallet) = logic_with_wallet().await;
        let mut audit = MockAuditPort::new();
        audit
            .expect_record()
            .times(1)
            .returning(|_| Err(audit::Error::Adapter("audit store unavailable".into())));
        let logic = DomainLogic::new(
            Arc::new(database.clone()),
            Arc::new(audit),
            Arc::new(MockMemberPort::new()),
            Arc::new(MockPaymentGatewayPort::new()),
            crate::config::WalletConfig::default(),
        );

        // WHEN freezing the wallet
        let res = logic
            .freeze_wallet(status_change(&wallet, "suspicious chargebacks"))
            .await;

        // THEN the freeze still happens
        assert_that!(res)
            .is_ok()
            .matches(|wallet| wallet.status == WalletStatus::Frozen);
    }

    #[tokio::test]
    async fn test_reverse_debit() {
        // GIVEN a purchase of 30 out of 100
        let (logic, database, wallet) = logic_with_wallet().await;
        logic.credit(credit("auth-1", 100, "topup-1")).await.unwrap();
        let purchase = logic.debit(debit("auth-1", 30, "order-1")).await.unwrap();
        let request = ReverseTransactionRequest {
            transaction_id: purchase.transaction_id,
            reason: "order cancelled".to_string(),
            actor: "admin-1".to_string(),
        };

        // WHEN reversing it twice
        let first = logic.reverse_transaction(request.clone()).await.unwrap();
        let second = logic.reverse_transaction(request).await.unwrap();

        // THEN a single linked refund restores the balance
        assert_that!(first.balance_after).is_equal_to(100);
        assert_that!(first.transaction.direction).is_equal_to(Direction::Credit);
        assert_that!(first.transaction.transaction_type).is_equal_to(TransactionType::Refund);
        assert_that!(first.transaction.reversal_of).is_equal_to(Some(purchase.transaction_id));
        assert_that!(second.replayed).is_true();
        assert_that!(database.find_wallet(wallet.wallet_id).await.unwrap().unwrap().balance)
            .is_equal_to(100);
    }

    #[tokio::test]
    async fn test_reverse_reversal() {
        let (logic, _, _) = logic_with_wallet().await;
        logic.credit(credit("auth-1", 100, "topup-1")).await.unwrap();
        let purchase = logic.debit(debit("auth-1", 30, "order-1")).await.unwrap();
        let reversal = logic
            .reverse_transaction(ReverseTransactionRequest {
                transaction_id: purchase.transaction_id,
                reason: "order cancelled".to_string(),
                actor: "admin-1".to_string(),
            })
            .await
            .unwrap();

        let res = logic
            .reverse_transaction(ReverseTransactionRequest {
                transaction_id: reversal.transaction_id,
                reason: "changed my mind".to_string(),
                actor: "admin-1".to_string(),
            })
            .await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_reverse_unknown_transaction() {
        let (logic, _, _) = logic_with_wallet().await;

        let res = logic
            .reverse_transaction(ReverseTransactionRequest {
                transaction_id: Uuid::new_v4(),
                reason: "order cancelled".to_string(),
                actor: "admin-1".to_string(),
            })
            .await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::TransactionNotFound(_)));
    }
}

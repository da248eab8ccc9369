use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    domain::ReconciliationReport,
    ports::{
        audit::AuditPort, database::DatabasePort, member::MemberPort, payment::PaymentGatewayPort,
    },
};

use super::{DomainLogic, Error};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileWalletRequest {
    pub wallet_id: Uuid,
}

impl<D, A, M, P> DomainLogic<D, A, M, P>
where
    D: DatabasePort,
    A: AuditPort,
    M: MemberPort,
    P: PaymentGatewayPort,
{
    /// Compare the cached balance of a wallet against its ledger
    ///
    /// Only reports: a drifted wallet is logged at `error` and left as is for a human to look at.
    pub async fn reconcile_wallet(
        &self,
        request: ReconcileWalletRequest,
    ) -> Result<ReconciliationReport, Error> {
        let wallet = self
            .database
            .find_wallet(request.wallet_id)
            .await?
            .ok_or_else(|| Error::NotFound(request.wallet_id.to_string()))?;
        let totals = self.database.ledger_totals(wallet.wallet_id).await?;

        let report = wallet.reconcile(&totals);
        if report.consistent {
            debug!(wallet_id = %report.wallet_id, balance = report.cached_balance, "wallet is consistent");
        } else {
            error!(
                wallet_id = %report.wallet_id,
                cached_balance = report.cached_balance,
                ledger_balance = ?report.ledger_balance,
                last_balance_after = ?report.last_balance_after,
                counters_balance = ?report.counters_balance,
                "wallet balance drifted from its ledger"
            );
        }

        Ok(report)
    }
}

service!(ReconcileWalletRequest => ReconciliationReport, |logic, request| logic.reconcile_wallet(request));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::database::memory::MemoryDatabase,
        commands::tests::{credit, debit, logic_with_wallet},
        config::WalletConfig,
        domain::{LedgerTotals, Wallet},
        ports::{
            database::MockDatabasePort, member::MockMemberPort, payment::MockPaymentGatewayPort,
        },
    };
    use chrono::Utc;
    use speculoos::prelude::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_consistent_wallet() {
        // GIVEN a wallet with some activity
        let (logic, _, wallet) = logic_with_wallet().await;
        logic.credit(credit("auth-1", 500, "topup-1")).await.unwrap();
        logic.debit(debit("auth-1", 150, "order-1")).await.unwrap();

        // WHEN reconciling it
        let res = logic
            .reconcile_wallet(ReconcileWalletRequest {
                wallet_id: wallet.wallet_id,
            })
            .await;

        // THEN cache, ledger and counters agree
        assert_that!(res).is_ok().matches(|report| {
            report.consistent
                && report.cached_balance == 350
                && report.ledger_balance == Some(350)
                && report.transaction_count == 2
        });
    }

    #[tokio::test]
    async fn test_empty_wallet() {
        let (logic, _, wallet) = logic_with_wallet().await;

        let res = logic
            .reconcile_wallet(ReconcileWalletRequest {
                wallet_id: wallet.wallet_id,
            })
            .await;

        assert_that!(res)
            .is_ok()
            .matches(|report| report.consistent && report.last_balance_after.is_none());
    }

    #[tokio::test]
    async fn test_drifted_wallet() {
        // GIVEN a cached balance with no ledger behind it
        let wallet = Wallet {
            balance: 10,
            lifetime_received: 10,
            ..Wallet::new(Uuid::new_v4(), "auth-1", Utc::now())
        };
        let wallet_id = wallet.wallet_id;
        let mut database = MockDatabasePort::new();
        database
            .expect_find_wallet()
            .returning(move |_| Ok(Some(wallet.clone())));
        database
            .expect_ledger_totals()
            .returning(|_| Ok(LedgerTotals::default()));
        let logic = DomainLogic::new(
            Arc::new(database),
            Arc::new(MemoryDatabase::default()),
            Arc::new(MockMemberPort::new()),
            Arc::new(MockPaymentGatewayPort::new()),
            WalletConfig::default(),
        );

        // WHEN reconciling it
        let res = logic.reconcile_wallet(ReconcileWalletRequest { wallet_id }).await;

        // THEN the drift is reported
        assert_that!(res).is_ok().matches(|report| {
            !report.consistent && report.cached_balance == 10 && report.ledger_balance == Some(0)
        });
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let (logic, _, _) = logic_with_wallet().await;

        let res = logic
            .reconcile_wallet(ReconcileWalletRequest {
                wallet_id: Uuid::new_v4(),
            })
            .await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::NotFound(_)));
    }
}

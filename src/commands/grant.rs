use chrono::Utc;
use tracing::info;

use crate::{
    domain::{keys, Direction, GrantType, Metadata, Page, PromotionalGrant, Reference, TransactionType},
    ports::{
        audit::AuditPort, database::DatabasePort, member::MemberPort, payment::PaymentGatewayPort,
    },
};

use super::{DomainLogic, Error, PostingRequest};

/// Longest explicit expiry accepted for a grant
const MAX_EXPIRY_DAYS: u32 = 3650;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantRequest {
    pub member_auth_id: String,
    pub amount: u64,
    pub grant_type: GrantType,
    pub reason: String,
    pub granted_by: String,
    pub campaign_code: Option<String>,
    /// Overrides the default expiry of the grant type
    pub expires_in_days: Option<u32>,
    pub metadata: Metadata,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListGrantsRequest {
    pub wallet_id: Option<uuid::Uuid>,
    pub grant_type: Option<GrantType>,
    pub page: Page,
}

impl<D, A, M, P> DomainLogic<D, A, M, P>
where
    D: DatabasePort,
    A: AuditPort,
    M: MemberPort,
    P: PaymentGatewayPort,
{
    /// Issue bonus bubbles and credit them immediately
    #[tracing::instrument(skip_all, fields(member_auth_id = %request.member_auth_id, grant_type = %request.grant_type, amount = request.amount))]
    pub async fn grant_promotional_bubbles(
        &self,
        request: GrantRequest,
    ) -> Result<PromotionalGrant, Error> {
        if request.amount == 0 {
            return Err(Error::InvalidAmount("grant must be at least one bubble".into()));
        }
        if request.expires_in_days.is_some_and(|days| days > MAX_EXPIRY_DAYS) {
            return Err(Error::InvalidAmount(
                format!("grants cannot expire more than {MAX_EXPIRY_DAYS} days out").into(),
            ));
        }
        let wallet = self
            .database
            .find_wallet_by_auth_id(request.member_auth_id.clone())
            .await?
            .ok_or_else(|| Error::NotFound(request.member_auth_id.clone()))?;

        let now = Utc::now();
        let expires_at = PromotionalGrant::expiry(
            request.grant_type,
            request.expires_in_days,
            self.config.default_promo_expiry_days,
            now,
        )?;
        let mut metadata = request.metadata;
        metadata.insert(keys::GRANT_TYPE, request.grant_type.as_str());
        if let Some(code) = &request.campaign_code {
            metadata.insert(keys::CAMPAIGN_CODE, code.as_str());
        }
        let grant = PromotionalGrant::new(
            wallet.wallet_id,
            request.member_auth_id.clone(),
            request.grant_type,
            request.amount,
            request.reason,
            request.granted_by.clone(),
            request.campaign_code,
            expires_at,
            metadata,
            now,
        )?;
        let grant = self.database.insert_grant(grant).await?;

        let posting = PostingRequest::new(
            request.member_auth_id,
            grant.amount,
            grant.credit_idempotency_key(),
            TransactionType::PromotionalCredit,
            self.config.service_name.clone(),
        )
        .with_description(grant.description())
        .with_reference(Reference::new("grant", grant.grant_id))
        .initiated_by(request.granted_by)
        .with_metadata(grant.metadata.clone());
        let posted = self.post(posting.into_posting(Direction::Credit, None)).await?;

        let grant = self
            .database
            .attach_grant_transaction(grant.grant_id, posted.transaction_id)
            .await?;
        info!(
            grant_id = %grant.grant_id,
            wallet_id = %grant.wallet_id,
            transaction_id = %posted.transaction_id,
            "granted promotional bubbles"
        );

        Ok(grant)
    }

    /// Grants, newest first
    pub async fn list_grants(&self, request: ListGrantsRequest) -> Result<Vec<PromotionalGrant>, Error> {
        Ok(self
            .database
            .list_grants(request.wallet_id, request.grant_type, request.page)
            .await?)
    }
}

service!(GrantRequest => PromotionalGrant, |logic, request| logic.grant_promotional_bubbles(request));
service!(ListGrantsRequest => Vec<PromotionalGrant>, |logic, request| logic.list_grants(request));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::logic_with_wallet;
    use chrono::Duration;
    use rstest::*;
    use speculoos::prelude::*;

    fn grant(grant_type: GrantType, amount: u64, expires_in_days: Option<u32>) -> GrantRequest {
        GrantRequest {
            member_auth_id: "auth-1".to_string(),
            amount,
            grant_type,
            reason: "Spring splash".to_string(),
            granted_by: "admin-1".to_string(),
            campaign_code: Some("SPLASH24".to_string()),
            expires_in_days,
            metadata: Metadata::default(),
        }
    }

    #[tokio::test]
    async fn test_grant_is_credited() {
        // GIVEN an empty wallet
        let (logic, database, wallet) = logic_with_wallet().await;

        // WHEN granting 100 bubbles for 60 days
        let before = Utc::now();
        let res = logic
            .grant_promotional_bubbles(grant(GrantType::Campaign, 100, Some(60)))
            .await
            .unwrap();

        // THEN the wallet is credited and the grant is linked to the transaction
        assert_that!(res.remaining).is_equal_to(100);
        assert_that!(res.expires_at)
            .is_some()
            .matches(|at| *at >= before + Duration::days(60));
        let transaction_id = res.transaction_id.unwrap();
        let txn = database.find_transaction(transaction_id).await.unwrap().unwrap();
        assert_that!(txn.transaction_type).is_equal_to(TransactionType::PromotionalCredit);
        assert_that!(txn.idempotency_key).is_equal_to(format!("grant-{}", res.grant_id));
        assert_that!(txn.description.as_str()).is_equal_to("Promo - SPLASH24 (100 bubbles)");
        assert_that!(txn.metadata.text(keys::CAMPAIGN_CODE)).is_equal_to(Some("SPLASH24"));
        assert_that!(database.find_wallet(wallet.wallet_id).await.unwrap().unwrap().balance)
            .is_equal_to(100);
    }

    #[rstest]
    #[case(GrantType::Scholarship, false)]
    #[case(GrantType::Discount, false)]
    #[case(GrantType::LoyaltyReward, true)]
    #[tokio::test]
    async fn test_default_expiry(#[case] grant_type: GrantType, #[case] expires: bool) {
        let (logic, _, _) = logic_with_wallet().await;

        let res = logic
            .grant_promotional_bubbles(grant(grant_type, 15, None))
            .await
            .unwrap();

        assert_that!(res.expires_at.is_some()).is_equal_to(expires);
    }

    #[tokio::test]
    async fn test_zero_grant() {
        let (logic, _, _) = logic_with_wallet().await;

        let res = logic
            .grant_promotional_bubbles(grant(GrantType::Campaign, 0, None))
            .await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidAmount(_)));
    }

    #[rstest]
    #[case(MAX_EXPIRY_DAYS + 1)]
    #[case(u32::MAX)]
    #[tokio::test]
    async fn test_expiry_too_far_out(#[case] days: u32) {
        // GIVEN an empty wallet
        let (logic, database, wallet) = logic_with_wallet().await;

        // WHEN granting with an expiry beyond the limit
        let res = logic
            .grant_promotional_bubbles(grant(GrantType::Campaign, 100, Some(days)))
            .await;

        // THEN the grant is refused and nothing is credited
        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::InvalidAmount(_)));
        assert_that!(database.find_wallet(wallet.wallet_id).await.unwrap().unwrap().balance)
            .is_equal_to(0);
    }

    #[tokio::test]
    async fn test_longest_expiry_is_accepted() {
        let (logic, _, _) = logic_with_wallet().await;

        let res = logic
            .grant_promotional_bubbles(grant(GrantType::Campaign, 100, Some(MAX_EXPIRY_DAYS)))
            .await;

        assert_that!(res)
            .is_ok()
            .matches(|grant| grant.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_list_grants_by_type() {
        let (logic, _, wallet) = logic_with_wallet().await;
        logic
            .grant_promotional_bubbles(grant(GrantType::Campaign, 5, None))
            .await
            .unwrap();
        logic
            .grant_promotional_bubbles(grant(GrantType::Compensation, 7, None))
            .await
            .unwrap();

        let res = logic
            .list_grants(ListGrantsRequest {
                wallet_id: Some(wallet.wallet_id),
                grant_type: Some(GrantType::Compensation),
                page: Page::default(),
            })
            .await
            .unwrap();

        assert_that!(res).has_length(1);
        assert_that!(res[0].amount).is_equal_to(7);
    }
}

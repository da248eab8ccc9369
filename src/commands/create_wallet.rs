use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    domain::{keys, Direction, GrantType, Metadata, PromotionalGrant, Reference, TransactionType, Wallet},
    ports::{
        audit::AuditPort, database::DatabasePort, member::MemberPort, payment::PaymentGatewayPort,
    },
};

use super::{DomainLogic, Error, PostingRequest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateWalletRequest {
    pub member_id: Uuid,
    pub member_auth_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WelcomeBonusRequest {
    pub member_id: Uuid,
    pub member_auth_id: String,
    /// Decided by the caller, e.g. after the first paid activation
    pub eligible: bool,
    pub granted_by: String,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WelcomeBonusResponse {
    pub wallet: Wallet,
    /// `false` when the member was not eligible or already received the bonus
    pub granted: bool,
    pub amount: u64,
}

const DEFAULT_WELCOME_REASON: &str = "Welcome bonus, thanks for joining";

impl<D, A, M, P> DomainLogic<D, A, M, P>
where
    D: DatabasePort,
    A: AuditPort,
    M: MemberPort,
    P: PaymentGatewayPort,
{
    /// Open a wallet, or return the existing one for the same member
    #[tracing::instrument(skip_all, fields(member_auth_id = %request.member_auth_id))]
    pub async fn create_wallet(&self, request: CreateWalletRequest) -> Result<Wallet, Error> {
        let wallet = self
            .database
            .create_wallet(Wallet::new(request.member_id, request.member_auth_id, Utc::now()))
            .await?;
        info!(wallet_id = %wallet.wallet_id, "wallet ready");

        Ok(wallet)
    }

    /// One-time welcome bonus, keyed on the member's auth id
    #[tracing::instrument(skip_all, fields(member_auth_id = %request.member_auth_id))]
    pub async fn grant_welcome_bonus(
        &self,
        request: WelcomeBonusRequest,
    ) -> Result<WelcomeBonusResponse, Error> {
        let wallet = self
            .create_wallet(CreateWalletRequest {
                member_id: request.member_id,
                member_auth_id: request.member_auth_id.clone(),
            })
            .await?;

        let amount = self.config.welcome_bonus_amount;
        if !request.eligible || !self.config.welcome_bonus_enabled || amount == 0 {
            debug!("member is not eligible for a welcome bonus");
            return Ok(WelcomeBonusResponse {
                wallet,
                granted: false,
                amount: 0,
            });
        }

        let idempotency_key = format!("welcome-bonus-{}", request.member_auth_id);
        if self
            .database
            .find_transaction_by_key(idempotency_key.clone())
            .await?
            .is_some()
        {
            debug!("welcome bonus already granted");
            return Ok(WelcomeBonusResponse {
                wallet,
                granted: false,
                amount: 0,
            });
        }

        let now = Utc::now();
        let reason = request
            .reason
            .unwrap_or_else(|| DEFAULT_WELCOME_REASON.to_string());
        let grant = PromotionalGrant::new(
            wallet.wallet_id,
            request.member_auth_id.clone(),
            GrantType::WelcomeBonus,
            amount,
            reason,
            request.granted_by.clone(),
            None,
            PromotionalGrant::expiry(
                GrantType::WelcomeBonus,
                None,
                self.config.default_promo_expiry_days,
                now,
            )?,
            Metadata::default().with(keys::GRANT_TYPE, GrantType::WelcomeBonus.as_str()),
            now,
        )?;
        let grant = self.database.insert_grant(grant).await?;

        let posting = PostingRequest::new(
            request.member_auth_id,
            amount,
            idempotency_key,
            TransactionType::WelcomeBonus,
            self.config.service_name.clone(),
        )
        .with_description(grant.description())
        .with_reference(Reference::new("grant", grant.grant_id))
        .initiated_by(request.granted_by)
        .with_metadata(grant.metadata.clone());
        let posted = self.post(posting.into_posting(Direction::Credit, None)).await?;
        if posted.replayed {
            // A concurrent call won the race, this grant row stays unlinked
            return Ok(WelcomeBonusResponse {
                wallet,
                granted: false,
                amount: 0,
            });
        }
        self.database
            .attach_grant_transaction(grant.grant_id, posted.transaction_id)
            .await?;

        let wallet = self
            .database
            .find_wallet(wallet.wallet_id)
            .await?
            .ok_or_else(|| Error::NotFound(wallet.wallet_id.to_string()))?;
        info!(wallet_id = %wallet.wallet_id, amount, "granted welcome bonus");

        Ok(WelcomeBonusResponse {
            wallet,
            granted: true,
            amount,
        })
    }
}

service!(CreateWalletRequest => Wallet, |logic, request| logic.create_wallet(request));
service!(WelcomeBonusRequest => WelcomeBonusResponse, |logic, request| logic.grant_welcome_bonus(request));

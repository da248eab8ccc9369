//! Bubble purchases through the payment gateway

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    domain::{
        keys, Direction, Metadata, Page, PaymentMethod, Reference, Rejection, TopupFilter,
        TopupStatus, TransactionType, WalletStatus, WalletTopup,
    },
    ports::{
        audit::AuditPort,
        database::{self, DatabasePort},
        member::MemberPort,
        payment::{self, CheckoutRequest, PaymentGatewayPort, PaymentVerification},
    },
};

use super::{DomainLogic, Error, PostingRequest};

/// Generated references that may collide before a topup request gives up
const MAX_REFERENCE_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitiateTopupRequest {
    pub member_auth_id: String,
    pub bubbles: u64,
    pub payment_method: PaymentMethod,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitiateTopupResponse {
    pub topup_id: Uuid,
    pub reference: String,
    /// Where to send the member, only set for gateway-backed methods
    pub checkout_url: Option<String>,
    pub topup: WalletTopup,
}

impl From<WalletTopup> for InitiateTopupResponse {
    fn from(topup: WalletTopup) -> Self {
        Self {
            topup_id: topup.topup_id,
            reference: topup.reference.clone(),
            checkout_url: topup.checkout_url.clone(),
            topup,
        }
    }
}

/// Result of a payment as reported by the gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmTopupRequest {
    pub reference: String,
    pub payment_reference: String,
    pub outcome: PaymentOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmTopupResponse {
    pub topup: WalletTopup,
    /// Credit produced by the topup, if it completed
    pub transaction_id: Option<Uuid>,
}

/// Member-initiated status check, for when the member returns before the webhook arrives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileTopupRequest {
    pub reference: String,
    pub member_auth_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetTopupRequest {
    pub topup_id: Uuid,
    pub member_auth_id: String,
}

/// Topup history of a member, newest first
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListMemberTopupsRequest {
    pub member_auth_id: String,
    pub page: Page,
}

/// Administrative topup search
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListTopupsRequest {
    pub filter: TopupFilter,
    pub page: Page,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpireStaleTopupsRequest {
    pub now: DateTime<Utc>,
}

impl<D, A, M, P> DomainLogic<D, A, M, P>
where
    D: DatabasePort,
    A: AuditPort,
    M: MemberPort,
    P: PaymentGatewayPort,
{
    /// Create a pending topup and open a checkout session for it
    ///
    /// No wallet lock is held while waiting on the gateway. If the gateway fails or does not
    /// answer within `gateway_timeout`, the topup is marked failed.
    #[tracing::instrument(skip_all, fields(member_auth_id = %request.member_auth_id, bubbles = request.bubbles))]
    pub async fn initiate_topup(
        &self,
        request: InitiateTopupRequest,
    ) -> Result<InitiateTopupResponse, Error> {
        let (min, max) = (self.config.topup_min_bubbles, self.config.topup_max_bubbles);
        if !(min..=max).contains(&request.bubbles) {
            return Err(Error::InvalidAmount(
                format!("topups must be between {min} and {max} bubbles").into(),
            ));
        }
        let wallet = self
            .database
            .find_wallet_by_auth_id(request.member_auth_id.clone())
            .await?
            .ok_or_else(|| Error::NotFound(request.member_auth_id.clone()))?;
        if wallet.status != WalletStatus::Active {
            return Err(Error::WalletInactive {
                status: wallet.status,
            });
        }

        let topup = WalletTopup::new(
            wallet.wallet_id,
            wallet.member_auth_id,
            request.bubbles,
            self.config.exchange_rate,
            request.payment_method,
            Utc::now(),
        )?;
        let mut topup = self.store_new_topup(topup).await?;
        info!(
            topup_id = %topup.topup_id,
            reference = %topup.reference,
            fiat_amount = topup.fiat_amount,
            "created topup"
        );
        if !topup.payment_method.uses_gateway() {
            return Ok(topup.into());
        }

        let payer_email = match self.member.get_member(topup.member_auth_id.clone()).await {
            Ok(member) => member.email,
            Err(err) => {
                warn!(error = %err, "cannot resolve payer email, continuing without it");
                None
            }
        };
        let checkout = CheckoutRequest {
            topup_id: topup.topup_id,
            wallet_id: topup.wallet_id,
            reference: topup.reference.clone(),
            member_auth_id: topup.member_auth_id.clone(),
            payer_email,
            bubbles_amount: topup.bubbles_amount,
            fiat_amount: topup.fiat_amount,
            currency: self.config.fiat_currency.clone(),
            callback_url: format!("{}?topup={}", self.config.callback_base_path, topup.topup_id),
        };
        let session = match timeout(
            self.config.gateway_timeout,
            self.payment.initialize_checkout(checkout),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(self.fail_checkout(topup, err).await),
            Err(_) => return Err(self.fail_checkout(topup, payment::Error::Timeout).await),
        };

        topup.start_processing(
            session.payment_reference,
            session.checkout_url,
            session.access_code,
            Utc::now(),
        )?;
        let topup = self
            .database
            .update_topup(topup, TopupStatus::Pending)
            .await?;
        info!(reference = %topup.reference, "checkout session opened");

        Ok(topup.into())
    }

    /// Store a new topup, drawing a fresh reference when the generated one is taken
    async fn store_new_topup(&self, mut topup: WalletTopup) -> Result<WalletTopup, Error> {
        let mut attempt = 1;
        loop {
            match self.database.insert_topup(topup.clone()).await {
                Err(database::Error::DuplicateTopupReference(reference))
                    if attempt < MAX_REFERENCE_ATTEMPTS =>
                {
                    warn!(%reference, attempt, "topup reference collision, regenerating");
                    topup.reference = WalletTopup::generate_reference();
                    attempt += 1;
                }
                res => return Ok(res?),
            }
        }
    }

    /// Mark a topup failed after the gateway could not open a checkout
    async fn fail_checkout(&self, mut topup: WalletTopup, err: payment::Error) -> Error {
        let reason = err.to_string();
        warn!(reference = %topup.reference, error = %reason, "checkout initialization failed");

        let expected = topup.status;
        match topup.fail(reason.clone(), None, Utc::now()) {
            Ok(()) => {
                if let Err(err) = self.database.update_topup(topup, expected).await {
                    warn!(error = %err, "cannot mark topup as failed");
                }
            }
            Err(rejection) => warn!(error = %rejection, "cannot mark topup as failed"),
        }

        Error::UpstreamPaymentFailure(reason)
    }

    /// Apply a payment outcome reported by the gateway
    ///
    /// Confirming the same success twice credits once: the credit's idempotency key is derived
    /// from the topup reference.
    #[tracing::instrument(skip_all, fields(reference = %request.reference))]
    pub async fn confirm_topup(
        &self,
        request: ConfirmTopupRequest,
    ) -> Result<ConfirmTopupResponse, Error> {
        let topup = self
            .database
            .find_topup_by_reference(request.reference.clone())
            .await?
            .ok_or(Error::TopupNotFound(request.reference))?;

        match request.outcome {
            PaymentOutcome::Succeeded => self.complete_topup(topup, request.payment_reference).await,
            PaymentOutcome::Failed { reason } => {
                self.fail_topup(topup, reason, request.payment_reference).await
            }
        }
    }

    async fn complete_topup(
        &self,
        mut topup: WalletTopup,
        payment_reference: String,
    ) -> Result<ConfirmTopupResponse, Error> {
        if topup.status != TopupStatus::Completed {
            let expected = topup.status;
            topup.complete(payment_reference, Utc::now())?;
            topup = match self.database.update_topup(topup.clone(), expected).await {
                Ok(topup) => topup,
                // Another delivery of the same confirmation got there first
                Err(database::Error::Rejected(Rejection::InvalidTopupTransition {
                    from: TopupStatus::Completed,
                    ..
                })) => self
                    .database
                    .find_topup(topup.topup_id)
                    .await?
                    .ok_or_else(|| Error::TopupNotFound(topup.reference.clone()))?,
                Err(err) => return Err(err.into()),
            };
        }

        // Always attempted so that a crash between the two writes is repaired by a redelivery
        let mut metadata = Metadata::default();
        if let Some(payment_reference) = &topup.payment_reference {
            metadata.insert(keys::PAYMENT_REFERENCE, payment_reference.as_str());
        }
        if let Ok(fiat_amount) = i64::try_from(topup.fiat_amount) {
            metadata.insert(keys::FIAT_AMOUNT, fiat_amount);
        }
        let posting = PostingRequest::new(
            topup.member_auth_id.clone(),
            topup.bubbles_amount,
            topup.credit_idempotency_key(),
            TransactionType::Topup,
            self.config.service_name.clone(),
        )
        .with_description(format!("Bubble purchase ({} bubbles)", topup.bubbles_amount))
        .with_reference(Reference::new("topup", topup.topup_id))
        .with_metadata(metadata);
        let posted = self.post(posting.into_posting(Direction::Credit, None)).await?;
        info!(
            reference = %topup.reference,
            transaction_id = %posted.transaction_id,
            replayed = posted.replayed,
            "topup completed"
        );

        Ok(ConfirmTopupResponse {
            topup,
            transaction_id: Some(posted.transaction_id),
        })
    }

    async fn fail_topup(
        &self,
        mut topup: WalletTopup,
        reason: String,
        payment_reference: String,
    ) -> Result<ConfirmTopupResponse, Error> {
        match topup.status {
            TopupStatus::Completed => {
                // Bubbles were already credited, a late failure notice does not take them back
                warn!(reference = %topup.reference, "failure reported for a completed topup");
                let transaction_id = self
                    .database
                    .find_transaction_by_key(topup.credit_idempotency_key())
                    .await?
                    .map(|txn| txn.transaction_id);
                Ok(ConfirmTopupResponse {
                    topup,
                    transaction_id,
                })
            }
            TopupStatus::Failed | TopupStatus::Expired => Ok(ConfirmTopupResponse {
                topup,
                transaction_id: None,
            }),
            TopupStatus::Pending | TopupStatus::Processing => {
                let expected = topup.status;
                topup.fail(reason, Some(payment_reference), Utc::now())?;
                let topup = self.database.update_topup(topup, expected).await?;
                warn!(
                    reference = %topup.reference,
                    reason = topup.failure_reason.as_deref().unwrap_or_default(),
                    "topup payment failed"
                );
                Ok(ConfirmTopupResponse {
                    topup,
                    transaction_id: None,
                })
            }
        }
    }

    /// Ask the gateway about an open topup and apply a definitive answer
    ///
    /// Gateway errors are logged and the topup is returned as stored.
    #[tracing::instrument(skip_all, fields(reference = %request.reference))]
    pub async fn reconcile_topup(&self, request: ReconcileTopupRequest) -> Result<WalletTopup, Error> {
        let topup = self
            .database
            .find_topup_by_reference(request.reference.clone())
            .await?
            .filter(|topup| topup.member_auth_id == request.member_auth_id)
            .ok_or(Error::TopupNotFound(request.reference))?;
        if !topup.status.is_open() || !topup.payment_method.uses_gateway() {
            return Ok(topup);
        }

        let payment_reference = topup
            .payment_reference
            .clone()
            .unwrap_or_else(|| topup.reference.clone());
        let verification = match timeout(
            self.config.gateway_timeout,
            self.payment.verify_payment(payment_reference.clone()),
        )
        .await
        {
            Ok(Ok(verification)) => verification,
            Ok(Err(err)) => {
                warn!(error = %err, "cannot verify topup payment");
                return Ok(topup);
            }
            Err(_) => {
                warn!("payment verification timed out");
                return Ok(topup);
            }
        };

        let outcome = match verification {
            PaymentVerification::Completed => PaymentOutcome::Succeeded,
            PaymentVerification::Failed { reason } => PaymentOutcome::Failed { reason },
            PaymentVerification::Pending => {
                debug!("payment still pending");
                return Ok(topup);
            }
        };
        let confirmed = self
            .confirm_topup(ConfirmTopupRequest {
                reference: topup.reference,
                payment_reference,
                outcome,
            })
            .await?;

        Ok(confirmed.topup)
    }

    /// Topup owned by the caller
    pub async fn get_topup(&self, request: GetTopupRequest) -> Result<WalletTopup, Error> {
        self.database
            .find_topup(request.topup_id)
            .await?
            .filter(|topup| topup.member_auth_id == request.member_auth_id)
            .ok_or_else(|| Error::TopupNotFound(request.topup_id.to_string()))
    }

    pub async fn list_member_topups(
        &self,
        request: ListMemberTopupsRequest,
    ) -> Result<Vec<WalletTopup>, Error> {
        let wallet = self
            .database
            .find_wallet_by_auth_id(request.member_auth_id.clone())
            .await?
            .ok_or(Error::NotFound(request.member_auth_id))?;
        let filter = TopupFilter {
            wallet_id: Some(wallet.wallet_id),
            ..TopupFilter::default()
        };

        Ok(self.database.list_topups(filter, request.page).await?)
    }

    pub async fn list_topups(&self, request: ListTopupsRequest) -> Result<Vec<WalletTopup>, Error> {
        Ok(self.database.list_topups(request.filter, request.page).await?)
    }

    /// Expire open topups older than `topup_ttl`, returning how many were expired
    pub async fn expire_stale_topups(&self, request: ExpireStaleTopupsRequest) -> Result<usize, Error> {
        let cutoff = chrono::Duration::from_std(self.config.topup_ttl)
            .ok()
            .and_then(|ttl| request.now.checked_sub_signed(ttl))
            .ok_or(Error::InvalidState("topup ttl is out of range".into()))?;

        let mut expired = 0;
        for mut topup in self.database.list_open_topups(cutoff).await? {
            let expected = topup.status;
            topup.expire(request.now)?;
            match self.database.update_topup(topup, expected).await {
                Ok(topup) => {
                    info!(reference = %topup.reference, "expired topup");
                    expired += 1;
                }
                Err(database::Error::Rejected(rejection)) => {
                    debug!(error = %rejection, "topup moved while expiring");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if expired > 0 {
            info!(expired, %cutoff, "expired stale topups");
        }

        Ok(expired)
    }
}

service!(InitiateTopupRequest => InitiateTopupResponse, |logic, request| logic.initiate_topup(request));
service!(ConfirmTopupRequest => ConfirmTopupResponse, |logic, request| logic.confirm_topup(request));
service!(ReconcileTopupRequest => WalletTopup, |logic, request| logic.reconcile_topup(request));
service!(GetTopupRequest => WalletTopup, |logic, request| logic.get_topup(request));
service!(ListMemberTopupsRequest => Vec<WalletTopup>, |logic, request| logic.list_member_topups(request));
service!(ListTopupsRequest => Vec<WalletTopup>, |logic, request| logic.list_topups(request));
service!(ExpireStaleTopupsRequest => usize, |logic, request| logic.expire_stale_topups(request));

use std::{borrow::Cow, sync::Arc};

use crate::{
    config::WalletConfig,
    domain::{Rejection, WalletStatus},
    ports::{audit, database, member, payment},
};

/// Implements [`tower::Service`] for a request type by delegating to an inherent method
///
/// Each call works on a clone of the [`DomainLogic`], which only clones the port handles.
macro_rules! service {
    ($request:ty => $response:ty, |$logic:ident, $req:ident| $body:expr) => {
        impl<D, A, M, P> tower::Service<$request> for $crate::commands::DomainLogic<D, A, M, P>
        where
            D: $crate::ports::database::DatabasePort + 'static,
            A: $crate::ports::audit::AuditPort + 'static,
            M: $crate::ports::member::MemberPort + 'static,
            P: $crate::ports::payment::PaymentGatewayPort + 'static,
        {
            type Response = $response;
            type Error = $crate::commands::Error;
            type Future = std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
            >;

            fn poll_ready(
                &mut self,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), Self::Error>> {
                std::task::Poll::Ready(Ok(()))
            }

            fn call(&mut self, $req: $request) -> Self::Future {
                let $logic = self.clone();
                Box::pin(async move { $body.await })
            }
        }
    };
}

pub mod admin;
pub mod create_wallet;
pub mod engine;
pub mod grant;
pub mod queries;
pub mod reconcile;
pub mod topup;

pub use admin::{
    AdjustBalanceRequest, ChangeTierRequest, CloseWalletRequest, FreezeWalletRequest,
    ReverseTransactionRequest, StatusChangeRequest, SuspendWalletRequest, UnfreezeWalletRequest,
};
pub use create_wallet::{CreateWalletRequest, WelcomeBonusRequest, WelcomeBonusResponse};
pub use engine::{BalanceCheck, CheckBalanceRequest, CreditRequest, DebitRequest, PostingRequest, PostingResponse};
pub use grant::{GrantRequest, ListGrantsRequest};
pub use queries::{
    GetTransactionRequest, GetWalletRequest, ListAuditLogRequest, ListTransactionsRequest,
    ListWalletsRequest, SystemStatsRequest,
};
pub use reconcile::ReconcileWalletRequest;
pub use topup::{
    ConfirmTopupRequest, ConfirmTopupResponse, ExpireStaleTopupsRequest, GetTopupRequest,
    InitiateTopupRequest, InitiateTopupResponse, ListMemberTopupsRequest, ListTopupsRequest,
    PaymentOutcome, ReconcileTopupRequest,
};

/// Wallet operations over a set of ports
///
/// Every operation is available both as an inherent `async fn` and as a [`tower::Service`]
/// implementation for its request type.
pub struct DomainLogic<D, A, M, P> {
    database: Arc<D>,
    audit: Arc<A>,
    member: Arc<M>,
    payment: Arc<P>,
    config: WalletConfig,
}

impl<D, A, M, P> Clone for DomainLogic<D, A, M, P> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            audit: self.audit.clone(),
            member: self.member.clone(),
            payment: self.payment.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D, A, M, P> DomainLogic<D, A, M, P> {
    pub fn new(
        database: Arc<D>,
        audit: Arc<A>,
        member: Arc<M>,
        payment: Arc<P>,
        config: WalletConfig,
    ) -> Self {
        Self {
            database,
            audit,
            member,
            payment,
            config,
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No wallet for the given identity
    #[error("wallet {0} not found")]
    NotFound(String),

    #[error("wallet is {status}")]
    WalletInactive { status: WalletStatus },

    /// Carries both numbers so the caller can prompt for a topup
    #[error("not enough bubbles: need {required} but have {balance}")]
    InsufficientFunds { balance: u64, required: u64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(Cow<'static, str>),

    #[error("invalid reason: {0}")]
    InvalidReason(Cow<'static, str>),

    #[error("payment gateway failure: {0}")]
    UpstreamPaymentFailure(String),

    #[error("topup {0} not found")]
    TopupNotFound(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(Cow<'static, str>),

    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    #[error("database port error: {0:?}")]
    Database(database::Error),
    #[error("audit port error: {0:?}")]
    Audit(#[from] audit::Error),
    #[error("member port error: {0:?}")]
    Member(#[from] member::Error),
    #[error("payment port error: {0:?}")]
    Payment(#[from] payment::Error),
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::InvalidAmount => {
                Error::InvalidAmount("amount must be a positive number of bubbles".into())
            }
            Rejection::WalletInactive { status } => Error::WalletInactive { status },
            Rejection::InsufficientFunds { balance, required } => {
                Error::InsufficientFunds { balance, required }
            }
            Rejection::InvalidWalletTransition { .. } => {
                Error::InvalidTransition(rejection.to_string().into())
            }
            Rejection::InvalidTopupTransition { .. } => {
                Error::InvalidState(rejection.to_string().into())
            }
            Rejection::IdempotencyKeyReused { .. } => {
                Error::InvalidState("idempotency key already used for another operation".into())
            }
            Rejection::ExpiryOutOfRange { .. } => Error::InvalidAmount(rejection.to_string().into()),
        }
    }
}

/// Lifts domain-level failures reported by the database port into their own variants
impl From<database::Error> for Error {
    fn from(err: database::Error) -> Self {
        match err {
            database::Error::WalletNotFound(id) => Error::NotFound(id),
            database::Error::TopupNotFound(reference) => Error::TopupNotFound(reference),
            database::Error::Rejected(rejection) => rejection.into(),
            err => Error::Database(err),
        }
    }
}

/// Minimum length of reasons attached to sensitive administrative actions
const MIN_REASON_LEN: usize = 5;

fn validate_reason(reason: &str) -> Result<(), Error> {
    if reason.trim().chars().count() < MIN_REASON_LEN {
        return Err(Error::InvalidReason(
            format!("must be at least {MIN_REASON_LEN} characters").into(),
        ));
    }
    Ok(())
}

use uuid::Uuid;

/// External payment processor
///
/// Calls through this port are made without holding any wallet lock.
#[mockall::automock]
#[async_trait::async_trait]
pub trait PaymentGatewayPort: Send + Sync {
    /// Open a checkout session the member is redirected to
    async fn initialize_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession, Error>;
    /// Ask the processor for the current state of a payment
    async fn verify_payment(&self, reference: String) -> Result<PaymentVerification, Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub topup_id: Uuid,
    pub wallet_id: Uuid,
    /// Topup reference, reused as the payment reference
    pub reference: String,
    pub member_auth_id: String,
    pub payer_email: Option<String>,
    pub bubbles_amount: u64,
    /// Amount to charge, in fiat currency units
    pub fiat_amount: u64,
    pub currency: String,
    pub callback_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutSession {
    pub payment_reference: String,
    pub checkout_url: Option<String>,
    pub access_code: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentVerification {
    Completed,
    Failed { reason: String },
    /// No definitive answer yet
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The processor answered but refused the request
    #[error("payment gateway rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("payment gateway did not answer in time")]
    Timeout,

    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    adapters::service_client::{failure_excerpt, ServiceClient, ServiceClientConfig},
    config::ConfigError,
    ports::payment::{CheckoutRequest, CheckoutSession, Error, PaymentGatewayPort, PaymentVerification},
};

/// Payment gateway reached through the payments service
#[derive(Clone, Debug)]
pub struct HttpPaymentGateway {
    client: ServiceClient,
}

impl HttpPaymentGateway {
    pub fn new(config: ServiceClientConfig) -> Result<Self, Error> {
        let client = ServiceClient::new(config).map_err(|err| Error::Adapter(Box::new(err)))?;
        Ok(Self { client })
    }

    /// Create from environment variables, see [`ServiceClientConfig::from_env`]
    ///
    /// The payments service URL is read from `PAYMENTS_SERVICE_URL`.
    pub fn config_from_env() -> Result<ServiceClientConfig, ConfigError> {
        ServiceClientConfig::from_env("PAYMENTS_SERVICE_URL")
    }
}

#[derive(Debug, Serialize)]
struct InitializeBody<'a> {
    purpose: &'static str,
    amount: u64,
    currency: &'a str,
    reference: &'a str,
    member_auth_id: &'a str,
    callback_url: &'a str,
    metadata: InitializeMetadata<'a>,
}

#[derive(Debug, Serialize)]
struct InitializeMetadata<'a> {
    topup_id: Uuid,
    wallet_id: Uuid,
    bubbles_amount: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    payer_email: Option<&'a str>,
}

impl<'a> From<&'a CheckoutRequest> for InitializeBody<'a> {
    fn from(request: &'a CheckoutRequest) -> Self {
        Self {
            purpose: "wallet_topup",
            amount: request.fiat_amount,
            currency: &request.currency,
            reference: &request.reference,
            member_auth_id: &request.member_auth_id,
            callback_url: &request.callback_url,
            metadata: InitializeMetadata {
                topup_id: request.topup_id,
                wallet_id: request.wallet_id,
                bubbles_amount: request.bubbles_amount,
                kind: "wallet_topup",
                payer_email: request.payer_email.as_deref(),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct InitializeResponse {
    reference: Option<String>,
    authorization_url: Option<String>,
    access_code: Option<String>,
}

impl InitializeResponse {
    fn into_session(self, fallback_reference: &str) -> CheckoutSession {
        CheckoutSession {
            payment_reference: self
                .reference
                .unwrap_or_else(|| fallback_reference.to_string()),
            checkout_url: self.authorization_url,
            access_code: self.access_code,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    status: Option<String>,
    message: Option<String>,
}

impl From<VerifyResponse> for PaymentVerification {
    fn from(response: VerifyResponse) -> Self {
        match response.status.as_deref() {
            Some("completed") => PaymentVerification::Completed,
            Some("failed") => PaymentVerification::Failed {
                reason: response
                    .message
                    .unwrap_or_else(|| "Payment failed".to_string()),
            },
            _ => PaymentVerification::Pending,
        }
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::Adapter(Box::new(err))
    }
}

#[async_trait::async_trait]
impl PaymentGatewayPort for HttpPaymentGateway {
    async fn initialize_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession, Error> {
        let response = self
            .client
            .request(Method::POST, "/payments/internal/initialize")
            .json(&InitializeBody::from(&request))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let (status, message) = failure_excerpt(response).await;
            warn!(reference = %request.reference, %status, %message, "payment initialization refused");
            return Err(Error::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: InitializeResponse = response.json().await.map_err(transport_error)?;
        debug!(reference = %request.reference, "checkout session opened");
        Ok(body.into_session(&request.reference))
    }

    async fn verify_payment(&self, reference: String) -> Result<PaymentVerification, Error> {
        let response = self
            .client
            .request(
                Method::GET,
                &format!("/payments/internal/paystack/verify/{reference}"),
            )
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let (status, message) = failure_excerpt(response).await;
            return Err(Error::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: VerifyResponse = response.json().await.map_err(transport_error)?;
        Ok(body.into())
    }
}

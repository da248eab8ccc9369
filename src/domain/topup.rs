use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Rejection;

string_enum! {
    /// Lifecycle of a bubble purchase
    ///
    /// `Pending -> Processing -> Completed | Failed | Expired`. A pending topup can also fail or
    /// expire directly, e.g. when the gateway could not be reached.
    pub enum TopupStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Expired => "expired",
    }
}

impl TopupStatus {
    pub fn is_open(&self) -> bool {
        match self {
            TopupStatus::Pending | TopupStatus::Processing => true,
            TopupStatus::Completed | TopupStatus::Failed | TopupStatus::Expired => false,
        }
    }
}

string_enum! {
    pub enum PaymentMethod {
        Paystack => "paystack",
        BankTransfer => "bank_transfer",
        AdminGrant => "admin_grant",
    }
}

impl PaymentMethod {
    /// Whether a checkout session must be opened with the payment gateway
    pub fn uses_gateway(&self) -> bool {
        match self {
            PaymentMethod::Paystack => true,
            PaymentMethod::BankTransfer | PaymentMethod::AdminGrant => false,
        }
    }
}

/// One attempt to buy bubbles through the payment gateway
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTopup {
    pub topup_id: Uuid,
    pub wallet_id: Uuid,
    pub member_auth_id: String,
    /// Human-facing reference, also sent to the gateway
    pub reference: String,
    pub bubbles_amount: u64,
    /// Price in fiat currency units
    pub fiat_amount: u64,
    /// Fiat units per bubble at the time of the request
    pub exchange_rate: u64,
    pub payment_method: PaymentMethod,
    pub status: TopupStatus,
    pub payment_reference: Option<String>,
    pub checkout_url: Option<String>,
    pub access_code: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletTopup {
    pub fn new(
        wallet_id: Uuid,
        member_auth_id: impl Into<String>,
        bubbles_amount: u64,
        exchange_rate: u64,
        payment_method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<Self, Rejection> {
        if bubbles_amount == 0 {
            return Err(Rejection::InvalidAmount);
        }
        let fiat_amount = bubbles_amount
            .checked_mul(exchange_rate)
            .ok_or(Rejection::InvalidAmount)?;

        Ok(Self {
            topup_id: Uuid::new_v4(),
            wallet_id,
            member_auth_id: member_auth_id.into(),
            reference: Self::generate_reference(),
            bubbles_amount,
            fiat_amount,
            exchange_rate,
            payment_method,
            status: TopupStatus::Pending,
            payment_reference: None,
            checkout_url: None,
            access_code: None,
            completed_at: None,
            failed_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Random reference such as `TOP-7Q2ZK9AB`
    pub fn generate_reference() -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| char::from(c).to_ascii_uppercase())
            .collect();
        format!("TOP-{suffix}")
    }

    /// Idempotency key of the credit produced by this topup
    ///
    /// Derived from the reference so that a duplicated gateway notification cannot credit twice.
    pub fn credit_idempotency_key(&self) -> String {
        format!("topup-{}", self.reference)
    }

    pub fn start_processing(
        &mut self,
        payment_reference: String,
        checkout_url: Option<String>,
        access_code: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        self.ensure_transition(TopupStatus::Processing, &[TopupStatus::Pending])?;
        self.status = TopupStatus::Processing;
        self.payment_reference = Some(payment_reference);
        self.checkout_url = checkout_url;
        self.access_code = access_code;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, payment_reference: String, now: DateTime<Utc>) -> Result<(), Rejection> {
        self.ensure_transition(
            TopupStatus::Completed,
            &[TopupStatus::Pending, TopupStatus::Processing],
        )?;
        self.status = TopupStatus::Completed;
        self.payment_reference = Some(payment_reference);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(
        &mut self,
        reason: String,
        payment_reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        self.ensure_transition(
            TopupStatus::Failed,
            &[TopupStatus::Pending, TopupStatus::Processing],
        )?;
        self.status = TopupStatus::Failed;
        if payment_reference.is_some() {
            self.payment_reference = payment_reference;
        }
        self.failure_reason = Some(reason);
        self.failed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), Rejection> {
        self.ensure_transition(
            TopupStatus::Expired,
            &[TopupStatus::Pending, TopupStatus::Processing],
        )?;
        self.status = TopupStatus::Expired;
        self.failure_reason = Some("Payment was not confirmed in time".to_string());
        self.updated_at = now;
        Ok(())
    }

    fn ensure_transition(&self, to: TopupStatus, allowed_from: &[TopupStatus]) -> Result<(), Rejection> {
        if allowed_from.contains(&self.status) {
            Ok(())
        } else {
            Err(Rejection::InvalidTopupTransition {
                from: self.status,
                to,
            })
        }
    }
}

/// Topup search, every set field must match
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopupFilter {
    pub wallet_id: Option<Uuid>,
    pub member_auth_id: Option<String>,
    pub status: Option<TopupStatus>,
}

impl TopupFilter {
    pub fn matches(&self, topup: &WalletTopup) -> bool {
        self.wallet_id.map_or(true, |id| topup.wallet_id == id)
            && self
                .member_auth_id
                .as_ref()
                .map_or(true, |auth_id| topup.member_auth_id == *auth_id)
            && self.status.map_or(true, |status| topup.status == status)
    }
}

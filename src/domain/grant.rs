use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, Rejection};

string_enum! {
    pub enum GrantType {
        WelcomeBonus => "welcome_bonus",
        ReferralReward => "referral_reward",
        LoyaltyReward => "loyalty_reward",
        Campaign => "campaign",
        Compensation => "compensation",
        AdminManual => "admin_manual",
        /// Academy scholarship, reduces an installment obligation
        Scholarship => "scholarship",
        /// Fee discount deposited as bubbles
        Discount => "discount",
    }
}

impl GrantType {
    /// Grants that stand in for real fee reductions never expire
    pub fn never_expires(&self) -> bool {
        match self {
            GrantType::WelcomeBonus | GrantType::Scholarship | GrantType::Discount => true,
            GrantType::ReferralReward
            | GrantType::LoyaltyReward
            | GrantType::Campaign
            | GrantType::Compensation
            | GrantType::AdminManual => false,
        }
    }
}

/// Bonus bubbles issued by the system or an administrator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionalGrant {
    pub grant_id: Uuid,
    pub wallet_id: Uuid,
    pub member_auth_id: String,
    pub grant_type: GrantType,
    pub amount: u64,
    /// Part of `amount` not consumed yet, always `<= amount`
    pub remaining: u64,
    pub reason: String,
    pub campaign_code: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Ledger entry that credited this grant
    pub transaction_id: Option<Uuid>,
    pub granted_by: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl PromotionalGrant {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wallet_id: Uuid,
        member_auth_id: impl Into<String>,
        grant_type: GrantType,
        amount: u64,
        reason: impl Into<String>,
        granted_by: impl Into<String>,
        campaign_code: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<Self, Rejection> {
        if amount == 0 {
            return Err(Rejection::InvalidAmount);
        }

        Ok(Self {
            grant_id: Uuid::new_v4(),
            wallet_id,
            member_auth_id: member_auth_id.into(),
            grant_type,
            amount,
            remaining: amount,
            reason: reason.into(),
            campaign_code,
            expires_at,
            transaction_id: None,
            granted_by: granted_by.into(),
            metadata,
            created_at: now,
        })
    }

    /// Expiry of a new grant
    ///
    /// An explicit number of days wins. Otherwise grants that never expire get `None` and every
    /// other type gets `default_days`.
    pub fn expiry(
        grant_type: GrantType,
        expires_in_days: Option<u32>,
        default_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, Rejection> {
        let days = match expires_in_days {
            Some(days) => days,
            None if grant_type.never_expires() => return Ok(None),
            None => default_days,
        };
        Duration::try_days(days.into())
            .and_then(|offset| now.checked_add_signed(offset))
            .map(Some)
            .ok_or(Rejection::ExpiryOutOfRange { days })
    }

    /// Idempotency key of the credit produced by this grant
    pub fn credit_idempotency_key(&self) -> String {
        format!("grant-{}", self.grant_id)
    }

    /// Ledger description shown to the member
    pub fn description(&self) -> String {
        match (self.grant_type, &self.campaign_code) {
            (GrantType::Campaign, Some(code)) => format!("Promo - {code} ({} bubbles)", self.amount),
            (GrantType::Compensation, _) => {
                format!("Adjustment - credited by admin ({} bubbles)", self.amount)
            }
            (GrantType::Scholarship, _) => {
                format!("Scholarship credit - {} ({} bubbles)", self.reason, self.amount)
            }
            (GrantType::Discount, _) => {
                format!("Discount credit - {} ({} bubbles)", self.reason, self.amount)
            }
            (GrantType::WelcomeBonus, _) => format!("{} ({} bubbles)", self.reason, self.amount),
            (
                GrantType::Campaign
                | GrantType::ReferralReward
                | GrantType::LoyaltyReward
                | GrantType::AdminManual,
                _,
            ) => format!("Promo - {} ({} bubbles)", self.reason, self.amount),
        }
    }
}

//! Wallet configuration

use std::{str::FromStr, time::Duration};

use serde::Deserialize;

/// Settings injected into [`crate::commands::DomainLogic`]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Fiat currency units per bubble
    pub exchange_rate: u64,
    pub fiat_currency: String,
    pub welcome_bonus_enabled: bool,
    pub welcome_bonus_amount: u64,
    pub topup_min_bubbles: u64,
    pub topup_max_bubbles: u64,
    /// Expiry of grants that do not set one and are not exempt
    pub default_promo_expiry_days: u32,
    /// Upper bound on a single payment gateway call
    #[serde(deserialize_with = "seconds::deserialize")]
    pub gateway_timeout: Duration,
    /// Age after which unconfirmed topups are expired
    #[serde(deserialize_with = "seconds::deserialize")]
    pub topup_ttl: Duration,
    /// Recorded as `service_source` on entries created by the wallet itself
    pub service_name: String,
    /// Path the gateway sends the member back to after checkout
    pub callback_base_path: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            exchange_rate: 100,
            fiat_currency: "NGN".to_string(),
            welcome_bonus_enabled: true,
            welcome_bonus_amount: 10,
            topup_min_bubbles: 25,
            topup_max_bubbles: 5000,
            default_promo_expiry_days: 60,
            gateway_timeout: Duration::from_secs(10),
            topup_ttl: Duration::from_secs(24 * 60 * 60),
            service_name: "wallet_service".to_string(),
            callback_base_path: "/account/wallet".to_string(),
        }
    }
}

impl WalletConfig {
    /// Create config from environment variables
    ///
    /// A `.env` file is loaded first if present. Unset variables keep their default, set
    /// variables that fail to parse are an error.
    ///
    /// - `WALLET_EXCHANGE_RATE`
    /// - `WALLET_FIAT_CURRENCY`
    /// - `WALLET_WELCOME_BONUS_ENABLED`
    /// - `WALLET_WELCOME_BONUS_AMOUNT`
    /// - `WALLET_TOPUP_MIN_BUBBLES` / `WALLET_TOPUP_MAX_BUBBLES`
    /// - `WALLET_PROMO_EXPIRY_DAYS`
    /// - `WALLET_GATEWAY_TIMEOUT_SECS`
    /// - `WALLET_TOPUP_TTL_SECS`
    /// - `WALLET_SERVICE_NAME`
    /// - `WALLET_CALLBACK_BASE_PATH`
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            exchange_rate: parse(&lookup, "WALLET_EXCHANGE_RATE")?.unwrap_or(defaults.exchange_rate),
            fiat_currency: lookup("WALLET_FIAT_CURRENCY").unwrap_or(defaults.fiat_currency),
            welcome_bonus_enabled: parse(&lookup, "WALLET_WELCOME_BONUS_ENABLED")?
                .unwrap_or(defaults.welcome_bonus_enabled),
            welcome_bonus_amount: parse(&lookup, "WALLET_WELCOME_BONUS_AMOUNT")?
                .unwrap_or(defaults.welcome_bonus_amount),
            topup_min_bubbles: parse(&lookup, "WALLET_TOPUP_MIN_BUBBLES")?
                .unwrap_or(defaults.topup_min_bubbles),
            topup_max_bubbles: parse(&lookup, "WALLET_TOPUP_MAX_BUBBLES")?
                .unwrap_or(defaults.topup_max_bubbles),
            default_promo_expiry_days: parse(&lookup, "WALLET_PROMO_EXPIRY_DAYS")?
                .unwrap_or(defaults.default_promo_expiry_days),
            gateway_timeout: parse(&lookup, "WALLET_GATEWAY_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.gateway_timeout),
            topup_ttl: parse(&lookup, "WALLET_TOPUP_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.topup_ttl),
            service_name: lookup("WALLET_SERVICE_NAME").unwrap_or(defaults.service_name),
            callback_base_path: lookup("WALLET_CALLBACK_BASE_PATH")
                .unwrap_or(defaults.callback_base_path),
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange_rate == 0 {
            return Err(ConfigError::Invalid(
                "exchange rate must be positive".to_string(),
            ));
        }
        if self.topup_min_bubbles == 0 || self.topup_min_bubbles > self.topup_max_bubbles {
            return Err(ConfigError::Invalid(format!(
                "topup bounds {}..={} are not a valid range",
                self.topup_min_bubbles, self.topup_max_bubbles
            )));
        }
        Ok(())
    }
}

/// Read an optional environment variable, failing if it is set but does not parse
pub(crate) fn env_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    parse(&|key: &str| std::env::var(key).ok(), key)
}

pub(crate) fn required_env_var(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Parse {
                key,
                value: value.clone(),
            })
        })
        .transpose()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot parse {key}={value:?}")]
    Parse { key: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

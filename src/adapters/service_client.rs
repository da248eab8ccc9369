//! Authenticated HTTP client for calls to sibling services

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};

use crate::config::{env_var, required_env_var, ConfigError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceClientConfig {
    /// Base URL of the target service, without a trailing slash
    pub base_url: String,
    /// Bearer token presented to the target service
    pub token: Option<String>,
    /// Sent as `X-Caller-Service`
    pub caller: String,
    pub timeout: Duration,
}

impl ServiceClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            caller: "wallet".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Create config from environment variables
    ///
    /// - `url_key`: required base URL of the target service
    /// - `INTERNAL_SERVICE_TOKEN`: optional bearer token
    /// - `INTERNAL_CALLER_NAME`: optional caller name (default: `wallet`)
    /// - `INTERNAL_HTTP_TIMEOUT_SECS`: optional timeout in seconds (default: 10)
    pub fn from_env(url_key: &'static str) -> Result<Self, ConfigError> {
        let mut config = Self::new(required_env_var(url_key)?);
        config.token = env_var("INTERNAL_SERVICE_TOKEN")?;
        if let Some(caller) = env_var("INTERNAL_CALLER_NAME")? {
            config.caller = caller;
        }
        if let Some(secs) = env_var("INTERNAL_HTTP_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[derive(Clone, Debug)]
pub struct ServiceClient {
    client: Client,
    config: ServiceClientConfig,
}

impl ServiceClient {
    pub fn new(config: ServiceClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ServiceClientConfig {
        &self.config
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}{path}", self.config.base_url))
            .header("X-Caller-Service", &self.config.caller);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        request
    }
}

/// Status and a bounded excerpt of the body of a failed response
pub async fn failure_excerpt(response: Response) -> (StatusCode, String) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    (status, body.chars().take(200).collect())
}

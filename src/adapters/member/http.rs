use reqwest::{Method, StatusCode};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    adapters::service_client::{failure_excerpt, ServiceClient, ServiceClientConfig},
    config::ConfigError,
    ports::member::{Error, Member, MemberPort},
};

/// Member lookups against the members service
#[derive(Clone, Debug)]
pub struct HttpMemberDirectory {
    client: ServiceClient,
}

impl HttpMemberDirectory {
    pub fn new(config: ServiceClientConfig) -> Result<Self, Error> {
        let client = ServiceClient::new(config).map_err(|err| Error::Adapter(Box::new(err)))?;
        Ok(Self { client })
    }

    /// The members service URL is read from `MEMBERS_SERVICE_URL`
    pub fn config_from_env() -> Result<ServiceClientConfig, ConfigError> {
        ServiceClientConfig::from_env("MEMBERS_SERVICE_URL")
    }
}

#[derive(Debug, Deserialize)]
struct MemberResponse {
    id: Uuid,
    email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("members service answered {status}: {message}")]
struct UnexpectedStatus {
    status: StatusCode,
    message: String,
}

#[async_trait::async_trait]
impl MemberPort for HttpMemberDirectory {
    async fn get_member(&self, member_auth_id: String) -> Result<Member, Error> {
        let response = self
            .client
            .request(
                Method::GET,
                &format!("/internal/members/by-auth/{member_auth_id}"),
            )
            .send()
            .await
            .map_err(|err| Error::Adapter(Box::new(err)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::MemberDoesNotExist(member_auth_id));
        }
        if !response.status().is_success() {
            let (status, message) = failure_excerpt(response).await;
            return Err(Error::Adapter(Box::new(UnexpectedStatus { status, message })));
        }

        let body: MemberResponse = response
            .json()
            .await
            .map_err(|err| Error::Adapter(Box::new(err)))?;
        Ok(Member {
            member_id: body.id,
            member_auth_id,
            email: body.email,
        })
    }
}

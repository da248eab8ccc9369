use uuid::Uuid;

/// Membership directory, owned by the members service
#[mockall::automock]
#[async_trait::async_trait]
pub trait MemberPort: Send + Sync {
    async fn get_member(&self, member_auth_id: String) -> Result<Member, Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub member_id: Uuid,
    pub member_auth_id: String,
    pub email: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Domain-level error when a member does not exist
    #[error("member {0} does not exist")]
    MemberDoesNotExist(String),

    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}

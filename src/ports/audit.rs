use uuid::Uuid;

use crate::domain::{AuditEntry, Page};

/// Append-only store for administrative actions
#[mockall::automock]
#[async_trait::async_trait]
pub trait AuditPort: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), Error>;
    /// Entries, newest first, optionally restricted to one wallet
    async fn list_entries(&self, wallet_id: Option<Uuid>, page: Page) -> Result<Vec<AuditEntry>, Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}

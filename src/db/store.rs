use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::models::{AuthUser, StoredDocument};

/// Get-by-id / update-by-id access to persisted flow documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` when the document does not exist
    async fn load_document(&self, document_id: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// Persist the merged document, attributing the write to `actor`
    async fn save_document(&self, document: &StoredDocument, actor: &AuthUser) -> Result<(), StoreError>;
}

/// Append-only audit trail of raw mutation events
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, document_id: &str, event: Value) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AccessChecker: Send + Sync {
    async fn verify_access(&self, user: &AuthUser, document_id: &str) -> Result<bool, StoreError>;
}

use thiserror::Error;

/// Failures of the persistent-store collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Malformed stored document '{document_id}': {message}")]
    Malformed { document_id: String, message: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the distributed pub/sub transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport connection failed: {0}")]
    Connect(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscription failed: {0}")]
    Subscribe(String),
}

/// Error taxonomy of the collaboration core.
///
/// `Authentication`, `Authorization` and `Validation` are surfaced to the client as
/// error frames. Everything else is logged and turned into a generic frame or retried.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Authentication required")]
    Authentication,

    #[error("Access denied to document {document_id}")]
    Authorization { document_id: String },

    #[error("Validation error in field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Document {0} not found")]
    DocumentNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CollabError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type CollabResult<T> = Result<T, CollabError>;

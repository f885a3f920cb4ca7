use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::store::{AccessChecker, DocumentStore};
use crate::error::StoreError;
use crate::models::AuthUser;

/// Grants access when the document's workspace is one the user belongs to.
///
/// Decisions are cached per (user, document) for `ttl`.
pub struct ScopeAccessChecker {
    store: Arc<dyn DocumentStore>,
    decisions: Cache<(String, String), bool>,
}

impl ScopeAccessChecker {
    pub fn new(store: Arc<dyn DocumentStore>, ttl: Duration) -> Self {
        let decisions = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(ttl)
            .build();
        info!("Access decision cache initialized (ttl {:?})", ttl);
        Self { store, decisions }
    }
}

#[async_trait]
impl AccessChecker for ScopeAccessChecker {
    async fn verify_access(&self, user: &AuthUser, document_id: &str) -> Result<bool, StoreError> {
        let key = (user.id.clone(), document_id.to_string());
        if let Some(granted) = self.decisions.get(&key).await {
            return Ok(granted);
        }

        let granted = match self.store.load_document(document_id).await? {
            Some(doc) => user.in_scope(&doc.scope_id),
            None => false,
        };
        debug!(
            "Access check for user {} on document {}: {}",
            user.id, document_id, granted
        );

        self.decisions.insert(key, granted).await;
        Ok(granted)
    }
}

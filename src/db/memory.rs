use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::PoisonError;

use super::store::{DocumentStore, EventLog};
use crate::error::StoreError;
use crate::models::{AuthUser, StoredDocument};

/// Document store held in memory. Used for single-node dev runs and tests.
#[derive(Default)]
pub struct InMemoryStore {
    documents: DashMap<String, StoredDocument>,
    saved_by: DashMap<String, String>,
    fail_saves: AtomicBool,
    save_count: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: StoredDocument) {
        self.documents.insert(document.id.clone(), document);
    }

    pub fn delete(&self, document_id: &str) {
        self.documents.remove(document_id);
    }

    pub fn get(&self, document_id: &str) -> Option<StoredDocument> {
        self.documents.get(document_id).map(|d| d.clone())
    }

    /// Id of the user who last saved the document
    pub fn saved_by(&self, document_id: &str) -> Option<String> {
        self.saved_by.get(document_id).map(|u| u.clone())
    }

    /// Make every following save fail until switched back
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn load_document(&self, document_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.get(document_id))
    }

    async fn save_document(&self, document: &StoredDocument, actor: &AuthUser) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store rejecting writes".to_string()));
        }
        if !self.documents.contains_key(&document.id) {
            return Err(StoreError::Unavailable(format!("document {} no longer exists", document.id)));
        }
        self.documents.insert(document.id.clone(), document.clone());
        self.saved_by.insert(document.id.clone(), actor.id.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEventLog {
    events: Mutex<Vec<(String, Value)>>,
    fail_appends: AtomicBool,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, document_id: &str, event: Value) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("event log unavailable".to_string()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((document_id.to_string(), event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str) -> StoredDocument {
        StoredDocument {
            id: id.to_string(),
            scope_id: "ws-1".to_string(),
            flow_data: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn saves_only_existing_documents() {
        let store = InMemoryStore::new();
        let actor = AuthUser::new("u1", "Alice");
        assert!(store.save_document(&doc("d1"), &actor).await.is_err());

        store.insert(doc("d1"));
        store.save_document(&doc("d1"), &actor).await.unwrap();
        assert_eq!(store.saved_by("d1").as_deref(), Some("u1"));
        assert_eq!(store.save_count(), 1);

        store.fail_saves(true);
        assert!(store.save_document(&doc("d1"), &actor).await.is_err());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn event_log_appends_in_order() {
        let log = InMemoryEventLog::new();
        log.append("d1", json!({"n": 1})).await.unwrap();
        log.append("d1", json!({"n": 2})).await.unwrap();
        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1["n"], 2);

        log.fail_appends(true);
        assert!(log.append("d1", json!({})).await.is_err());
    }
}

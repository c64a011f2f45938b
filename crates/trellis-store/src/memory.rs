//! In-process document store
//!
//! Every write happens under one lock and bumps a store-wide version, so a
//! write either lands completely or not at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use trellis_common::crd::ClusterDocument;
use trellis_common::{Error, Result};

use crate::store::DocumentStore;

#[derive(Default)]
struct State {
    docs: HashMap<String, (u64, ClusterDocument)>,
    version: u64,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Document store held in memory
#[derive(Default)]
pub struct MemoryDocumentStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the backing service were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.state.lock().docs.len()
    }

    /// True when no documents are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::internal_with_context(
                "memory-store",
                "store unavailable",
            ));
        }
        Ok(())
    }
}

fn with_etag(mut doc: ClusterDocument, version: u64) -> ClusterDocument {
    doc.etag = Some(version.to_string());
    doc
}

fn check_etag(key: &str, current: u64, etag: Option<&str>) -> Result<()> {
    match etag {
        Some(etag) if etag == current.to_string() => Ok(()),
        _ => Err(Error::conflict(key)),
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.docs.contains_key(&doc.key) {
            return Err(Error::already_exists(&doc.key));
        }
        let version = state.bump();
        let doc = with_etag(doc, version);
        state.docs.insert(doc.key.clone(), (version, doc.clone()));
        Ok(doc)
    }

    async fn get(&self, key: &str) -> Result<ClusterDocument> {
        self.check_available()?;
        self.state
            .lock()
            .docs
            .get(key)
            .map(|(version, doc)| with_etag(doc.clone(), *version))
            .ok_or_else(|| Error::not_found("ClusterDocument", key))
    }

    async fn list(&self) -> Result<Vec<ClusterDocument>> {
        self.check_available()?;
        let mut docs: Vec<_> = self
            .state
            .lock()
            .docs
            .values()
            .map(|(version, doc)| with_etag(doc.clone(), *version))
            .collect();
        docs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(docs)
    }

    async fn replace(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
        self.check_available()?;
        let mut state = self.state.lock();
        let current = match state.docs.get(&doc.key) {
            Some((version, _)) => *version,
            None => return Err(Error::not_found("ClusterDocument", &doc.key)),
        };
        check_etag(&doc.key, current, doc.etag.as_deref())?;

        let version = state.bump();
        let doc = with_etag(doc, version);
        state.docs.insert(doc.key.clone(), (version, doc.clone()));
        Ok(doc)
    }

    async fn delete(&self, doc: &ClusterDocument) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let current = match state.docs.get(&doc.key) {
            Some((version, _)) => *version,
            None => return Err(Error::not_found("ClusterDocument", &doc.key)),
        };
        check_etag(&doc.key, current, doc.etag.as_deref())?;
        state.docs.remove(&doc.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis_common::crd::ProvisioningState;
    use trellis_common::retry::RetryConfig;

    use crate::store::patch_with_retry;

    async fn seeded(id: &str) -> (MemoryDocumentStore, ClusterDocument) {
        let store = MemoryDocumentStore::new();
        let doc = store.create(ClusterDocument::new(id)).await.unwrap();
        (store, doc)
    }

    #[tokio::test]
    async fn patch_applies_mutation_and_advances_token() {
        let (store, original) = seeded("A").await;

        let patched = store
            .patch("a", &|doc| {
                doc.properties.provisioning_state = ProvisioningState::Deleting;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(
            patched.properties.provisioning_state,
            ProvisioningState::Deleting
        );
        assert_ne!(patched.etag, original.etag);
        assert_eq!(store.get("a").await.unwrap(), patched);
    }

    #[tokio::test]
    async fn stale_write_is_a_conflict() {
        let (store, stale) = seeded("a").await;
        store
            .patch("a", &|doc| {
                doc.dequeues += 1;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.replace(stale.clone()).await.unwrap_err();
        assert!(err.is_conflict());
        let err = store.delete(&stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("a").await.unwrap().dequeues, 1);
    }

    #[tokio::test]
    async fn patch_of_removed_document_is_not_found() {
        let (store, doc) = seeded("a").await;
        store.delete(&doc).await.unwrap();

        let err = store.patch("a", &|_| Ok(())).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_mutation_writes_nothing() {
        let (store, doc) = seeded("a").await;

        let err = store
            .patch("a", &|doc| {
                doc.dequeues = 99;
                Err(Error::protocol_violation("refused"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert_eq!(store.get("a").await.unwrap(), doc);
    }

    #[tokio::test]
    async fn mutation_may_not_change_the_key() {
        let (store, _) = seeded("a").await;
        let err = store
            .patch("a", &|doc| {
                doc.key = "b".to_string();
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (store, _) = seeded("a").await;
        let err = store.create(ClusterDocument::new("A")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    /// Story: concurrent increments through the retried patch never lose an update
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_patches_are_all_applied() {
        let (store, _) = seeded("a").await;
        let store = Arc::new(store);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let config = RetryConfig {
                        max_attempts: 0,
                        ..RetryConfig::conflicts()
                    };
                    patch_with_retry(store.as_ref(), &config, "a", &|doc| {
                        doc.dequeues += 1;
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }
        assert_eq!(store.get("a").await.unwrap().dequeues, 16);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let (store, _) = seeded("a").await;
        store.set_unavailable(true);
        assert!(store.get("a").await.is_err());
        assert!(store.list().await.is_err());
        store.set_unavailable(false);
        assert!(store.get("a").await.is_ok());
    }
}

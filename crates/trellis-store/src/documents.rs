//! Leases over cluster documents
//!
//! A worker may drive a document only while it holds that document's lease.
//! Leases live inside the document itself and are taken with the same
//! conditional write as every other change: two dispatchers that read the
//! same unleased document race on one replace, and exactly one wins.
//!
//! Every write made through [`ClusterDocuments`] re-checks that the caller
//! still owns an unexpired lease, so a worker whose lease was taken over
//! after expiry cannot clobber the new holder.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use trellis_common::crd::{ClusterDocument, Lease};
use trellis_common::retry::RetryConfig;
use trellis_common::{Error, Result};

use crate::store::{patch_with_retry, retry_on_conflict, DocumentStore, Mutation};

/// Default lease lifetime
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Lease-aware access to cluster documents for one dispatcher identity
#[derive(Clone)]
pub struct ClusterDocuments {
    store: Arc<dyn DocumentStore>,
    owner: String,
    lease_duration: Duration,
    retry: RetryConfig,
}

impl ClusterDocuments {
    /// Wrap `store` for the dispatcher identified by `owner`
    pub fn new(store: Arc<dyn DocumentStore>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            retry: RetryConfig::conflicts(),
        }
    }

    /// Override the lease lifetime
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Override the conflict retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Identity written into leases
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Lease lifetime
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Insert a new document
    pub async fn create(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
        self.store.create(doc).await
    }

    /// Read a document without taking a lease
    pub async fn get(&self, key: &str) -> Result<ClusterDocument> {
        self.store.get(key).await
    }

    /// Lease one document with pending work.
    ///
    /// Candidates are tried least-dequeued first. Losing the race for one
    /// candidate moves on to the next; `Ok(None)` means nothing was leased.
    pub async fn dequeue(&self) -> Result<Option<ClusterDocument>> {
        let now = Utc::now();
        let mut candidates: Vec<_> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|doc| doc.is_leaseable(now))
            .collect();
        candidates.sort_by(|a, b| a.dequeues.cmp(&b.dequeues).then_with(|| a.key.cmp(&b.key)));

        for mut doc in candidates {
            let key = doc.key.clone();
            doc.lease = Some(Lease {
                owner: self.owner.clone(),
                expires: after(now, self.lease_duration),
            });
            doc.not_before = None;
            doc.dequeues += 1;

            match self.store.replace(doc).await {
                Ok(leased) => {
                    info!(
                        cluster = %key,
                        owner = %self.owner,
                        dequeues = leased.dequeues,
                        state = %leased.properties.provisioning_state,
                        "leased cluster document"
                    );
                    return Ok(Some(leased));
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(cluster = %key, owner = %self.owner, "lost lease race");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Extend the caller's lease; `LeaseLost` if it no longer holds it
    pub async fn renew_lease(&self, key: &str) -> Result<ClusterDocument> {
        let lease_duration = self.lease_duration;
        let owner = self.owner.clone();
        self.patch_with_lease(key, &move |doc| {
            if let Some(lease) = doc.lease.as_mut() {
                lease.expires = after(Utc::now(), lease_duration);
            }
            debug!(cluster = %doc.key, owner = %owner, "renewed lease");
            Ok(())
        })
        .await
    }

    /// Patch a document the caller holds the lease on.
    ///
    /// Conflicts are retried against a fresh read; the lease is re-checked
    /// on every attempt.
    pub async fn patch_with_lease(
        &self,
        key: &str,
        mutate: Mutation<'_>,
    ) -> Result<ClusterDocument> {
        let owner = self.owner.as_str();
        let guarded = move |doc: &mut ClusterDocument| {
            if !doc.is_leased_by(owner, Utc::now()) {
                return Err(Error::lease_lost(&doc.key, owner));
            }
            mutate(doc)
        };
        patch_with_retry(self.store.as_ref(), &self.retry, key, &guarded).await
    }

    /// Apply the cycle's outcome and give the lease up in one write
    pub async fn end_lease(&self, key: &str, mutate: Mutation<'_>) -> Result<ClusterDocument> {
        self.patch_with_lease(key, &|doc| {
            mutate(doc)?;
            doc.lease = None;
            Ok(())
        })
        .await
    }

    /// Give the lease up without further changes
    pub async fn release_lease(&self, key: &str) -> Result<ClusterDocument> {
        self.end_lease(key, &|_| Ok(())).await
    }

    /// Give the lease up and keep the document from being leased before `not_before`
    pub async fn release_lease_until(
        &self,
        key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<ClusterDocument> {
        self.end_lease(key, &move |doc| {
            doc.not_before = Some(not_before);
            Ok(())
        })
        .await
    }

    /// Remove a document the caller holds the lease on
    pub async fn delete(&self, key: &str) -> Result<()> {
        let owner = self.owner.as_str();
        retry_on_conflict(&self.retry, "delete", || async move {
            let doc = self.store.get(key).await?;
            if !doc.is_leased_by(owner, Utc::now()) {
                return Err(Error::lease_lost(key, owner));
            }
            self.store.delete(&doc).await
        })
        .await?;
        info!(cluster = %key, owner = %self.owner, "deleted cluster document");
        Ok(())
    }
}

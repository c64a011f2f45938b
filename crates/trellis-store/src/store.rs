//! The document store contract
//!
//! Every write is conditional on the concurrency token the writer read. A
//! lost race surfaces as `Error::ConcurrencyConflict`; retrying is the
//! caller's decision and lives in [`retry_on_conflict`].

use std::future::Future;

use async_trait::async_trait;

use trellis_common::crd::ClusterDocument;
use trellis_common::retry::{retry_if, RetryConfig};
use trellis_common::{Error, Result};

/// Pure mutation applied to a freshly read document.
///
/// Returning an error aborts the write and hands the error to the caller.
pub type Mutation<'a> = &'a (dyn Fn(&mut ClusterDocument) -> Result<()> + Send + Sync);

/// Key-value persistence for cluster documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document; `AlreadyExists` if the key is taken
    async fn create(&self, doc: ClusterDocument) -> Result<ClusterDocument>;

    /// Read a document and its current concurrency token
    async fn get(&self, key: &str) -> Result<ClusterDocument>;

    /// Read every document
    async fn list(&self) -> Result<Vec<ClusterDocument>>;

    /// Overwrite a document if its token still matches `doc.etag`
    async fn replace(&self, doc: ClusterDocument) -> Result<ClusterDocument>;

    /// Remove a document if its token still matches `doc.etag`
    async fn delete(&self, doc: &ClusterDocument) -> Result<()>;

    /// Read, mutate and conditionally write one document.
    ///
    /// Fails with `ConcurrencyConflict` when another writer got there first
    /// and `NotFound` when the document has been removed.
    async fn patch(&self, key: &str, mutate: Mutation<'_>) -> Result<ClusterDocument> {
        let mut doc = self.get(key).await?;
        mutate(&mut doc)?;
        if doc.key != key {
            return Err(Error::validation_for_field(
                "key",
                format!("mutation changed document key {key} to {}", doc.key),
            ));
        }
        self.replace(doc).await
    }
}

/// Run `operation` again whenever it loses an optimistic-concurrency race.
///
/// Each attempt must re-read the document; any other error is returned as is.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(config, operation_name, Error::is_conflict, operation).await
}

/// [`DocumentStore::patch`] retried on conflict
pub async fn patch_with_retry(
    store: &dyn DocumentStore,
    config: &RetryConfig,
    key: &str,
    mutate: Mutation<'_>,
) -> Result<ClusterDocument> {
    retry_on_conflict(config, "patch", || store.patch(key, mutate)).await
}

//! Document store backed by `ClusterRecord` custom resources
//!
//! `metadata.resourceVersion` is the concurrency token: the API server
//! rejects a replace or delete carrying a stale version with 409.

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Api, Client};
use tracing::debug;

use trellis_common::crd::{ClusterDocument, ClusterRecord, ClusterRecordSpec};
use trellis_common::kube_utils::deterministic_hash;
use trellis_common::{Error, Result};

use crate::store::DocumentStore;

/// Object name for the record holding `key`
pub fn record_name(key: &str) -> String {
    format!("cluster-{}", deterministic_hash(key, 16))
}

/// Document store persisting into a namespace of the Kubernetes API
#[derive(Clone)]
pub struct KubeDocumentStore {
    api: Api<ClusterRecord>,
}

impl KubeDocumentStore {
    /// Store documents as records in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn to_record(doc: ClusterDocument) -> ClusterRecord {
        let name = record_name(&doc.key);
        let etag = doc.etag.clone();
        let mut record = ClusterRecord::new(&name, ClusterRecordSpec { document: doc });
        record.metadata.resource_version = etag;
        record
    }

    fn from_record(record: ClusterRecord) -> ClusterDocument {
        let mut doc = record.spec.document;
        doc.etag = record.metadata.resource_version;
        doc
    }
}

/// Translate API status codes into the store's error taxonomy
fn map_error(key: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(key)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(key),
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found("ClusterDocument", key),
        _ => Error::from(err),
    }
}

#[async_trait]
impl DocumentStore for KubeDocumentStore {
    async fn create(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
        let key = doc.key.clone();
        let mut record = Self::to_record(doc);
        record.metadata.resource_version = None;
        let created = self
            .api
            .create(&PostParams::default(), &record)
            .await
            .map_err(|e| map_error(&key, e))?;
        debug!(key = %key, "created cluster record");
        Ok(Self::from_record(created))
    }

    async fn get(&self, key: &str) -> Result<ClusterDocument> {
        match self.api.get_opt(&record_name(key)).await? {
            Some(record) => Ok(Self::from_record(record)),
            None => Err(Error::not_found("ClusterDocument", key)),
        }
    }

    async fn list(&self) -> Result<Vec<ClusterDocument>> {
        let records = self.api.list(&ListParams::default()).await?;
        Ok(records.items.into_iter().map(Self::from_record).collect())
    }

    async fn replace(&self, doc: ClusterDocument) -> Result<ClusterDocument> {
        let key = doc.key.clone();
        if doc.etag.is_none() {
            return Err(Error::conflict(&key));
        }
        let record = Self::to_record(doc);
        let replaced = self
            .api
            .replace(&record_name(&key), &PostParams::default(), &record)
            .await
            .map_err(|e| map_error(&key, e))?;
        Ok(Self::from_record(replaced))
    }

    async fn delete(&self, doc: &ClusterDocument) -> Result<()> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: doc.etag.clone(),
                uid: None,
            }),
            ..Default::default()
        };
        self.api
            .delete(&record_name(&doc.key), &params)
            .await
            .map_err(|e| map_error(&doc.key, e))?;
        debug!(key = %doc.key, "deleted cluster record");
        Ok(())
    }
}

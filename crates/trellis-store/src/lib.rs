//! Cluster document persistence for Trellis
//!
//! - [`DocumentStore`]: conditional read-modify-write over documents
//! - [`MemoryDocumentStore`] and [`KubeDocumentStore`]: the two backends
//! - [`ClusterDocuments`]: leases and lease-checked writes for workers

#![deny(missing_docs)]

mod documents;
mod kube_store;
mod memory;
mod store;

pub use documents::{ClusterDocuments, DEFAULT_LEASE_DURATION};
pub use kube_store::{record_name, KubeDocumentStore};
pub use memory::MemoryDocumentStore;
pub use store::{patch_with_retry, retry_on_conflict, DocumentStore, Mutation};

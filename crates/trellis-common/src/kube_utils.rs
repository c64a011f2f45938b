//! Small helpers shared by the Kubernetes-backed components

use std::fmt::Write;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use crate::crd::{Cluster, ClusterRecord};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "trellis-controller";

/// Hex SHA-256 of `input`, truncated to `bytes` bytes.
///
/// Stable across toolchains, so safe to persist in object names.
pub fn deterministic_hash(input: &str, bytes: usize) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    let len = bytes.min(hash.as_ref().len());
    hash.as_ref()[..len]
        .iter()
        .fold(String::with_capacity(len * 2), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// CRDs owned and installed by Trellis
pub fn owned_crds() -> Vec<CustomResourceDefinition> {
    vec![Cluster::crd(), ClusterRecord::crd()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_truncated() {
        let a = deterministic_hash("/subscriptions/abc/clusters/prod", 16);
        assert_eq!(a.len(), 32);
        assert_eq!(a, deterministic_hash("/subscriptions/abc/clusters/prod", 16));
        assert_ne!(a, deterministic_hash("/subscriptions/abc/clusters/dev", 16));
        assert_eq!(deterministic_hash("x", 64).len(), 64);
    }

    #[test]
    fn owned_crds_are_trellis_group() {
        let names: Vec<_> = owned_crds()
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect();
        assert_eq!(names, vec!["clusters.trellis.dev", "clusterrecords.trellis.dev"]);
    }
}

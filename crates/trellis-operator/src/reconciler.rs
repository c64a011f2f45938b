//! Reconciler loop driver
//!
//! Every in-cluster controller follows the same steps: read the cluster
//! singleton, check its feature flag, resolve the object the request names,
//! run finalization if that object is being deleted, and otherwise bring
//! child resources to the desired state. [`ChildReconciler`] supplies the
//! controller-specific pieces and [`reconcile`] runs the steps.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use tracing::{debug, info, instrument};

use trellis_common::crd::Cluster;
use trellis_common::{Error, Result};

use crate::clients::ClusterClient;

/// What the runtime should do after a reconcile
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Nothing to do until the watched objects change
    Done,
    /// Run again after the delay
    RetryAfter(Duration),
    /// Reconcile failed; the runtime requeues with its error policy
    Failed(Error),
}

impl ReconcileOutcome {
    /// Convert to the form kube's controller runtime expects
    pub fn into_action(self) -> Result<Action> {
        match self {
            ReconcileOutcome::Done => Ok(Action::await_change()),
            ReconcileOutcome::RetryAfter(delay) => Ok(Action::requeue(delay)),
            ReconcileOutcome::Failed(e) => Err(e),
        }
    }

    /// Classify an error, turning provider throttling into a requeue
    pub fn from_error(error: Error) -> Self {
        match error.rate_limit_delay() {
            Some(delay) => ReconcileOutcome::RetryAfter(delay),
            None => ReconcileOutcome::Failed(error),
        }
    }
}

/// Derived parameters of the last successful reconcile
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot<P> {
    /// Parameters the children were last brought to
    pub params: P,
    /// When that reconcile finished
    pub completed_at: Option<DateTime<Utc>>,
}

/// Controller-specific steps run by [`reconcile`]
#[async_trait]
pub trait ChildReconciler: Send + Sync {
    /// Object the request resolves to
    type Target: Send + Sync;
    /// Desired state of the children, compared against the last snapshot
    type Params: PartialEq + Debug + Send + Sync;

    /// Controller name used in logs and finalizers
    fn name(&self) -> &'static str;

    /// Operator flag that must be `true` for the controller to act
    fn flag(&self) -> &'static str;

    /// Finalizer this controller keeps on its target, if any
    fn finalizer(&self) -> Option<&'static str> {
        None
    }

    /// Minimum time between two reconciles that reach the provider
    fn min_interval(&self) -> Option<Duration> {
        None
    }

    /// Look up the target named by `request`; `None` when it is gone
    async fn resolve(&self, cluster: &Cluster, request: &str) -> Result<Option<Self::Target>>;

    /// Object metadata used for deletion and finalizer checks
    fn metadata<'a>(&self, _target: &'a Self::Target) -> Option<&'a ObjectMeta> {
        None
    }

    /// Clean up children of a target being deleted; must tolerate repeats
    async fn finalize(&self, _target: &Self::Target) -> Result<()> {
        Ok(())
    }

    /// Persist the target with the finalizer added
    async fn add_finalizer(&self, _target: &Self::Target) -> Result<()> {
        Ok(())
    }

    /// Persist the target with the finalizer removed
    async fn remove_finalizer(&self, _target: &Self::Target) -> Result<()> {
        Ok(())
    }

    /// Snapshot of the last successful reconcile
    fn snapshot(&self, _cluster: &Cluster, _target: &Self::Target) -> Option<Snapshot<Self::Params>> {
        None
    }

    /// Compute the desired parameters
    async fn desired(&self, cluster: &Cluster, target: &Self::Target) -> Result<Self::Params>;

    /// Bring the children to `params`
    async fn ensure(&self, cluster: &Cluster, target: &Self::Target, params: &Self::Params)
        -> Result<()>;

    /// Persist `params` as the new snapshot
    async fn record(
        &self,
        _cluster: &Cluster,
        _target: &Self::Target,
        _params: Self::Params,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }
}

/// True when `meta` lists `finalizer`
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Run one reconcile of `request` through `reconciler`
#[instrument(skip(reconciler, clusters, now), fields(controller = reconciler.name()))]
pub async fn reconcile<R>(
    reconciler: &R,
    clusters: &dyn ClusterClient,
    request: &str,
    now: DateTime<Utc>,
) -> ReconcileOutcome
where
    R: ChildReconciler + ?Sized,
{
    match drive(reconciler, clusters, request, now).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let outcome = ReconcileOutcome::from_error(e);
            if let ReconcileOutcome::RetryAfter(delay) = &outcome {
                info!(retry_after_secs = delay.as_secs(), "provider throttled reconcile");
            }
            outcome
        }
    }
}

async fn drive<R>(
    reconciler: &R,
    clusters: &dyn ClusterClient,
    request: &str,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome>
where
    R: ChildReconciler + ?Sized,
{
    let cluster = clusters.get_cluster().await?;

    if !cluster.spec.flag_enabled(reconciler.flag()) {
        debug!("controller is disabled");
        return Ok(ReconcileOutcome::Done);
    }

    let Some(target) = reconciler.resolve(&cluster, request).await? else {
        debug!("target not found");
        return Ok(ReconcileOutcome::Done);
    };

    let finalized_meta = reconciler
        .finalizer()
        .and_then(|finalizer| reconciler.metadata(&target).map(|meta| (finalizer, meta)));

    if let Some((finalizer, meta)) = finalized_meta {
        if meta.deletion_timestamp.is_some() {
            if !has_finalizer(meta, finalizer) {
                return Ok(ReconcileOutcome::Done);
            }
            reconciler.finalize(&target).await?;
            reconciler.remove_finalizer(&target).await?;
            info!("finalized");
            return Ok(ReconcileOutcome::Done);
        }
    }

    let snapshot = reconciler.snapshot(&cluster, &target);

    if let Some(interval) = reconciler.min_interval() {
        if let Some(completed_at) = snapshot.as_ref().and_then(|s| s.completed_at) {
            let elapsed = (now - completed_at).to_std().unwrap_or_default();
            if elapsed < interval {
                let remaining = interval - elapsed;
                debug!(remaining_secs = remaining.as_secs(), "within minimum interval");
                return Ok(ReconcileOutcome::RetryAfter(remaining));
            }
        }
    }

    let params = reconciler.desired(&cluster, &target).await?;

    if snapshot.is_some_and(|s| s.params == params) {
        debug!("parameters unchanged since last reconcile");
    } else {
        reconciler.ensure(&cluster, &target, &params).await?;
        reconciler.record(&cluster, &target, params, now).await?;
    }

    if let Some((finalizer, meta)) = finalized_meta {
        if !has_finalizer(meta, finalizer) {
            reconciler.add_finalizer(&target).await?;
        }
    }

    Ok(ReconcileOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use trellis_common::crd::ClusterSpec;

    use crate::clients::MockClusterClient;

    const FLAG: &str = "trellis.test.enabled";

    fn cluster(enabled: bool) -> Cluster {
        let mut spec = ClusterSpec::default();
        spec.operator_flags
            .insert(FLAG.to_string(), enabled.to_string());
        Cluster::new("cluster", spec)
    }

    fn clusters(enabled: bool) -> MockClusterClient {
        let mut clusters = MockClusterClient::new();
        clusters
            .expect_get_cluster()
            .returning(move || Ok(cluster(enabled)));
        clusters
    }

    /// Reconciler over a plain counter, with an optional fixed snapshot
    #[derive(Default)]
    struct Counter {
        ensured: AtomicUsize,
        snapshot: Option<Snapshot<u32>>,
        desired: u32,
        fail_with: Option<fn() -> Error>,
    }

    #[async_trait]
    impl ChildReconciler for Counter {
        type Target = ();
        type Params = u32;

        fn name(&self) -> &'static str {
            "Counter"
        }

        fn flag(&self) -> &'static str {
            FLAG
        }

        fn min_interval(&self) -> Option<Duration> {
            Some(Duration::from_secs(60))
        }

        async fn resolve(&self, _cluster: &Cluster, _request: &str) -> Result<Option<()>> {
            Ok(Some(()))
        }

        fn snapshot(&self, _cluster: &Cluster, _target: &()) -> Option<Snapshot<u32>> {
            self.snapshot.clone()
        }

        async fn desired(&self, _cluster: &Cluster, _target: &()) -> Result<u32> {
            Ok(self.desired)
        }

        async fn ensure(&self, _cluster: &Cluster, _target: &(), _params: &u32) -> Result<()> {
            self.ensured.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    // ==========================================================================
    // Outcome conversion
    // ==========================================================================

    #[test]
    fn outcomes_map_to_actions() {
        assert_eq!(
            ReconcileOutcome::Done.into_action().unwrap(),
            Action::await_change()
        );
        assert_eq!(
            ReconcileOutcome::RetryAfter(Duration::from_secs(7))
                .into_action()
                .unwrap(),
            Action::requeue(Duration::from_secs(7))
        );
        assert!(ReconcileOutcome::Failed(Error::internal("boom"))
            .into_action()
            .is_err());
    }

    #[test]
    fn throttling_becomes_retry_after() {
        let throttled = Error::provider_response(429, Some("30".to_string()), "slow down");
        assert!(matches!(
            ReconcileOutcome::from_error(throttled),
            ReconcileOutcome::RetryAfter(d) if d == Duration::from_secs(30)
        ));

        let unparseable = Error::provider_response(429, Some("soon".to_string()), "slow down");
        assert!(matches!(
            ReconcileOutcome::from_error(unparseable),
            ReconcileOutcome::Failed(_)
        ));

        let immediate = Error::provider_response(429, Some("0".to_string()), "slow down");
        assert!(matches!(
            ReconcileOutcome::from_error(immediate),
            ReconcileOutcome::RetryAfter(d) if d == Duration::from_secs(1)
        ));
    }

    // ==========================================================================
    // Driver steps
    // ==========================================================================

    #[tokio::test]
    async fn missing_singleton_fails_with_not_found() {
        let mut clusters = MockClusterClient::new();
        clusters
            .expect_get_cluster()
            .returning(|| Err(Error::not_found("Cluster", "cluster")));
        let counter = Counter::default();

        let outcome = reconcile(&counter, &clusters, "cluster", Utc::now()).await;

        match outcome {
            ReconcileOutcome::Failed(e) => assert!(e.is_not_found()),
            other => panic!("expected Failed(NotFound), got {other:?}"),
        }
        assert_eq!(counter.ensured.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_flag_does_nothing() {
        let counter = Counter::default();
        let outcome = reconcile(&counter, &clusters(false), "cluster", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
        assert_eq!(counter.ensured.load(Ordering::SeqCst), 0);
    }

    /// Story: parameters equal to the snapshot skip the ensure call
    #[tokio::test]
    async fn unchanged_parameters_skip_ensure() {
        let now = Utc::now();
        let counter = Counter {
            desired: 3,
            snapshot: Some(Snapshot {
                params: 3,
                completed_at: Some(now - chrono::Duration::hours(2)),
            }),
            ..Default::default()
        };

        let outcome = reconcile(&counter, &clusters(true), "cluster", now).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
        assert_eq!(counter.ensured.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recent_completion_requeues_for_the_remainder() {
        let now = Utc::now();
        let counter = Counter {
            desired: 4,
            snapshot: Some(Snapshot {
                params: 3,
                completed_at: Some(now - chrono::Duration::seconds(20)),
            }),
            ..Default::default()
        };

        let outcome = reconcile(&counter, &clusters(true), "cluster", now).await;
        match outcome {
            ReconcileOutcome::RetryAfter(d) => assert_eq!(d, Duration::from_secs(40)),
            other => panic!("expected RetryAfter, got {other:?}"),
        }
        assert_eq!(counter.ensured.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limited_ensure_requeues_instead_of_failing() {
        let counter = Counter {
            desired: 1,
            fail_with: Some(|| Error::provider_response(429, Some("30".to_string()), "throttled")),
            ..Default::default()
        };

        let outcome = reconcile(&counter, &clusters(true), "cluster", Utc::now()).await;
        match outcome {
            ReconcileOutcome::RetryAfter(d) => assert_eq!(d, Duration::from_secs(30)),
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }

    #[test]
    fn finalizer_lookup() {
        let meta = ObjectMeta {
            finalizers: Some(vec!["a".to_string(), "b".to_string()]),
            ..Default::default()
        };
        assert!(has_finalizer(&meta, "b"));
        assert!(!has_finalizer(&meta, "c"));
        assert!(!has_finalizer(&ObjectMeta::default(), "a"));
    }
}

//! Worker dispatch loop
//!
//! Each [`Backend`] leases documents out of the shared store and runs one
//! worker task per leased document. Any number of backends may share a
//! store; the conditional lease write keeps each document to one worker.
//!
//! A worker renews its lease on a heartbeat while the cycle runs. If renewal
//! finds the lease gone, or keeps failing until the last renewed expiry has
//! passed, the cycle is cancelled before it can write anything.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::{AbortOnDropHandle, TaskTracker};
use tracing::{debug, error, info, warn, Instrument};

use trellis_common::crd::ClusterDocument;
use trellis_common::metrics::{dims, topics, Dimensions, MetricsEmitter};
use trellis_common::{Error, Result};
use trellis_store::{ClusterDocuments, DocumentStore};

use crate::config::BackendConfig;
use crate::manager::ManagerFactory;
use crate::provisioning::{run_cycle, CycleOutcome, CycleSettings};

/// Dispatcher leasing cluster documents to workers
pub struct Backend {
    documents: ClusterDocuments,
    factory: Arc<dyn ManagerFactory>,
    metrics: Arc<dyn MetricsEmitter>,
    config: BackendConfig,
    active: Arc<AtomicUsize>,
    workers: TaskTracker,
    waiting: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Backend {
    /// Create a dispatcher over `store`
    pub fn new(
        store: Arc<dyn DocumentStore>,
        factory: Arc<dyn ManagerFactory>,
        metrics: Arc<dyn MetricsEmitter>,
        config: BackendConfig,
    ) -> Result<Self> {
        config.validate()?;
        let documents = ClusterDocuments::new(store, config.identity.clone())
            .with_lease_duration(config.lease_duration)
            .with_retry(config.conflict_retry.clone());
        Ok(Self {
            documents,
            factory,
            metrics,
            config,
            active: Arc::new(AtomicUsize::new(0)),
            workers: TaskTracker::new(),
            waiting: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Identity this dispatcher writes into leases
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Number of workers currently running
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Lease one document and start a worker for it.
    ///
    /// Returns `Ok(false)` when every worker slot is busy or no document is
    /// leaseable. Errors are store plumbing failures only; what happens to
    /// the document is recorded by the worker.
    pub async fn try_dispatch(&self) -> Result<bool> {
        if !self.reserve_slot() {
            debug!(max_workers = self.config.max_workers, "worker pool saturated");
            return Ok(false);
        }

        let doc = match self.documents.dequeue().await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                self.release_slot();
                return Ok(false);
            }
            Err(e) => {
                self.release_slot();
                return Err(e);
            }
        };

        let worker = Worker {
            documents: self.documents.clone(),
            factory: self.factory.clone(),
            metrics: self.metrics.clone(),
            settings: CycleSettings::from(&self.config),
            heartbeat_interval: self.config.heartbeat_interval,
        };
        let slot = SlotGuard {
            active: self.active.clone(),
            metrics: self.metrics.clone(),
        };
        let span = tracing::info_span!("worker", cluster = %doc.key);

        self.workers.spawn(
            async move {
                let _slot = slot;
                worker.run(doc).await;
            }
            .instrument(span),
        );

        Ok(true)
    }

    /// Dispatch until [`stop`](Self::stop) is called.
    ///
    /// Plumbing errors are logged and retried after the poll interval.
    pub async fn run(&self) {
        info!(
            identity = %self.config.identity,
            max_workers = self.config.max_workers,
            "backend dispatcher started"
        );

        while !self.shutdown.is_cancelled() {
            let idle = match self.try_dispatch().await {
                Ok(true) => false,
                Ok(false) => true,
                Err(e) => {
                    error!(error = %e, "dispatch failed");
                    self.metrics.emit_gauge(
                        topics::DISPATCH_ERRORS,
                        1,
                        &dims([("retryable", if e.is_retryable() { "true" } else { "false" })]),
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(identity = %self.config.identity, "backend dispatcher stopped");
    }

    /// Stop the dispatch loop; running workers are left to finish
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Block until every worker started so far has finished.
    ///
    /// Concurrent callers are served one at a time. Workers dispatched while
    /// a caller waits are waited for as well.
    pub async fn wait_for_workers(&self) {
        let _waiting = self.waiting.lock().await;
        self.workers.close();
        self.workers.wait().await;
        self.workers.reopen();
    }

    fn reserve_slot(&self) -> bool {
        let max = self.config.max_workers;
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1));
        match reserved {
            Ok(previous) => {
                self.metrics
                    .emit_gauge(topics::WORKERS_ACTIVE, (previous + 1) as i64, &Dimensions::new());
                true
            }
            Err(_) => false,
        }
    }

    fn release_slot(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker slot held for the life of a spawned worker, returned even if it panics
struct SlotGuard {
    active: Arc<AtomicUsize>,
    metrics: Arc<dyn MetricsEmitter>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics
            .emit_gauge(topics::WORKERS_ACTIVE, remaining as i64, &Dimensions::new());
    }
}

/// Everything one worker task needs, detached from the dispatcher
struct Worker {
    documents: ClusterDocuments,
    factory: Arc<dyn ManagerFactory>,
    metrics: Arc<dyn MetricsEmitter>,
    settings: CycleSettings,
    heartbeat_interval: Duration,
}

impl Worker {
    async fn run(self, doc: ClusterDocument) {
        let state = doc.properties.provisioning_state.to_string();
        let started = Instant::now();

        let (result, panicked) = match AssertUnwindSafe(self.drive(&doc)).catch_unwind().await {
            Ok(result) => (result, false),
            Err(_) => {
                if let Err(release) = self.documents.release_lease(&doc.key).await {
                    warn!(error = %release, "failed to release lease after panic");
                }
                let e = Error::internal_with_context("worker", "resource manager panicked");
                (Err(e), true)
            }
        };

        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) if panicked => "panicked",
            Err(Error::LeaseLost { .. }) => "lease_lost",
            Err(_) => "error",
        };
        match &result {
            Ok(_) => {}
            Err(e @ Error::LeaseLost { .. }) => warn!(error = %e, "worker lost its lease"),
            Err(e) => error!(error = %e, state = %state, "worker failed"),
        }

        let dims = dims([("state", state.as_str()), ("outcome", outcome)]);
        self.metrics.emit_float(
            topics::CYCLE_DURATION,
            started.elapsed().as_secs_f64(),
            &dims,
        );
        self.metrics.emit_gauge(topics::CYCLE_RESULT, 1, &dims);
    }

    async fn drive(&self, doc: &ClusterDocument) -> Result<CycleOutcome> {
        let manager = match self.factory.new_manager(doc, self.documents.clone()) {
            Ok(manager) => manager,
            Err(e) => {
                if let Err(release) = self.documents.release_lease(&doc.key).await {
                    warn!(error = %release, "failed to release lease");
                }
                return Err(e);
            }
        };

        let lost = CancellationToken::new();
        let expires = doc
            .lease
            .as_ref()
            .map(|lease| lease.expires)
            .unwrap_or_else(Utc::now);
        // Dropped on every exit path, including a panicking manager
        let _heartbeat = AbortOnDropHandle::new(tokio::spawn(
            heartbeat(
                self.documents.clone(),
                doc.key.clone(),
                self.heartbeat_interval,
                expires,
                lost.clone(),
            )
            .in_current_span(),
        ));

        tokio::select! {
            result = run_cycle(&self.documents, manager.as_ref(), doc, &self.settings) => result,
            _ = lost.cancelled() => Err(Error::lease_lost(&doc.key, self.documents.owner())),
        }
    }
}

/// Renew the lease on `key` until aborted.
///
/// Cancels `lost` when the lease is taken away, or when renewals keep failing
/// until the last renewed expiry has passed; past that point another
/// dispatcher may hold the document.
async fn heartbeat(
    documents: ClusterDocuments,
    key: String,
    interval: Duration,
    mut expires: DateTime<Utc>,
    lost: CancellationToken,
) {
    loop {
        let until_expiry = (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(interval.min(until_expiry)).await;
        match documents.renew_lease(&key).await {
            Ok(doc) => {
                if let Some(lease) = doc.lease {
                    expires = lease.expires;
                }
            }
            Err(e @ Error::LeaseLost { .. }) => {
                warn!(error = %e, "lease renewal refused");
                lost.cancel();
                return;
            }
            Err(e) if e.is_not_found() => return,
            Err(e) if Utc::now() >= expires => {
                warn!(error = %e, %expires, "lease expired while renewals were failing");
                lost.cancel();
                return;
            }
            Err(e) => warn!(error = %e, "lease renewal failed, will retry"),
        }
    }
}

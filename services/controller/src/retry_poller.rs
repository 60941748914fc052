//! Periodic retry of failed create and delete operations.
//!
//! Handlers record a resource here when its aggregate settles on a failure
//! for a Create or Delete, and clear it when the operation succeeds. The
//! poller re-dispatches recorded operations on a fixed interval:
//!
//! 1. Entries whose resource is gone or whose generation moved are dropped
//! 2. Entries past `max_retries` are dropped. The finalizer of a failed
//!    delete stays held; only a confirmed teardown releases it
//! 3. Everything else is dispatched again to the current reporter set and
//!    leaves the list until a handler records a new failure

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mlplane_events::{Operation, ResourceKind, ResourceStatus};
use mlplane_id::{ReporterId, ResourceName};
use mlplane_reconcile::RetryTracker;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::committer::{Fenced, StatusCommitter};
use crate::dispatch::Dispatcher;
use crate::store::AggregateStatus;

// =============================================================================
// Failed Operations
// =============================================================================

/// An operation whose aggregate settled on a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedOperation {
    pub generation: u64,
    pub operation: Operation,
}

/// Failed operations of one kind, keyed by resource.
#[derive(Debug, Default)]
pub struct FailedOperations {
    entries: DashMap<ResourceName, FailedOperation>,
}

impl FailedOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the failed operation for `name`.
    pub fn record(&self, name: &ResourceName, generation: u64, operation: Operation) {
        let previous = self.entries.insert(
            name.clone(),
            FailedOperation {
                generation,
                operation,
            },
        );
        if previous.is_none() {
            debug!(resource = %name, generation, %operation, "recorded failed operation");
        }
    }

    /// Forget `name`. Returns true if it was recorded.
    pub fn clear(&self, name: &ResourceName) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn get(&self, name: &ResourceName) -> Option<FailedOperation> {
        self.entries.get(name).map(|entry| *entry)
    }

    /// All recorded operations, sorted by resource.
    pub fn snapshot(&self) -> Vec<(ResourceName, FailedOperation)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Placement
// =============================================================================

/// Source of the reporter set an operation should be issued against.
#[async_trait]
pub trait Placement: Send + Sync + 'static {
    async fn reporters_for(&self, kind: ResourceKind, resource: &ResourceName) -> Vec<ReporterId>;
}

/// Fixed placement: every resource of a kind lives on the same reporters,
/// unless a per-resource set was given.
#[derive(Debug, Clone, Default)]
pub struct StaticPlacement {
    by_kind: BTreeMap<ResourceKind, Vec<ReporterId>>,
    by_resource: BTreeMap<(ResourceKind, ResourceName), Vec<ReporterId>>,
}

impl StaticPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: ResourceKind, reporters: Vec<ReporterId>) -> Self {
        self.by_kind.insert(kind, reporters);
        self
    }

    pub fn with_resource(
        mut self,
        kind: ResourceKind,
        resource: ResourceName,
        reporters: Vec<ReporterId>,
    ) -> Self {
        self.by_resource.insert((kind, resource), reporters);
        self
    }
}

#[async_trait]
impl Placement for StaticPlacement {
    async fn reporters_for(&self, kind: ResourceKind, resource: &ResourceName) -> Vec<ReporterId> {
        self.by_resource
            .get(&(kind, resource.clone()))
            .or_else(|| self.by_kind.get(&kind))
            .cloned()
            .unwrap_or_default()
    }
}

// =============================================================================
// Poller
// =============================================================================

/// Configuration for the failed-operation poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_retries: u32,
    /// Window after which an entry's retry count starts over.
    pub window: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_retries: mlplane_reconcile::DEFAULT_MAX_RETRIES,
            window: mlplane_reconcile::DEFAULT_RETRY_WINDOW,
        }
    }
}

/// Counters from one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub retried: usize,
    pub dropped: usize,
    pub exhausted: usize,
}

/// Re-dispatches failed operations for one aggregated kind.
pub struct FailedOperationPoller<S: ResourceStatus> {
    failed: Arc<FailedOperations>,
    committer: Arc<StatusCommitter<AggregateStatus<S>>>,
    dispatcher: Arc<Dispatcher<S>>,
    placement: Arc<dyn Placement>,
    tracker: RetryTracker<ResourceName>,
    config: PollerConfig,
}

impl<S: ResourceStatus> FailedOperationPoller<S> {
    pub fn new(
        failed: Arc<FailedOperations>,
        committer: Arc<StatusCommitter<AggregateStatus<S>>>,
        dispatcher: Arc<Dispatcher<S>>,
        placement: Arc<dyn Placement>,
        config: PollerConfig,
    ) -> Self {
        Self {
            failed,
            committer,
            dispatcher,
            placement,
            tracker: RetryTracker::new(config.max_retries, config.window),
            config,
        }
    }

    /// Run until the shutdown signal is received.
    #[instrument(skip(self, shutdown), fields(kind = %S::KIND))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_retries = self.config.max_retries,
            "Starting failed-operation poller"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.poll_once().await;
                    if stats != PollStats::default() {
                        info!(
                            retried = stats.retried,
                            dropped = stats.dropped,
                            exhausted = stats.exhausted,
                            "Failed-operation poll complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Failed-operation poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every recorded failed operation.
    pub async fn poll_once(&mut self) -> PollStats {
        let mut stats = PollStats::default();
        self.tracker.prune();

        for (name, failed) in self.failed.snapshot() {
            match self.committer.fetch_fenced(&name, failed.generation).await {
                Ok(Fenced::Current(_)) => {}
                Ok(Fenced::NotFound) | Ok(Fenced::Stale { .. }) => {
                    debug!(resource = %name, generation = failed.generation, "failed operation superseded");
                    self.forget(&name);
                    stats.dropped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(resource = %name, error = %err, "could not read resource for retry");
                    continue;
                }
            }

            if self.tracker.record_failure(&name) {
                warn!(
                    resource = %name,
                    operation = %failed.operation,
                    attempts = self.tracker.attempts(&name) - 1,
                    "retries exhausted for failed operation"
                );
                self.forget(&name);
                stats.exhausted += 1;
                continue;
            }

            let reporters = self.placement.reporters_for(S::KIND, &name).await;
            match self
                .dispatcher
                .dispatch(&name, failed.generation, failed.operation, reporters)
                .await
            {
                Ok(report) => {
                    // Tracker count is kept: a failed retry counts towards `max_retries`.
                    self.failed.clear(&name);
                    info!(
                        resource = %name,
                        operation = %failed.operation,
                        iteration = report.iteration,
                        delivered = report.delivered.len(),
                        "retried failed operation"
                    );
                    stats.retried += 1;
                }
                Err(err) => {
                    warn!(resource = %name, error = %err, "retry dispatch failed");
                }
            }
        }

        stats
    }

    fn forget(&mut self, name: &ResourceName) {
        self.failed.clear(name);
        self.tracker.clear(name);
    }
}

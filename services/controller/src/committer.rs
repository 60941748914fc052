//! Generation-fenced status commits and finalizer release.
//!
//! Every write re-reads the resource, re-checks the fence, and writes
//! conditionally on the version it just read. Conflicts are retried through
//! [`retry_on_conflict`]; every other outcome is returned as a value so the
//! event loop can log it and move on.

use std::sync::Arc;

use mlplane_id::ResourceName;
use mlplane_reconcile::{Clock, RetryPolicy, TokioClock};
use tracing::{debug, info, warn};

use crate::retry::{retry_on_conflict, RetryError};
use crate::store::{ObservedStatus, Resource, ResourceStore, StoreError, StoreResult};

/// Result of reading a resource against an event's generation.
#[derive(Debug, Clone, PartialEq)]
pub enum Fenced<St> {
    /// The resource exists and is at the event's generation.
    Current(Resource<St>),

    /// The resource no longer exists.
    NotFound,

    /// The resource moved to another generation.
    Stale { current: u64 },
}

/// Result of a status commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome<St> {
    /// The new status was written.
    Committed(Resource<St>),

    /// The computed status equals the stored one; nothing was written.
    Unchanged(Resource<St>),

    NotFound,

    Stale { current: u64 },

    /// Conflicts persisted past the retry policy.
    Exhausted { attempts: u32 },

    /// The store failed for another reason.
    Failed(StoreError),
}

impl<St> CommitOutcome<St> {
    /// The resource as it stands after the commit, when it was not dropped.
    pub fn resource(&self) -> Option<&Resource<St>> {
        match self {
            CommitOutcome::Committed(r) | CommitOutcome::Unchanged(r) => Some(r),
            _ => None,
        }
    }
}

/// Result of a finalizer release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizerOutcome {
    /// This call removed the finalizer.
    Released,

    /// The finalizer was already gone.
    AlreadyReleased,

    /// Deletion has not been requested; the finalizer stays.
    NotDeleting,

    NotFound,

    Exhausted { attempts: u32 },

    Failed(StoreError),
}

/// Applies statuses and releases finalizers for one resource kind.
pub struct StatusCommitter<St: ObservedStatus> {
    store: Arc<dyn ResourceStore<St>>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<St: ObservedStatus> StatusCommitter<St> {
    pub fn new(store: Arc<dyn ResourceStore<St>>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            clock: Arc::new(TokioClock),
        }
    }

    /// Replace the clock used for backoff sleeps and deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Read `name` and check it is still at `generation`.
    pub async fn fetch_fenced(&self, name: &ResourceName, generation: u64) -> StoreResult<Fenced<St>> {
        let Some(resource) = self.store.get(name).await? else {
            return Ok(Fenced::NotFound);
        };
        if resource.meta.generation != generation {
            return Ok(Fenced::Stale {
                current: resource.meta.generation,
            });
        }
        Ok(Fenced::Current(resource))
    }

    /// Write the status computed by `compute` from the stored status, as long
    /// as the resource stays at `generation`.
    ///
    /// `compute` runs once per attempt against the freshly read status.
    pub async fn commit<F>(&self, name: &ResourceName, generation: u64, compute: F) -> CommitOutcome<St>
    where
        F: Fn(&St) -> St + Send + Sync,
    {
        let compute = &compute;
        let result = retry_on_conflict(&self.policy, self.clock.as_ref(), || {
            self.try_commit(name, generation, compute)
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(
                    resource = %name,
                    generation,
                    attempts,
                    error = %last,
                    "giving up on status write after repeated conflicts"
                );
                CommitOutcome::Exhausted { attempts }
            }
            Err(RetryError::Store(err)) => {
                warn!(resource = %name, generation, error = %err, "status write failed");
                CommitOutcome::Failed(err)
            }
        }
    }

    async fn try_commit<F>(
        &self,
        name: &ResourceName,
        generation: u64,
        compute: &F,
    ) -> StoreResult<CommitOutcome<St>>
    where
        F: Fn(&St) -> St + Send + Sync,
    {
        let resource = match self.fetch_fenced(name, generation).await? {
            Fenced::Current(resource) => resource,
            Fenced::NotFound => return Ok(CommitOutcome::NotFound),
            Fenced::Stale { current } => return Ok(CommitOutcome::Stale { current }),
        };

        let next = compute(&resource.status);
        if next == resource.status {
            return Ok(CommitOutcome::Unchanged(resource));
        }

        match self
            .store
            .update_status(name, resource.meta.resource_version, next)
            .await
        {
            Ok(updated) => Ok(CommitOutcome::Committed(updated)),
            Err(StoreError::NotFound(_)) => Ok(CommitOutcome::NotFound),
            Err(err) => Err(err),
        }
    }

    /// Remove `finalizer` from `name` while its deletion marker is set.
    ///
    /// The marker is re-checked on every attempt immediately before the
    /// conditional write, so a resource that is no longer being deleted keeps
    /// its finalizer.
    pub async fn release_finalizer(&self, name: &ResourceName, finalizer: &str) -> FinalizerOutcome {
        let result = retry_on_conflict(&self.policy, self.clock.as_ref(), || {
            self.try_release(name, finalizer)
        })
        .await;

        match result {
            Ok(outcome) => {
                match &outcome {
                    FinalizerOutcome::Released => {
                        info!(resource = %name, finalizer, "released finalizer");
                    }
                    other => debug!(resource = %name, finalizer, outcome = ?other, "finalizer not released"),
                }
                outcome
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(
                    resource = %name,
                    finalizer,
                    attempts,
                    error = %last,
                    "giving up on finalizer release after repeated conflicts"
                );
                FinalizerOutcome::Exhausted { attempts }
            }
            Err(RetryError::Store(err)) => {
                warn!(resource = %name, finalizer, error = %err, "finalizer release failed");
                FinalizerOutcome::Failed(err)
            }
        }
    }

    async fn try_release(&self, name: &ResourceName, finalizer: &str) -> StoreResult<FinalizerOutcome> {
        let Some(resource) = self.store.get(name).await? else {
            return Ok(FinalizerOutcome::NotFound);
        };
        if !resource.meta.deletion_requested {
            return Ok(FinalizerOutcome::NotDeleting);
        }
        if !resource.meta.has_finalizer(finalizer) {
            return Ok(FinalizerOutcome::AlreadyReleased);
        }

        match self
            .store
            .remove_finalizer(name, resource.meta.resource_version, finalizer)
            .await
        {
            Ok(_) => Ok(FinalizerOutcome::Released),
            Err(StoreError::NotFound(_)) => Ok(FinalizerOutcome::NotFound),
            Err(err) => Err(err),
        }
    }
}

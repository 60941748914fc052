//! Resource store abstraction.
//!
//! The store owns each resource's metadata (generation, resource version,
//! deletion marker, finalizers) and its observed status. Every write is
//! conditional on the resource version the writer last read; a moved version
//! is reported as [`StoreError::Conflict`] and the writer re-reads.

mod memory;
mod status;

use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;
use mlplane_id::ResourceName;
use thiserror::Error;

pub use memory::InMemoryStore;
pub use status::{AggregateStatus, ExperimentStatus, ServerStatus};

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(ResourceName),

    /// The resource already exists.
    #[error("resource already exists: {0}")]
    AlreadyExists(ResourceName),

    /// The resource version moved since it was read.
    #[error("conflict on {name}: expected version {expected}, found {actual}")]
    Conflict {
        name: ResourceName,
        expected: u64,
        actual: u64,
    },

    /// The backing store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Bounds every observed-status type satisfies.
pub trait ObservedStatus: Clone + PartialEq + Debug + Default + Send + Sync + 'static {}

impl<T> ObservedStatus for T where T: Clone + PartialEq + Debug + Default + Send + Sync + 'static {}

/// Resource metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: ResourceName,

    /// Desired-state version, bumped by the owner on every spec change.
    pub generation: u64,

    /// Bumped on every write of any kind.
    pub resource_version: u64,

    /// Set once deletion has been requested. Never cleared.
    pub deletion_requested: bool,

    /// Holds that block garbage collection while deletion is in progress.
    pub finalizers: BTreeSet<String>,
}

impl ObjectMeta {
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.contains(finalizer)
    }
}

/// A stored resource with its observed status.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource<St> {
    pub meta: ObjectMeta,
    pub status: St,
}

/// Conditional access to resources of one kind.
#[async_trait]
pub trait ResourceStore<St: ObservedStatus>: Send + Sync + 'static {
    /// Fetch a resource. `None` when it does not exist.
    async fn get(&self, name: &ResourceName) -> StoreResult<Option<Resource<St>>>;

    /// Replace the status if the resource is still at `expected_version`.
    async fn update_status(
        &self,
        name: &ResourceName,
        expected_version: u64,
        status: St,
    ) -> StoreResult<Resource<St>>;

    /// Remove `finalizer` if the resource is still at `expected_version`.
    ///
    /// Returns `None` when removing the last finalizer of a resource being
    /// deleted caused it to be garbage-collected.
    async fn remove_finalizer(
        &self,
        name: &ResourceName,
        expected_version: u64,
        finalizer: &str,
    ) -> StoreResult<Option<Resource<St>>>;
}

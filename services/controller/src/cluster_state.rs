//! Read-only snapshot of every resource's latest committed status.
//!
//! Writers replace the snapshot copy-on-write; readers hold an
//! `Arc<ClusterState>` that never changes under them.

use std::collections::BTreeMap;
use std::sync::Arc;

use mlplane_events::{ModelState, PipelineStatus};
use mlplane_id::ResourceName;
use tokio::sync::watch;

use crate::store::{AggregateStatus, ExperimentStatus, ServerStatus};

/// Latest committed status of every known resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterState {
    pub models: BTreeMap<ResourceName, AggregateStatus<ModelState>>,
    pub pipelines: BTreeMap<ResourceName, AggregateStatus<PipelineStatus>>,
    pub experiments: BTreeMap<ResourceName, ExperimentStatus>,
    pub servers: BTreeMap<ResourceName, ServerStatus>,
    /// Bumped on every change.
    pub revision: u64,
}

/// A status type that has a slot in [`ClusterState`].
pub trait ClusterEntry: Clone + PartialEq + Send + Sync + 'static {
    fn entries(state: &ClusterState) -> &BTreeMap<ResourceName, Self>;

    fn slot(state: &mut ClusterState) -> &mut BTreeMap<ResourceName, Self>;
}

impl ClusterEntry for AggregateStatus<ModelState> {
    fn entries(state: &ClusterState) -> &BTreeMap<ResourceName, Self> {
        &state.models
    }

    fn slot(state: &mut ClusterState) -> &mut BTreeMap<ResourceName, Self> {
        &mut state.models
    }
}

impl ClusterEntry for AggregateStatus<PipelineStatus> {
    fn entries(state: &ClusterState) -> &BTreeMap<ResourceName, Self> {
        &state.pipelines
    }

    fn slot(state: &mut ClusterState) -> &mut BTreeMap<ResourceName, Self> {
        &mut state.pipelines
    }
}

impl ClusterEntry for ExperimentStatus {
    fn entries(state: &ClusterState) -> &BTreeMap<ResourceName, Self> {
        &state.experiments
    }

    fn slot(state: &mut ClusterState) -> &mut BTreeMap<ResourceName, Self> {
        &mut state.experiments
    }
}

impl ClusterEntry for ServerStatus {
    fn entries(state: &ClusterState) -> &BTreeMap<ResourceName, Self> {
        &state.servers
    }

    fn slot(state: &mut ClusterState) -> &mut BTreeMap<ResourceName, Self> {
        &mut state.servers
    }
}

/// Publishes [`ClusterState`] snapshots to any number of readers.
#[derive(Debug, Clone)]
pub struct ClusterStateHandle {
    tx: Arc<watch::Sender<Arc<ClusterState>>>,
}

impl Default for ClusterStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(ClusterState::default()));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ClusterState> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.tx.subscribe()
    }

    /// Insert or replace `name`'s status. No-op if unchanged.
    pub fn upsert<T: ClusterEntry>(&self, name: &ResourceName, status: &T) {
        self.tx.send_if_modified(|state| {
            if T::entries(state).get(name) == Some(status) {
                return false;
            }
            let state = Arc::make_mut(state);
            T::slot(state).insert(name.clone(), status.clone());
            state.revision += 1;
            true
        });
    }

    /// Drop `name` from the snapshot.
    pub fn remove<T: ClusterEntry>(&self, name: &ResourceName) {
        self.tx.send_if_modified(|state| {
            if !T::entries(state).contains_key(name) {
                return false;
            }
            let state = Arc::make_mut(state);
            T::slot(state).remove(name);
            state.revision += 1;
            true
        });
    }
}

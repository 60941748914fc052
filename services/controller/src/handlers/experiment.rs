//! Experiment status handler.

use std::sync::Arc;

use async_trait::async_trait;
use mlplane_events::ExperimentStatusEvent;
use tracing::debug;

use super::{DropReason, EventHandler, HandleOutcome, EXPERIMENT_FINALIZER};
use crate::cluster_state::ClusterStateHandle;
use crate::committer::{CommitOutcome, FinalizerOutcome, StatusCommitter};
use crate::store::ExperimentStatus;

/// Commits experiment conditions and releases the finalizer of an
/// experiment that is inactive while being deleted.
pub struct ExperimentHandler {
    committer: Arc<StatusCommitter<ExperimentStatus>>,
    cluster: Option<ClusterStateHandle>,
}

impl ExperimentHandler {
    pub fn new(committer: Arc<StatusCommitter<ExperimentStatus>>) -> Self {
        Self {
            committer,
            cluster: None,
        }
    }

    pub fn with_cluster_state(mut self, cluster: ClusterStateHandle) -> Self {
        self.cluster = Some(cluster);
        self
    }
}

#[async_trait]
impl EventHandler for ExperimentHandler {
    type Payload = ExperimentStatusEvent;

    fn name(&self) -> &'static str {
        "experiment"
    }

    async fn handle(&self, event: ExperimentStatusEvent) -> HandleOutcome {
        let next = ExperimentStatus {
            active: event.active,
            candidates_ready: event.candidates_ready,
            mirror_ready: event.mirror_ready,
            reason: event.description,
            observed_generation: event.generation,
        };
        let name = event.experiment;

        let outcome = self
            .committer
            .commit(&name, event.generation, |_| next.clone())
            .await;
        let applied = match &outcome {
            CommitOutcome::Committed(_) => HandleOutcome::Committed,
            CommitOutcome::Unchanged(_) => HandleOutcome::Unchanged,
            CommitOutcome::NotFound => return HandleOutcome::Dropped(DropReason::NotFound),
            CommitOutcome::Stale { current } => {
                debug!(
                    resource = %name,
                    generation = event.generation,
                    current,
                    "dropping experiment status for superseded generation"
                );
                return HandleOutcome::Dropped(DropReason::StaleGeneration);
            }
            CommitOutcome::Exhausted { .. } | CommitOutcome::Failed(_) => return HandleOutcome::Failed,
        };

        if let (Some(cluster), Some(stored)) = (&self.cluster, outcome.resource()) {
            cluster.upsert(&name, &stored.status);
        }

        if next.active {
            return applied;
        }

        match self
            .committer
            .release_finalizer(&name, EXPERIMENT_FINALIZER)
            .await
        {
            FinalizerOutcome::Released => {
                if let Some(cluster) = &self.cluster {
                    cluster.remove::<ExperimentStatus>(&name);
                }
                HandleOutcome::Released
            }
            FinalizerOutcome::Exhausted { .. } | FinalizerOutcome::Failed(_) => HandleOutcome::Failed,
            _ => applied,
        }
    }
}

//! Server status handler.

use std::sync::Arc;

use async_trait::async_trait;
use mlplane_events::ServerStatusEvent;
use tracing::debug;

use super::{DropReason, EventHandler, HandleOutcome};
use crate::cluster_state::ClusterStateHandle;
use crate::committer::{CommitOutcome, StatusCommitter};
use crate::store::ServerStatus;

/// Commits server replica counts.
pub struct ServerHandler {
    committer: Arc<StatusCommitter<ServerStatus>>,
    cluster: Option<ClusterStateHandle>,
}

impl ServerHandler {
    pub fn new(committer: Arc<StatusCommitter<ServerStatus>>) -> Self {
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
impl EventHandler for ServerHandler {
    type Payload = ServerStatusEvent;

    fn name(&self) -> &'static str {
        "server"
    }

    async fn handle(&self, event: ServerStatusEvent) -> HandleOutcome {
        let next = ServerStatus {
            available_replicas: event.available_replicas,
            expected_replicas: event.expected_replicas,
            loaded_model_replicas: event.loaded_model_replicas,
            observed_generation: event.generation,
        };

        let outcome = self
            .committer
            .commit(&event.server, event.generation, |_| next.clone())
            .await;

        match &outcome {
            CommitOutcome::Committed(stored) | CommitOutcome::Unchanged(stored) => {
                if let Some(cluster) = &self.cluster {
                    cluster.upsert(&event.server, &stored.status);
                }
            }
            CommitOutcome::Stale { current } => {
                debug!(
                    resource = %event.server,
                    generation = event.generation,
                    current,
                    "dropping server status for superseded generation"
                );
            }
            _ => {}
        }

        match outcome {
            CommitOutcome::Committed(_) => HandleOutcome::Committed,
            CommitOutcome::Unchanged(_) => HandleOutcome::Unchanged,
            CommitOutcome::NotFound => HandleOutcome::Dropped(DropReason::NotFound),
            CommitOutcome::Stale { .. } => HandleOutcome::Dropped(DropReason::StaleGeneration),
            CommitOutcome::Exhausted { .. } | CommitOutcome::Failed(_) => HandleOutcome::Failed,
        }
    }
}

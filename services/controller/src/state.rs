//! Controller state shared by the event loops, pollers and startup code.

use std::sync::Arc;

use mlplane_events::{ModelState, Operation, PipelineStatus, ResourceStatus};
use mlplane_id::{ReporterId, ResourceName};
use mlplane_reconcile::{Clock, RetryPolicy, StatusAggregator, TokioClock};
use thiserror::Error;
use tracing::info;

use crate::cluster_state::ClusterStateHandle;
use crate::committer::StatusCommitter;
use crate::dispatch::{CommandSink, DispatchError, DispatchReport, Dispatcher};
use crate::handlers::{
    ExperimentHandler, ModelHandler, PipelineHandler, ServerHandler, EXPERIMENT_FINALIZER, MODEL_FINALIZER,
    PIPELINE_FINALIZER,
};
use crate::manifest::Manifest;
use crate::retry_poller::{FailedOperationPoller, FailedOperations, Placement, PollerConfig};
use crate::store::{
    AggregateStatus, ExperimentStatus, InMemoryStore, Resource, ResourceStore, ServerStatus, StoreError,
};

/// Errors from owner-side operations.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

// =============================================================================
// Aggregated Kind
// =============================================================================

/// Everything one aggregated kind (models or pipelines) needs.
pub struct AggregatedKind<S: ResourceStatus> {
    store: Arc<InMemoryStore<AggregateStatus<S>>>,
    aggregator: Arc<StatusAggregator<S>>,
    committer: Arc<StatusCommitter<AggregateStatus<S>>>,
    dispatcher: Arc<Dispatcher<S>>,
    failed: Arc<FailedOperations>,
    finalizer: &'static str,
}

impl<S: ResourceStatus> AggregatedKind<S> {
    fn new(finalizer: &'static str, retry: RetryPolicy, clock: Arc<dyn Clock>, sink: Arc<dyn CommandSink>) -> Self {
        let store = Arc::new(InMemoryStore::<AggregateStatus<S>>::new());
        let aggregator = Arc::new(StatusAggregator::<S>::new());
        let committer = Arc::new(StatusCommitter::new(store.clone(), retry).with_clock(clock));
        let dispatcher = Arc::new(Dispatcher::new(aggregator.clone(), sink));

        Self {
            store,
            aggregator,
            committer,
            dispatcher,
            failed: Arc::new(FailedOperations::new()),
            finalizer,
        }
    }

    pub fn store(&self) -> &Arc<InMemoryStore<AggregateStatus<S>>> {
        &self.store
    }

    pub fn aggregator(&self) -> &Arc<StatusAggregator<S>> {
        &self.aggregator
    }

    pub fn committer(&self) -> &Arc<StatusCommitter<AggregateStatus<S>>> {
        &self.committer
    }

    pub fn failed(&self) -> &Arc<FailedOperations> {
        &self.failed
    }

    /// Create the resource and hold the kind's finalizer on it.
    pub async fn register(&self, name: ResourceName) -> Result<Resource<AggregateStatus<S>>, StoreError> {
        self.store.create(name.clone()).await?;
        self.store.add_finalizer(&name, self.finalizer).await
    }

    /// Issue `operation` at the resource's current generation.
    pub async fn issue(
        &self,
        name: &ResourceName,
        operation: Operation,
        reporters: Vec<ReporterId>,
    ) -> Result<DispatchReport, IssueError> {
        let resource = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;

        Ok(self
            .dispatcher
            .dispatch(name, resource.meta.generation, operation, reporters)
            .await?)
    }

    /// Request deletion and issue the Delete to `reporters`.
    ///
    /// Returns `None` if the resource was collected right away because no
    /// finalizer held it.
    pub async fn delete(
        &self,
        name: &ResourceName,
        reporters: Vec<ReporterId>,
    ) -> Result<Option<DispatchReport>, IssueError> {
        let Some(resource) = self.store.request_deletion(name).await? else {
            return Ok(None);
        };

        let report = self
            .dispatcher
            .dispatch(name, resource.meta.generation, Operation::Delete, reporters)
            .await?;
        Ok(Some(report))
    }

    /// Poller retrying this kind's failed operations.
    pub fn poller(&self, placement: Arc<dyn Placement>, config: PollerConfig) -> FailedOperationPoller<S> {
        FailedOperationPoller::new(
            self.failed.clone(),
            self.committer.clone(),
            self.dispatcher.clone(),
            placement,
            config,
        )
    }
}

// =============================================================================
// Controller State
// =============================================================================

/// Shared controller state.
#[derive(Clone)]
pub struct ControllerState {
    inner: Arc<ControllerStateInner>,
}

struct ControllerStateInner {
    models: AggregatedKind<ModelState>,
    pipelines: AggregatedKind<PipelineStatus>,
    experiments: Arc<InMemoryStore<ExperimentStatus>>,
    experiment_committer: Arc<StatusCommitter<ExperimentStatus>>,
    servers: Arc<InMemoryStore<ServerStatus>>,
    server_committer: Arc<StatusCommitter<ServerStatus>>,
    cluster: ClusterStateHandle,
}

impl ControllerState {
    /// Create state backed by in-memory stores and the tokio clock.
    pub fn new(retry: RetryPolicy, sink: Arc<dyn CommandSink>) -> Self {
        Self::with_clock(retry, Arc::new(TokioClock), sink)
    }

    pub fn with_clock(retry: RetryPolicy, clock: Arc<dyn Clock>, sink: Arc<dyn CommandSink>) -> Self {
        let experiments = Arc::new(InMemoryStore::<ExperimentStatus>::new());
        let servers = Arc::new(InMemoryStore::<ServerStatus>::new());

        let inner = ControllerStateInner {
            models: AggregatedKind::new(MODEL_FINALIZER, retry.clone(), clock.clone(), sink.clone()),
            pipelines: AggregatedKind::new(PIPELINE_FINALIZER, retry.clone(), clock.clone(), sink),
            experiment_committer: Arc::new(
                StatusCommitter::new(experiments.clone(), retry.clone()).with_clock(clock.clone()),
            ),
            experiments,
            server_committer: Arc::new(StatusCommitter::new(servers.clone(), retry).with_clock(clock)),
            servers,
            cluster: ClusterStateHandle::new(),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn models(&self) -> &AggregatedKind<ModelState> {
        &self.inner.models
    }

    pub fn pipelines(&self) -> &AggregatedKind<PipelineStatus> {
        &self.inner.pipelines
    }

    pub fn experiments(&self) -> &Arc<InMemoryStore<ExperimentStatus>> {
        &self.inner.experiments
    }

    pub fn servers(&self) -> &Arc<InMemoryStore<ServerStatus>> {
        &self.inner.servers
    }

    pub fn cluster(&self) -> &ClusterStateHandle {
        &self.inner.cluster
    }

    pub fn model_handler(&self) -> ModelHandler {
        let models = &self.inner.models;
        ModelHandler::for_models(models.aggregator.clone(), models.committer.clone())
            .with_failed_operations(models.failed.clone())
            .with_cluster_state(self.inner.cluster.clone())
    }

    pub fn pipeline_handler(&self) -> PipelineHandler {
        let pipelines = &self.inner.pipelines;
        PipelineHandler::for_pipelines(pipelines.aggregator.clone(), pipelines.committer.clone())
            .with_failed_operations(pipelines.failed.clone())
            .with_cluster_state(self.inner.cluster.clone())
    }

    pub fn experiment_handler(&self) -> ExperimentHandler {
        ExperimentHandler::new(self.inner.experiment_committer.clone())
            .with_cluster_state(self.inner.cluster.clone())
    }

    pub fn server_handler(&self) -> ServerHandler {
        ServerHandler::new(self.inner.server_committer.clone()).with_cluster_state(self.inner.cluster.clone())
    }

    /// Create every resource in `manifest` and issue Create for models and
    /// pipelines.
    pub async fn apply_manifest(&self, manifest: &Manifest) -> Result<(), IssueError> {
        for model in &manifest.models {
            self.inner.models.register(model.name.clone()).await?;
            self.inner
                .models
                .issue(&model.name, Operation::Create, model.reporters.clone())
                .await?;
        }

        for pipeline in &manifest.pipelines {
            self.inner.pipelines.register(pipeline.name.clone()).await?;
            self.inner
                .pipelines
                .issue(&pipeline.name, Operation::Create, pipeline.reporters.clone())
                .await?;
        }

        for experiment in &manifest.experiments {
            self.inner.experiments.create(experiment.clone()).await?;
            self.inner
                .experiments
                .add_finalizer(experiment, EXPERIMENT_FINALIZER)
                .await?;
        }

        for server in &manifest.servers {
            self.inner.servers.create(server.clone()).await?;
        }

        info!(
            models = manifest.models.len(),
            pipelines = manifest.pipelines.len(),
            experiments = manifest.experiments.len(),
            servers = manifest.servers.len(),
            "Manifest applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ChannelCommandSink;
    use mlplane_testing::{name, reporter, reporters};

    #[tokio::test]
    async fn test_apply_manifest_registers_and_dispatches() {
        let sink = Arc::new(ChannelCommandSink::new());
        let mut rx = sink.register(reporter("mlserver-0"), 4).await;
        let state = ControllerState::new(RetryPolicy::default(), sink);

        let manifest = Manifest::from_json(
            br#"{"models": [{"name": "iris", "reporters": ["mlserver-0"]}], "experiments": ["ab"]}"#,
        )
        .unwrap();
        state.apply_manifest(&manifest).await.unwrap();

        let model = state.models().store().get(&name("iris")).await.unwrap().unwrap();
        assert!(model.meta.has_finalizer(MODEL_FINALIZER));
        assert_eq!(model.status.state, ModelState::Unknown);
        assert_eq!(state.models().aggregator().current_iteration(&name("iris")), 1);

        let command = rx.recv().await.unwrap();
        assert_eq!(command.operation, Operation::Create);
        assert_eq!(command.iteration, 1);
        assert_eq!(command.generation, 1);

        let experiment = state.experiments().get(&name("ab")).await.unwrap().unwrap();
        assert!(experiment.meta.has_finalizer(EXPERIMENT_FINALIZER));
    }

    #[tokio::test]
    async fn test_delete_without_finalizer_collects_immediately() {
        let state = ControllerState::new(RetryPolicy::default(), Arc::new(ChannelCommandSink::new()));
        state.pipelines().store().create(name("p1")).await.unwrap();

        let report = state
            .pipelines()
            .delete(&name("p1"), reporters(&["dataflow-0"]))
            .await
            .unwrap();

        assert!(report.is_none());
        assert!(state.pipelines().store().get(&name("p1")).await.unwrap().is_none());
    }
}

//! Handler for kinds with many reporters (models, pipelines).

use std::sync::Arc;

use async_trait::async_trait;
use mlplane_events::{Operation, ResourceStatus, StatusUpdateEvent};
use mlplane_id::ResourceName;
use mlplane_reconcile::{DerivationPolicy, ModelPolicy, PipelinePolicy, StatusAggregator};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{DropReason, EventHandler, HandleOutcome, MODEL_FINALIZER, PIPELINE_FINALIZER};
use crate::cluster_state::{ClusterEntry, ClusterStateHandle};
use crate::committer::{CommitOutcome, Fenced, FinalizerOutcome, StatusCommitter};
use crate::retry_poller::FailedOperations;
use crate::store::AggregateStatus;

/// Folds reporter statuses into one aggregate and commits it.
///
/// Per event:
/// 1. Drop it if its iteration or reporter is not live
/// 2. Drop it if the resource is gone or at another generation
/// 3. Record the reporter's status and derive the aggregate
/// 4. Commit the aggregate under generation fencing
/// 5. On a torn-down aggregate for a Delete, release the finalizer and
///    forget the resource
pub struct AggregatingHandler<P: DerivationPolicy> {
    policy: P,
    aggregator: Arc<StatusAggregator<P::Status>>,
    committer: Arc<StatusCommitter<AggregateStatus<P::Status>>>,
    finalizer: &'static str,
    failed: Option<Arc<FailedOperations>>,
    cluster: Option<ClusterStateHandle>,
}

/// Handler for model status events.
pub type ModelHandler = AggregatingHandler<ModelPolicy>;

/// Handler for pipeline status events.
pub type PipelineHandler = AggregatingHandler<PipelinePolicy>;

impl ModelHandler {
    pub fn for_models(
        aggregator: Arc<StatusAggregator<<ModelPolicy as DerivationPolicy>::Status>>,
        committer: Arc<StatusCommitter<AggregateStatus<<ModelPolicy as DerivationPolicy>::Status>>>,
    ) -> Self {
        Self::new(ModelPolicy, aggregator, committer, MODEL_FINALIZER)
    }
}

impl PipelineHandler {
    pub fn for_pipelines(
        aggregator: Arc<StatusAggregator<<PipelinePolicy as DerivationPolicy>::Status>>,
        committer: Arc<StatusCommitter<AggregateStatus<<PipelinePolicy as DerivationPolicy>::Status>>>,
    ) -> Self {
        Self::new(PipelinePolicy, aggregator, committer, PIPELINE_FINALIZER)
    }
}

impl<P> AggregatingHandler<P>
where
    P: DerivationPolicy,
    AggregateStatus<P::Status>: ClusterEntry,
{
    pub fn new(
        policy: P,
        aggregator: Arc<StatusAggregator<P::Status>>,
        committer: Arc<StatusCommitter<AggregateStatus<P::Status>>>,
        finalizer: &'static str,
    ) -> Self {
        Self {
            policy,
            aggregator,
            committer,
            finalizer,
            failed: None,
            cluster: None,
        }
    }

    /// Record failed creates/deletes for the retry poller.
    pub fn with_failed_operations(mut self, failed: Arc<FailedOperations>) -> Self {
        self.failed = Some(failed);
        self
    }

    /// Publish committed statuses into the cluster snapshot.
    pub fn with_cluster_state(mut self, cluster: ClusterStateHandle) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// A failed aggregate, or a reporter reporting the failed outcome of its
    /// operation, queues the operation for retry. A successful aggregate
    /// clears it.
    fn track_failure(
        &self,
        name: &ResourceName,
        generation: u64,
        operation: Operation,
        reported: P::Status,
        state: P::Status,
    ) {
        let Some(failed) = &self.failed else {
            return;
        };
        if !matches!(operation, Operation::Create | Operation::Delete) {
            return;
        }
        if self.policy.is_failed(operation, state) || reported == P::Status::from_outcome(operation, false) {
            failed.record(name, generation, operation);
        } else if state == P::Status::from_outcome(operation, true) {
            failed.clear(name);
        }
    }

    fn forget(&self, name: &ResourceName) {
        self.aggregator.delete(name);
        if let Some(failed) = &self.failed {
            failed.clear(name);
        }
        if let Some(cluster) = &self.cluster {
            cluster.remove::<AggregateStatus<P::Status>>(name);
        }
    }

    /// Release the finalizer once teardown is confirmed. The aggregator entry
    /// is kept when the release could not complete, so a redelivered status
    /// retries it.
    async fn finish_teardown(&self, name: &ResourceName) -> Option<HandleOutcome> {
        match self.committer.release_finalizer(name, self.finalizer).await {
            FinalizerOutcome::Released => {
                self.forget(name);
                info!(kind = %P::Status::KIND, resource = %name, "teardown confirmed by all reporters");
                Some(HandleOutcome::Released)
            }
            FinalizerOutcome::AlreadyReleased | FinalizerOutcome::NotFound => {
                self.forget(name);
                None
            }
            FinalizerOutcome::NotDeleting => None,
            FinalizerOutcome::Exhausted { .. } | FinalizerOutcome::Failed(_) => {
                Some(HandleOutcome::Failed)
            }
        }
    }
}

#[async_trait]
impl<P> EventHandler for AggregatingHandler<P>
where
    P: DerivationPolicy,
    P::Status: DeserializeOwned,
    AggregateStatus<P::Status>: ClusterEntry,
{
    type Payload = StatusUpdateEvent<P::Status>;

    fn name(&self) -> &'static str {
        P::Status::KIND.as_str()
    }

    async fn handle(&self, event: Self::Payload) -> HandleOutcome {
        let StatusUpdateEvent {
            resource,
            reporter,
            iteration,
            generation,
            operation,
            status,
        } = event;

        if self.aggregator.is_outdated(&resource, iteration, &reporter) {
            debug!(
                resource = %resource,
                reporter = %reporter,
                iteration,
                current = self.aggregator.current_iteration(&resource),
                "dropping outdated status"
            );
            return HandleOutcome::Dropped(DropReason::Outdated);
        }

        match self.committer.fetch_fenced(&resource, generation).await {
            Ok(Fenced::Current(_)) => {}
            Ok(Fenced::NotFound) => {
                debug!(resource = %resource, "dropping status for missing resource");
                return HandleOutcome::Dropped(DropReason::NotFound);
            }
            Ok(Fenced::Stale { current }) => {
                debug!(
                    resource = %resource,
                    generation,
                    current,
                    "dropping status for superseded generation"
                );
                return HandleOutcome::Dropped(DropReason::StaleGeneration);
            }
            Err(err) => {
                warn!(resource = %resource, error = %err, "could not read resource");
                return HandleOutcome::Failed;
            }
        }

        let Some(counts) = self
            .aggregator
            .record_if_current(&resource, iteration, &reporter, status)
        else {
            debug!(resource = %resource, iteration, "iteration advanced before status was recorded");
            return HandleOutcome::Dropped(DropReason::Outdated);
        };

        let aggregate = self.policy.derive(operation, &counts);
        debug!(
            resource = %resource,
            reporter = %reporter,
            iteration,
            %operation,
            state = %aggregate.status,
            reason = %aggregate.reason,
            "derived aggregate status"
        );

        let next = AggregateStatus {
            state: aggregate.status,
            reason: aggregate.reason,
            reporters: counts.total(),
            observed_generation: generation,
        };
        let outcome = self
            .committer
            .commit(&resource, generation, |_| next.clone())
            .await;

        let applied = match &outcome {
            CommitOutcome::Committed(_) => HandleOutcome::Committed,
            CommitOutcome::Unchanged(_) => HandleOutcome::Unchanged,
            CommitOutcome::NotFound => return HandleOutcome::Dropped(DropReason::NotFound),
            CommitOutcome::Stale { .. } => return HandleOutcome::Dropped(DropReason::StaleGeneration),
            CommitOutcome::Exhausted { .. } | CommitOutcome::Failed(_) => return HandleOutcome::Failed,
        };

        if let (Some(cluster), Some(stored)) = (&self.cluster, outcome.resource()) {
            cluster.upsert(&resource, &stored.status);
        }
        self.track_failure(&resource, generation, operation, status, next.state);

        if self.policy.is_torn_down(operation, next.state) {
            if let Some(done) = self.finish_teardown(&resource).await {
                return done;
            }
        }

        applied
    }
}

#[cfg(test)]
mod tests {
    use mlplane_events::{ModelState, PipelineStatus};
    use mlplane_reconcile::RetryPolicy;
    use mlplane_testing::{name, reporters, status_event};
    use proptest::prelude::*;

    use super::*;
    use crate::store::{InMemoryStore, ResourceStore};

    struct Fixture {
        store: Arc<InMemoryStore<AggregateStatus<PipelineStatus>>>,
        aggregator: Arc<StatusAggregator<PipelineStatus>>,
        failed: Arc<FailedOperations>,
        handler: PipelineHandler,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::<AggregateStatus<PipelineStatus>>::new());
        store.create(name("p1")).await.unwrap();
        store.add_finalizer(&name("p1"), PIPELINE_FINALIZER).await.unwrap();
        let aggregator = Arc::new(StatusAggregator::new());
        let committer = Arc::new(StatusCommitter::new(store.clone(), RetryPolicy::default()));
        let failed = Arc::new(FailedOperations::new());
        let handler = PipelineHandler::for_pipelines(aggregator.clone(), committer)
            .with_failed_operations(failed.clone());
        Fixture {
            store,
            aggregator,
            failed,
            handler,
        }
    }

    async fn stored(fx: &Fixture) -> AggregateStatus<PipelineStatus> {
        fx.store.get(&name("p1")).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_partial_then_full_readiness() {
        let fx = fixture().await;
        fx.aggregator
            .start_iteration(&name("p1"), reporters(&["a", "b", "c"]), PipelineStatus::Unknown);

        let outcome = fx
            .handler
            .handle(status_event("p1", "a", 1, 1, Operation::Create, PipelineStatus::Ready))
            .await;
        assert_eq!(outcome, HandleOutcome::Committed);
        assert_eq!(stored(&fx).await.state, PipelineStatus::Creating);
        assert_eq!(stored(&fx).await.reason, "1/3 ready ");

        for r in ["b", "c"] {
            fx.handler
                .handle(status_event("p1", r, 1, 1, Operation::Create, PipelineStatus::Ready))
                .await;
        }
        let status = stored(&fx).await;
        assert_eq!(status.state, PipelineStatus::Ready);
        assert_eq!(status.reason, "3/3 ready ");
        assert_eq!(status.reporters, 3);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_unchanged() {
        let fx = fixture().await;
        fx.aggregator
            .start_iteration(&name("p1"), reporters(&["a"]), PipelineStatus::Unknown);
        let event = status_event("p1", "a", 1, 1, Operation::Create, PipelineStatus::Ready);

        assert_eq!(fx.handler.handle(event.clone()).await, HandleOutcome::Committed);
        assert_eq!(fx.handler.handle(event).await, HandleOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_outdated_and_stale_events_dropped() {
        let fx = fixture().await;
        fx.aggregator
            .start_iteration(&name("p1"), reporters(&["a"]), PipelineStatus::Unknown);
        fx.aggregator
            .start_iteration(&name("p1"), reporters(&["a"]), PipelineStatus::Unknown);

        let outcome = fx
            .handler
            .handle(status_event("p1", "a", 1, 1, Operation::Create, PipelineStatus::Ready))
            .await;
        assert_eq!(outcome, HandleOutcome::Dropped(DropReason::Outdated));

        let outcome = fx
            .handler
            .handle(status_event("p1", "z", 2, 1, Operation::Create, PipelineStatus::Ready))
            .await;
        assert_eq!(outcome, HandleOutcome::Dropped(DropReason::Outdated));

        fx.store.update_spec(&name("p1")).await.unwrap();
        let outcome = fx
            .handler
            .handle(status_event("p1", "a", 2, 1, Operation::Create, PipelineStatus::Ready))
            .await;
        assert_eq!(outcome, HandleOutcome::Dropped(DropReason::StaleGeneration));
        assert_eq!(fx.aggregator.count_with_status(&name("p1"), PipelineStatus::Ready), 0);
        assert_eq!(stored(&fx).await, AggregateStatus::default());
    }

    #[tokio::test]
    async fn test_failed_create_tracked_and_cleared() {
        let fx = fixture().await;
        fx.aggregator
            .start_iteration(&name("p1"), reporters(&["a"]), PipelineStatus::Unknown);
        fx.handler
            .handle(status_event("p1", "a", 1, 1, Operation::Create, PipelineStatus::Failed))
            .await;
        assert!(fx.failed.get(&name("p1")).is_some());

        fx.aggregator
            .start_iteration(&name("p1"), reporters(&["a"]), PipelineStatus::Unknown);
        fx.handler
            .handle(status_event("p1", "a", 2, 1, Operation::Create, PipelineStatus::Ready))
            .await;
        assert!(fx.failed.is_empty());
    }

    #[tokio::test]
    async fn test_failed_teardown_reporter_queues_retry() {
        let fx = fixture().await;
        fx.aggregator
            .start_iteration(&name("p1"), reporters(&["a", "b"]), PipelineStatus::Unknown);

        fx.handler
            .handle(status_event("p1", "a", 1, 1, Operation::Delete, PipelineStatus::FailedTerminating))
            .await;

        assert_eq!(stored(&fx).await.state, PipelineStatus::Terminating);
        assert_eq!(
            fx.failed.get(&name("p1")),
            Some(crate::retry_poller::FailedOperation {
                generation: 1,
                operation: Operation::Delete,
            })
        );
    }

    #[tokio::test]
    async fn test_terminated_without_deletion_keeps_finalizer() {
        let fx = fixture().await;
        fx.aggregator
            .start_iteration(&name("p1"), reporters(&["a"]), PipelineStatus::Unknown);

        let outcome = fx
            .handler
            .handle(status_event("p1", "a", 1, 1, Operation::Delete, PipelineStatus::Terminated))
            .await;
        assert_eq!(outcome, HandleOutcome::Committed);

        let resource = fx.store.get(&name("p1")).await.unwrap().unwrap();
        assert!(resource.meta.has_finalizer(PIPELINE_FINALIZER));
        assert_eq!(fx.aggregator.current_iteration(&name("p1")), 1);
    }

    #[tokio::test]
    async fn test_model_handler_uses_model_vocabulary() {
        let store = Arc::new(InMemoryStore::<AggregateStatus<ModelState>>::new());
        store.create(name("iris")).await.unwrap();
        let aggregator = Arc::new(StatusAggregator::new());
        aggregator.start_iteration(&name("iris"), reporters(&["mlserver-0"]), ModelState::Unknown);
        let committer = Arc::new(StatusCommitter::new(store.clone(), RetryPolicy::default()));
        let handler = ModelHandler::for_models(aggregator, committer);
        assert_eq!(handler.name(), "model");

        handler
            .handle(status_event("iris", "mlserver-0", 1, 1, Operation::Create, ModelState::Available))
            .await;
        let status = store.get(&name("iris")).await.unwrap().unwrap().status;
        assert_eq!(status.state, ModelState::Available);
        assert_eq!(status.reason, "1/1 streams are ready, 0/1 still creating, 0/1 streams failed");
    }

    fn pipeline_status() -> impl Strategy<Value = PipelineStatus> {
        prop_oneof![
            Just(PipelineStatus::Ready),
            Just(PipelineStatus::Creating),
            Just(PipelineStatus::Failed),
            Just(PipelineStatus::Rebalancing),
        ]
    }

    proptest! {
        #[test]
        fn prop_committed_status_independent_of_arrival_order(
            (statuses, order) in prop::collection::vec(pipeline_status(), 1..6)
                .prop_flat_map(|statuses| {
                    let order = Just((0..statuses.len()).collect::<Vec<_>>()).prop_shuffle();
                    (Just(statuses), order)
                })
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (in_order, shuffled) = runtime.block_on(async {
                let mut results = Vec::new();
                for sequence in [(0..statuses.len()).collect::<Vec<_>>(), order.clone()] {
                    let fx = fixture().await;
                    let ids: Vec<String> = (0..statuses.len()).map(|i| format!("r{i}")).collect();
                    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                    fx.aggregator
                        .start_iteration(&name("p1"), reporters(&id_refs), PipelineStatus::Unknown);
                    for i in sequence {
                        fx.handler
                            .handle(status_event("p1", &ids[i], 1, 1, Operation::Create, statuses[i]))
                            .await;
                    }
                    results.push(stored(&fx).await);
                }
                (results[0].clone(), results[1].clone())
            });

            prop_assert_eq!(in_order, shuffled);
        }
    }
}

//! Derivation policies: per-status counts to one aggregate status.

use std::fmt::Write as _;

use mlplane_events::{ModelState, Operation, PipelineStatus, ResourceStatus};

use crate::StatusCounts;

/// Aggregate status derived for a resource, with a human-readable summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate<S> {
    pub status: S,
    pub reason: String,
}

impl<S> Aggregate<S> {
    fn new(status: S, reason: String) -> Self {
        Self { status, reason }
    }
}

const UNKNOWN_OPERATION: &str = "Unknown operation or status";

/// Maps the operation in flight and reporter counts to an aggregate.
///
/// Implementations must be total and pure: the same operation and counts
/// always produce the same aggregate.
pub trait DerivationPolicy: Send + Sync + 'static {
    type Status: ResourceStatus;

    /// Derive the aggregate for `operation` from `counts`.
    fn derive(
        &self,
        operation: Operation,
        counts: &StatusCounts<Self::Status>,
    ) -> Aggregate<Self::Status>;

    /// True when `status` confirms that a deletion finished on every reporter.
    fn is_torn_down(&self, operation: Operation, status: Self::Status) -> bool;

    /// True when `status` is a failed aggregate for a create or delete that
    /// the failed-operation poller should retry. A single reporter reporting
    /// the failed outcome of its operation is retried as well.
    fn is_failed(&self, operation: Operation, status: Self::Status) -> bool;
}

// =============================================================================
// Model Policy
// =============================================================================

/// Aggregation over serving replicas of a model.
///
/// Only Create and Delete are judged; any other operation yields `Unknown`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelPolicy;

impl DerivationPolicy for ModelPolicy {
    type Status = ModelState;

    fn derive(&self, operation: Operation, counts: &StatusCounts<ModelState>) -> Aggregate<ModelState> {
        let total = counts.total();
        let unknown = counts.get(ModelState::Unknown);

        match operation {
            Operation::Create => {
                let available = counts.get(ModelState::Available);
                let failed = total.saturating_sub(available + unknown);
                let reason = format!(
                    "{available}/{total} streams are ready, {unknown}/{total} still creating, {failed}/{total} streams failed"
                );
                let status = if failed == total {
                    ModelState::Failed
                } else if available > 0 && unknown == 0 {
                    ModelState::Available
                } else {
                    ModelState::Progressing
                };
                Aggregate::new(status, reason)
            }
            Operation::Delete => {
                let terminated = counts.get(ModelState::Terminated);
                let failed = total.saturating_sub(terminated + unknown);
                let reason = format!(
                    "{terminated}/{total} streams terminated, {unknown}/{total} still terminating, {failed}/{total} streams failed to terminate"
                );
                let status = if failed > 0 {
                    ModelState::TerminateFailed
                } else if terminated == total {
                    ModelState::Terminated
                } else {
                    ModelState::Terminating
                };
                Aggregate::new(status, reason)
            }
            Operation::Rebalance | Operation::Ready | Operation::Unspecified => {
                Aggregate::new(ModelState::Unknown, UNKNOWN_OPERATION.to_string())
            }
        }
    }

    fn is_torn_down(&self, operation: Operation, status: ModelState) -> bool {
        operation == Operation::Delete && status == ModelState::Terminated
    }

    fn is_failed(&self, operation: Operation, status: ModelState) -> bool {
        matches!(
            (operation, status),
            (Operation::Create, ModelState::Failed) | (Operation::Delete, ModelState::TerminateFailed)
        )
    }
}

// =============================================================================
// Pipeline Policy
// =============================================================================

/// Aggregation over dataflow engines running a pipeline.
///
/// Only `Failed` reporters count as failed. A reporter that failed to tear
/// down leaves the aggregate `Terminating` and is retried by the poller.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelinePolicy;

impl PipelinePolicy {
    /// Summary pieces in fixed order, zero counts omitted.
    fn summary(ready: usize, terminated: usize, failed: usize, rebalancing: usize, total: usize) -> String {
        let mut out = String::new();
        for (count, word) in [
            (ready, "ready"),
            (terminated, "terminated"),
            (failed, "failed"),
            (rebalancing, "rebalancing"),
        ] {
            if count > 0 {
                let _ = write!(out, "{count}/{total} {word} ");
            }
        }
        out
    }
}

impl DerivationPolicy for PipelinePolicy {
    type Status = PipelineStatus;

    fn derive(
        &self,
        operation: Operation,
        counts: &StatusCounts<PipelineStatus>,
    ) -> Aggregate<PipelineStatus> {
        let total = counts.total();
        let ready = counts.get(PipelineStatus::Ready);
        let terminated = counts.get(PipelineStatus::Terminated);
        let failed = counts.get(PipelineStatus::Failed);
        let rebalancing = counts.get(PipelineStatus::Rebalancing);
        let unknown = counts.get(PipelineStatus::Unknown);

        let status = match operation {
            Operation::Create => {
                if failed == total {
                    PipelineStatus::Failed
                } else if ready > 0 && unknown == 0 {
                    PipelineStatus::Ready
                } else {
                    PipelineStatus::Creating
                }
            }
            Operation::Delete => {
                if failed > 0 {
                    PipelineStatus::Failed
                } else if terminated == total {
                    PipelineStatus::Terminated
                } else {
                    PipelineStatus::Terminating
                }
            }
            Operation::Rebalance | Operation::Ready => {
                if failed == total {
                    PipelineStatus::Failed
                } else if ready > 0 && rebalancing == 0 {
                    PipelineStatus::Ready
                } else {
                    PipelineStatus::Rebalancing
                }
            }
            Operation::Unspecified => {
                return Aggregate::new(PipelineStatus::Unknown, UNKNOWN_OPERATION.to_string());
            }
        };

        Aggregate::new(
            status,
            Self::summary(ready, terminated, failed, rebalancing, total),
        )
    }

    fn is_torn_down(&self, operation: Operation, status: PipelineStatus) -> bool {
        operation == Operation::Delete && status == PipelineStatus::Terminated
    }

    fn is_failed(&self, operation: Operation, status: PipelineStatus) -> bool {
        matches!(operation, Operation::Create | Operation::Delete) && status == PipelineStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    use PipelineStatus::{Failed, FailedTerminating, Ready, Rebalancing, Terminated, Unknown};

    fn pipeline(statuses: &[PipelineStatus]) -> StatusCounts<PipelineStatus> {
        statuses.iter().copied().collect()
    }

    fn model(statuses: &[ModelState]) -> StatusCounts<ModelState> {
        statuses.iter().copied().collect()
    }

    #[rstest]
    #[case(&[Ready, Unknown, Unknown], PipelineStatus::Creating, "1/3 ready ")]
    #[case(&[Ready, Ready, Ready], PipelineStatus::Ready, "3/3 ready ")]
    #[case(&[Failed, Ready, Failed], PipelineStatus::Ready, "1/3 ready 2/3 failed ")]
    #[case(&[Failed, Failed, Failed], PipelineStatus::Failed, "3/3 failed ")]
    #[case(&[Unknown, Unknown, Unknown], PipelineStatus::Creating, "")]
    fn test_pipeline_create(
        #[case] statuses: &[PipelineStatus],
        #[case] expected: PipelineStatus,
        #[case] reason: &str,
    ) {
        let agg = PipelinePolicy.derive(Operation::Create, &pipeline(statuses));
        assert_eq!(agg.status, expected);
        assert_eq!(agg.reason, reason);
    }

    #[rstest]
    #[case(&[Terminated, Terminated, Terminated], PipelineStatus::Terminated)]
    #[case(&[Terminated, Unknown, Terminated], PipelineStatus::Terminating)]
    #[case(&[Terminated, FailedTerminating, Terminated], PipelineStatus::Terminating)]
    #[case(&[Failed, Terminated, Terminated], PipelineStatus::Failed)]
    fn test_pipeline_delete(#[case] statuses: &[PipelineStatus], #[case] expected: PipelineStatus) {
        let agg = PipelinePolicy.derive(Operation::Delete, &pipeline(statuses));
        assert_eq!(agg.status, expected);
    }

    #[test]
    fn test_failed_teardown_not_counted_as_failed() {
        let agg = PipelinePolicy.derive(
            Operation::Delete,
            &pipeline(&[Terminated, FailedTerminating, Terminated]),
        );
        assert_eq!(agg.reason, "2/3 terminated ");
    }

    #[rstest]
    #[case(Operation::Rebalance, &[Ready, Rebalancing], PipelineStatus::Rebalancing)]
    #[case(Operation::Ready, &[Ready, Ready], PipelineStatus::Ready)]
    #[case(Operation::Rebalance, &[Failed, Failed], PipelineStatus::Failed)]
    fn test_pipeline_rebalance(
        #[case] op: Operation,
        #[case] statuses: &[PipelineStatus],
        #[case] expected: PipelineStatus,
    ) {
        assert_eq!(PipelinePolicy.derive(op, &pipeline(statuses)).status, expected);
    }

    #[test]
    fn test_summary_order_is_fixed() {
        let agg = PipelinePolicy.derive(
            Operation::Rebalance,
            &pipeline(&[Rebalancing, Failed, Terminated, Ready]),
        );
        assert_eq!(
            agg.reason,
            "1/4 ready 1/4 terminated 1/4 failed 1/4 rebalancing "
        );
    }

    #[test]
    fn test_unspecified_operation() {
        let agg = PipelinePolicy.derive(Operation::Unspecified, &pipeline(&[Ready]));
        assert_eq!(agg.status, PipelineStatus::Unknown);
        assert_eq!(agg.reason, "Unknown operation or status");
    }

    #[rstest]
    #[case(Operation::Rebalance)]
    #[case(Operation::Ready)]
    #[case(Operation::Unspecified)]
    fn test_model_only_judges_create_and_delete(#[case] op: Operation) {
        let agg = ModelPolicy.derive(op, &model(&[ModelState::Available, ModelState::Available]));
        assert_eq!(agg.status, ModelState::Unknown);
        assert_eq!(agg.reason, "Unknown operation or status");
        assert!(!ModelPolicy.is_failed(op, agg.status));
    }

    #[test]
    fn test_empty_reporter_set() {
        let empty = pipeline(&[]);
        assert_eq!(PipelinePolicy.derive(Operation::Create, &empty).status, PipelineStatus::Failed);
        assert_eq!(
            PipelinePolicy.derive(Operation::Delete, &empty).status,
            PipelineStatus::Terminated
        );
    }

    #[rstest]
    #[case(&[ModelState::Available, ModelState::Available], ModelState::Available)]
    #[case(&[ModelState::Available, ModelState::Unknown], ModelState::Progressing)]
    #[case(&[ModelState::Failed, ModelState::Available], ModelState::Available)]
    #[case(&[ModelState::Failed, ModelState::ScheduleFailed], ModelState::Failed)]
    fn test_model_create(#[case] statuses: &[ModelState], #[case] expected: ModelState) {
        assert_eq!(ModelPolicy.derive(Operation::Create, &model(statuses)).status, expected);
    }

    #[test]
    fn test_model_summaries() {
        let agg = ModelPolicy.derive(
            Operation::Create,
            &model(&[ModelState::Available, ModelState::Unknown, ModelState::Failed]),
        );
        assert_eq!(
            agg.reason,
            "1/3 streams are ready, 1/3 still creating, 1/3 streams failed"
        );

        let agg = ModelPolicy.derive(
            Operation::Delete,
            &model(&[ModelState::Terminated, ModelState::TerminateFailed]),
        );
        assert_eq!(agg.status, ModelState::TerminateFailed);
        assert_eq!(
            agg.reason,
            "1/2 streams terminated, 0/2 still terminating, 1/2 streams failed to terminate"
        );
    }

    #[test]
    fn test_model_delete_terminated() {
        let agg = ModelPolicy.derive(
            Operation::Delete,
            &model(&[ModelState::Terminated, ModelState::Terminated]),
        );
        assert_eq!(agg.status, ModelState::Terminated);
        assert!(ModelPolicy.is_torn_down(Operation::Delete, agg.status));
        assert!(!ModelPolicy.is_torn_down(Operation::Create, agg.status));
    }

    #[test]
    fn test_is_failed() {
        assert!(PipelinePolicy.is_failed(Operation::Create, PipelineStatus::Failed));
        assert!(PipelinePolicy.is_failed(Operation::Delete, PipelineStatus::Failed));
        assert!(!PipelinePolicy.is_failed(Operation::Rebalance, PipelineStatus::Failed));
        assert!(ModelPolicy.is_failed(Operation::Delete, ModelState::TerminateFailed));
        assert!(!ModelPolicy.is_failed(Operation::Create, ModelState::Progressing));
    }

    fn pipeline_status() -> impl Strategy<Value = PipelineStatus> {
        prop_oneof![
            Just(Unknown),
            Just(Ready),
            Just(Failed),
            Just(Terminated),
            Just(Rebalancing),
            Just(FailedTerminating),
        ]
    }

    fn operation() -> impl Strategy<Value = Operation> {
        prop_oneof![
            Just(Operation::Create),
            Just(Operation::Delete),
            Just(Operation::Rebalance),
            Just(Operation::Ready),
        ]
    }

    proptest! {
        #[test]
        fn prop_derive_is_order_independent_and_idempotent(
            op in operation(),
            statuses in proptest::collection::vec(pipeline_status(), 0..10),
        ) {
            let forward = pipeline(&statuses);
            let mut reversed_statuses = statuses.clone();
            reversed_statuses.reverse();
            let reversed = pipeline(&reversed_statuses);

            let first = PipelinePolicy.derive(op, &forward);
            prop_assert_eq!(&first, &PipelinePolicy.derive(op, &forward));
            prop_assert_eq!(&first, &PipelinePolicy.derive(op, &reversed));
        }
    }
}

//! Event payload definitions for all resource kinds.
//!
//! Models and pipelines are served by several independent reporters at once,
//! so their events carry a reporter id and an iteration stamp and are folded
//! together by the status aggregator. Experiments and servers have a single
//! reporter (the scheduler) and are applied directly.

use std::fmt::{self, Debug, Display};
use std::hash::Hash;

use mlplane_id::{ReporterId, ResourceName};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const MODEL_STATUS_UPDATED: &str = "model.status_updated";
    pub const PIPELINE_STATUS_UPDATED: &str = "pipeline.status_updated";
    pub const EXPERIMENT_STATUS_UPDATED: &str = "experiment.status_updated";
    pub const SERVER_STATUS_UPDATED: &str = "server.status_updated";
}

// =============================================================================
// Resource Kinds and Operations
// =============================================================================

/// Kind of resource an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Model,
    Pipeline,
    Experiment,
    Server,
}

impl ResourceKind {
    /// All kinds, in the order their event loops are started.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Model,
        ResourceKind::Pipeline,
        ResourceKind::Experiment,
        ResourceKind::Server,
    ];

    /// The status-update event type for this kind.
    pub fn status_event_type(&self) -> &'static str {
        match self {
            ResourceKind::Model => event_types::MODEL_STATUS_UPDATED,
            ResourceKind::Pipeline => event_types::PIPELINE_STATUS_UPDATED,
            ResourceKind::Experiment => event_types::EXPERIMENT_STATUS_UPDATED,
            ResourceKind::Server => event_types::SERVER_STATUS_UPDATED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Model => "model",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::Experiment => "experiment",
            ResourceKind::Server => "server",
        }
    }

    /// Resolve the kind that owns an event type.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.status_event_type() == event_type)
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling operation an iteration was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Delete,
    /// Placement changed; reporters move the resource between replicas.
    Rebalance,
    /// A rebalance finished on a reporter and it is serving again.
    Ready,
    /// Anything this build does not know about. Kept decodable so the
    /// derivation policies can report it instead of the event being dropped.
    #[serde(other)]
    Unspecified,
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::Rebalance => "rebalance",
            Operation::Ready => "ready",
            Operation::Unspecified => "unspecified",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Status Enums
// =============================================================================

/// A closed per-kind status vocabulary.
///
/// The same vocabulary is used for a single reporter's observation and for
/// the aggregate derived from all reporters.
pub trait ResourceStatus:
    Copy + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static
{
    /// The kind this vocabulary belongs to.
    const KIND: ResourceKind;

    /// The status of a reporter that has not reported yet.
    const UNKNOWN: Self;

    /// Map a reporter's success/failure for an operation to a status.
    fn from_outcome(operation: Operation, success: bool) -> Self;
}

/// Model status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unknown,
    Progressing,
    Available,
    Failed,
    Terminating,
    Terminated,
    TerminateFailed,
    ScheduleFailed,
}

impl Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelState::Unknown => "unknown",
            ModelState::Progressing => "progressing",
            ModelState::Available => "available",
            ModelState::Failed => "failed",
            ModelState::Terminating => "terminating",
            ModelState::Terminated => "terminated",
            ModelState::TerminateFailed => "terminate_failed",
            ModelState::ScheduleFailed => "schedule_failed",
        };
        f.write_str(s)
    }
}

impl ResourceStatus for ModelState {
    const KIND: ResourceKind = ResourceKind::Model;
    const UNKNOWN: Self = ModelState::Unknown;

    fn from_outcome(operation: Operation, success: bool) -> Self {
        match (operation, success) {
            (Operation::Create, true) => ModelState::Available,
            (Operation::Create, false) => ModelState::Failed,
            (Operation::Delete, true) => ModelState::Terminated,
            (Operation::Delete, false) => ModelState::TerminateFailed,
            (Operation::Rebalance | Operation::Ready | Operation::Unspecified, _) => ModelState::Unknown,
        }
    }
}

/// Pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Unknown,
    Creating,
    Ready,
    Failed,
    Terminating,
    Terminated,
    FailedTerminating,
    Rebalancing,
}

impl Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::Unknown => "unknown",
            PipelineStatus::Creating => "creating",
            PipelineStatus::Ready => "ready",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Terminating => "terminating",
            PipelineStatus::Terminated => "terminated",
            PipelineStatus::FailedTerminating => "failed_terminating",
            PipelineStatus::Rebalancing => "rebalancing",
        };
        f.write_str(s)
    }
}

impl ResourceStatus for PipelineStatus {
    const KIND: ResourceKind = ResourceKind::Pipeline;
    const UNKNOWN: Self = PipelineStatus::Unknown;

    fn from_outcome(operation: Operation, success: bool) -> Self {
        match (operation, success) {
            (Operation::Create | Operation::Ready, true) => PipelineStatus::Ready,
            (Operation::Delete, true) => PipelineStatus::Terminated,
            (Operation::Delete, false) => PipelineStatus::FailedTerminating,
            (Operation::Rebalance, true) => PipelineStatus::Rebalancing,
            (Operation::Create | Operation::Rebalance | Operation::Ready, false) => {
                PipelineStatus::Failed
            }
            (Operation::Unspecified, _) => PipelineStatus::Unknown,
        }
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Common accessors for event payloads.
pub trait EventPayload {
    /// The kind whose loop consumes this payload.
    const KIND: ResourceKind;

    /// Name of the resource the event refers to.
    fn resource(&self) -> &ResourceName;

    /// Generation of the desired state the event was produced for.
    fn generation(&self) -> u64;
}

/// One reporter's status for one resource in one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateEvent<S> {
    /// Resource the status is for.
    pub resource: ResourceName,

    /// Reporter that observed the status.
    pub reporter: ReporterId,

    /// Iteration (vector clock value) the originating operation was stamped with.
    pub iteration: u64,

    /// Generation of the resource's desired state when the operation was issued.
    pub generation: u64,

    /// Operation in progress.
    pub operation: Operation,

    /// The reporter's status.
    pub status: S,
}

impl<S: ResourceStatus> StatusUpdateEvent<S> {
    /// Build an event from a reporter's success flag for an operation.
    pub fn from_outcome(
        resource: ResourceName,
        reporter: ReporterId,
        iteration: u64,
        generation: u64,
        operation: Operation,
        success: bool,
    ) -> Self {
        Self {
            resource,
            reporter,
            iteration,
            generation,
            operation,
            status: S::from_outcome(operation, success),
        }
    }
}

impl<S: ResourceStatus> EventPayload for StatusUpdateEvent<S> {
    const KIND: ResourceKind = S::KIND;

    fn resource(&self) -> &ResourceName {
        &self.resource
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

/// Status update for a model from one serving replica.
pub type ModelStatusEvent = StatusUpdateEvent<ModelState>;

/// Status update for a pipeline from one dataflow engine.
pub type PipelineStatusEvent = StatusUpdateEvent<PipelineStatus>;

/// Replica counts for a server, reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatusEvent {
    pub server: ResourceName,
    pub generation: u64,
    pub available_replicas: u32,
    pub expected_replicas: u32,
    pub loaded_model_replicas: u32,
}

impl EventPayload for ServerStatusEvent {
    const KIND: ResourceKind = ResourceKind::Server;

    fn resource(&self) -> &ResourceName {
        &self.server
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

/// Experiment activity, reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentStatusEvent {
    pub experiment: ResourceName,
    pub generation: u64,
    pub active: bool,
    #[serde(default)]
    pub candidates_ready: bool,
    #[serde(default)]
    pub mirror_ready: bool,
    #[serde(default)]
    pub description: String,
}

impl EventPayload for ExperimentStatusEvent {
    const KIND: ResourceKind = ResourceKind::Experiment;

    fn resource(&self) -> &ResourceName {
        &self.experiment
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_kind_event_type_lookup() {
        for kind in ResourceKind::ALL {
            assert_eq!(
                ResourceKind::from_event_type(kind.status_event_type()),
                Some(kind)
            );
        }
        assert_eq!(ResourceKind::from_event_type("model.deleted"), None);
    }

    #[test]
    fn test_unknown_operation_decodes_as_unspecified() {
        let op: Operation = serde_json::from_str("\"migrate\"").unwrap();
        assert_eq!(op, Operation::Unspecified);

        let op: Operation = serde_json::from_str("\"rebalance\"").unwrap();
        assert_eq!(op, Operation::Rebalance);
    }

    #[rstest]
    #[case(Operation::Create, true, PipelineStatus::Ready)]
    #[case(Operation::Create, false, PipelineStatus::Failed)]
    #[case(Operation::Delete, true, PipelineStatus::Terminated)]
    #[case(Operation::Delete, false, PipelineStatus::FailedTerminating)]
    #[case(Operation::Rebalance, true, PipelineStatus::Rebalancing)]
    #[case(Operation::Rebalance, false, PipelineStatus::Failed)]
    #[case(Operation::Ready, true, PipelineStatus::Ready)]
    #[case(Operation::Unspecified, true, PipelineStatus::Unknown)]
    fn test_pipeline_outcome_mapping(
        #[case] op: Operation,
        #[case] success: bool,
        #[case] expected: PipelineStatus,
    ) {
        assert_eq!(PipelineStatus::from_outcome(op, success), expected);
    }

    #[rstest]
    #[case(Operation::Create, true, ModelState::Available)]
    #[case(Operation::Create, false, ModelState::Failed)]
    #[case(Operation::Delete, true, ModelState::Terminated)]
    #[case(Operation::Delete, false, ModelState::TerminateFailed)]
    #[case(Operation::Rebalance, true, ModelState::Unknown)]
    #[case(Operation::Ready, false, ModelState::Unknown)]
    #[case(Operation::Unspecified, false, ModelState::Unknown)]
    fn test_model_outcome_mapping(
        #[case] op: Operation,
        #[case] success: bool,
        #[case] expected: ModelState,
    ) {
        assert_eq!(ModelState::from_outcome(op, success), expected);
    }

    #[test]
    fn test_status_event_json_shape() {
        let json = serde_json::json!({
            "resource": "p1",
            "reporter": "dataflow-engine-0",
            "iteration": 3,
            "generation": 2,
            "operation": "create",
            "status": "ready"
        });
        let event: PipelineStatusEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.resource.as_str(), "p1");
        assert_eq!(event.iteration, 3);
        assert_eq!(event.status, PipelineStatus::Ready);
        assert_eq!(<PipelineStatusEvent as EventPayload>::KIND, ResourceKind::Pipeline);
    }

    #[test]
    fn test_status_event_rejects_invalid_reporter() {
        let json = serde_json::json!({
            "resource": "m1",
            "reporter": "",
            "iteration": 1,
            "generation": 1,
            "operation": "create",
            "status": "available"
        });
        assert!(serde_json::from_value::<ModelStatusEvent>(json).is_err());
    }

    #[test]
    fn test_experiment_event_defaults() {
        let json = serde_json::json!({
            "experiment": "ab-test",
            "generation": 4,
            "active": true
        });
        let event: ExperimentStatusEvent = serde_json::from_value(json).unwrap();
        assert!(event.active);
        assert!(!event.candidates_ready);
        assert!(event.description.is_empty());
    }
}

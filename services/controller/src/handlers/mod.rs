//! Per-kind status event handlers.
//!
//! A handler receives one decoded payload at a time from its kind's event
//! loop. Handlers never fail the loop: every path ends in a
//! [`HandleOutcome`] that the loop counts and moves past.

mod aggregating;
mod experiment;
mod server;

use async_trait::async_trait;
use mlplane_events::EventPayload;
use serde::de::DeserializeOwned;

pub use aggregating::{AggregatingHandler, ModelHandler, PipelineHandler};
pub use experiment::ExperimentHandler;
pub use server::ServerHandler;

/// Finalizer held on models until every replica confirmed the unload.
pub const MODEL_FINALIZER: &str = "mlplane.io/model-finalizer";

/// Finalizer held on pipelines until every dataflow engine confirmed teardown.
pub const PIPELINE_FINALIZER: &str = "mlplane.io/pipeline-finalizer";

/// Finalizer held on experiments until the scheduler reports them inactive.
pub const EXPERIMENT_FINALIZER: &str = "mlplane.io/experiment-finalizer";

/// Why an event was dropped without a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Iteration mismatch, unknown reporter, or an untracked resource.
    Outdated,
    /// The resource does not exist.
    NotFound,
    /// The resource moved to another generation.
    StaleGeneration,
}

/// What handling one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// A new status was written.
    Committed,
    /// The status was already up to date.
    Unchanged,
    /// The status was written (or already current) and the finalizer released.
    Released,
    Dropped(DropReason),
    /// The write gave up; a later event will retry it.
    Failed,
}

/// Consumes one kind's decoded status events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// The payload this handler's loop decodes.
    type Payload: EventPayload + DeserializeOwned + Send + 'static;

    /// Handler name for logging.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: Self::Payload) -> HandleOutcome;
}

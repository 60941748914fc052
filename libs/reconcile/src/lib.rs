//! Status reconciliation primitives.
//!
//! This library turns per-reporter status observations into one aggregate
//! status per resource. Key concepts:
//!
//! - **Iteration**: a per-resource counter advanced once per dispatched
//!   operation. Observations stamped with any other iteration are stale.
//! - **Reporter set**: the replicas an operation was issued against, fixed
//!   when the iteration starts.
//! - **Derivation policy**: a pure function from the operation in flight and
//!   the per-status counts to an aggregate status and a summary.
//!
//! # Invariants
//!
//! - Observations are accepted only for the live iteration and a reporter in
//!   its expected set
//! - Derivation depends only on counts, never on arrival order
//! - Independent resources never contend on a shared lock

use std::time::Duration;

use mlplane_id::{ReporterId, ResourceName};
use thiserror::Error;

mod aggregator;
mod clock;
mod policy;
mod retry;

pub use aggregator::{StatusAggregator, StatusCounts};
pub use clock::{Clock, TokioClock};
pub use policy::{Aggregate, DerivationPolicy, ModelPolicy, PipelinePolicy};
pub use retry::{BackoffPolicy, RetryPolicy, RetryTracker};

/// Aggregator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregatorError {
    /// No iteration has been started for the resource.
    #[error("resource {0} is not tracked")]
    Untracked(ResourceName),

    /// The reporter is not part of the live iteration's expected set.
    #[error("reporter {reporter} is not expected for {resource}")]
    UnknownReporter {
        resource: ResourceName,
        reporter: ReporterId,
    },
}

/// Default retry limit for failed create/delete operations.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window for failed create/delete operations.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

//! Observed status written onto resources.

use mlplane_events::ResourceStatus;

/// Aggregate status of a model or pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateStatus<S> {
    pub state: S,
    pub reason: String,

    /// Reporters in the iteration the status was derived from.
    pub reporters: usize,

    /// Generation the status was derived for.
    pub observed_generation: u64,
}

impl<S: ResourceStatus> Default for AggregateStatus<S> {
    fn default() -> Self {
        Self {
            state: S::UNKNOWN,
            reason: String::new(),
            reporters: 0,
            observed_generation: 0,
        }
    }
}

/// Replica counts of an inference server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub available_replicas: u32,
    pub expected_replicas: u32,
    pub loaded_model_replicas: u32,
    pub observed_generation: u64,
}

impl ServerStatus {
    pub fn is_ready(&self) -> bool {
        self.expected_replicas > 0 && self.available_replicas >= self.expected_replicas
    }
}

/// Conditions of an experiment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentStatus {
    pub active: bool,
    pub candidates_ready: bool,
    pub mirror_ready: bool,
    pub reason: String,
    pub observed_generation: u64,
}

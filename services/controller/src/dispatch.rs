//! Operation dispatch: starts an iteration and fans the command out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use mlplane_events::{Operation, ResourceKind, ResourceStatus};
use mlplane_id::{ReporterId, ResourceName};
use mlplane_reconcile::StatusAggregator;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Dispatch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The operation had nobody to run on.
    #[error("no reporters to dispatch {operation} for {resource}")]
    NoReporters {
        resource: ResourceName,
        operation: Operation,
    },

    /// The sink has no route to the reporter.
    #[error("unknown reporter: {0}")]
    UnknownReporter(ReporterId),

    /// The reporter's command channel is closed.
    #[error("command channel closed for reporter {0}")]
    ChannelClosed(ReporterId),
}

/// Command sent to a reporter, stamped with the iteration it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCommand {
    pub kind: ResourceKind,
    pub resource: ResourceName,
    pub iteration: u64,
    pub generation: u64,
    pub operation: Operation,
}

/// Delivery path from the controller to reporters.
#[async_trait]
pub trait CommandSink: Send + Sync + 'static {
    async fn send(&self, reporter: &ReporterId, command: OperationCommand) -> Result<(), DispatchError>;
}

/// In-process sink with one bounded channel per reporter.
#[derive(Debug, Default)]
pub struct ChannelCommandSink {
    senders: RwLock<BTreeMap<ReporterId, mpsc::Sender<OperationCommand>>>,
}

impl ChannelCommandSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a command channel for `reporter`, replacing any previous one.
    pub async fn register(&self, reporter: ReporterId, capacity: usize) -> mpsc::Receiver<OperationCommand> {
        let (tx, rx) = mpsc::channel(capacity);
        self.senders.write().await.insert(reporter, tx);
        rx
    }
}

#[async_trait]
impl CommandSink for ChannelCommandSink {
    async fn send(&self, reporter: &ReporterId, command: OperationCommand) -> Result<(), DispatchError> {
        let sender = self
            .senders
            .read()
            .await
            .get(reporter)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownReporter(reporter.clone()))?;

        sender
            .send(command)
            .await
            .map_err(|_| DispatchError::ChannelClosed(reporter.clone()))
    }
}

/// What a dispatch reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub iteration: u64,
    pub delivered: Vec<ReporterId>,
    pub failed: Vec<(ReporterId, DispatchError)>,
}

/// Issues operations for one aggregated kind.
pub struct Dispatcher<S: ResourceStatus> {
    aggregator: Arc<StatusAggregator<S>>,
    sink: Arc<dyn CommandSink>,
}

impl<S: ResourceStatus> Dispatcher<S> {
    pub fn new(aggregator: Arc<StatusAggregator<S>>, sink: Arc<dyn CommandSink>) -> Self {
        Self { aggregator, sink }
    }

    /// Start one iteration for `resource` over `reporters` and send each of
    /// them the stamped command.
    ///
    /// Delivery failures are reported per reporter; a reporter that never
    /// received the command stays `Unknown` in the iteration.
    pub async fn dispatch(
        &self,
        resource: &ResourceName,
        generation: u64,
        operation: Operation,
        reporters: Vec<ReporterId>,
    ) -> Result<DispatchReport, DispatchError> {
        let reporters: BTreeSet<ReporterId> = reporters.into_iter().collect();
        if reporters.is_empty() {
            return Err(DispatchError::NoReporters {
                resource: resource.clone(),
                operation,
            });
        }

        let iteration = self
            .aggregator
            .start_iteration(resource, reporters.iter().cloned(), S::UNKNOWN);

        let command = OperationCommand {
            kind: S::KIND,
            resource: resource.clone(),
            iteration,
            generation,
            operation,
        };

        let sends = reporters.iter().map(|reporter| {
            let command = command.clone();
            async move { (reporter.clone(), self.sink.send(reporter, command).await) }
        });

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (reporter, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered.push(reporter),
                Err(err) => {
                    warn!(resource = %resource, reporter = %reporter, error = %err, "command not delivered");
                    failed.push((reporter, err));
                }
            }
        }

        info!(
            kind = %S::KIND,
            resource = %resource,
            %operation,
            iteration,
            generation,
            delivered = delivered.len(),
            failed = failed.len(),
            "dispatched operation"
        );

        Ok(DispatchReport {
            iteration,
            delivered,
            failed,
        })
    }
}

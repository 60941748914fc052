//! Per-kind event loop.
//!
//! The loop pulls raw messages from an [`EventSource`], decodes the envelope
//! for its handler's payload type and applies it. Messages are handled one
//! at a time, in arrival order. A message that fails to decode is logged and
//! dropped; it never stops the loop.

use std::sync::Arc;

use mlplane_events::{decode_envelope, EventPayload};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::bus::EventSource;
use crate::handlers::{EventHandler, HandleOutcome};

/// Counters for one loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub malformed: u64,
    pub committed: u64,
    pub unchanged: u64,
    pub released: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl LoopStats {
    fn record(&mut self, outcome: HandleOutcome) {
        match outcome {
            HandleOutcome::Committed => self.committed += 1,
            HandleOutcome::Unchanged => self.unchanged += 1,
            HandleOutcome::Released => self.released += 1,
            HandleOutcome::Dropped(_) => self.dropped += 1,
            HandleOutcome::Failed => self.failed += 1,
        }
    }
}

/// Event loop for a single kind.
pub struct EventLoop<H> {
    handler: Arc<H>,
}

impl<H: EventHandler> EventLoop<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Run until the source ends or shutdown is signalled.
    #[instrument(skip_all, fields(handler = self.handler.name()))]
    pub async fn run<S: EventSource>(&self, mut source: S, mut shutdown: watch::Receiver<bool>) -> LoopStats {
        info!("Starting event loop");
        let mut stats = LoopStats::default();

        loop {
            let message = tokio::select! {
                message = source.next_message() => message,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping event loop");
                        break;
                    }
                    continue;
                }
            };

            match message {
                Some(Ok(bytes)) => {
                    stats.received += 1;
                    match self.process(&bytes).await {
                        Some(outcome) => stats.record(outcome),
                        None => stats.malformed += 1,
                    }
                }
                Some(Err(err)) => {
                    error!(error = %err, "Event source failed");
                    break;
                }
                None => {
                    debug!("Event source exhausted");
                    break;
                }
            }
        }

        info!(
            received = stats.received,
            committed = stats.committed,
            unchanged = stats.unchanged,
            released = stats.released,
            dropped = stats.dropped,
            malformed = stats.malformed,
            failed = stats.failed,
            "Event loop stopped"
        );
        stats
    }

    /// Decode and handle one message. Returns `None` if it was malformed.
    pub async fn process(&self, bytes: &[u8]) -> Option<HandleOutcome> {
        let envelope = match decode_envelope::<H::Payload>(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, handler = self.handler.name(), "Dropping malformed event");
                return None;
            }
        };

        let span = info_span!(
            "status_event",
            kind = %<H::Payload as EventPayload>::KIND,
            event_id = %envelope.event_id,
            resource = %envelope.payload.resource(),
            generation = envelope.payload.generation(),
        );
        let outcome = self.handler.handle(envelope.payload).instrument(span).await;
        debug!(handler = self.handler.name(), ?outcome, "Event handled");
        Some(outcome)
    }
}

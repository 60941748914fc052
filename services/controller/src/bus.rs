//! Event sources and routing.
//!
//! Each event loop consumes one kind. A mixed stream (a file of
//! newline-delimited envelopes, for example) goes through a [`KindRouter`]
//! that reads the envelope header and forwards the raw bytes to the channel
//! registered for that kind.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use mlplane_events::{RawEnvelope, ResourceKind};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Split};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Source read errors.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A stream of raw event messages.
///
/// `None` means the stream has ended.
#[async_trait]
pub trait EventSource: Send {
    async fn next_message(&mut self) -> Option<Result<Bytes, SourceError>>;
}

#[async_trait]
impl EventSource for mpsc::Receiver<Bytes> {
    async fn next_message(&mut self) -> Option<Result<Bytes, SourceError>> {
        self.recv().await.map(Ok)
    }
}

/// Newline-delimited messages from any buffered reader. Blank lines are skipped.
pub struct NdjsonSource<R> {
    lines: Split<R>,
}

impl<R: AsyncBufRead + Unpin + Send> NdjsonSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.split(b'\n'),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for NdjsonSource<R> {
    async fn next_message(&mut self) -> Option<Result<Bytes, SourceError>> {
        loop {
            match self.lines.next_segment().await {
                Ok(Some(mut line)) => {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some(Ok(Bytes::from(line)));
                }
                Ok(None) => return None,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

// =============================================================================
// Kind Router
// =============================================================================

/// Counters from a router run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub malformed: u64,
    pub unrouted: u64,
}

/// Fans a mixed stream out to one channel per kind.
#[derive(Debug, Default)]
pub struct KindRouter {
    routes: HashMap<ResourceKind, mpsc::Sender<Bytes>>,
}

impl KindRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send messages of `kind` to `sender`.
    pub fn route(mut self, kind: ResourceKind, sender: mpsc::Sender<Bytes>) -> Self {
        self.routes.insert(kind, sender);
        self
    }

    /// Route until the source ends, fails, or shutdown is signalled.
    ///
    /// The per-kind senders are dropped on return, which ends the
    /// downstream loops once they drain.
    #[instrument(skip_all, name = "kind_router")]
    pub async fn run<S: EventSource>(self, mut source: S, mut shutdown: watch::Receiver<bool>) -> RouterStats {
        let mut stats = RouterStats::default();

        loop {
            let message = tokio::select! {
                message = source.next_message() => message,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping router");
                        break;
                    }
                    continue;
                }
            };

            let bytes = match message {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    error!(error = %err, "Event source failed");
                    break;
                }
                None => {
                    info!("Event source exhausted");
                    break;
                }
            };

            let kind = match RawEnvelope::decode(&bytes) {
                Ok(envelope) => envelope.kind,
                Err(err) => {
                    error!(error = %err, "Dropping malformed event");
                    stats.malformed += 1;
                    continue;
                }
            };

            let Some(sender) = self.routes.get(&kind) else {
                warn!(%kind, "No event loop registered for kind");
                stats.unrouted += 1;
                continue;
            };

            if sender.send(bytes).await.is_err() {
                warn!(%kind, "Event loop for kind has stopped");
                stats.unrouted += 1;
                continue;
            }
            stats.routed += 1;
        }

        debug!(
            routed = stats.routed,
            malformed = stats.malformed,
            unrouted = stats.unrouted,
            "Router finished"
        );
        stats
    }
}

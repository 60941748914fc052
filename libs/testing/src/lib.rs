//! Shared fixtures for mlplane tests.
//!
//! Helpers here panic on bad input: they are only ever called with literals.

use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mlplane_events::{EventEnvelope, EventPayload, Operation, ResourceStatus, StatusUpdateEvent};
use mlplane_id::{ReporterId, ResourceName};
use mlplane_reconcile::Clock;
use serde::Serialize;

/// Parse a resource name literal.
pub fn name(s: &str) -> ResourceName {
    ResourceName::parse(s).expect("valid resource name")
}

/// Parse a reporter id literal.
pub fn reporter(s: &str) -> ReporterId {
    ReporterId::parse(s).expect("valid reporter id")
}

/// Parse a list of reporter id literals.
pub fn reporters(ids: &[&str]) -> Vec<ReporterId> {
    ids.iter().map(|s| reporter(s)).collect()
}

/// Status event for `resource` from `reporter`.
pub fn status_event<S: ResourceStatus>(
    resource: &str,
    reporter_id: &str,
    iteration: u64,
    generation: u64,
    operation: Operation,
    status: S,
) -> StatusUpdateEvent<S> {
    StatusUpdateEvent {
        resource: name(resource),
        reporter: reporter(reporter_id),
        iteration,
        generation,
        operation,
        status,
    }
}

/// Encode a payload as one NDJSON line, trailing newline included.
pub fn envelope_line<P: EventPayload + Serialize>(payload: P) -> Vec<u8> {
    let mut line = EventEnvelope::wrap(payload)
        .encode()
        .expect("envelope encodes");
    line.push(b'\n');
    line
}

// =============================================================================
// Manual Clock
// =============================================================================

/// Clock that only moves when slept on or advanced.
///
/// `sleep` returns immediately after advancing the clock, so retry loops run
/// without real delays and the total time they waited can be asserted.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock().expect("clock lock") += by;
    }

    /// Total time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().expect("clock lock")
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("clock lock").clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("clock lock").push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Tracing
// =============================================================================

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
///
/// Honors `RUST_LOG`; silent otherwise.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        let before = clock.now();
        clock.sleep(Duration::from_millis(10)).await;
        clock.sleep(Duration::from_millis(5)).await;

        assert_eq!(clock.now() - before, Duration::from_millis(15));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(5)]
        );
    }
}

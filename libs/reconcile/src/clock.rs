//! Injectable time source.

use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Time source for retry loops and pollers.
///
/// Deadlines are measured with `now` and waits go through `sleep`, so tests
/// can drive time by hand.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

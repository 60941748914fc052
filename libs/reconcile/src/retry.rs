//! Backoff, bounded retry and failure tracking.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;

// =============================================================================
// Backoff Policy
// =============================================================================

/// Delay schedule between conflict retries.
///
/// The step grows by `multiplier` per attempt up to `max`, plus up to
/// `jitter` of itself at random.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            multiplier: 1.0,
            max: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = delay.min(self.max.as_secs_f64());

        let spread = delay * self.jitter.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return Duration::from_secs_f64(delay);
        }
        Duration::from_secs_f64(delay + rand::rng().random_range(0.0..spread))
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bound on a single optimistic write.
///
/// A write gives up after `max_attempts` tries or once `deadline` has passed
/// since the first try, whichever comes first.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            deadline: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may start after `attempts` tries and `elapsed` time.
    pub fn allows(&self, attempts: u32, elapsed: Duration) -> bool {
        attempts < self.max_attempts && elapsed < self.deadline
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Strikes {
    count: u32,
    since: Instant,
}

/// Counts failures per key and says when to stop retrying.
///
/// Counting restarts for a key whose first failure is older than `window`.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    max_retries: u32,
    window: Duration,
    strikes: BTreeMap<K, Strikes>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            strikes: BTreeMap::new(),
        }
    }

    /// Count a failure of `key`. True once it failed more than `max_retries` times.
    pub fn record_failure(&mut self, key: &K) -> bool {
        self.record_failure_at(key, Instant::now())
    }

    pub fn record_failure_at(&mut self, key: &K, now: Instant) -> bool {
        let window = self.window;
        let strikes = self
            .strikes
            .entry(key.clone())
            .and_modify(|s| {
                if now.duration_since(s.since) > window {
                    *s = Strikes { count: 0, since: now };
                }
            })
            .or_insert(Strikes { count: 0, since: now });

        strikes.count += 1;
        strikes.count > self.max_retries
    }

    /// Failures of `key` in its current window.
    pub fn attempts(&self, key: &K) -> u32 {
        self.strikes.get(key).map_or(0, |s| s.count)
    }

    pub fn clear(&mut self, key: &K) {
        self.strikes.remove(key);
    }

    /// Forget keys whose window has passed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.strikes.retain(|_, s| now.duration_since(s.since) <= window);
    }

    pub fn len(&self) -> usize {
        self.strikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strikes.is_empty()
    }
}

//! Per-resource iteration clock and reporter status table.

use std::collections::BTreeMap;

use dashmap::DashMap;
use mlplane_events::ResourceStatus;
use mlplane_id::{ReporterId, ResourceName};
use tracing::debug;

use crate::AggregatorError;

/// Count of reporters per status in one iteration.
///
/// Built from any sequence of statuses, so two sequences that are
/// permutations of each other produce equal counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCounts<S> {
    total: usize,
    by_status: BTreeMap<S, usize>,
}

impl<S: ResourceStatus> StatusCounts<S> {
    /// Number of reporters in the iteration.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of reporters currently at `status`.
    pub fn get(&self, status: S) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

impl<S: ResourceStatus> FromIterator<S> for StatusCounts<S> {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut total = 0;
        let mut by_status = BTreeMap::new();
        for status in iter {
            total += 1;
            *by_status.entry(status).or_insert(0) += 1;
        }
        Self { total, by_status }
    }
}

#[derive(Debug)]
struct Iteration<S> {
    clock: u64,
    statuses: BTreeMap<ReporterId, S>,
}

impl<S: ResourceStatus> Iteration<S> {
    fn counts(&self) -> StatusCounts<S> {
        self.statuses.values().copied().collect()
    }

    fn accepts(&self, iteration: u64, reporter: &ReporterId) -> bool {
        self.clock == iteration && self.statuses.contains_key(reporter)
    }
}

/// Tracks the live iteration and reporter statuses for every resource of one kind.
///
/// Each resource's entry lives in its own shard slot, so operations on one
/// resource are serialized while unrelated resources proceed concurrently.
/// No method holds a map guard across a call to another method.
#[derive(Debug)]
pub struct StatusAggregator<S> {
    entries: DashMap<ResourceName, Iteration<S>>,
}

impl<S: ResourceStatus> Default for StatusAggregator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ResourceStatus> StatusAggregator<S> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Begin a new iteration for `resource`.
    ///
    /// Advances the clock by one and resets every reporter in `reporters` to
    /// `initial`, discarding any reporter from the previous iteration.
    /// Returns the new iteration value.
    pub fn start_iteration<I>(&self, resource: &ResourceName, reporters: I, initial: S) -> u64
    where
        I: IntoIterator<Item = ReporterId>,
    {
        let statuses: BTreeMap<_, _> = reporters.into_iter().map(|r| (r, initial)).collect();
        let reporter_count = statuses.len();

        let mut entry = self
            .entries
            .entry(resource.clone())
            .or_insert_with(|| Iteration {
                clock: 0,
                statuses: BTreeMap::new(),
            });
        entry.clock += 1;
        entry.statuses = statuses;
        let clock = entry.clock;
        drop(entry);

        debug!(
            kind = %S::KIND,
            resource = %resource,
            iteration = clock,
            reporters = reporter_count,
            "started iteration"
        );
        clock
    }

    /// Overwrite `reporter`'s status in the live iteration.
    ///
    /// Rejects reporters outside the expected set and untracked resources
    /// without changing anything.
    pub fn record_status(
        &self,
        resource: &ResourceName,
        reporter: &ReporterId,
        status: S,
    ) -> Result<(), AggregatorError> {
        let mut entry = self
            .entries
            .get_mut(resource)
            .ok_or_else(|| AggregatorError::Untracked(resource.clone()))?;

        match entry.statuses.get_mut(reporter) {
            Some(slot) => {
                *slot = status;
                Ok(())
            }
            None => Err(AggregatorError::UnknownReporter {
                resource: resource.clone(),
                reporter: reporter.clone(),
            }),
        }
    }

    /// Returns true when an observation stamped with `iteration` from
    /// `reporter` must be discarded.
    pub fn is_outdated(&self, resource: &ResourceName, iteration: u64, reporter: &ReporterId) -> bool {
        match self.entries.get(resource) {
            Some(entry) => !entry.accepts(iteration, reporter),
            None => true,
        }
    }

    /// Check freshness and record in one step.
    ///
    /// Returns the post-write counts, or `None` when the observation is
    /// outdated. The check and the write happen under the same entry lock,
    /// so a concurrent `start_iteration` lands either before both or after both.
    pub fn record_if_current(
        &self,
        resource: &ResourceName,
        iteration: u64,
        reporter: &ReporterId,
        status: S,
    ) -> Option<StatusCounts<S>> {
        let mut entry = self.entries.get_mut(resource)?;
        if !entry.accepts(iteration, reporter) {
            return None;
        }
        entry.statuses.insert(reporter.clone(), status);
        Some(entry.counts())
    }

    /// Number of reporters at `status` in the live iteration.
    pub fn count_with_status(&self, resource: &ResourceName, status: S) -> usize {
        self.entries
            .get(resource)
            .map(|entry| entry.statuses.values().filter(|s| **s == status).count())
            .unwrap_or(0)
    }

    /// Counts for the live iteration, if the resource is tracked.
    pub fn counts(&self, resource: &ResourceName) -> Option<StatusCounts<S>> {
        self.entries.get(resource).map(|entry| entry.counts())
    }

    /// Reporters expected in the live iteration, in sorted order.
    pub fn reporters(&self, resource: &ResourceName) -> Vec<ReporterId> {
        self.entries
            .get(resource)
            .map(|entry| entry.statuses.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Current iteration, or 0 for a resource that is not tracked.
    pub fn current_iteration(&self, resource: &ResourceName) -> u64 {
        self.entries.get(resource).map(|entry| entry.clock).unwrap_or(0)
    }

    /// Forget everything about `resource`. Returns true if it was tracked.
    pub fn delete(&self, resource: &ResourceName) -> bool {
        let removed = self.entries.remove(resource).is_some();
        if removed {
            debug!(kind = %S::KIND, resource = %resource, "removed aggregator entry");
        }
        removed
    }

    /// All tracked resources, sorted.
    pub fn tracked(&self) -> Vec<ResourceName> {
        let mut names: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

use std::collections::HashSet;

use super::Upid;

/// Tracks the evolving process population across successive observations.
///
/// After `update(observed)`: `current` equals `observed`, `new_upids` holds
/// the upids that were not in the previous `current`, and `deleted_upids`
/// holds the upids of the previous `current` that vanished. The three sets
/// partition the observation history: a upid shows up in `new_upids` on
/// exactly one update and in `deleted_upids` on exactly one later update.
#[derive(Debug, Default)]
pub struct ProcTracker {
    upids: HashSet<Upid>,
    new_upids: HashSet<Upid>,
    deleted_upids: HashSet<Upid>,
}

impl ProcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current population with `observed`, recomputing the
    /// new/deleted deltas against the previous population.
    pub fn update(&mut self, observed: HashSet<Upid>) {
        self.new_upids = observed.difference(&self.upids).copied().collect();
        self.deleted_upids = self.upids.difference(&observed).copied().collect();
        self.upids = observed;
    }

    pub fn current(&self) -> &HashSet<Upid> {
        &self.upids
    }

    pub fn new_upids(&self) -> &HashSet<Upid> {
        &self.new_upids
    }

    pub fn deleted_upids(&self) -> &HashSet<Upid> {
        &self.deleted_upids
    }
}

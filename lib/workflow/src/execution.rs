//! Results of advancing a workflow.

use serde::{Deserialize, Serialize};
use workweave_core::WorkId;

/// What a single sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Iteration the sync ended on.
    pub num_run: u32,
    /// Works instantiated by this sync, nested workflows included.
    pub instantiated: Vec<WorkId>,
    /// Works moved to terminated.
    pub terminated: Vec<WorkId>,
    /// Terminated works whose conditions could not be evaluated yet.
    pub deferred: Vec<WorkId>,
    /// Set when the loop condition started a new iteration.
    pub new_iteration: Option<u32>,
}

impl SyncReport {
    #[must_use]
    pub fn new(num_run: u32) -> Self {
        Self {
            num_run,
            ..Self::default()
        }
    }

    /// Returns true if the sync changed anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.instantiated.is_empty()
            || !self.terminated.is_empty()
            || self.new_iteration.is_some()
    }

    /// Folds a nested workflow's report into this one.
    pub fn absorb(&mut self, nested: SyncReport) {
        self.instantiated.extend(nested.instantiated);
        self.terminated.extend(nested.terminated);
        self.deferred.extend(nested.deferred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferral_alone_is_not_a_change() {
        let mut report = SyncReport::new(1);
        report.deferred.push(WorkId::new());
        assert!(!report.has_changes());

        let mut outer = SyncReport::new(1);
        outer.absorb(report);
        assert_eq!(outer.deferred.len(), 1);
        assert!(!outer.has_changes());
    }

    #[test]
    fn new_iteration_is_a_change() {
        let mut report = SyncReport::new(2);
        report.new_iteration = Some(2);
        assert!(report.has_changes());
    }
}

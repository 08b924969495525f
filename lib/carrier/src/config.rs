//! Tunables of the processing lifecycle operations.

use crate::storage::RetryPolicy;
use std::time::Duration;
use workweave_workflow::processing::DEFAULT_OPERATION_QUIET_PERIOD_SECS;

/// Settings shared by every carrier operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierConfig {
    /// Largest content update batch committed in one transaction.
    pub max_updates_per_round: usize,
    /// Job ids per remote poll round-trip.
    pub poll_jobs_chunk_size: usize,
    pub operation_quiet_period_secs: i64,
    /// Reconciliation failures tolerated before a processing fails.
    pub max_update_retries: u32,
    /// Submission failures tolerated before a processing fails.
    pub max_polling_retries: u32,
    pub conflict_retry: RetryPolicy,
    pub cache_ttl_secs: u64,
    /// Concurrent remote polls per operation.
    pub fanout_limit: usize,
    pub fanout_progress_interval_secs: u64,
    /// Output collections wait for external bookkeeping before closing.
    pub require_ext_reconciled: bool,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            max_updates_per_round: 2000,
            poll_jobs_chunk_size: 2000,
            operation_quiet_period_secs: DEFAULT_OPERATION_QUIET_PERIOD_SECS,
            max_update_retries: 3,
            max_polling_retries: 5,
            conflict_retry: RetryPolicy::default(),
            cache_ttl_secs: 3600,
            fanout_limit: 8,
            fanout_progress_interval_secs: 30,
            require_ext_reconciled: true,
        }
    }
}

impl CarrierConfig {
    #[must_use]
    pub fn operation_quiet_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.operation_quiet_period_secs)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn fanout_progress_interval(&self) -> Duration {
        Duration::from_secs(self.fanout_progress_interval_secs)
    }
}

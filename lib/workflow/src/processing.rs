//! Processings: one remote submission attempt of a work.

use crate::status::{Locking, ProcessingStatus, WorkStatus};
use crate::work::{ErrorAnnotations, Work};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use workweave_core::{ProcessingId, RequestId, TransformId};

/// Default window during which a repeated operator action is suppressed.
pub const DEFAULT_OPERATION_QUIET_PERIOD_SECS: i64 = 120;

/// One remote submission representing a work's current attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processing {
    pub id: ProcessingId,
    pub request_id: RequestId,
    pub transform_id: TransformId,
    pub status: ProcessingStatus,
    pub substatus: ProcessingStatus,
    /// Remote task id.
    pub external_id: Option<String>,
    /// Task ids seen before the current one.
    #[serde(default)]
    pub old_external_ids: BTreeSet<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Anchor for the operation quiet period.
    pub operation_time: Option<DateTime<Utc>>,
    pub polling_retries: u32,
    pub update_retries: u32,
    #[serde(default)]
    pub errors: ErrorAnnotations,
    pub locking: Locking,
    pub locked_at: Option<DateTime<Utc>>,
    /// Snapshot of the owning work.
    pub work: Work,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Processing {
    /// Creates a `New` processing for a started work.
    #[must_use]
    pub fn new(request_id: RequestId, transform_id: TransformId, work: Work) -> Self {
        let now = Utc::now();
        Self {
            id: ProcessingId::new(),
            request_id,
            transform_id,
            status: WorkStatus::New,
            substatus: WorkStatus::New,
            external_id: None,
            old_external_ids: BTreeSet::new(),
            submitted_at: None,
            operation_time: None,
            polling_retries: 0,
            update_retries: 0,
            errors: ErrorAnnotations::default(),
            locking: Locking::Idle,
            locked_at: None,
            work,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal status with no pending operator intent.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.status.is_terminal() && !self.substatus.is_operator_intent()
    }

    /// Returns true if an operator request is waiting to be actuated.
    #[must_use]
    pub fn has_pending_operation(&self) -> bool {
        self.substatus.is_operator_intent() || self.substatus.is_in_operation()
    }

    /// Returns true within `quiet` of the last operator action.
    #[must_use]
    pub fn in_operation_quiet_period(&self, now: DateTime<Utc>, quiet: Duration) -> bool {
        self.operation_time.is_some_and(|at| at + quiet > now)
    }

    /// Sets status and substatus together.
    pub fn set_status(&mut self, status: ProcessingStatus) {
        self.status = status;
        self.substatus = status;
        self.updated_at = Utc::now();
    }

    /// Records a successful submission.
    pub fn mark_submitted(&mut self, external_id: String, now: DateTime<Utc>) {
        self.set_external_id(external_id);
        self.submitted_at = Some(now);
        self.polling_retries = 0;
        self.set_status(WorkStatus::Submitted);
        self.work.workload_id.clone_from(&self.external_id);
    }

    /// Replaces the task id, remembering the previous one.
    pub fn set_external_id(&mut self, external_id: String) {
        if let Some(previous) = self.external_id.take()
            && previous != external_id
        {
            self.old_external_ids.insert(previous);
        }
        self.external_id = Some(external_id);
    }

    /// Stamps an operator request.
    pub fn request_operation(&mut self, intent: ProcessingStatus, now: DateTime<Utc>) {
        self.substatus = intent;
        self.operation_time = Some(now);
        self.updated_at = now;
    }

    /// Stamps the operation time after an actuation attempt.
    pub fn touch_operation(&mut self, now: DateTime<Utc>) {
        self.operation_time = Some(now);
        self.updated_at = now;
    }
}

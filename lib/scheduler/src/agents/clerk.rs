//! Advances workflows and starts processings for the works they
//! instantiate.
//!
//! A request round folds what its processings report back into the
//! workflow, applies any operator request, syncs the workflow and creates
//! a processing for every newly instantiated work.

use super::claim_one;
use crate::agent::{Agent, AgentKind};
use crate::error::AgentError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use workweave_carrier::storage::retry_on_conflict;
use workweave_carrier::{Carrier, ProcessingFilter, RequestRecord};
use workweave_core::{ProcessingId, RequestId, Result, TransformId, WorkId};
use workweave_workflow::{Processing, WorkStatus, Workflow};

/// Request statuses the clerk works on.
const CLAIMABLE: [WorkStatus; 8] = [
    WorkStatus::New,
    WorkStatus::Transforming,
    WorkStatus::ToCancel,
    WorkStatus::ToSuspend,
    WorkStatus::ToExpire,
    WorkStatus::ToResume,
    WorkStatus::ToFinish,
    WorkStatus::ToForceFinish,
];

pub struct Clerk {
    carrier: Arc<Carrier>,
    lease: ChronoDuration,
    allow_dependency_cycles: bool,
}

impl Clerk {
    #[must_use]
    pub fn new(carrier: Arc<Carrier>, lease: ChronoDuration) -> Self {
        Self {
            carrier,
            lease,
            allow_dependency_cycles: false,
        }
    }

    /// Lets every claimed workflow fall back to a warning on dependency
    /// cycles.
    #[must_use]
    pub fn with_dependency_cycles_allowed(mut self, allow: bool) -> Self {
        self.allow_dependency_cycles = allow;
        self
    }

    /// Sets `intent` on a processing under its lock.
    ///
    /// Returns false if another agent holds the processing.
    async fn mark(
        &self,
        processing_id: ProcessingId,
        intent: WorkStatus,
    ) -> Result<bool, AgentError> {
        let filter = ProcessingFilter::id(processing_id);
        let Some(mut processing) = claim_one(&self.carrier, filter, self.lease).await? else {
            return Ok(false);
        };
        processing.substatus = intent;
        processing.updated_at = Utc::now();
        let storage = self.carrier.storage();
        let saved = retry_on_conflict(
            self.carrier.config().conflict_retry,
            "update_processing",
            || storage.update_processing(&processing),
        )
        .await;
        storage
            .release_processing(processing_id)
            .await
            .map_err(AgentError::from)?;
        saved.map_err(AgentError::from)?;
        Ok(true)
    }

    /// Passes a request's operator intent to its processings.
    ///
    /// Returns false while some processing could not be marked.
    async fn propagate_intent(
        &self,
        intent: WorkStatus,
        processings: &[Processing],
    ) -> Result<bool, AgentError> {
        let mut complete = true;
        for processing in processings.iter().filter(|p| targets(p, intent)) {
            if self.mark(processing.id, intent).await? {
                info!(processing_id = %processing.id, intent = %intent, "operator request passed on");
            } else {
                debug!(processing_id = %processing.id, "processing busy; intent retried next round");
                complete = false;
            }
        }
        Ok(complete)
    }

    /// Starts a newly instantiated work, reusing a processing created by
    /// an interrupted earlier round.
    async fn start(
        &self,
        request_id: RequestId,
        workflow: &mut Workflow,
        work_id: WorkId,
        processings: &[Processing],
    ) -> Result<(), AgentError> {
        let Some(work) = workflow.work(work_id) else {
            return Ok(());
        };
        let mut work = work.clone();

        if let Some(outcome) = unstarted_outcome(work.substatus) {
            // Nothing was ever submitted; the request settles locally.
            workflow
                .start_work(work_id, TransformId::new())
                .map_err(AgentError::from)?;
            if let Some(work) = workflow.work_mut(work_id) {
                work.set_status(outcome);
            }
            info!(work = %work.name, status = %outcome, "closed work before it started");
            return Ok(());
        }

        let existing = processings
            .iter()
            .find(|p| p.work.id == work_id && p.work.num_run == work.num_run);
        let transform_id = match existing {
            Some(processing) => {
                debug!(processing_id = %processing.id, "reusing processing");
                work.start(processing.transform_id);
                if !work.processings.contains(&processing.id) {
                    work.processings.push(processing.id);
                }
                processing.transform_id
            }
            None => {
                let processing = self
                    .carrier
                    .create_processing(request_id, &mut work)
                    .await
                    .map_err(|e| AgentError::carrier("create_processing", e))?;
                info!(work = %work.name, processing_id = %processing.id, "started work");
                processing.transform_id
            }
        };
        workflow
            .start_work(work_id, transform_id)
            .map_err(AgentError::from)?;
        workflow
            .update_work(work_id, &work)
            .map_err(AgentError::from)?;
        Ok(())
    }
}

/// Status a work takes when an operator request reaches it before it
/// started.
fn unstarted_outcome(substatus: WorkStatus) -> Option<WorkStatus> {
    match substatus {
        WorkStatus::ToCancel => Some(WorkStatus::Cancelled),
        WorkStatus::ToSuspend => Some(WorkStatus::Suspended),
        WorkStatus::ToExpire => Some(WorkStatus::Expired),
        WorkStatus::ToFinish | WorkStatus::ToForceFinish => Some(WorkStatus::Finished),
        _ => None,
    }
}

/// Whether a request intent applies to a processing.
fn targets(processing: &Processing, intent: WorkStatus) -> bool {
    if processing.has_pending_operation() {
        return false;
    }
    match intent {
        WorkStatus::ToResume => {
            processing.is_terminated() && processing.status != WorkStatus::Finished
        }
        _ => !processing.is_terminated(),
    }
}

/// Applies a request intent to the workflow itself.
fn apply_intent(workflow: &mut Workflow, intent: WorkStatus) {
    match intent {
        WorkStatus::ToCancel => workflow.cancel(),
        WorkStatus::ToSuspend => workflow.suspend(),
        WorkStatus::ToExpire => workflow.expire(),
        WorkStatus::ToResume => workflow.resume(),
        WorkStatus::ToFinish | WorkStatus::ToForceFinish => {
            for work_id in workflow.get_current_works() {
                if let Some(work) = workflow.work_mut(work_id) {
                    if intent == WorkStatus::ToFinish {
                        work.finish();
                    } else {
                        work.force_finish();
                    }
                }
            }
        }
        _ => {}
    }
}

/// Copies what settled processings report into the works of the current
/// iteration.
fn merge_processings(
    workflow: &mut Workflow,
    processings: &[Processing],
) -> Result<usize, AgentError> {
    let mut merged = 0;
    for processing in processings {
        // Snapshots change until the operator request settles.
        if processing.has_pending_operation() {
            continue;
        }
        let work_id = processing.work.id;
        let current = workflow
            .work(work_id)
            .is_some_and(|w| w.num_run == processing.work.num_run);
        if !current {
            // Left over from an earlier iteration.
            continue;
        }
        workflow
            .update_work(work_id, &processing.work)
            .map_err(AgentError::from)?;
        merged += 1;
    }
    Ok(merged)
}

#[async_trait]
impl Agent for Clerk {
    type Item = RequestRecord;

    fn kind(&self) -> AgentKind {
        AgentKind::Clerk
    }

    async fn claim(&self, limit: usize) -> Result<Vec<RequestRecord>, AgentError> {
        let requests = self
            .carrier
            .storage()
            .claim_requests(&CLAIMABLE, limit, self.lease)
            .await
            .map_err(AgentError::from)?;
        Ok(requests)
    }

    #[instrument(skip(self, item), fields(request_id = %item.id, status = %item.status))]
    async fn process(&self, item: &RequestRecord) -> Result<(), AgentError> {
        let mut request = item.clone();
        if self.allow_dependency_cycles {
            request.workflow.template.allow_dependency_cycles = true;
        }
        let storage = self.carrier.storage();
        let processings = storage
            .get_processings(&ProcessingFilter::request(request.id))
            .await
            .map_err(AgentError::from)?;
        let merged = merge_processings(&mut request.workflow, &processings)?;
        debug!(processings = processings.len(), merged, "merged processing reports");

        let intent = request.status.is_operator_intent().then_some(request.status);
        let mut intent_pending = false;
        if let Some(intent) = intent {
            apply_intent(&mut request.workflow, intent);
            intent_pending = !self.propagate_intent(intent, &processings).await?;
            info!(intent = %intent, "applied operator request");
        }

        let mut broken = false;
        let new_works = match request.workflow.get_new_works() {
            Ok(works) => works,
            Err(e) => {
                // Template errors do not heal by retrying.
                error!(error = %e, workflow = %request.workflow.name(), "workflow cannot advance");
                broken = true;
                Vec::new()
            }
        };
        for work_id in new_works {
            self.start(request.id, &mut request.workflow, work_id, &processings)
                .await?;
        }

        request.status = if broken {
            WorkStatus::Failed
        } else if request.workflow.is_terminated() {
            request.workflow.get_status()
        } else if intent_pending {
            request.status
        } else {
            WorkStatus::Transforming
        };
        request.updated_at = Utc::now();
        retry_on_conflict(
            self.carrier.config().conflict_retry,
            "update_request",
            || storage.update_request(&request),
        )
        .await
        .map_err(AgentError::from)?;
        if request.status.is_terminal() {
            info!(status = %request.status, "request terminated");
        }
        Ok(())
    }

    async fn release(&self, item: &RequestRecord) -> Result<(), AgentError> {
        self.carrier
            .storage()
            .release_request(item.id)
            .await
            .map_err(AgentError::from)?;
        Ok(())
    }
}

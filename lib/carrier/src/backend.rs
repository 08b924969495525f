//! Execution backends: how a work kind is submitted and how the remote
//! service's statuses read for it.

use crate::content::ContentStatus;
use crate::error::CarrierError;
use crate::io_map::InputOutputMaps;
use crate::remote::{JobInfo, TaskParams};
use std::collections::BTreeMap;
use std::sync::Arc;
use workweave_workflow::{ProcessingStatus, Work, WorkStatus};

/// Job substatus marking a fine-grained job whose events all completed.
pub const FINE_GRAINED_DONE: &str = "fg_done";

/// Capabilities of one kind of remote execution.
pub trait ExecutionBackend: Send + Sync {
    /// The `work_kind` tag this backend serves.
    fn work_kind(&self) -> &str;

    /// Jobs carry per-event records that refine their status.
    fn is_event_service(&self) -> bool {
        false
    }

    fn build_submission_params(&self, work: &Work, maps: &InputOutputMaps) -> TaskParams;

    fn map_task_status(&self, status: &str) -> ProcessingStatus {
        WorkStatus::from_task_status(status)
    }

    fn map_job_status(&self, job: &JobInfo, work: &Work) -> ContentStatus;
}

fn attempts_exhausted(job: &JobInfo, work: &Work) -> bool {
    job.attempt_nr >= job.max_attempt && job.attempt_nr >= work.max_attempts
}

fn batch_job_status(job: &JobInfo, work: &Work) -> ContentStatus {
    match job.status.to_ascii_lowercase().as_str() {
        "finished" | "merging" => ContentStatus::Available,
        "failed" | "closed" | "cancelled" | "lost" | "broken" | "missing" => {
            if attempts_exhausted(job, work) {
                ContentStatus::FinalFailed
            } else {
                ContentStatus::Failed
            }
        }
        "activated" => ContentStatus::Activated,
        _ => ContentStatus::Processing,
    }
}

fn base_params(work: &Work, maps: &InputOutputMaps) -> TaskParams {
    let inputs = maps
        .iter()
        .flat_map(|(_, map)| map.inputs.iter().map(|c| c.name.clone()))
        .collect();
    TaskParams {
        name: work.name.clone(),
        work_kind: work.work_kind.clone(),
        max_attempts: work.max_attempts,
        parent_workload_id: work.parent_workload_id.clone(),
        inputs,
        parameters: work.parameters.clone(),
    }
}

/// One job per input.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchBackend;

impl ExecutionBackend for BatchBackend {
    fn work_kind(&self) -> &str {
        "batch"
    }

    fn build_submission_params(&self, work: &Work, maps: &InputOutputMaps) -> TaskParams {
        base_params(work, maps)
    }

    fn map_job_status(&self, job: &JobInfo, work: &Work) -> ContentStatus {
        batch_job_status(job, work)
    }
}

/// Jobs bundle several events that share one external id.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventServiceBackend;

impl ExecutionBackend for EventServiceBackend {
    fn work_kind(&self) -> &str {
        "event_service"
    }

    fn is_event_service(&self) -> bool {
        true
    }

    fn build_submission_params(&self, work: &Work, maps: &InputOutputMaps) -> TaskParams {
        let mut params = base_params(work, maps);
        params
            .parameters
            .insert("fine_grained".to_string(), serde_json::Value::Bool(true));
        params
    }

    fn map_job_status(&self, job: &JobInfo, work: &Work) -> ContentStatus {
        match job.status.to_ascii_lowercase().as_str() {
            "finished" | "merging" if job.substatus.as_deref() == Some(FINE_GRAINED_DONE) => {
                ContentStatus::Available
            }
            "finished" | "merging" => {
                if attempts_exhausted(job, work) {
                    ContentStatus::FinalSubAvailable
                } else {
                    ContentStatus::SubAvailable
                }
            }
            _ => batch_job_status(job, work),
        }
    }
}

/// Backends keyed by work kind.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the batch and event-service backends.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BatchBackend));
        registry.register(Arc::new(EventServiceBackend));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn ExecutionBackend>) {
        self.backends
            .insert(backend.work_kind().to_string(), backend);
    }

    #[must_use]
    pub fn get(&self, work_kind: &str) -> Option<Arc<dyn ExecutionBackend>> {
        self.backends.get(work_kind).cloned()
    }

    /// Looks up the backend for a work.
    ///
    /// # Errors
    ///
    /// Returns `CarrierError::UnknownBackend` if no backend serves the work's kind.
    pub fn for_work(&self, work: &Work) -> Result<Arc<dyn ExecutionBackend>, CarrierError> {
        self.get(&work.work_kind)
            .ok_or_else(|| CarrierError::UnknownBackend {
                work_kind: work.work_kind.clone(),
            })
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: &str, substatus: Option<&str>, attempt_nr: u32) -> JobInfo {
        JobInfo {
            job_id: "1".to_string(),
            status: status.to_string(),
            substatus: substatus.map(str::to_string),
            attempt_nr,
            max_attempt: 3,
            input_name: "f1".to_string(),
        }
    }

    #[test]
    fn batch_failures_become_final_once_attempts_run_out() {
        let work = Work::new("a");
        let backend = BatchBackend;
        assert_eq!(
            backend.map_job_status(&job("failed", None, 1), &work),
            ContentStatus::Failed
        );
        assert_eq!(
            backend.map_job_status(&job("lost", None, 3), &work),
            ContentStatus::FinalFailed
        );
        assert_eq!(
            backend.map_job_status(&job("merging", None, 1), &work),
            ContentStatus::Available
        );
        assert_eq!(
            backend.map_job_status(&job("starting", None, 1), &work),
            ContentStatus::Processing
        );
    }

    #[test]
    fn event_service_needs_fine_grained_done() {
        let work = Work::new("a");
        let backend = EventServiceBackend;
        assert_eq!(
            backend.map_job_status(&job("finished", Some("fg_done"), 1), &work),
            ContentStatus::Available
        );
        assert_eq!(
            backend.map_job_status(&job("finished", None, 1), &work),
            ContentStatus::SubAvailable
        );
        assert_eq!(
            backend.map_job_status(&job("finished", Some("partial"), 3), &work),
            ContentStatus::FinalSubAvailable
        );
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let registry = BackendRegistry::with_defaults();
        let work = Work::new("a").with_kind("quantum");
        assert!(matches!(
            registry.for_work(&work),
            Err(CarrierError::UnknownBackend { .. })
        ));
        assert!(registry.for_work(&Work::new("b")).is_ok());
    }
}

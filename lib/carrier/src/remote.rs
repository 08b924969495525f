//! Remote execution service contract.
//!
//! Implementations report failures as [`RemoteError`]; the engine decides
//! which of them mean "still running".

use crate::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Parameters of one task submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub name: String,
    pub work_kind: String,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_workload_id: Option<String>,
    /// Input names to process.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, JsonValue>,
}

/// Remote view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub status: String,
    pub job_ids: Vec<String>,
}

/// Remote view of one job of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub substatus: Option<String>,
    pub attempt_nr: u32,
    pub max_attempt: u32,
    /// Name of the input the job processed.
    pub input_name: String,
}

/// Status of one event inside a fine-grained job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub job_id: String,
    /// Matches the sub-map id of the contents.
    pub event_id: u64,
    pub status: String,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Submits a task and returns its external id.
    async fn submit(&self, params: &TaskParams) -> Result<String, RemoteError>;

    /// Returns `None` when the service does not know the task.
    async fn poll_task(&self, external_id: &str) -> Result<Option<TaskInfo>, RemoteError>;

    async fn poll_jobs(&self, job_ids: &[String]) -> Result<Vec<JobInfo>, RemoteError>;

    async fn poll_events(&self, job_ids: &[String]) -> Result<Vec<EventRecord>, RemoteError>;

    async fn kill(&self, external_id: &str) -> Result<(), RemoteError>;

    /// Asks the task to finish; `soft` lets running jobs complete.
    async fn finish(&self, external_id: &str, soft: bool) -> Result<(), RemoteError>;

    /// Retries the failed jobs of a task.
    async fn retry(&self, external_id: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Default)]
struct ScriptState {
    next_task: u64,
    tasks: BTreeMap<String, TaskInfo>,
    jobs: BTreeMap<String, JobInfo>,
    events: Vec<EventRecord>,
    submitted: Vec<TaskParams>,
    killed: Vec<String>,
    finished: Vec<(String, bool)>,
    retried: Vec<String>,
    failures: u32,
}

/// In-memory remote service whose answers are set by the caller.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    state: Mutex<ScriptState>,
}

impl ScriptedRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, ScriptState>, RemoteError> {
        self.state.lock().map_err(|e| RemoteError::Unavailable {
            message: format!("script lock poisoned: {e}"),
        })
    }

    fn take_failure(state: &mut ScriptState) -> Result<(), RemoteError> {
        if state.failures > 0 {
            state.failures -= 1;
            return Err(RemoteError::Unavailable {
                message: "scripted outage".to_string(),
            });
        }
        Ok(())
    }

    /// Makes the next `count` calls fail as unavailable.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failures = count;
        }
    }

    pub fn set_task(&self, external_id: &str, status: &str, job_ids: &[&str]) {
        if let Ok(mut state) = self.state.lock() {
            state.tasks.insert(
                external_id.to_string(),
                TaskInfo {
                    status: status.to_string(),
                    job_ids: job_ids.iter().map(|s| (*s).to_string()).collect(),
                },
            );
        }
    }

    pub fn set_job(&self, job: JobInfo) {
        if let Ok(mut state) = self.state.lock() {
            state.jobs.insert(job.job_id.clone(), job);
        }
    }

    pub fn add_event(&self, event: EventRecord) {
        if let Ok(mut state) = self.state.lock() {
            state.events.push(event);
        }
    }

    #[must_use]
    pub fn submitted(&self) -> Vec<TaskParams> {
        self.state
            .lock()
            .map(|s| s.submitted.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn killed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.killed.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn finished(&self) -> Vec<(String, bool)> {
        self.state
            .lock()
            .map(|s| s.finished.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn retried(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.retried.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteClient for ScriptedRemote {
    async fn submit(&self, params: &TaskParams) -> Result<String, RemoteError> {
        let mut state = self.state()?;
        Self::take_failure(&mut state)?;
        state.next_task += 1;
        let external_id = (1000 + state.next_task).to_string();
        state.submitted.push(params.clone());
        state.tasks.insert(
            external_id.clone(),
            TaskInfo {
                status: "pending".to_string(),
                job_ids: Vec::new(),
            },
        );
        Ok(external_id)
    }

    async fn poll_task(&self, external_id: &str) -> Result<Option<TaskInfo>, RemoteError> {
        let mut state = self.state()?;
        Self::take_failure(&mut state)?;
        Ok(state.tasks.get(external_id).cloned())
    }

    async fn poll_jobs(&self, job_ids: &[String]) -> Result<Vec<JobInfo>, RemoteError> {
        let mut state = self.state()?;
        Self::take_failure(&mut state)?;
        Ok(job_ids
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn poll_events(&self, job_ids: &[String]) -> Result<Vec<EventRecord>, RemoteError> {
        let mut state = self.state()?;
        Self::take_failure(&mut state)?;
        Ok(state
            .events
            .iter()
            .filter(|e| job_ids.contains(&e.job_id))
            .cloned()
            .collect())
    }

    async fn kill(&self, external_id: &str) -> Result<(), RemoteError> {
        let mut state = self.state()?;
        Self::take_failure(&mut state)?;
        state.killed.push(external_id.to_string());
        if let Some(task) = state.tasks.get_mut(external_id) {
            task.status = "aborted".to_string();
        }
        Ok(())
    }

    async fn finish(&self, external_id: &str, soft: bool) -> Result<(), RemoteError> {
        let mut state = self.state()?;
        Self::take_failure(&mut state)?;
        state.finished.push((external_id.to_string(), soft));
        Ok(())
    }

    async fn retry(&self, external_id: &str) -> Result<(), RemoteError> {
        let mut state = self.state()?;
        Self::take_failure(&mut state)?;
        if !state.tasks.contains_key(external_id) {
            return Err(RemoteError::TaskNotFound {
                external_id: external_id.to_string(),
            });
        }
        state.retried.push(external_id.to_string());
        Ok(())
    }
}

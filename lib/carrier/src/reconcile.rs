//! Reconciliation: merging remote job and event status into output contents.
//!
//! Polls may repeat and arrive out of order. Each observation goes through
//! the external id merge first; only an observation carrying the current
//! job id may change a status, and a terminal status never goes back.

use crate::backend::ExecutionBackend;
use crate::config::CarrierConfig;
use crate::content::{Content, ContentExt, ContentStatus, ContentUpdate, ExternalId, ExternalIdMerge};
use crate::error::RemoteError;
use crate::fanout::gather;
use crate::io_map::InputOutputMaps;
use crate::propagation::chunked;
use crate::remote::{EventRecord, JobInfo, RemoteClient};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use workweave_core::ContentId;
use workweave_workflow::{Processing, ProcessingStatus, Work, WorkStatus};

const EVENT_SUCCESS: [&str; 3] = ["finished", "done", "merged"];
const EVENT_FAILURE: [&str; 5] = ["failed", "fatal", "cancelled", "discarded", "corrupted"];

/// Resolves the records of one (job, event) pair.
///
/// Success beats failure, which beats everything else; with no decisive
/// record the job status stands.
#[must_use]
pub fn event_status(records: &[&EventRecord], job_status: ContentStatus) -> ContentStatus {
    let any_in = |set: &[&str]| {
        records
            .iter()
            .any(|r| set.contains(&r.status.to_ascii_lowercase().as_str()))
    };
    if any_in(EVENT_SUCCESS.as_slice()) {
        ContentStatus::Available
    } else if any_in(EVENT_FAILURE.as_slice()) {
        ContentStatus::FinalFailed
    } else {
        job_status
    }
}

/// Job ids of a task still worth polling.
///
/// Drops jobs already superseded on some output and jobs whose outputs are
/// all terminal.
#[must_use]
pub fn unterminated_job_ids(job_ids: &[String], maps: &InputOutputMaps) -> Vec<String> {
    let mut settled: BTreeSet<&str> = BTreeSet::new();
    let mut open: BTreeSet<&str> = BTreeSet::new();
    for (_, map) in maps.iter() {
        for output in &map.outputs {
            settled.extend(output.metadata.old_external_ids.iter().map(ExternalId::as_str));
            if let Some(current) = &output.metadata.external_id {
                if output.substatus.is_terminal() {
                    settled.insert(current.as_str());
                } else {
                    open.insert(current.as_str());
                }
            }
        }
    }
    job_ids
        .iter()
        .filter(|id| open.contains(id.as_str()) || !settled.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Working copies of the outputs touched by one poll.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    contents: BTreeMap<ContentId, Content>,
    touched: BTreeSet<ContentId>,
    attempts: BTreeMap<ContentId, u32>,
}

impl UpdateBatch {
    pub fn new<'a>(outputs: impl IntoIterator<Item = &'a Content>) -> Self {
        Self {
            contents: outputs.into_iter().map(|c| (c.id, c.clone())).collect(),
            ..Self::default()
        }
    }

    /// Records one observation. Returns true if the content changed.
    pub fn observe(
        &mut self,
        content_id: ContentId,
        status: ContentStatus,
        job_id: &str,
        attempt_nr: u32,
    ) -> bool {
        let Some(content) = self.contents.get_mut(&content_id) else {
            return false;
        };
        let before = content.metadata.clone();
        let merge = content.metadata.merge_external_id(ExternalId::new(job_id));
        let mut changed = content.metadata != before;

        if merge == ExternalIdMerge::Current {
            self.attempts.insert(content_id, attempt_nr);
            let resurrects = content.substatus.is_terminal() && !status.is_terminal();
            if content.substatus != status && !resurrects {
                content.substatus = status;
                changed = true;
            }
        }
        if changed {
            self.touched.insert(content_id);
        }
        changed
    }

    /// Applies every job to the outputs of the maps consuming its input.
    pub fn observe_jobs(
        &mut self,
        maps: &InputOutputMaps,
        jobs: &[JobInfo],
        events: &[EventRecord],
        work: &Work,
        backend: &dyn ExecutionBackend,
    ) {
        for job in jobs {
            let job_status = backend.map_job_status(job, work);
            let refine = backend.is_event_service()
                && matches!(
                    job_status,
                    ContentStatus::FinalSubAvailable | ContentStatus::FinalFailed
                );
            let targets: Vec<(ContentId, Option<u64>)> = maps
                .outputs_for_input(&job.input_name)
                .iter()
                .map(|c| (c.id, c.sub_map_id))
                .collect();
            for (content_id, sub_map_id) in targets {
                let status = if refine {
                    let records: Vec<&EventRecord> = events
                        .iter()
                        .filter(|e| e.job_id == job.job_id && Some(e.event_id) == sub_map_id)
                        .collect();
                    event_status(&records, job_status)
                } else {
                    job_status
                };
                self.observe(content_id, status, &job.job_id, job.attempt_nr);
            }
        }
    }

    /// Forces every non-terminal output to `Missing`.
    pub fn force_missing(&mut self) {
        for content in self.contents.values_mut() {
            if !content.substatus.is_terminal() {
                content.substatus = ContentStatus::Missing;
                self.touched.insert(content.id);
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    /// Content updates plus the bookkeeping rows of terminal outputs.
    #[must_use]
    pub fn into_parts(self) -> (Vec<ContentUpdate>, Vec<ContentExt>) {
        let mut updates = Vec::with_capacity(self.touched.len());
        let mut ext_rows = Vec::new();
        for id in &self.touched {
            let Some(content) = self.contents.get(id) else {
                continue;
            };
            updates.push(ContentUpdate {
                content_id: content.id,
                status: None,
                substatus: Some(content.substatus),
                metadata: Some(content.metadata.clone()),
            });
            if content.substatus.is_terminal() {
                let attempt_nr = self.attempts.get(id).copied().unwrap_or_default();
                ext_rows.push(ContentExt::for_output(content, attempt_nr));
            }
        }
        (updates, ext_rows)
    }
}

/// Result of one reconciliation poll.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// `None` means "still running, nothing learned".
    pub task_status: Option<ProcessingStatus>,
    pub updates: Vec<ContentUpdate>,
    pub ext_rows: Vec<ContentExt>,
    /// Set when the remote answered in a shape that could not be used.
    pub error: Option<String>,
}

impl PollOutcome {
    fn status(status: ProcessingStatus) -> Self {
        Self {
            task_status: Some(status),
            ..Self::default()
        }
    }

    fn error(message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::default()
        }
    }
}

/// Polls the remote task of a processing and reconciles its outputs.
///
/// Transient remote failures come back as an empty outcome. An unknown
/// task yields `Failed`. Once the task is terminal, outputs that never got
/// a final status are forced `Missing`.
pub async fn poll_processing_updates(
    processing: &Processing,
    maps: &InputOutputMaps,
    remote: Arc<dyn RemoteClient>,
    backend: &dyn ExecutionBackend,
    config: &CarrierConfig,
) -> PollOutcome {
    let Some(external_id) = processing.external_id.clone() else {
        warn!(processing_id = %processing.id, "processing has no external task id");
        return PollOutcome::status(WorkStatus::Failed);
    };

    let info = match remote.poll_task(&external_id).await {
        Ok(Some(info)) => info,
        Ok(None) | Err(RemoteError::TaskNotFound { .. }) => {
            warn!(processing_id = %processing.id, external_id = %external_id, "remote task not found");
            return PollOutcome::status(WorkStatus::Failed);
        }
        Err(e) if e.is_transient() => {
            warn!(processing_id = %processing.id, external_id, error = %e, "task poll failed");
            return PollOutcome::default();
        }
        Err(e) => {
            warn!(processing_id = %processing.id, external_id, error = %e, "unusable task poll");
            return PollOutcome::error(e.to_string());
        }
    };
    let task_status = backend.map_task_status(&info.status);

    let job_ids = unterminated_job_ids(&info.job_ids, maps);
    let num_jobs = job_ids.len();
    let event_service = backend.is_event_service();
    let results = gather(
        chunked(job_ids, config.poll_jobs_chunk_size),
        config.fanout_limit,
        config.fanout_progress_interval(),
        "poll_jobs",
        |chunk| {
            let remote = Arc::clone(&remote);
            async move {
                let jobs = remote.poll_jobs(&chunk).await?;
                let events = if event_service {
                    remote.poll_events(&chunk).await?
                } else {
                    Vec::new()
                };
                Ok::<_, RemoteError>((jobs, events))
            }
        },
    )
    .await;

    let mut jobs = Vec::new();
    let mut events = Vec::new();
    let mut complete = true;
    let mut error = None;
    for result in results {
        match result {
            Some(Ok((chunk_jobs, chunk_events))) => {
                jobs.extend(chunk_jobs);
                events.extend(chunk_events);
            }
            Some(Err(e)) => {
                warn!(processing_id = %processing.id, error = %e, "job poll failed");
                complete = false;
                if !e.is_transient() {
                    error = Some(e.to_string());
                }
            }
            None => complete = false,
        }
    }

    let mut batch = UpdateBatch::new(maps.iter().flat_map(|(_, map)| map.outputs.iter()));
    batch.observe_jobs(maps, &jobs, &events, &processing.work, backend);
    if complete && task_status.is_terminal() {
        batch.force_missing();
    }
    let (updates, ext_rows) = batch.into_parts();

    debug!(
        processing_id = %processing.id,
        task_status = %task_status,
        jobs = num_jobs,
        updates = updates.len(),
        complete,
        "reconciled remote task"
    );

    PollOutcome {
        task_status: complete.then_some(task_status),
        updates,
        ext_rows,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BatchBackend, EventServiceBackend};
    use crate::content::ContentRelationType;
    use crate::remote::ScriptedRemote;
    use chrono::Utc;
    use workweave_core::{CollectionId, RequestId, TransformId};

    fn contents(n: u64) -> Vec<Content> {
        let (req, tf) = (RequestId::new(), TransformId::new());
        let (input_coll, output_coll) = (CollectionId::new(), CollectionId::new());
        (0..n)
            .flat_map(|i| {
                let name = format!("f{i}");
                [
                    Content::new(req, tf, input_coll, i + 1, &name, ContentRelationType::Input),
                    Content::new(req, tf, output_coll, i + 1, &name, ContentRelationType::Output),
                ]
            })
            .collect()
    }

    fn finished(job_id: u64, i: u64) -> JobInfo {
        JobInfo {
            job_id: job_id.to_string(),
            status: "finished".to_string(),
            substatus: None,
            attempt_nr: 1,
            max_attempt: 3,
            input_name: format!("f{i}"),
        }
    }

    /// Applies one poll and returns the ids it touched.
    fn apply_round(contents: &mut [Content], jobs: &[JobInfo]) -> BTreeSet<ContentId> {
        let maps = InputOutputMaps::from_contents(contents.to_vec());
        let mut batch = UpdateBatch::new(maps.iter().flat_map(|(_, m)| m.outputs.iter()));
        batch.observe_jobs(&maps, jobs, &[], &Work::new("a"), &BatchBackend);
        let (updates, _) = batch.into_parts();
        let mut touched = BTreeSet::new();
        for update in &updates {
            touched.insert(update.content_id);
            if let Some(content) = contents.iter_mut().find(|c| c.id == update.content_id) {
                content.apply(update);
            }
        }
        touched
    }

    fn output<'a>(contents: &'a [Content], name: &str) -> &'a Content {
        contents
            .iter()
            .find(|c| c.relation_type == ContentRelationType::Output && c.name == name)
            .unwrap()
    }

    #[test]
    fn overlapping_polls_merge_in_either_order() {
        let first: Vec<JobInfo> = (0..5).map(|i| finished(100 + i, i)).collect();
        let second: Vec<JobInfo> = (3..10).map(|i| finished(200 + i, i)).collect();

        let mut results = Vec::new();
        for rounds in [[&first, &second], [&second, &first]] {
            let mut state = contents(10);
            let mut touched = BTreeSet::new();
            for jobs in rounds {
                touched.extend(apply_round(&mut state, jobs));
            }
            assert_eq!(touched.len(), 10);

            for name in ["f3", "f4"] {
                let meta = &output(&state, name).metadata;
                let n: u64 = name[1..].parse().unwrap();
                assert_eq!(meta.external_id, Some(ExternalId::new((200 + n).to_string())));
                assert_eq!(
                    meta.old_external_ids,
                    BTreeSet::from([ExternalId::new((100 + n).to_string())])
                );
            }
            assert!(
                state
                    .iter()
                    .filter(|c| c.relation_type == ContentRelationType::Output)
                    .all(|c| c.substatus == ContentStatus::Available)
            );
            results.push(
                state
                    .iter()
                    .filter(|c| c.relation_type == ContentRelationType::Output)
                    .map(|c| (c.name.clone(), c.substatus, c.metadata.clone()))
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(results[0], results[1]);

        let mut state = contents(10);
        apply_round(&mut state, &first);
        assert!(apply_round(&mut state, &first).is_empty());
    }

    #[test]
    fn terminal_output_is_not_resurrected() {
        let state = contents(1);
        let id = output(&state, "f0").id;
        let mut batch = UpdateBatch::new(state.iter());
        assert!(batch.observe(id, ContentStatus::Available, "10", 1));
        assert!(!batch.observe(id, ContentStatus::Processing, "10", 2));
        let (updates, ext_rows) = batch.into_parts();
        assert_eq!(updates[0].substatus, Some(ContentStatus::Available));
        assert_eq!(ext_rows.len(), 1);
        assert_eq!(ext_rows[0].job_id.as_deref(), Some("10"));
    }

    #[test]
    fn superseded_job_cannot_change_status() {
        let state = contents(1);
        let id = output(&state, "f0").id;
        let mut batch = UpdateBatch::new(state.iter());
        batch.observe(id, ContentStatus::Processing, "20", 1);
        batch.observe(id, ContentStatus::FinalFailed, "10", 3);
        let (updates, _) = batch.into_parts();
        assert_eq!(updates[0].substatus, Some(ContentStatus::Processing));
    }

    #[test]
    fn event_records_resolve_by_priority() {
        let record = |status: &str| EventRecord {
            job_id: "1".to_string(),
            event_id: 0,
            status: status.to_string(),
        };
        let (done, fatal, queued) = (record("done"), record("fatal"), record("queued"));
        assert_eq!(
            event_status(&[&fatal, &done], ContentStatus::FinalFailed),
            ContentStatus::Available
        );
        assert_eq!(
            event_status(&[&queued, &fatal], ContentStatus::FinalSubAvailable),
            ContentStatus::FinalFailed
        );
        assert_eq!(
            event_status(&[&queued], ContentStatus::FinalSubAvailable),
            ContentStatus::FinalSubAvailable
        );
    }

    #[test]
    fn event_service_refines_per_sub_map() {
        let (req, tf, coll) = (RequestId::new(), TransformId::new(), CollectionId::new());
        let state: Vec<Content> = [0u64, 1]
            .into_iter()
            .flat_map(|sub| {
                [
                    Content::new(req, tf, coll, 1, "evt", ContentRelationType::Input)
                        .with_sub_map_id(Some(sub)),
                    Content::new(req, tf, coll, 1, format!("out{sub}"), ContentRelationType::Output)
                        .with_sub_map_id(Some(sub)),
                ]
            })
            .collect();
        let maps = InputOutputMaps::from_contents(state);
        let job = JobInfo {
            job_id: "5".to_string(),
            status: "finished".to_string(),
            substatus: None,
            attempt_nr: 3,
            max_attempt: 3,
            input_name: "evt".to_string(),
        };
        let events = [EventRecord {
            job_id: "5".to_string(),
            event_id: 1,
            status: "merged".to_string(),
        }];

        let mut batch = UpdateBatch::new(maps.iter().flat_map(|(_, m)| m.outputs.iter()));
        batch.observe_jobs(&maps, &[job], &events, &Work::new("a"), &EventServiceBackend);
        let (updates, _) = batch.into_parts();
        let by_sub: BTreeMap<Option<u64>, ContentStatus> = maps
            .contents()
            .filter(|c| c.relation_type == ContentRelationType::Output)
            .filter_map(|c| {
                updates
                    .iter()
                    .find(|u| u.content_id == c.id)
                    .and_then(|u| u.substatus)
                    .map(|s| (c.sub_map_id, s))
            })
            .collect();
        assert_eq!(by_sub[&Some(0)], ContentStatus::FinalSubAvailable);
        assert_eq!(by_sub[&Some(1)], ContentStatus::Available);
    }

    #[test]
    fn settled_jobs_are_not_polled_again() {
        let mut state = contents(2);
        apply_round(&mut state, &[finished(7, 0)]);
        let maps = InputOutputMaps::from_contents(state);
        let ids = unterminated_job_ids(&["7".to_string(), "8".to_string()], &maps);
        assert_eq!(ids, vec!["8".to_string()]);
    }

    fn submitted_processing(external_id: &str) -> Processing {
        let mut processing = Processing::new(RequestId::new(), TransformId::new(), Work::new("a"));
        processing.mark_submitted(external_id.to_string(), Utc::now());
        processing
    }

    #[tokio::test]
    async fn poll_reconciles_running_task() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_task("1001", "running", &["1", "2"]);
        remote.set_job(finished(1, 0));
        remote.set_job(JobInfo {
            status: "running".to_string(),
            ..finished(2, 1)
        });
        let maps = InputOutputMaps::from_contents(contents(2));

        let outcome = poll_processing_updates(
            &submitted_processing("1001"),
            &maps,
            remote,
            &BatchBackend,
            &CarrierConfig::default(),
        )
        .await;

        assert_eq!(outcome.task_status, Some(WorkStatus::Running));
        assert_eq!(outcome.updates.len(), 2);
        assert_eq!(outcome.ext_rows.len(), 1);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn terminal_task_forces_missing() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_task("1001", "done", &["1"]);
        remote.set_job(finished(1, 0));
        let maps = InputOutputMaps::from_contents(contents(2));

        let outcome = poll_processing_updates(
            &submitted_processing("1001"),
            &maps,
            remote,
            &BatchBackend,
            &CarrierConfig::default(),
        )
        .await;

        assert_eq!(outcome.task_status, Some(WorkStatus::Finished));
        let statuses: BTreeSet<ContentStatus> =
            outcome.updates.iter().filter_map(|u| u.substatus).collect();
        assert_eq!(
            statuses,
            BTreeSet::from([ContentStatus::Available, ContentStatus::Missing])
        );
    }

    #[tokio::test]
    async fn remote_failures_map_to_outcomes() {
        let remote = Arc::new(ScriptedRemote::new());
        let maps = InputOutputMaps::from_contents(contents(1));
        let config = CarrierConfig::default();
        let processing = submitted_processing("1001");

        remote.set_task("1001", "running", &[]);
        remote.fail_next(1);
        let outcome =
            poll_processing_updates(&processing, &maps, remote.clone(), &BatchBackend, &config)
                .await;
        assert_eq!(outcome.task_status, None);
        assert!(outcome.updates.is_empty());

        let outcome = poll_processing_updates(
            &submitted_processing("404"),
            &maps,
            remote,
            &BatchBackend,
            &config,
        )
        .await;
        assert_eq!(outcome.task_status, Some(WorkStatus::Failed));
    }
}

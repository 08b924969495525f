//! Collection, work and processing status sync.

use crate::content::{Content, ContentExt, ContentRelationType, ContentStatus, ContentUpdate};
use workweave_workflow::{
    Collection, CollectionCounters, CollectionRelationType, ExtCounters, Processing,
    ProcessingStatus, TerminalCounts, Work, WorkStatus,
};

/// Counter bucket of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileClass {
    Processed,
    New,
    Failed,
    Missing,
    Processing,
}

fn classify(status: ContentStatus) -> FileClass {
    match status {
        s if s.is_processed() => FileClass::Processed,
        ContentStatus::New => FileClass::New,
        ContentStatus::Failed | ContentStatus::FinalFailed | ContentStatus::FinalSubAvailable => {
            FileClass::Failed
        }
        ContentStatus::Lost
        | ContentStatus::Deleted
        | ContentStatus::Missing
        | ContentStatus::Cancelled => FileClass::Missing,
        _ => FileClass::Processing,
    }
}

/// Recounts a collection's file counters from the local substatus of its
/// contents.
pub fn sync_collection_status<'a>(
    collection: &mut Collection,
    contents: impl IntoIterator<Item = &'a Content>,
) {
    let mut counters = CollectionCounters::default();
    for content in contents {
        counters.total_files += 1;
        match classify(content.substatus) {
            FileClass::Processed => {
                counters.processed_files += 1;
                counters.bytes += content.bytes;
            }
            FileClass::New => counters.new_files += 1,
            FileClass::Failed => counters.failed_files += 1,
            FileClass::Missing => counters.missing_files += 1,
            FileClass::Processing => counters.processing_files += 1,
        }
    }
    collection.counters = counters;
}

/// Recounts the bookkeeping counters of an output collection.
pub fn sync_ext_counters<'a>(
    collection: &mut Collection,
    rows: impl IntoIterator<Item = &'a ContentExt>,
) {
    let mut ext = ExtCounters::default();
    for row in rows {
        ext.ext_files += 1;
        match classify(row.status) {
            FileClass::Processed => ext.processed_ext_files += 1,
            FileClass::Failed => ext.failed_ext_files += 1,
            FileClass::Missing => ext.missing_ext_files += 1,
            FileClass::New | FileClass::Processing => {}
        }
    }
    collection.ext = ext;
}

/// No content holds a substatus that a flush would still publish.
///
/// Substatus values outside the flushable set never reach `status`, so
/// they do not hold a collection open.
#[must_use]
pub fn all_updates_flushed<'a>(contents: impl IntoIterator<Item = &'a Content>) -> bool {
    contents
        .into_iter()
        .all(|c| c.is_flushed() || !c.substatus.is_flushable())
}

/// How a close pass was requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseRequest {
    /// The processing is wrapping up.
    pub terminate: bool,
    /// Close everything unconditionally.
    pub abort: bool,
    /// Close outputs without waiting for counts or bookkeeping.
    pub force: bool,
}

impl CloseRequest {
    #[must_use]
    pub fn abort() -> Self {
        Self {
            terminate: true,
            abort: true,
            force: true,
        }
    }

    #[must_use]
    pub fn terminate() -> Self {
        Self {
            terminate: true,
            ..Self::default()
        }
    }
}

/// Decides whether one collection may close now.
#[must_use]
pub fn should_close(
    collection: &Collection,
    work: &Work,
    request: CloseRequest,
    all_flushed: bool,
    require_ext: bool,
) -> bool {
    if collection.is_closed() {
        return false;
    }
    if request.abort {
        return true;
    }
    let counted = collection.counters.all_terminated();
    match collection.relation_type {
        CollectionRelationType::Input => {
            !work.generating_new_inputs
                && !work.has_new_inputs
                && work.workload_id.is_some()
                && counted
        }
        CollectionRelationType::Output => {
            request.terminate
                && (request.force
                    || (all_flushed && (!require_ext || collection.ext_reconciled()) && counted))
        }
        CollectionRelationType::Log => {
            request.terminate && (request.force || (all_flushed && counted))
        }
    }
}

/// Applies [`should_close`] to every collection. Returns how many closed.
pub fn close_collections(
    collections: &mut [Collection],
    work: &Work,
    request: CloseRequest,
    all_flushed: bool,
    require_ext: bool,
) -> usize {
    let mut closed = 0;
    for collection in collections.iter_mut() {
        if should_close(collection, work, request, all_flushed, require_ext) {
            collection.close();
            closed += 1;
        }
    }
    closed
}

/// Final work status from closed collections.
///
/// Returns `None` while any collection is open. With no output files the
/// processing's own substatus decides, falling back to `Failed`.
#[must_use]
pub fn work_status_from_collections(
    collections: &[Collection],
    processing_substatus: ProcessingStatus,
) -> Option<WorkStatus> {
    if !collections.iter().all(Collection::is_closed) {
        return None;
    }
    let (total, processed) = collections
        .iter()
        .filter(|c| c.relation_type == CollectionRelationType::Output)
        .fold((0, 0), |(total, processed), c| {
            (total + c.counters.total_files, processed + c.counters.processed_files)
        });
    let status = if total == 0 {
        if processing_substatus.is_terminal() {
            processing_substatus
        } else {
            WorkStatus::Failed
        }
    } else if processed == total {
        WorkStatus::Finished
    } else if processed == 0 {
        WorkStatus::Failed
    } else {
        WorkStatus::SubFinished
    };
    Some(status)
}

/// Processing substatus values after which a processing wraps up.
#[must_use]
pub fn processing_terminating(substatus: ProcessingStatus) -> bool {
    matches!(
        substatus,
        WorkStatus::Finished
            | WorkStatus::Failed
            | WorkStatus::SubFinished
            | WorkStatus::Terminating
            | WorkStatus::Cancelled
    )
}

/// Narrows a work status to what a finished processing may report.
#[must_use]
pub fn final_processing_status(status: WorkStatus) -> ProcessingStatus {
    match status {
        WorkStatus::Finished | WorkStatus::SubFinished | WorkStatus::Failed => status,
        _ => WorkStatus::SubFinished,
    }
}

/// What still holds a work open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkProgress {
    /// Every collection of the processing is closed.
    pub collections_closed: bool,
    /// Some input is still waiting on its dependencies.
    pub pending_releases: bool,
    pub all_flushed: bool,
}

/// Sets a work's status from its processings.
///
/// The work turns terminal only once its processings are terminated and
/// nothing else can still arrive; the terminal status is picked by
/// priority. Otherwise it is `Running` while any processing runs.
/// Returns the new status.
pub fn sync_work_status(
    work: &mut Work,
    processings: &[&Processing],
    progress: WorkProgress,
) -> WorkStatus {
    let all_terminated = !processings.is_empty() && processings.iter().all(|p| p.is_terminated());
    if all_terminated
        && progress.collections_closed
        && !work.has_new_inputs
        && !progress.pending_releases
        && progress.all_flushed
    {
        let status = TerminalCounts::from_statuses(processings.iter().map(|p| p.status)).aggregate();
        work.set_status(status);
        return status;
    }

    let status = if processings
        .iter()
        .any(|p| matches!(p.status, WorkStatus::Submitted | WorkStatus::Running))
    {
        WorkStatus::Running
    } else {
        WorkStatus::Transforming
    };
    if work.substatus.is_operator_intent() || work.substatus.is_in_operation() {
        work.status = status;
    } else {
        work.set_status(status);
    }
    status
}

/// Resets every input and output that was not processed back to `New`.
///
/// This is the only path that moves a content out of a terminal status.
#[must_use]
pub fn reactivate_contents<'a>(
    contents: impl IntoIterator<Item = &'a Content>,
) -> Vec<ContentUpdate> {
    contents
        .into_iter()
        .filter(|c| {
            matches!(
                c.relation_type,
                ContentRelationType::Input | ContentRelationType::Output
            )
        })
        .filter(|c| !c.substatus.is_processed() && (c.status, c.substatus) != (ContentStatus::New, ContentStatus::New))
        .map(|c| ContentUpdate::publish(c.id, ContentStatus::New))
        .collect()
}

//! The agents of a deployment.
//!
//! Processing agents are woken two ways: by events naming a processing,
//! and by a periodic claim over every processing in the states they serve.
//! Events are tried first so a busy deployment reacts in event order.

pub mod clerk;
pub mod finisher;
pub mod poller;
pub mod submitter;
pub mod trigger;

pub use clerk::Clerk;
pub use finisher::Finisher;
pub use poller::Poller;
pub use submitter::Submitter;
pub use trigger::Trigger;

use crate::error::AgentError;
use chrono::Duration as ChronoDuration;
use tracing::debug;
use workweave_carrier::{BusEvent, Carrier, Envelope, EventKind, ProcessingFilter};
use workweave_core::Result;
use workweave_workflow::Processing;

/// A processing locked by an agent.
#[derive(Debug, Clone)]
pub struct ClaimedProcessing {
    pub processing: Processing,
    /// Event that woke it; `None` when found by the periodic claim.
    pub wakeup: Option<EventKind>,
}

/// Claims the processings named by pending events of `kinds`.
///
/// An event whose processing is locked elsewhere is published again; an
/// event for an unknown processing is dropped.
pub(crate) async fn claim_woken(
    carrier: &Carrier,
    kinds: &[EventKind],
    limit: usize,
    lease: ChronoDuration,
) -> Result<Vec<ClaimedProcessing>, AgentError> {
    let mut claimed: Vec<ClaimedProcessing> = Vec::new();
    for kind in kinds {
        let room = limit.saturating_sub(claimed.len());
        if room == 0 {
            break;
        }
        let events = carrier
            .bus()
            .fetch(*kind, room)
            .await
            .map_err(AgentError::from)?;
        for envelope in events {
            let event = envelope.into_payload();
            let Some(processing_id) = event.processing_id() else {
                continue;
            };
            if claimed.iter().any(|c| c.processing.id == processing_id) {
                continue;
            }
            match claim_one(carrier, ProcessingFilter::id(processing_id), lease).await? {
                Some(processing) => claimed.push(ClaimedProcessing {
                    processing,
                    wakeup: Some(*kind),
                }),
                None => requeue(carrier, event).await?,
            }
        }
    }
    Ok(claimed)
}

/// Tops a batch up with processings matching `filter`.
pub(crate) async fn claim_matching(
    carrier: &Carrier,
    filter: &ProcessingFilter,
    limit: usize,
    lease: ChronoDuration,
) -> Result<Vec<ClaimedProcessing>, AgentError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let processings = carrier
        .storage()
        .claim_processings(filter, limit, lease)
        .await
        .map_err(AgentError::from)?;
    Ok(processings
        .into_iter()
        .map(|processing| ClaimedProcessing {
            processing,
            wakeup: None,
        })
        .collect())
}

/// Locks the single processing selected by `filter`, if it is free.
pub(crate) async fn claim_one(
    carrier: &Carrier,
    filter: ProcessingFilter,
    lease: ChronoDuration,
) -> Result<Option<Processing>, AgentError> {
    let mut claimed = carrier
        .storage()
        .claim_processings(&filter, 1, lease)
        .await
        .map_err(AgentError::from)?;
    Ok(claimed.pop())
}

/// Publishes `event` again if its target still exists.
async fn requeue(carrier: &Carrier, event: BusEvent) -> Result<(), AgentError> {
    let Some(processing_id) = event.processing_id() else {
        return Ok(());
    };
    let exists = carrier
        .storage()
        .get_processing(processing_id, false)
        .await
        .map_err(AgentError::from)?
        .is_some();
    if exists {
        debug!(processing_id = %processing_id, kind = %event.kind(), "processing busy; requeueing event");
        carrier
            .bus()
            .publish(Envelope::new(event))
            .await
            .map_err(AgentError::from)?;
    } else {
        debug!(processing_id = %processing_id, kind = %event.kind(), "dropping event for unknown processing");
    }
    Ok(())
}

pub(crate) async fn release_processing(
    carrier: &Carrier,
    item: &ClaimedProcessing,
) -> Result<(), AgentError> {
    carrier
        .storage()
        .release_processing(item.processing.id)
        .await
        .map_err(AgentError::from)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use workweave_carrier::{
        Carrier, CarrierConfig, MemoryBus, MemoryCache, MemoryStorage, ScriptedRemote,
    };

    pub(crate) struct Deployment {
        pub storage: Arc<MemoryStorage>,
        pub remote: Arc<ScriptedRemote>,
        pub bus: Arc<MemoryBus>,
        pub carrier: Arc<Carrier>,
    }

    pub(crate) fn deployment(config: CarrierConfig) -> Deployment {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(ScriptedRemote::new());
        let bus = Arc::new(MemoryBus::new());
        let carrier = Arc::new(Carrier::new(
            storage.clone(),
            remote.clone(),
            Arc::new(MemoryCache::new()),
            bus.clone(),
            config,
        ));
        Deployment {
            storage,
            remote,
            bus,
            carrier,
        }
    }

    pub(crate) fn lease() -> chrono::Duration {
        chrono::Duration::seconds(600)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Deployment, deployment, lease};
    use super::*;
    use crate::agent::{Agent, AgentRunner};
    use crate::schedule::PollSchedule;
    use std::sync::Arc;
    use std::time::Duration;
    use workweave_carrier::{CarrierConfig, EventBus, JobInfo, RequestRecord, Storage};
    use workweave_core::{ProcessingId, RequestId, WorkId};
    use workweave_workflow::{Condition, Work, WorkCheck, WorkStatus, Workflow, WorkflowTemplate};

    #[tokio::test]
    async fn busy_processing_event_is_requeued() {
        let d = deployment(CarrierConfig::default());
        let mut work = Work::new("a");
        let p = d
            .carrier
            .create_processing(RequestId::new(), &mut work)
            .await
            .unwrap();
        d.storage
            .claim_processings(&ProcessingFilter::id(p.id), 1, lease())
            .await
            .unwrap();

        let claimed = claim_woken(&d.carrier, &[EventKind::NewProcessing], 10, lease())
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(d.bus.pending(EventKind::NewProcessing), 1);

        d.storage.release_processing(p.id).await.unwrap();
        let claimed = claim_woken(&d.carrier, &[EventKind::NewProcessing], 10, lease())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].wakeup, Some(EventKind::NewProcessing));
        assert_eq!(d.bus.pending(EventKind::NewProcessing), 0);
    }

    #[tokio::test]
    async fn events_for_unknown_processings_are_dropped() {
        let d = deployment(CarrierConfig::default());
        d.bus
            .publish(Envelope::new(BusEvent::SyncProcessing {
                processing_id: ProcessingId::new(),
            }))
            .await
            .unwrap();

        let claimed = claim_woken(&d.carrier, &[EventKind::SyncProcessing], 10, lease())
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(d.bus.pending(EventKind::SyncProcessing), 0);
    }

    #[tokio::test]
    async fn duplicate_events_claim_once() {
        let d = deployment(CarrierConfig::default());
        let mut work = Work::new("a");
        let p = d
            .carrier
            .create_processing(RequestId::new(), &mut work)
            .await
            .unwrap();
        d.bus
            .publish(Envelope::new(BusEvent::NewProcessing {
                processing_id: p.id,
            }))
            .await
            .unwrap();

        let claimed = claim_woken(&d.carrier, &[EventKind::NewProcessing], 10, lease())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(d.bus.pending(EventKind::NewProcessing), 0);
    }

    fn runner<A: Agent>(agent: A) -> AgentRunner<A> {
        AgentRunner::new(agent, 2, 10, PollSchedule::new(Duration::from_secs(1)))
    }

    async fn processing_of(d: &Deployment, request_id: RequestId, work_id: WorkId) -> Processing {
        d.storage
            .get_processings(&ProcessingFilter::request(request_id))
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.work.id == work_id)
            .unwrap()
    }

    fn complete_task(d: &Deployment, external_id: &str, job_id: &str, input: &str) {
        d.remote.set_task(external_id, "done", &[job_id]);
        d.remote.set_job(JobInfo {
            job_id: job_id.to_string(),
            status: "finished".to_string(),
            substatus: None,
            attempt_nr: 1,
            max_attempt: 3,
            input_name: input.to_string(),
        });
    }

    #[tokio::test]
    async fn request_runs_through_every_agent() {
        let d = deployment(CarrierConfig::default());
        let mut template = WorkflowTemplate::new("chain");
        let a = template.add_work(Work::new("a")).unwrap();
        let b = template.add_work(Work::new("b")).unwrap();
        template
            .add_condition(Condition::single(a, WorkCheck::IsFinished).then(b))
            .unwrap();
        let request = RequestRecord::new(Workflow::new(template));
        let request_id = request.id;
        d.storage.add_request(request).await.unwrap();

        let clerk = runner(Clerk::new(Arc::clone(&d.carrier), lease()));
        let submitter = runner(Submitter::new(Arc::clone(&d.carrier), lease()));
        let poller = runner(Poller::new(Arc::clone(&d.carrier), lease()));
        let trigger = runner(Trigger::new(Arc::clone(&d.carrier), lease()));
        let finisher = runner(Finisher::new(Arc::clone(&d.carrier), lease()));

        let steps = [(a, "1001", "1", "f1"), (b, "1002", "2", "g1")];
        for (work_id, external_id, job_id, input) in steps {
            clerk.run_once().await.unwrap();
            let p = processing_of(&d, request_id, work_id).await;
            d.carrier.register_inputs(p.id, &[input]).await.unwrap();

            let report = submitter.run_once().await.unwrap();
            assert_eq!(report.processed, 1);
            complete_task(&d, external_id, job_id, input);
            poller.run_once().await.unwrap();
            trigger.run_once().await.unwrap();
            finisher.run_once().await.unwrap();

            let p = processing_of(&d, request_id, work_id).await;
            assert_eq!(p.status, WorkStatus::Finished);
            assert_eq!(p.work.status, WorkStatus::Finished);
        }

        clerk.run_once().await.unwrap();
        let request = d.storage.get_request(request_id).await.unwrap().unwrap();
        assert_eq!(request.status, WorkStatus::Finished);
        assert_eq!(request.workflow.work(a).unwrap().status, WorkStatus::Finished);
        assert_eq!(request.workflow.work(b).unwrap().status, WorkStatus::Finished);
        assert_eq!(d.remote.submitted().len(), 2);
    }
}

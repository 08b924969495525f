//! Closes processings and carries out operator requests.

use super::{ClaimedProcessing, claim_matching, claim_woken, release_processing};
use crate::agent::{Agent, AgentKind};
use crate::error::AgentError;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tracing::{debug, instrument};
use workweave_carrier::{Carrier, EventKind, ProcessingFilter};
use workweave_core::Result;
use workweave_workflow::WorkStatus;

/// Events the finisher acts on.
const WAKEUPS: [EventKind; 3] = [
    EventKind::SyncProcessing,
    EventKind::AbortProcessing,
    EventKind::ResumeProcessing,
];

/// Substatuses of processings with an operator request to carry out.
const OPERATOR_SUBSTATUSES: [WorkStatus; 11] = [
    WorkStatus::ToCancel,
    WorkStatus::ToSuspend,
    WorkStatus::ToResume,
    WorkStatus::ToExpire,
    WorkStatus::ToFinish,
    WorkStatus::ToForceFinish,
    WorkStatus::Cancelling,
    WorkStatus::Suspending,
    WorkStatus::Resuming,
    WorkStatus::Expiring,
    WorkStatus::Terminating,
];

pub struct Finisher {
    carrier: Arc<Carrier>,
    lease: ChronoDuration,
}

impl Finisher {
    #[must_use]
    pub fn new(carrier: Arc<Carrier>, lease: ChronoDuration) -> Self {
        Self { carrier, lease }
    }
}

#[async_trait]
impl Agent for Finisher {
    type Item = ClaimedProcessing;

    fn kind(&self) -> AgentKind {
        AgentKind::Finisher
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedProcessing>, AgentError> {
        let mut items = claim_woken(&self.carrier, &WAKEUPS, limit, self.lease).await?;
        let filter = ProcessingFilter::default().or_substatuses(OPERATOR_SUBSTATUSES);
        let room = limit.saturating_sub(items.len());
        items.extend(claim_matching(&self.carrier, &filter, room, self.lease).await?);
        Ok(items)
    }

    #[instrument(skip(self, item), fields(processing_id = %item.processing.id, wakeup = ?item.wakeup))]
    async fn process(&self, item: &ClaimedProcessing) -> Result<(), AgentError> {
        let id = item.processing.id;
        let (operation, outcome) = match item.wakeup {
            Some(EventKind::AbortProcessing) => (
                "handle_abort_processing",
                self.carrier.handle_abort_processing(id).await,
            ),
            Some(EventKind::ResumeProcessing) => (
                "handle_resume_processing",
                self.carrier.handle_resume_processing(id).await,
            ),
            _ if item.processing.has_pending_operation() => (
                "handle_operator_intent",
                self.carrier.handle_operator_intent(id).await,
            ),
            _ => ("sync_processing", self.carrier.sync_processing(id).await),
        };
        let outcome = outcome.map_err(|e| AgentError::carrier(operation, e))?;
        debug!(status = %outcome.status, substatus = %outcome.substatus, "finisher pass done");
        Ok(())
    }

    async fn release(&self, item: &ClaimedProcessing) -> Result<(), AgentError> {
        release_processing(&self.carrier, item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{Deployment, deployment, lease};
    use workweave_carrier::{BusEvent, CarrierConfig, Envelope, EventBus, Storage};
    use workweave_core::{ProcessingId, RequestId};
    use workweave_workflow::Work;

    async fn submitted(d: &Deployment) -> ProcessingId {
        let mut work = Work::new("a");
        let p = d
            .carrier
            .create_processing(RequestId::new(), &mut work)
            .await
            .unwrap();
        d.carrier.register_inputs(p.id, &["f1"]).await.unwrap();
        d.carrier.handle_new_processing(p.id).await.unwrap();
        p.id
    }

    async fn run_round(finisher: &Finisher) -> usize {
        let items = finisher.claim(10).await.unwrap();
        for item in &items {
            finisher.process(item).await.unwrap();
            finisher.release(item).await.unwrap();
        }
        items.len()
    }

    #[tokio::test]
    async fn abort_event_cancels_the_processing() {
        let d = deployment(CarrierConfig::default());
        let id = submitted(&d).await;
        d.bus
            .publish(Envelope::new(BusEvent::AbortProcessing { processing_id: id }))
            .await
            .unwrap();

        let finisher = Finisher::new(d.carrier.clone(), lease());
        assert_eq!(run_round(&finisher).await, 1);

        let stored = d.storage.get_processing(id, false).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Cancelled);
        assert_eq!(d.remote.killed(), vec!["1001".to_string()]);
        assert_eq!(d.bus.pending(EventKind::WorkTerminated), 1);
    }

    #[tokio::test]
    async fn cancel_request_is_actuated_then_settled() {
        let d = deployment(CarrierConfig::default());
        let id = submitted(&d).await;
        let mut p = d.storage.get_processing(id, false).await.unwrap().unwrap();
        p.substatus = WorkStatus::ToCancel;
        d.storage.update_processing(&p).await.unwrap();

        let finisher = Finisher::new(d.carrier.clone(), lease());
        run_round(&finisher).await;
        let stored = d.storage.get_processing(id, false).await.unwrap().unwrap();
        assert_eq!(stored.substatus, WorkStatus::Cancelling);
        assert_eq!(d.remote.killed(), vec!["1001".to_string()]);

        // The poller sees the killed task terminate.
        d.carrier.handle_update_processing(id).await.unwrap();
        run_round(&finisher).await;
        let stored = d.storage.get_processing(id, false).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Cancelled);
        assert!(stored.is_terminated());
        assert_eq!(stored.work.status, WorkStatus::Cancelled);
    }

    #[tokio::test]
    async fn resume_event_reactivates_an_aborted_processing() {
        let d = deployment(CarrierConfig::default());
        let id = submitted(&d).await;
        d.bus
            .publish(Envelope::new(BusEvent::AbortProcessing { processing_id: id }))
            .await
            .unwrap();
        let finisher = Finisher::new(d.carrier.clone(), lease());
        run_round(&finisher).await;

        d.bus
            .publish(Envelope::new(BusEvent::ResumeProcessing { processing_id: id }))
            .await
            .unwrap();
        run_round(&finisher).await;

        let stored = d.storage.get_processing(id, false).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Running);
        assert_eq!(d.remote.retried(), vec!["1001".to_string()]);
    }
}

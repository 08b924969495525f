//! Polls submitted processings and reconciles what the remote service
//! reports.

use super::{ClaimedProcessing, claim_matching, claim_woken, release_processing};
use crate::agent::{Agent, AgentKind};
use crate::error::AgentError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};
use workweave_carrier::{Carrier, EventKind, ProcessingFilter};
use workweave_core::Result;
use workweave_workflow::WorkStatus;

pub struct Poller {
    carrier: Arc<Carrier>,
    lease: ChronoDuration,
}

impl Poller {
    #[must_use]
    pub fn new(carrier: Arc<Carrier>, lease: ChronoDuration) -> Self {
        Self { carrier, lease }
    }
}

#[async_trait]
impl Agent for Poller {
    type Item = ClaimedProcessing;

    fn kind(&self) -> AgentKind {
        AgentKind::Poller
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedProcessing>, AgentError> {
        let mut items =
            claim_woken(&self.carrier, &[EventKind::UpdateProcessing], limit, self.lease).await?;
        let filter = ProcessingFilter::statuses([WorkStatus::Submitted, WorkStatus::Running]);
        let room = limit.saturating_sub(items.len());
        items.extend(claim_matching(&self.carrier, &filter, room, self.lease).await?);
        Ok(items)
    }

    #[instrument(skip(self, item), fields(processing_id = %item.processing.id))]
    async fn process(&self, item: &ClaimedProcessing) -> Result<(), AgentError> {
        let processing = &item.processing;
        // Requests not yet actuated belong to the finisher.
        if processing.substatus.is_operator_intent() {
            debug!(substatus = %processing.substatus, "operator request pending");
            return Ok(());
        }
        let quiet = self.carrier.config().operation_quiet_period();
        if processing.in_operation_quiet_period(Utc::now(), quiet) {
            debug!("inside operation quiet period");
            return Ok(());
        }
        self.carrier
            .handle_update_processing(processing.id)
            .await
            .map_err(|e| AgentError::carrier("handle_update_processing", e))?;
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
    use workweave_carrier::{CarrierConfig, JobInfo, Storage};
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

    #[tokio::test]
    async fn finished_task_closes_the_processing() {
        let d = deployment(CarrierConfig::default());
        let id = submitted(&d).await;
        d.remote.set_task("1001", "done", &["1"]);
        d.remote.set_job(JobInfo {
            job_id: "1".to_string(),
            status: "finished".to_string(),
            substatus: None,
            attempt_nr: 1,
            max_attempt: 3,
            input_name: "f1".to_string(),
        });

        let poller = Poller::new(d.carrier.clone(), lease());
        let items = poller.claim(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].wakeup, Some(EventKind::UpdateProcessing));
        poller.process(&items[0]).await.unwrap();
        poller.release(&items[0]).await.unwrap();

        let stored = d.storage.get_processing(id, false).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Finished);
        assert!(poller.claim(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_operator_request_is_not_polled() {
        let d = deployment(CarrierConfig::default());
        let id = submitted(&d).await;
        let mut p = d.storage.get_processing(id, false).await.unwrap().unwrap();
        p.substatus = WorkStatus::ToCancel;
        d.storage.update_processing(&p).await.unwrap();
        d.remote.set_task("1001", "done", &[]);

        let poller = Poller::new(d.carrier.clone(), lease());
        let items = poller.claim(10).await.unwrap();
        poller.process(&items[0]).await.unwrap();

        let stored = d.storage.get_processing(id, false).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Submitted);
        assert_eq!(stored.substatus, WorkStatus::ToCancel);
    }

    #[tokio::test]
    async fn quiet_period_defers_polling() {
        let d = deployment(CarrierConfig::default());
        let id = submitted(&d).await;
        let mut p = d.storage.get_processing(id, false).await.unwrap().unwrap();
        p.request_operation(WorkStatus::Cancelling, Utc::now());
        d.storage.update_processing(&p).await.unwrap();
        d.remote.set_task("1001", "done", &[]);

        let poller = Poller::new(d.carrier.clone(), lease());
        let items = poller.claim(10).await.unwrap();
        poller.process(&items[0]).await.unwrap();

        let stored = d.storage.get_processing(id, false).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Submitted);
    }
}

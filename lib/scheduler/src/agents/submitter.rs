//! Submits new processings to the remote service.

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

pub struct Submitter {
    carrier: Arc<Carrier>,
    lease: ChronoDuration,
}

impl Submitter {
    #[must_use]
    pub fn new(carrier: Arc<Carrier>, lease: ChronoDuration) -> Self {
        Self { carrier, lease }
    }
}

#[async_trait]
impl Agent for Submitter {
    type Item = ClaimedProcessing;

    fn kind(&self) -> AgentKind {
        AgentKind::Submitter
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedProcessing>, AgentError> {
        let mut items =
            claim_woken(&self.carrier, &[EventKind::NewProcessing], limit, self.lease).await?;
        let filter = ProcessingFilter::statuses([WorkStatus::New]);
        let room = limit.saturating_sub(items.len());
        items.extend(claim_matching(&self.carrier, &filter, room, self.lease).await?);
        Ok(items)
    }

    #[instrument(skip(self, item), fields(processing_id = %item.processing.id))]
    async fn process(&self, item: &ClaimedProcessing) -> Result<(), AgentError> {
        if item.processing.has_pending_operation() {
            debug!(substatus = %item.processing.substatus, "left to the finisher");
            return Ok(());
        }
        self.carrier
            .handle_new_processing(item.processing.id)
            .await
            .map_err(|e| AgentError::carrier("handle_new_processing", e))?;
        Ok(())
    }

    async fn release(&self, item: &ClaimedProcessing) -> Result<(), AgentError> {
        release_processing(&self.carrier, item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRunner;
    use crate::agents::testing::{deployment, lease};
    use crate::schedule::PollSchedule;
    use std::time::Duration;
    use workweave_carrier::{CarrierConfig, Storage};
    use workweave_core::RequestId;
    use workweave_workflow::{Locking, Work};

    #[tokio::test]
    async fn submits_new_processings_and_unlocks_them() {
        let d = deployment(CarrierConfig::default());
        let mut work = Work::new("a");
        let p = d
            .carrier
            .create_processing(RequestId::new(), &mut work)
            .await
            .unwrap();
        d.carrier.register_inputs(p.id, &["f1"]).await.unwrap();

        let runner = AgentRunner::new(
            Submitter::new(d.carrier.clone(), lease()),
            2,
            10,
            PollSchedule::new(Duration::from_secs(1)),
        );
        let report = runner.run_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.processed, 1);

        let stored = d.storage.get_processing(p.id, false).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Submitted);
        assert_eq!(stored.locking, Locking::Idle);
        assert_eq!(d.remote.submitted().len(), 1);
        assert_eq!(d.bus.pending(EventKind::NewProcessing), 0);

        // Nothing left to submit.
        assert_eq!(runner.run_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn cancelled_before_submission_is_skipped() {
        let d = deployment(CarrierConfig::default());
        let mut work = Work::new("a");
        let mut p = d
            .carrier
            .create_processing(RequestId::new(), &mut work)
            .await
            .unwrap();
        p.substatus = WorkStatus::ToCancel;
        d.storage.update_processing(&p).await.unwrap();

        let submitter = Submitter::new(d.carrier.clone(), lease());
        let items = submitter.claim(10).await.unwrap();
        assert_eq!(items.len(), 1);
        submitter.process(&items[0]).await.unwrap();
        assert!(d.remote.submitted().is_empty());
    }
}

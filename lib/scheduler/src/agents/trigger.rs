//! Pushes producer statuses into consumer inputs when contents change.

use super::{ClaimedProcessing, claim_one, release_processing};
use crate::agent::{Agent, AgentKind};
use crate::error::AgentError;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use workweave_carrier::{BusEvent, Carrier, Envelope, EventKind, ProcessingFilter};
use workweave_core::{RequestId, Result, TransformId};

/// Runs the trigger step of every transform named by a
/// [`BusEvent::ContentsUpdated`] event.
pub struct Trigger {
    carrier: Arc<Carrier>,
    lease: ChronoDuration,
}

impl Trigger {
    #[must_use]
    pub fn new(carrier: Arc<Carrier>, lease: ChronoDuration) -> Self {
        Self { carrier, lease }
    }

    /// Publishes the transforms whose processing was busy again.
    async fn requeue(&self, busy: BTreeMap<RequestId, Vec<TransformId>>) -> Result<(), AgentError> {
        for (request_id, transform_ids) in busy {
            debug!(request_id = %request_id, transforms = transform_ids.len(), "processings busy; requeueing");
            self.carrier
                .bus()
                .publish(Envelope::new(BusEvent::ContentsUpdated {
                    request_id,
                    transform_ids,
                }))
                .await
                .map_err(AgentError::from)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for Trigger {
    type Item = ClaimedProcessing;

    fn kind(&self) -> AgentKind {
        AgentKind::Trigger
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedProcessing>, AgentError> {
        let events = self
            .carrier
            .bus()
            .fetch(EventKind::ContentsUpdated, limit)
            .await
            .map_err(AgentError::from)?;

        // One pass per transform however many events named it.
        let mut transforms: BTreeMap<TransformId, RequestId> = BTreeMap::new();
        for envelope in events {
            if let BusEvent::ContentsUpdated {
                request_id,
                transform_ids,
            } = envelope.into_payload()
            {
                for transform_id in transform_ids {
                    transforms.insert(transform_id, request_id);
                }
            }
        }

        let mut items = Vec::new();
        let mut busy: BTreeMap<RequestId, Vec<TransformId>> = BTreeMap::new();
        for (transform_id, request_id) in transforms {
            let filter = ProcessingFilter::transform(transform_id);
            match claim_one(&self.carrier, filter.clone(), self.lease).await? {
                Some(processing) => items.push(ClaimedProcessing {
                    processing,
                    wakeup: Some(EventKind::ContentsUpdated),
                }),
                None => {
                    let known = !self
                        .carrier
                        .storage()
                        .get_processings(&filter)
                        .await
                        .map_err(AgentError::from)?
                        .is_empty();
                    if known {
                        busy.entry(request_id).or_default().push(transform_id);
                    }
                }
            }
        }
        self.requeue(busy).await?;
        Ok(items)
    }

    #[instrument(skip(self, item), fields(processing_id = %item.processing.id))]
    async fn process(&self, item: &ClaimedProcessing) -> Result<(), AgentError> {
        self.carrier
            .handle_trigger_processing(item.processing.id)
            .await
            .map_err(|e| AgentError::carrier("handle_trigger_processing", e))?;
        Ok(())
    }

    async fn release(&self, item: &ClaimedProcessing) -> Result<(), AgentError> {
        release_processing(&self.carrier, item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{deployment, lease};
    use workweave_carrier::{
        CarrierConfig, ContentFilter, ContentRelationType, ContentStatus, EventBus, JobInfo,
        Storage,
    };
    use workweave_workflow::{DependencyItem, Work};

    #[tokio::test]
    async fn repeated_events_trigger_once_per_transform() {
        let d = deployment(CarrierConfig::default());
        let request_id = RequestId::new();
        let mut work = Work::new("a");
        let p = d
            .carrier
            .create_processing(request_id, &mut work)
            .await
            .unwrap();
        d.carrier.register_inputs(p.id, &["f1", "f2"]).await.unwrap();
        d.bus
            .publish(Envelope::new(BusEvent::ContentsUpdated {
                request_id,
                transform_ids: vec![p.transform_id],
            }))
            .await
            .unwrap();

        let trigger = Trigger::new(d.carrier.clone(), lease());
        let items = trigger.claim(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].processing.id, p.id);
    }

    #[tokio::test]
    async fn busy_transform_is_requeued() {
        let d = deployment(CarrierConfig::default());
        let request_id = RequestId::new();
        let mut work = Work::new("a");
        let p = d
            .carrier
            .create_processing(request_id, &mut work)
            .await
            .unwrap();
        d.carrier.register_inputs(p.id, &["f1"]).await.unwrap();
        d.storage
            .claim_processings(&ProcessingFilter::id(p.id), 1, lease())
            .await
            .unwrap();

        let trigger = Trigger::new(d.carrier.clone(), lease());
        assert!(trigger.claim(10).await.unwrap().is_empty());
        assert_eq!(d.bus.pending(EventKind::ContentsUpdated), 1);
    }

    #[tokio::test]
    async fn unknown_transform_is_dropped() {
        let d = deployment(CarrierConfig::default());
        d.bus
            .publish(Envelope::new(BusEvent::ContentsUpdated {
                request_id: RequestId::new(),
                transform_ids: vec![TransformId::new()],
            }))
            .await
            .unwrap();

        let trigger = Trigger::new(d.carrier.clone(), lease());
        assert!(trigger.claim(10).await.unwrap().is_empty());
        assert_eq!(d.bus.pending(EventKind::ContentsUpdated), 0);
    }

    #[tokio::test]
    async fn producer_output_releases_consumer_input() {
        let d = deployment(CarrierConfig::default());
        let request_id = RequestId::new();
        let mut work_a = Work::new("a");
        let p_a = d
            .carrier
            .create_processing(request_id, &mut work_a)
            .await
            .unwrap();
        d.carrier.register_inputs(p_a.id, &["f1"]).await.unwrap();
        let mut work_b = Work::new("b")
            .with_dependency_map(vec![DependencyItem::new("g1").depends_on("a", "f1")])
            .unwrap();
        let p_b = d
            .carrier
            .create_processing(request_id, &mut work_b)
            .await
            .unwrap();
        d.carrier.handle_new_processing(p_a.id).await.unwrap();
        d.carrier.handle_new_processing(p_b.id).await.unwrap();

        d.remote.set_task("1001", "done", &["1"]);
        d.remote.set_job(JobInfo {
            job_id: "1".to_string(),
            status: "finished".to_string(),
            substatus: None,
            attempt_nr: 1,
            max_attempt: 3,
            input_name: "f1".to_string(),
        });
        d.carrier.handle_update_processing(p_a.id).await.unwrap();

        // Drain until no transform is left to trigger.
        let trigger = Trigger::new(d.carrier.clone(), lease());
        for _ in 0..4 {
            for item in trigger.claim(50).await.unwrap() {
                trigger.process(&item).await.unwrap();
                trigger.release(&item).await.unwrap();
            }
        }

        let inputs = d
            .storage
            .get_contents(
                &ContentFilter::transform(p_b.transform_id)
                    .with_relation(ContentRelationType::Input),
            )
            .await
            .unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].status, ContentStatus::Available);
    }
}

//! Event bus contract and the messages the carrier publishes.
//!
//! Delivery is at-least-once. Every handler reacting to these events is
//! idempotent, so a duplicate only costs a wasted pass.

use crate::content::{ContentRelationType, ContentStatus};
use crate::envelope::Envelope;
use crate::error::BusError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use workweave_core::{CollectionId, ProcessingId, RequestId, TransformId, WorkId};
use workweave_workflow::WorkStatus;

/// Subject prefix for carrier events.
pub const EVENTS_SUBJECT_PREFIX: &str = "workweave.events";

/// Status of one file as reported to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub name: String,
    pub relation_type: ContentRelationType,
    pub status: ContentStatus,
}

/// Messages exchanged between agents and published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    NewProcessing {
        processing_id: ProcessingId,
    },
    UpdateProcessing {
        processing_id: ProcessingId,
    },
    SyncProcessing {
        processing_id: ProcessingId,
    },
    AbortProcessing {
        processing_id: ProcessingId,
    },
    ResumeProcessing {
        processing_id: ProcessingId,
    },
    /// Contents of these transforms changed; their triggers should run.
    ContentsUpdated {
        request_id: RequestId,
        transform_ids: Vec<TransformId>,
    },
    FileStatus {
        request_id: RequestId,
        transform_id: TransformId,
        files: Vec<FileStatus>,
    },
    CollectionClosed {
        request_id: RequestId,
        transform_id: TransformId,
        collection_id: CollectionId,
        name: String,
    },
    WorkTerminated {
        request_id: RequestId,
        work_id: WorkId,
        status: WorkStatus,
    },
}

/// Routing key of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewProcessing,
    UpdateProcessing,
    SyncProcessing,
    AbortProcessing,
    ResumeProcessing,
    ContentsUpdated,
    FileStatus,
    CollectionClosed,
    WorkTerminated,
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewProcessing => "new_processing",
            Self::UpdateProcessing => "update_processing",
            Self::SyncProcessing => "sync_processing",
            Self::AbortProcessing => "abort_processing",
            Self::ResumeProcessing => "resume_processing",
            Self::ContentsUpdated => "contents_updated",
            Self::FileStatus => "file_status",
            Self::CollectionClosed => "collection_closed",
            Self::WorkTerminated => "work_terminated",
        }
    }

    /// Subject events of this kind are published on.
    #[must_use]
    pub fn subject(&self) -> String {
        format!("{EVENTS_SUBJECT_PREFIX}.{}", self.as_str())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BusEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewProcessing { .. } => EventKind::NewProcessing,
            Self::UpdateProcessing { .. } => EventKind::UpdateProcessing,
            Self::SyncProcessing { .. } => EventKind::SyncProcessing,
            Self::AbortProcessing { .. } => EventKind::AbortProcessing,
            Self::ResumeProcessing { .. } => EventKind::ResumeProcessing,
            Self::ContentsUpdated { .. } => EventKind::ContentsUpdated,
            Self::FileStatus { .. } => EventKind::FileStatus,
            Self::CollectionClosed { .. } => EventKind::CollectionClosed,
            Self::WorkTerminated { .. } => EventKind::WorkTerminated,
        }
    }

    /// The processing an agent-directed event targets.
    #[must_use]
    pub fn processing_id(&self) -> Option<ProcessingId> {
        match self {
            Self::NewProcessing { processing_id }
            | Self::UpdateProcessing { processing_id }
            | Self::SyncProcessing { processing_id }
            | Self::AbortProcessing { processing_id }
            | Self::ResumeProcessing { processing_id } => Some(*processing_id),
            _ => None,
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Envelope<BusEvent>) -> Result<(), BusError>;

    async fn publish_bulk(&self, events: Vec<Envelope<BusEvent>>) -> Result<(), BusError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Takes up to `max` pending events of one kind.
    async fn fetch(&self, kind: EventKind, max: usize)
    -> Result<Vec<Envelope<BusEvent>>, BusError>;
}

/// In-process work-queue bus.
#[derive(Debug, Default)]
pub struct MemoryBus {
    queues: Mutex<BTreeMap<EventKind, VecDeque<Envelope<BusEvent>>>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued events of one kind.
    #[must_use]
    pub fn pending(&self, kind: EventKind) -> usize {
        self.queues
            .lock()
            .map(|queues| queues.get(&kind).map_or(0, VecDeque::len))
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: Envelope<BusEvent>) -> Result<(), BusError> {
        let mut queues = self.queues.lock().map_err(|e| BusError::PublishFailed {
            message: format!("bus lock poisoned: {e}"),
        })?;
        queues
            .entry(event.payload.kind())
            .or_default()
            .push_back(event);
        Ok(())
    }

    async fn fetch(
        &self,
        kind: EventKind,
        max: usize,
    ) -> Result<Vec<Envelope<BusEvent>>, BusError> {
        let mut queues = self.queues.lock().map_err(|e| BusError::FetchFailed {
            message: format!("bus lock poisoned: {e}"),
        })?;
        let Some(queue) = queues.get_mut(&kind) else {
            return Ok(Vec::new());
        };
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_by_type() {
        let processing_id = ProcessingId::new();
        let event = BusEvent::SyncProcessing { processing_id };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "sync_processing");
        assert_eq!(event.kind().subject(), "workweave.events.sync_processing");
        assert_eq!(event.processing_id(), Some(processing_id));

        let back: BusEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn memory_bus_is_a_work_queue() {
        let bus = MemoryBus::new();
        let request_id = RequestId::new();
        let events: Vec<_> = (0..3)
            .map(|_| {
                Envelope::new(BusEvent::ContentsUpdated {
                    request_id,
                    transform_ids: vec![TransformId::new()],
                })
            })
            .collect();
        bus.publish_bulk(events).await.unwrap();
        bus.publish(Envelope::new(BusEvent::NewProcessing {
            processing_id: ProcessingId::new(),
        }))
        .await
        .unwrap();

        assert_eq!(bus.fetch(EventKind::ContentsUpdated, 2).await.unwrap().len(), 2);
        assert_eq!(bus.pending(EventKind::ContentsUpdated), 1);
        assert_eq!(bus.pending(EventKind::NewProcessing), 1);
        assert!(bus.fetch(EventKind::WorkTerminated, 5).await.unwrap().is_empty());
    }
}

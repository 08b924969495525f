//! NATS JetStream event bus.
//!
//! Events go to `workweave.events.<kind>` on a single work-queue stream.
//! Each kind is consumed through its own durable pull consumer, so a
//! message is handed to one agent and removed once acknowledged.

use crate::bus::{BusEvent, EVENTS_SUBJECT_PREFIX, EventBus, EventKind};
use crate::envelope::{CURRENT_VERSION, Envelope, RawEnvelope};
use crate::error::BusError;
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stream name for carrier events.
const EVENTS_STREAM_NAME: &str = "WORKWEAVE_EVENTS";

/// Prefix of the durable consumer names.
const CONSUMER_PREFIX: &str = "workweave";

/// Configuration of the NATS event bus.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// Stream name (defaults to WORKWEAVE_EVENTS).
    pub stream_name: Option<String>,
}

impl NatsConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: None,
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(EVENTS_STREAM_NAME)
    }
}

fn consumer_name(kind: EventKind) -> String {
    format!("{CONSUMER_PREFIX}_{}", kind.as_str())
}

/// JetStream-backed [`EventBus`].
pub struct NatsEventBus {
    jetstream: Arc<jetstream::Context>,
    config: NatsConfig,
}

impl NatsEventBus {
    /// Connects and makes sure the stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: NatsConfig) -> Result<Self, BusError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BusError::ConnectionFailed {
                message: e.to_string(),
            })?;
        let jetstream = async_nats::jetstream::new(client);

        let stream_config = jetstream::stream::Config {
            name: config.stream().to_string(),
            subjects: vec![format!("{EVENTS_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };
        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| BusError::ConnectionFailed {
                message: format!("failed to create events stream: {e}"),
            })?;

        Ok(Self {
            jetstream: Arc::new(jetstream),
            config,
        })
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: Envelope<BusEvent>) -> Result<(), BusError> {
        let subject = event.payload.kind().subject();
        let bytes = event
            .to_json_bytes()
            .map_err(|e| BusError::PublishFailed {
                message: format!("failed to serialize event: {e}"),
            })?;

        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| BusError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| BusError::PublishFailed {
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn fetch(
        &self,
        kind: EventKind,
        max: usize,
    ) -> Result<Vec<Envelope<BusEvent>>, BusError> {
        let stream = self
            .jetstream
            .get_stream(self.config.stream())
            .await
            .map_err(|e| BusError::FetchFailed {
                message: format!("failed to get stream: {e}"),
            })?;

        let name = consumer_name(kind);
        let consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(name.clone()),
            filter_subject: kind.subject(),
            deliver_policy: jetstream::consumer::DeliverPolicy::All,
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(&name, consumer_config)
            .await
            .map_err(|e| BusError::FetchFailed {
                message: format!("failed to create consumer: {e}"),
            })?;

        let mut messages = consumer
            .fetch()
            .max_messages(max)
            .messages()
            .await
            .map_err(|e| BusError::FetchFailed {
                message: format!("failed to get messages: {e}"),
            })?;

        let mut events = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| BusError::FetchFailed {
                message: e.to_string(),
            })?;

            match RawEnvelope::from_json_bytes(&message.payload) {
                Ok(raw) if raw.version() == CURRENT_VERSION => match raw.decode::<BusEvent>() {
                    Ok(envelope) => events.push(envelope),
                    Err(e) => warn!(kind = %kind, error = %e, "dropping undecodable event"),
                },
                Ok(raw) => {
                    warn!(kind = %kind, version = raw.version(), "dropping event with unknown version");
                }
                Err(e) => warn!(kind = %kind, error = %e, "dropping malformed event"),
            }

            message.ack().await.map_err(|e| BusError::FetchFailed {
                message: format!("failed to ack message: {e}"),
            })?;
        }

        debug!(kind = %kind, count = events.len(), "fetched events");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nats_config_defaults() {
        let config = NatsConfig::new("nats://localhost:4222");
        assert_eq!(config.stream(), EVENTS_STREAM_NAME);

        let named = NatsConfig {
            stream_name: Some("CUSTOM".to_string()),
            ..config
        };
        assert_eq!(named.stream(), "CUSTOM");
    }

    #[test]
    fn one_durable_consumer_per_kind() {
        assert_eq!(
            consumer_name(EventKind::ContentsUpdated),
            "workweave_contents_updated"
        );
        assert_ne!(
            consumer_name(EventKind::NewProcessing),
            consumer_name(EventKind::UpdateProcessing)
        );
    }
}

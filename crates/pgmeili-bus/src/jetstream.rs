//! NATS JetStream binding for the bus.

use async_nats::jetstream::{self, consumer, stream};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{info, warn};

use crate::consumer::Delivery;
use crate::distributor::ChangePublisher;
use crate::error::{BusError, BusResult};

/// Where changes are published and who reads them back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub url: String,
    /// JetStream stream holding the changes.
    pub stream: String,
    pub subject: String,
    /// Durable consumer name; its position survives restarts.
    pub durable: String,
    /// Per-table worker queue size on the consuming side.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".into(),
            stream: "pgmeili".into(),
            subject: "pgmeili.changes".into(),
            durable: "pgmeili-sync".into(),
            queue_capacity: 256,
        }
    }
}

/// A connected JetStream context with the change stream in place.
pub struct JetStreamBus {
    context: jetstream::Context,
    stream: stream::Stream,
    config: BusConfig,
}

impl JetStreamBus {
    /// Connect and make sure the stream exists.
    pub async fn connect(config: BusConfig) -> BusResult<Self> {
        let client = async_nats::connect(config.url.as_str())
            .await
            .map_err(|e| BusError::Connect {
                url: config.url.clone(),
                message: e.to_string(),
            })?;
        let context = jetstream::new(client);

        let stream = context
            .get_or_create_stream(stream::Config {
                name: config.stream.clone(),
                subjects: vec![config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Setup(format!("stream {}: {}", config.stream, e)))?;

        info!(
            url = %config.url,
            stream = %config.stream,
            subject = %config.subject,
            "Connected to JetStream"
        );

        Ok(Self {
            context,
            stream,
            config,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn publisher(&self) -> JetStreamPublisher {
        JetStreamPublisher {
            context: self.context.clone(),
            subject: self.config.subject.clone(),
        }
    }

    /// Deliveries from the durable pull consumer, oldest unacknowledged first.
    pub async fn deliveries(
        &self,
    ) -> BusResult<impl Stream<Item = BusResult<JetStreamDelivery>> + Send> {
        let consumer = self
            .stream
            .get_or_create_consumer(
                &self.config.durable,
                consumer::pull::Config {
                    durable_name: Some(self.config.durable.clone()),
                    filter_subject: self.config.subject.clone(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Setup(format!("consumer {}: {}", self.config.durable, e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        info!(durable = %self.config.durable, "Subscribed to change stream");
        Ok(messages.map(|message| {
            message
                .map(JetStreamDelivery)
                .map_err(|e| BusError::Subscribe(e.to_string()))
        }))
    }
}

/// Publishes onto the change subject.
#[derive(Clone)]
pub struct JetStreamPublisher {
    context: jetstream::Context,
    subject: String,
}

impl ChangePublisher for JetStreamPublisher {
    async fn publish(&self, payload: Bytes) -> BusResult<()> {
        let ack = self
            .context
            .publish(self.subject.clone(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        let subject = self.subject.clone();
        tokio::spawn(async move {
            if let Err(e) = ack.await {
                warn!(subject = %subject, error = %e, "JetStream did not acknowledge a published change");
            }
        });
        Ok(())
    }
}

/// A JetStream message awaiting acknowledgement.
pub struct JetStreamDelivery(jetstream::Message);

impl Delivery for JetStreamDelivery {
    fn payload(&self) -> &[u8] {
        &self.0.payload
    }

    async fn ack(self) -> BusResult<()> {
        self.0.ack().await.map_err(|e| BusError::Ack(e.to_string()))
    }
}

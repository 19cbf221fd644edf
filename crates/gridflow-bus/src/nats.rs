//! JetStream-backed [`EventBus`] implementation.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy, DeliverPolicy},
    stream::{Config as JsStreamConfig, DiscardPolicy, RetentionPolicy as JsRetentionPolicy},
};
use async_trait::async_trait;
use futures::StreamExt;

use crate::{
    Ackable, ConsumerConfig, DeliveredMessage, EventBus, MessageStream, PublishAck, PublishError,
    RetentionPolicy, StreamConfig,
};

pub struct NatsBus {
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Connects to `url` and wraps the resulting client in a JetStream context.
    pub async fn connect(url: &str) -> Result<Self, PublishError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| PublishError::Other(anyhow::anyhow!(e)))?;
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, PublishError> {
        let ack_future = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        let ack = ack_future
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        Ok(PublishAck {
            stream_sequence: ack.sequence,
        })
    }

    async fn create_or_update_stream(&self, config: StreamConfig) -> Result<(), PublishError> {
        let retention = match config.retention {
            RetentionPolicy::Limits => JsRetentionPolicy::Limits,
            RetentionPolicy::WorkQueue => JsRetentionPolicy::WorkQueue,
        };
        self.jetstream
            .get_or_create_stream(JsStreamConfig {
                name: config.name,
                subjects: config.subjects,
                retention,
                discard: DiscardPolicy::Old,
                max_age: config.max_age.unwrap_or_default(),
                ..Default::default()
            })
            .await
            .map_err(|e| PublishError::Setup(e.to_string()))?;
        Ok(())
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), PublishError> {
        let stream_handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| PublishError::Setup(e.to_string()))?;
        stream_handle
            .get_or_create_consumer(
                &config.durable_name.clone(),
                PullConfig {
                    durable_name: Some(config.durable_name),
                    filter_subject: config.filter_subject,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: config.ack_wait,
                    max_deliver: config.max_deliver,
                    deliver_policy: DeliverPolicy::All,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| PublishError::Setup(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, stream: &str, consumer: &str) -> Result<MessageStream, PublishError> {
        let stream_handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| PublishError::Setup(e.to_string()))?;
        let consumer_handle: jetstream::consumer::PullConsumer = stream_handle
            .get_consumer(consumer)
            .await
            .map_err(|e| PublishError::Setup(e.to_string()))?;
        let messages = consumer_handle
            .messages()
            .await
            .map_err(|e| PublishError::Setup(e.to_string()))?;

        let mapped = messages.filter_map(|result| async move {
            match result {
                Ok(message) => {
                    let delivery_count = message
                        .info()
                        .map(|info| info.delivered as u64)
                        .unwrap_or(1);
                    let subject = message.subject.to_string();
                    let payload = message.payload.to_vec();
                    Some(DeliveredMessage {
                        subject,
                        payload,
                        ack: Box::new(NatsAck {
                            message,
                            delivery_count,
                        }),
                    })
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed delivery from jetstream consumer");
                    None
                }
            }
        });

        Ok(Box::pin(mapped))
    }
}

struct NatsAck {
    message: jetstream::Message,
    delivery_count: u64,
}

#[async_trait]
impl Ackable for NatsAck {
    async fn ack(&self) -> Result<(), PublishError> {
        self.message
            .ack()
            .await
            .map_err(|e| PublishError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), PublishError> {
        let kind = jetstream::AckKind::Nak(delay);
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| PublishError::Ack(e.to_string()))
    }

    async fn term(&self) -> Result<(), PublishError> {
        self.message
            .ack_with(jetstream::AckKind::Term)
            .await
            .map_err(|e| PublishError::Ack(e.to_string()))
    }

    fn delivery_count(&self) -> u64 {
        self.delivery_count
    }
}

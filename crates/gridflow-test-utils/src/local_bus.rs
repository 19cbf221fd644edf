//! In-process [`EventBus`] double so TS/TCR/WLM unit tests don't need a
//! running NATS server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gridflow_bus::{
    Ackable, ConsumerConfig, DeliveredMessage, EventBus, MessageStream, PublishAck, PublishError,
    StreamConfig,
};
use tokio::sync::{mpsc, Mutex};

#[derive(Clone)]
struct RawMessage {
    subject: String,
    payload: Vec<u8>,
    delivery_count: u64,
}

struct ConsumerEntry {
    filter_subject: String,
    max_deliver: i64,
    sender: mpsc::UnboundedSender<RawMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<RawMessage>>>,
}

/// Routes messages by a simple subject-wildcard match (`*` matches exactly
/// one dot-separated token, same arity as the subjects in
/// `gridflow_bus::subjects`). `nak` simulates JetStream redelivery by
/// re-enqueueing the message after a delay, bounded by the consumer's
/// `max_deliver`; `ack`/`term` are no-ops since there is nothing to tell a
/// real server.
#[derive(Default)]
pub struct LocalBus {
    streams: DashMap<String, Vec<String>>,
    consumers: DashMap<String, ConsumerEntry>,
    sequence: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

fn subject_matches(filter: &str, subject: &str) -> bool {
    let filter_tokens: Vec<&str> = filter.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    if filter_tokens.len() != subject_tokens.len() {
        return false;
    }
    filter_tokens
        .iter()
        .zip(subject_tokens.iter())
        .all(|(f, s)| *f == "*" || f == s)
}

struct LocalAck {
    sender: mpsc::UnboundedSender<RawMessage>,
    message: RawMessage,
    max_deliver: i64,
}

#[async_trait]
impl Ackable for LocalAck {
    async fn ack(&self) -> Result<(), PublishError> {
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), PublishError> {
        if self.message.delivery_count >= self.max_deliver as u64 {
            return Ok(());
        }
        let mut redelivered = self.message.clone();
        redelivered.delivery_count += 1;
        let sender = self.sender.clone();
        let delay = delay.unwrap_or_else(|| Duration::from_millis(10));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(redelivered);
        });
        Ok(())
    }

    async fn term(&self) -> Result<(), PublishError> {
        Ok(())
    }

    fn delivery_count(&self) -> u64 {
        self.message.delivery_count
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, PublishError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        for entry in self.consumers.iter() {
            if subject_matches(&entry.filter_subject, subject) {
                let _ = entry.sender.send(RawMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    delivery_count: 1,
                });
            }
        }
        Ok(PublishAck {
            stream_sequence: sequence,
        })
    }

    async fn create_or_update_stream(&self, config: StreamConfig) -> Result<(), PublishError> {
        self.streams.insert(config.name, config.subjects);
        Ok(())
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), PublishError> {
        if !self.streams.contains_key(stream) {
            return Err(PublishError::Setup(format!("unknown stream {stream}")));
        }
        let key = format!("{stream}:{}", config.durable_name);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.consumers.insert(
            key,
            ConsumerEntry {
                filter_subject: config.filter_subject,
                max_deliver: config.max_deliver,
                sender,
                receiver: Mutex::new(Some(receiver)),
            },
        );
        Ok(())
    }

    async fn subscribe(&self, stream: &str, consumer: &str) -> Result<MessageStream, PublishError> {
        let key = format!("{stream}:{consumer}");
        let entry = self
            .consumers
            .get(&key)
            .ok_or_else(|| PublishError::Setup(format!("unknown consumer {key}")))?;

        let mut receiver_slot = entry.receiver.lock().await;
        let mut receiver = receiver_slot
            .take()
            .ok_or_else(|| PublishError::Setup(format!("consumer {key} already subscribed")))?;
        drop(receiver_slot);

        let sender = entry.sender.clone();
        let max_deliver = entry.max_deliver;
        drop(entry);

        let stream = async_stream::stream! {
            while let Some(raw) = receiver.recv().await {
                yield DeliveredMessage {
                    subject: raw.subject.clone(),
                    payload: raw.payload.clone(),
                    ack: Box::new(LocalAck {
                        sender: sender.clone(),
                        message: raw,
                        max_deliver,
                    }),
                };
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use gridflow_bus::RetentionPolicy;
    use std::time::Duration as StdDuration;

    fn stream_config(name: &str, subject: &str) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            subjects: vec![subject.to_string()],
            retention: RetentionPolicy::WorkQueue,
            max_age: None,
        }
    }

    fn consumer_config(durable_name: &str, filter_subject: &str) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: durable_name.to_string(),
            filter_subject: filter_subject.to_string(),
            ack_wait: StdDuration::from_secs(5),
            max_deliver: 3,
        }
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_message() {
        let bus = LocalBus::new();
        bus.create_or_update_stream(stream_config("task_dispatch", "task.dispatch.*"))
            .await
            .unwrap();
        bus.create_or_update_consumer(
            "task_dispatch",
            consumer_config("worker-1", "task.dispatch.*"),
        )
        .await
        .unwrap();

        let mut messages = bus.subscribe("task_dispatch", "worker-1").await.unwrap();
        bus.publish("task.dispatch.process", b"hello".to_vec())
            .await
            .unwrap();

        let delivered = messages.next().await.unwrap();
        assert_eq!(delivered.subject, "task.dispatch.process");
        assert_eq!(delivered.payload, b"hello");
        assert_eq!(delivered.ack.delivery_count(), 1);
    }

    #[tokio::test]
    async fn nak_redelivers_with_incremented_delivery_count() {
        let bus = LocalBus::new();
        bus.create_or_update_stream(stream_config("task_status", "task.status.*"))
            .await
            .unwrap();
        bus.create_or_update_consumer(
            "task_status",
            consumer_config("tcr", "task.status.*"),
        )
        .await
        .unwrap();

        let mut messages = bus.subscribe("task_status", "tcr").await.unwrap();
        bus.publish("task.status.success", b"{}".to_vec())
            .await
            .unwrap();

        let first = messages.next().await.unwrap();
        assert_eq!(first.ack.delivery_count(), 1);
        first.ack.nak(Some(StdDuration::from_millis(1))).await.unwrap();

        let second = messages.next().await.unwrap();
        assert_eq!(second.ack.delivery_count(), 2);
    }

    #[tokio::test]
    async fn subscribe_twice_on_same_consumer_errors() {
        let bus = LocalBus::new();
        bus.create_or_update_stream(stream_config("worker_heartbeat", "worker.heartbeat.*"))
            .await
            .unwrap();
        bus.create_or_update_consumer(
            "worker_heartbeat",
            consumer_config("wlm", "worker.heartbeat.*"),
        )
        .await
        .unwrap();

        let _first = bus.subscribe("worker_heartbeat", "wlm").await.unwrap();
        let second = bus.subscribe("worker_heartbeat", "wlm").await;
        assert!(second.is_err());
    }
}

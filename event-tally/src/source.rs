use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::Message;
use thiserror::Error;
use tracing::{debug, warn};

use common_kafka::config::{ConsumerConfig, KafkaConfig};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    /// The message carried no usable routing key. It has already been
    /// settled so it will not come back; the caller just moves on.
    #[error("message without a usable routing key")]
    MissingKey,
}

/// Terminal state of a delivery. Both outcomes settle the message with the
/// broker; they differ only in what the pipeline logs and counts. Nothing
/// is ever requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed, or intentionally discarded as a duplicate or unknown
    /// kind.
    Ack,
    /// Unusable payload or routing key.
    Reject,
}

#[async_trait]
pub trait DeliveryHandle: Send {
    async fn resolve(self: Box<Self>, outcome: DeliveryOutcome);
}

/// One raw message plus the handle to settle it with. Settling consumes
/// the delivery, so it can happen at most once.
pub struct Delivery {
    routing_key: String,
    payload: Vec<u8>,
    handle: Box<dyn DeliveryHandle>,
}

impl Delivery {
    pub fn new(routing_key: String, payload: Vec<u8>, handle: Box<dyn DeliveryHandle>) -> Self {
        Self {
            routing_key,
            payload,
            handle,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn ack(self) {
        self.handle.resolve(DeliveryOutcome::Ack).await;
    }

    pub async fn reject(self) {
        self.handle.resolve(DeliveryOutcome::Reject).await;
    }
}

/// Hands the ingestion loop one delivery at a time. `Ok(None)` means the
/// stream is finished and no further delivery will ever arrive.
#[async_trait]
pub trait EventSource: Send {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, SourceError>;
}

/// Kafka-backed source: the message key carries the routing key, the
/// payload carries the event JSON.
pub struct KafkaSource {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig, consumer: &ConsumerConfig) -> Result<Self, KafkaError> {
        let consumer_client = common_kafka::consumer::create_consumer(config, consumer)?;
        Ok(Self {
            inner: Arc::new(Inner {
                consumer: consumer_client,
                topic: consumer.kafka_consumer_topic.clone(),
            }),
        })
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, SourceError> {
        let message = self.inner.consumer.recv().await?;

        let offset = KafkaOffset {
            inner: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let routing_key = match message.key().map(std::str::from_utf8) {
            Some(Ok(key)) => key.to_string(),
            None | Some(Err(_)) => {
                // Settle it here so it is not redelivered forever.
                warn!(
                    partition = message.partition(),
                    offset = message.offset(),
                    "message key missing or not utf-8"
                );
                Box::new(offset).resolve(DeliveryOutcome::Reject).await;
                return Err(SourceError::MissingKey);
            }
        };
        let payload = message.payload().unwrap_or_default().to_vec();

        Ok(Some(Delivery::new(routing_key, payload, Box::new(offset))))
    }
}

/// Weak handle back to the consumer, so a delivery outliving its source
/// degrades to a warning instead of pinning the client.
struct KafkaOffset {
    inner: Weak<Inner>,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl DeliveryHandle for KafkaOffset {
    async fn resolve(self: Box<Self>, outcome: DeliveryOutcome) {
        let Some(inner) = self.inner.upgrade() else {
            warn!(
                partition = self.partition,
                offset = self.offset,
                "consumer gone before delivery was settled"
            );
            return;
        };
        if let Err(e) = inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)
        {
            warn!(
                error = %e,
                partition = self.partition,
                offset = self.offset,
                "failed to store offset"
            );
            return;
        }
        match outcome {
            DeliveryOutcome::Ack => {
                debug!(partition = self.partition, offset = self.offset, "delivery acked");
            }
            DeliveryOutcome::Reject => {
                debug!(
                    partition = self.partition,
                    offset = self.offset,
                    "delivery rejected, not requeued"
                );
            }
        }
    }
}

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

/// Build a `FutureProducer` and verify broker connectivity.
///
/// Blocks up to the metadata timeout while pinging the brokers, so a bad
/// host list fails here instead of on the first send.
pub fn create_producer(config: &KafkaConfig) -> Result<FutureProducer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: FutureProducer = client_config.create()?;

    match producer
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                topics = metadata.topics().len(),
                "connected to kafka brokers"
            );
        }
        Err(error) => {
            error!(%error, "failed to fetch metadata from kafka brokers");
            return Err(error);
        }
    }

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Produce(#[from] KafkaError),
    #[error("produce cancelled before a delivery report arrived")]
    Cancelled,
}

/// Produce every item to `topic`, keyed by `key_extractor`, and wait for
/// all delivery reports. Results are returned in input order.
pub async fn send_keyed_iter_to_kafka<T, C: ClientContext + 'static>(
    producer: &FutureProducer<C>,
    topic: &str,
    key_extractor: impl Fn(&T) -> Option<String>,
    iter: impl IntoIterator<Item = T>,
) -> Vec<Result<(), KafkaProduceError>>
where
    T: Serialize,
{
    let mut results = Vec::new();
    let mut handles = Vec::new();

    // Queue everything first, then await the reports, so the producer can
    // batch across the whole iterator.
    for (index, item) in iter.into_iter().enumerate() {
        let key = key_extractor(&item);
        let payload = match serde_json::to_string(&item) {
            Ok(payload) => payload,
            Err(e) => {
                results.push((index, Err(KafkaProduceError::Serialization(e))));
                continue;
            }
        };

        let record = FutureRecord {
            topic,
            key: key.as_deref(),
            payload: Some(&payload),
            timestamp: None,
            partition: None,
            headers: None,
        };

        match producer.send_result(record) {
            Ok(handle) => handles.push((index, handle)),
            Err((e, _)) => results.push((index, Err(KafkaProduceError::Produce(e)))),
        }
    }

    for (index, handle) in handles {
        let result = match handle.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(KafkaProduceError::Produce(e)),
            Err(_) => Err(KafkaProduceError::Cancelled),
        };
        results.push((index, result));
    }

    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

/// Build a `StreamConsumer` subscribed to the configured topic.
///
/// Offset storing is manual: committed positions only advance past a
/// message once the caller stores its offset, so unstored messages are
/// redelivered after a restart.
pub fn create_consumer(
    config: &KafkaConfig,
    consumer_config: &ConsumerConfig,
) -> Result<StreamConsumer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("group.id", &consumer_config.kafka_consumer_group)
        .set(
            "auto.offset.reset",
            &consumer_config.kafka_consumer_offset_reset,
        )
        .set("session.timeout.ms", "10000")
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    debug!("rdkafka consumer configuration: {:?}", client_config);
    let consumer: StreamConsumer = client_config.create()?;
    consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

    info!(
        topic = consumer_config.kafka_consumer_topic,
        group = consumer_config.kafka_consumer_group,
        "kafka consumer subscribed"
    );

    Ok(consumer)
}

use envconfig::Envconfig;

/// Client settings shared by producers and consumers.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Maximum time between producer batches during low traffic
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    // Time before we stop retrying producing a message
    #[envconfig(default = "10000")]
    pub kafka_message_timeout_ms: u32,

    // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,
}

/// Consumer-side settings. Group and topic have no sensible cross-service
/// defaults, so services seed them through `set_defaults` before reading
/// their config from the environment.
#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // earliest or latest
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,
}

impl ConsumerConfig {
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        }
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_defaults_seed_the_environment() {
        ConsumerConfig::set_defaults("tally-test-group", "tally-test-topic");

        let config = ConsumerConfig::init_from_env().unwrap();
        assert_eq!(config.kafka_consumer_group, "tally-test-group");
        assert_eq!(config.kafka_consumer_topic, "tally-test-topic");
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
    }
}

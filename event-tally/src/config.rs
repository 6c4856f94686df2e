use std::time::Duration;

use envconfig::Envconfig;

use common_kafka::config::{ConsumerConfig, KafkaConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3312")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    /// Quiet seconds on the source before the service drains and exits.
    #[envconfig(from = "IDLE_TIMEOUT_SECS", default = "5")]
    pub idle_timeout_secs: u64,

    /// Directory the per-kind tally files are written into on shutdown.
    #[envconfig(from = "OUTPUT_DIR", default = "results")]
    pub output_dir: String,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

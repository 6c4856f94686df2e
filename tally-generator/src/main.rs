use std::path::PathBuf;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use common_kafka::config::KafkaConfig;
use common_kafka::producer::{create_producer, send_keyed_iter_to_kafka};

mod generate;

use generate::{expected_counts, generate, write_summaries};

#[derive(Parser)]
#[command(
    name = "tally-generator",
    about = "Publish synthetic user lifecycle events along with the tallies they should produce"
)]
struct Cli {
    /// Number of events to generate.
    #[arg(long, default_value_t = 20)]
    count: usize,

    /// Size of the user pool events are drawn from.
    #[arg(long, default_value_t = 10)]
    users: usize,

    /// Fraction of events given a kind outside the known set.
    #[arg(long, default_value_t = 0.0)]
    unknown_ratio: f64,

    /// Seed for a reproducible batch.
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for the per-kind expected-count summaries.
    #[arg(long)]
    summary_out: Option<PathBuf>,

    /// Publish the batch to Kafka.
    #[arg(long)]
    publish: bool,

    /// Kafka bootstrap brokers, as comma-separated host:port pairs.
    #[arg(long, default_value = "localhost:9092")]
    brokers: String,

    /// Topic the events are published to.
    #[arg(long, default_value = "user-events")]
    topic: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    anyhow::ensure!(cli.users > 0, "--users must be at least 1");
    anyhow::ensure!(
        (0.0..=1.0).contains(&cli.unknown_ratio),
        "--unknown-ratio must be between 0 and 1"
    );

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let events = generate(cli.count, cli.users, cli.unknown_ratio, &mut rng);
    info!(count = events.len(), users = cli.users, "generated event batch");

    if let Some(dir) = &cli.summary_out {
        write_summaries(dir, &expected_counts(&events))?;
        info!(dir = %dir.display(), "expected-count summaries written");
    }

    if cli.publish {
        let config = KafkaConfig {
            kafka_hosts: cli.brokers.clone(),
            kafka_tls: false,
            kafka_producer_linger_ms: 20,
            kafka_message_timeout_ms: 10000,
            kafka_compression_codec: "none".to_string(),
        };
        let producer = create_producer(&config)?;
        let results = send_keyed_iter_to_kafka(
            &producer,
            &cli.topic,
            |event| Some(event.routing_key.clone()),
            events.iter(),
        )
        .await;

        let mut failed = 0;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "failed to publish event");
                failed += 1;
            }
        }
        anyhow::ensure!(failed == 0, "{failed} of {} events failed to publish", events.len());
        info!(published = events.len(), topic = cli.topic, "batch published");
    }

    Ok(())
}

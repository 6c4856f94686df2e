use std::future::ready;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common_kafka::config::ConsumerConfig;
use common_metrics::{serve, setup_metrics_routes};
use health::HealthRegistry;

use event_tally::config::Config;
use event_tally::consumer::IngestionLoop;
use event_tally::counter::EventCounter;
use event_tally::dispatch::Dispatcher;
use event_tally::source::KafkaSource;

// Slack added to the idle timeout before the liveness probe counts the
// ingestion loop as stalled.
const LIVENESS_SLACK: Duration = Duration::from_secs(30);

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().expect("static directive")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn index() -> &'static str {
    "event-tally service"
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("starting event-tally service");

    ConsumerConfig::set_defaults("event-tally", "user-events");
    let config = Config::init_from_env()?;
    info!(
        topic = config.consumer.kafka_consumer_topic,
        group = config.consumer.kafka_consumer_group,
        idle_timeout_secs = config.idle_timeout_secs,
        output_dir = config.output_dir,
        "configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let status_liveness = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(status_liveness.get_status())),
        );
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start status server");
    });

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        info!("shutdown signal received");
        ctrl_c_shutdown.cancel();
    });

    let counter = Arc::new(EventCounter::new());
    let mut dispatcher = Dispatcher::new(counter.clone());
    dispatcher.start_workers(&shutdown);

    let source = KafkaSource::new(&config.kafka, &config.consumer)?;
    let ingestion_liveness = liveness
        .register("ingestion", config.idle_timeout() + LIVENESS_SLACK)
        .await;
    let ingestion = IngestionLoop::new(
        &counter,
        &dispatcher,
        config.idle_timeout(),
        ingestion_liveness,
    );

    let reason = ingestion.run(source, &shutdown).await;
    info!(?reason, "ingestion finished, waiting for in-flight events");
    dispatcher.wait_for_completion().await;

    if let Err(e) = counter.snapshot_and_persist(Path::new(&config.output_dir)) {
        error!(error = %e, "failed to persist tallies");
    }

    shutdown.cancel();
    dispatcher.close().await;

    info!("event-tally service stopped");
    Ok(())
}

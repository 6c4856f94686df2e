use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use health::{HealthHandle, HealthRegistry};
use tokio_util::sync::CancellationToken;

use event_tally::consumer::{IngestionLoop, StopReason};
use event_tally::counter::{EventCounter, UserTally};
use event_tally::dispatch::Dispatcher;
use event_tally::source::DeliveryOutcome;
use event_tally::test::{EndBehavior, OutcomeLog, ScriptedSource};

async fn liveness_handle() -> HealthHandle {
    HealthRegistry::new("liveness")
        .register("ingestion", Duration::from_secs(30))
        .await
}

fn read_tally(dir: &Path, kind: &str) -> Vec<UserTally> {
    let raw = fs::read_to_string(dir.join(format!("{kind}.json"))).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn tally(user_id: &str, count: u64) -> UserTally {
    UserTally {
        user_id: user_id.to_string(),
        count,
    }
}

#[tokio::test]
async fn mixed_batch_end_to_end() {
    let counter = Arc::new(EventCounter::new());
    let shutdown = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(counter.clone());
    dispatcher.start_workers(&shutdown);

    let log = OutcomeLog::new();
    let mut source = ScriptedSource::new(EndBehavior::Close);
    source.push("u1.event.created", br#"{"id": "e1"}"#, "e1", &log);
    source.push("u1.event.created", br#"{"id": "e2"}"#, "e2", &log);
    source.push("u2.event.created", br#"{"id": "e3"}"#, "e3", &log);
    source.push("u1.event.UPDATED", br#"{"id": "e4"}"#, "e4", &log);
    // Same id as e1: discarded without touching the counts.
    source.push("u1.event.created", br#"{"id": "e1"}"#, "dup", &log);
    // Unknown kind: accepted, then dropped at dispatch.
    source.push("u9.event.renamed", br#"{"id": "e5"}"#, "unknown-kind", &log);
    // Two segments only: rejected before any bookkeeping.
    source.push("u3.created", br#"{"id": "e6"}"#, "bad-key", &log);
    source.push("u1.event.deleted", b"{ not json", "garbled", &log);
    source.push("u2.event.deleted", br#"{"id": "e7"}"#, "e7", &log);

    let ingestion = IngestionLoop::new(
        &counter,
        &dispatcher,
        Duration::from_secs(5),
        liveness_handle().await,
    );
    let reason = ingestion.run(source, &shutdown).await;
    assert_eq!(reason, StopReason::SourceClosed);

    dispatcher.wait_for_completion().await;
    assert_eq!(dispatcher.outstanding(), 0);

    let dir = tempfile::tempdir().unwrap();
    counter.snapshot_and_persist(dir.path()).unwrap();

    assert_eq!(
        read_tally(dir.path(), "created"),
        vec![tally("u1", 2), tally("u2", 1)]
    );
    assert_eq!(read_tally(dir.path(), "updated"), vec![tally("u1", 1)]);
    assert_eq!(read_tally(dir.path(), "deleted"), vec![tally("u2", 1)]);

    for tag in ["e1", "e2", "e3", "e4", "e7", "dup", "unknown-kind"] {
        assert_eq!(log.outcome_of(tag), Some(DeliveryOutcome::Ack), "{tag}");
    }
    for tag in ["bad-key", "garbled"] {
        assert_eq!(log.outcome_of(tag), Some(DeliveryOutcome::Reject), "{tag}");
    }

    shutdown.cancel();
    dispatcher.close().await;
}

#[tokio::test]
async fn quiet_source_drains_and_persists() {
    let counter = Arc::new(EventCounter::new());
    let shutdown = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(counter.clone());
    dispatcher.start_workers(&shutdown);

    let log = OutcomeLog::new();
    let mut source = ScriptedSource::new(EndBehavior::Idle);
    source.push("u5.event.deleted", br#"{"id": "e1"}"#, "e1", &log);
    source.push("u5.event.deleted", br#"{"id": "e2"}"#, "e2", &log);

    let ingestion = IngestionLoop::new(
        &counter,
        &dispatcher,
        Duration::from_millis(150),
        liveness_handle().await,
    );
    let reason = ingestion.run(source, &shutdown).await;
    assert_eq!(reason, StopReason::Idle);

    dispatcher.wait_for_completion().await;

    let dir = tempfile::tempdir().unwrap();
    counter.snapshot_and_persist(dir.path()).unwrap();

    assert_eq!(read_tally(dir.path(), "deleted"), vec![tally("u5", 2)]);
    assert!(read_tally(dir.path(), "created").is_empty());
    assert!(read_tally(dir.path(), "updated").is_empty());

    shutdown.cancel();
    dispatcher.close().await;
}

use std::time::Duration;

use health::HealthHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::counter::EventCounter;
use crate::dispatch::Dispatcher;
use crate::event::{EventMessage, InboundEvent};
use crate::routing::parse_routing_key;
use crate::source::{Delivery, EventSource, SourceError};

const DELIVERIES_COUNTER: &str = "tally_deliveries_total";
const SOURCE_ERRORS_COUNTER: &str = "tally_source_errors_total";

/// Pause after a transient source error, so a broken broker connection
/// does not spin the loop. Deliberately much shorter than the idle
/// timeout, which keeps ticking through it.
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Why [`IngestionLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No delivery arrived within the idle window.
    Idle,
    /// The shutdown token fired.
    Cancelled,
    /// The source reported end of stream.
    SourceClosed,
}

/// Pulls deliveries from a source and pushes accepted events into the
/// dispatcher, until the stream goes quiet, ends, or shutdown is
/// requested.
pub struct IngestionLoop<'a> {
    counter: &'a EventCounter,
    dispatcher: &'a Dispatcher,
    idle_timeout: Duration,
    liveness: HealthHandle,
}

impl<'a> IngestionLoop<'a> {
    pub fn new(
        counter: &'a EventCounter,
        dispatcher: &'a Dispatcher,
        idle_timeout: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            counter,
            dispatcher,
            idle_timeout,
            liveness,
        }
    }

    /// Drive the source until a stop condition is hit. The idle timer is
    /// rolling: it rearms on every delivery, including ones that end up
    /// rejected or discarded, and only fires after a full quiet window.
    pub async fn run<S: EventSource>(
        &self,
        mut source: S,
        shutdown: &CancellationToken,
    ) -> StopReason {
        info!(idle_timeout = ?self.idle_timeout, "ingestion started");

        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            self.liveness.report_healthy().await;

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutdown requested, stopping ingestion");
                    break StopReason::Cancelled;
                }
                () = &mut idle => {
                    info!(idle_timeout = ?self.idle_timeout, "no deliveries within the idle window, stopping ingestion");
                    break StopReason::Idle;
                }
                next = source.next_delivery() => match next {
                    Ok(Some(delivery)) => {
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        self.handle_delivery(shutdown, delivery).await;
                    }
                    Ok(None) => {
                        info!("source closed, stopping ingestion");
                        break StopReason::SourceClosed;
                    }
                    Err(SourceError::MissingKey) => {
                        // Already settled by the source; it still counts as
                        // traffic for the idle timer.
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        metrics::counter!(DELIVERIES_COUNTER, "outcome" => "invalid_routing_key")
                            .increment(1);
                    }
                    Err(e) => {
                        warn!(error = %e, "source error, backing off");
                        metrics::counter!(SOURCE_ERRORS_COUNTER).increment(1);
                        tokio::time::sleep(SOURCE_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }

    /// One delivery, end to end: decode, dedup, parse the routing key,
    /// mark processed, dispatch, settle.
    async fn handle_delivery(&self, shutdown: &CancellationToken, delivery: Delivery) {
        let event: InboundEvent = match serde_json::from_slice(delivery.payload()) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    routing_key = delivery.routing_key(),
                    "malformed payload, delivery rejected"
                );
                metrics::counter!(DELIVERIES_COUNTER, "outcome" => "malformed_payload")
                    .increment(1);
                delivery.reject().await;
                return;
            }
        };

        if self.counter.is_processed(&event.id) {
            debug!(message_id = event.id, "duplicate delivery discarded");
            metrics::counter!(DELIVERIES_COUNTER, "outcome" => "duplicate").increment(1);
            delivery.ack().await;
            return;
        }

        let Some(routing_key) = parse_routing_key(delivery.routing_key()) else {
            warn!(
                routing_key = delivery.routing_key(),
                message_id = event.id,
                "invalid routing key, delivery rejected"
            );
            metrics::counter!(DELIVERIES_COUNTER, "outcome" => "invalid_routing_key")
                .increment(1);
            delivery.reject().await;
            return;
        };

        // Marked before dispatch so a duplicate arriving while this one is
        // still queued gets discarded instead of double counted.
        self.counter.mark_processed(&event.id);

        let message = EventMessage {
            user_id: routing_key.user_id,
            kind: routing_key.kind,
            message_id: event.id,
        };
        self.dispatcher.dispatch(shutdown, message).await;

        delivery.ack().await;
        metrics::counter!(DELIVERIES_COUNTER, "outcome" => "processed").increment(1);
    }
}

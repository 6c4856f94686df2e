use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::counter::EventCounter;
use crate::event::{EventKind, EventMessage};

/// Per-kind lane capacity. Dispatch blocks once a lane holds this many
/// undrained messages.
pub const LANE_CAPACITY: usize = 100;

const DISPATCHED_COUNTER: &str = "tally_events_dispatched_total";
const OUTSTANDING_GAUGE: &str = "tally_outstanding_work";

/// Fans accepted events out to one bounded FIFO lane per kind, with a
/// dedicated worker per lane applying the counter mutations.
///
/// Every dispatch reserves a unit of outstanding work before the message
/// is offered to a lane, and each reservation is released exactly once:
/// by the worker that counted the message, or by dispatch itself when the
/// kind is unknown or cancellation interrupts the enqueue.
/// [`wait_for_completion`](Dispatcher::wait_for_completion) blocks until
/// the reservation count is back to zero.
pub struct Dispatcher {
    lanes: HashMap<EventKind, mpsc::Sender<EventMessage>>,
    parked: Option<Vec<(EventKind, mpsc::Receiver<EventMessage>)>>,
    outstanding: watch::Sender<usize>,
    counter: Arc<EventCounter>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(counter: Arc<EventCounter>) -> Self {
        let mut lanes = HashMap::new();
        let mut parked = Vec::new();
        for kind in EventKind::ALL {
            let (tx, rx) = mpsc::channel(LANE_CAPACITY);
            lanes.insert(kind, tx);
            parked.push((kind, rx));
        }
        let (outstanding, _receiver) = watch::channel(0);

        Self {
            lanes,
            parked: Some(parked),
            outstanding,
            counter,
            workers: Vec::new(),
        }
    }

    /// Launch one worker per kind. Call once, before the first dispatch.
    pub fn start_workers(&mut self, shutdown: &CancellationToken) {
        let Some(parked) = self.parked.take() else {
            warn!("dispatcher workers already started");
            return;
        };
        for (kind, lane) in parked {
            self.workers.push(tokio::spawn(worker_loop(
                kind,
                lane,
                self.counter.clone(),
                self.outstanding.clone(),
                shutdown.clone(),
            )));
        }
    }

    /// Route one message to the lane for its kind, waiting while that lane
    /// is full.
    ///
    /// The outstanding-work reservation is taken before anything else, so
    /// a completion waiter can never observe zero while a message sits
    /// between acceptance and its worker. Unknown kinds release the
    /// reservation and drop the message here; so does cancellation while
    /// blocked on a full lane. The select is biased toward the token, so
    /// nothing is enqueued once cancellation has been observed and the
    /// workers' shutdown drain misses nothing.
    pub async fn dispatch(&self, shutdown: &CancellationToken, message: EventMessage) {
        reserve(&self.outstanding);

        let Some(kind) = EventKind::parse(&message.kind) else {
            warn!(
                kind = message.kind,
                user_id = message.user_id,
                message_id = message.message_id,
                "unknown event kind, message dropped"
            );
            metrics::counter!(DISPATCHED_COUNTER, "kind" => "unknown").increment(1);
            release(&self.outstanding);
            return;
        };

        let lane = &self.lanes[&kind];
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                debug!(kind = %kind, "dispatch cancelled before enqueue, message dropped");
                release(&self.outstanding);
            }
            sent = lane.send(message) => match sent {
                Ok(()) => {
                    metrics::counter!(DISPATCHED_COUNTER, "kind" => kind.as_str()).increment(1);
                }
                Err(mpsc::error::SendError(dropped)) => {
                    error!(
                        kind = %kind,
                        message_id = dropped.message_id,
                        "lane closed, message dropped"
                    );
                    release(&self.outstanding);
                }
            },
        }
    }

    /// Wait until every reservation has been resolved. Returns immediately
    /// when nothing is outstanding.
    pub async fn wait_for_completion(&self) {
        let mut counts = self.outstanding.subscribe();
        // The sender lives on self, so the channel cannot close while we
        // hold the borrow.
        counts.wait_for(|outstanding| *outstanding == 0).await.ok();
    }

    /// Number of reservations not yet resolved.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Join the workers, then drop the lane senders. Call only after the
    /// shutdown token has fired; a worker that was never cancelled keeps
    /// waiting on its lane and so does this call.
    pub async fn close(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatch worker panicked");
            }
        }
        info!("dispatcher closed");
    }
}

async fn worker_loop(
    kind: EventKind,
    mut lane: mpsc::Receiver<EventMessage>,
    counter: Arc<EventCounter>,
    outstanding: watch::Sender<usize>,
    shutdown: CancellationToken,
) {
    debug!(kind = %kind, "worker started");
    loop {
        tokio::select! {
            next = lane.recv() => match next {
                Some(message) => count_message(kind, &counter, &outstanding, message),
                None => break,
            },
            () = shutdown.cancelled() => {
                // Nothing is enqueued after cancellation, so one drain of
                // the already-buffered messages settles every reservation
                // this lane holds.
                while let Ok(message) = lane.try_recv() {
                    count_message(kind, &counter, &outstanding, message);
                }
                break;
            }
        }
    }
    info!(kind = %kind, "worker stopped");
}

fn count_message(
    kind: EventKind,
    counter: &EventCounter,
    outstanding: &watch::Sender<usize>,
    message: EventMessage,
) {
    let total = counter.record(kind, &message.user_id);
    debug!(
        kind = %kind,
        user_id = message.user_id,
        message_id = message.message_id,
        total,
        "event counted"
    );
    release(outstanding);
}

fn reserve(outstanding: &watch::Sender<usize>) {
    let mut now = 0;
    outstanding.send_modify(|count| {
        *count += 1;
        now = *count;
    });
    common_metrics::gauge(OUTSTANDING_GAUGE, &[], now as f64);
}

fn release(outstanding: &watch::Sender<usize>) {
    let mut now = 0;
    outstanding.send_modify(|count| {
        *count = count.saturating_sub(1);
        now = *count;
    });
    common_metrics::gauge(OUTSTANDING_GAUGE, &[], now as f64);
}

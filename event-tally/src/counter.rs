use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::event::EventKind;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to create output directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize tallies for {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One row of a persisted tally file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTally {
    pub user_id: String,
    pub count: u64,
}

/// Per-kind tallies in the order users were first seen for that kind.
#[derive(Default)]
struct KindTally {
    slots: HashMap<String, usize>,
    entries: Vec<UserTally>,
}

impl KindTally {
    fn increment(&mut self, user_id: &str) -> u64 {
        match self.slots.get(user_id) {
            Some(&slot) => {
                let entry = &mut self.entries[slot];
                entry.count += 1;
                entry.count
            }
            None => {
                self.slots.insert(user_id.to_string(), self.entries.len());
                self.entries.push(UserTally {
                    user_id: user_id.to_string(),
                    count: 1,
                });
                1
            }
        }
    }
}

struct CounterState {
    tallies: HashMap<EventKind, KindTally>,
    processed: HashSet<String>,
}

/// Shared tally store for the pipeline: per-kind per-user counts plus the
/// set of event ids already taken on.
///
/// A single lock covers both tables, so a snapshot never mixes counts
/// from one moment with a processed set from another. The
/// [`is_processed`](EventCounter::is_processed) /
/// [`mark_processed`](EventCounter::mark_processed) pair is not atomic as
/// a unit; only the ingestion task runs that sequence, while workers
/// stick to [`record`](EventCounter::record).
pub struct EventCounter {
    state: Mutex<CounterState>,
}

impl EventCounter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState {
                tallies: HashMap::new(),
                processed: HashSet::new(),
            }),
        }
    }

    /// Count one event, returning the user's new total for that kind.
    pub fn record(&self, kind: EventKind, user_id: &str) -> u64 {
        self.lock().tallies.entry(kind).or_default().increment(user_id)
    }

    pub fn is_processed(&self, message_id: &str) -> bool {
        self.lock().processed.contains(message_id)
    }

    pub fn mark_processed(&self, message_id: &str) {
        self.lock().processed.insert(message_id.to_string());
    }

    /// Point-in-time copy of every kind's tally, in a fixed kind order.
    /// Kinds with no events yet come back as empty lists.
    pub fn snapshot(&self) -> Vec<(EventKind, Vec<UserTally>)> {
        let state = self.lock();
        EventKind::ALL
            .into_iter()
            .map(|kind| {
                let users = state
                    .tallies
                    .get(&kind)
                    .map(|tally| tally.entries.clone())
                    .unwrap_or_default();
                (kind, users)
            })
            .collect()
    }

    /// Write one `<kind>.json` file per kind under `dir`, each holding the
    /// users for that kind in first-seen order. Every kind gets a file,
    /// even when its list is empty. All writes are attempted regardless of
    /// individual failures; the first failure is returned once the rest
    /// have run. The state is copied out up front so file IO happens
    /// outside the lock.
    pub fn snapshot_and_persist(&self, dir: &Path) -> Result<(), SnapshotError> {
        let snapshot = self.snapshot();

        fs::create_dir_all(dir).map_err(|source| SnapshotError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut first_failure = None;
        for (kind, users) in snapshot {
            let path = dir.join(format!("{kind}.json"));
            match write_tally_file(&path, &users) {
                Ok(()) => {
                    info!(kind = %kind, users = users.len(), path = %path.display(), "tally file written");
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "failed to write tally file");
                    metrics::counter!("tally_snapshot_failures_total").increment(1);
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().expect("event counter lock poisoned")
    }
}

impl Default for EventCounter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_tally_file(path: &Path, users: &[UserTally]) -> Result<(), SnapshotError> {
    let json = serde_json::to_vec_pretty(users).map_err(|source| SnapshotError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| SnapshotError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn tally_for(counter: &EventCounter, kind: EventKind) -> Vec<UserTally> {
        counter
            .snapshot()
            .into_iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, users)| users)
            .unwrap()
    }

    #[test]
    fn record_returns_running_totals_per_kind_and_user() {
        let counter = EventCounter::new();

        assert_eq!(counter.record(EventKind::Created, "u1"), 1);
        assert_eq!(counter.record(EventKind::Created, "u1"), 2);
        assert_eq!(counter.record(EventKind::Updated, "u1"), 1);
        assert_eq!(counter.record(EventKind::Created, "u2"), 1);

        let created = tally_for(&counter, EventKind::Created);
        assert_eq!(
            created,
            vec![
                UserTally { user_id: "u1".to_string(), count: 2 },
                UserTally { user_id: "u2".to_string(), count: 1 },
            ]
        );
        assert!(tally_for(&counter, EventKind::Deleted).is_empty());
    }

    #[test]
    fn snapshot_preserves_first_seen_order() {
        let counter = EventCounter::new();
        for user in ["u3", "u1", "u2", "u1", "u3"] {
            counter.record(EventKind::Deleted, user);
        }

        let users: Vec<String> = tally_for(&counter, EventKind::Deleted)
            .into_iter()
            .map(|t| t.user_id)
            .collect();
        assert_eq!(users, vec!["u3", "u1", "u2"]);
    }

    #[test]
    fn tracks_processed_ids() {
        let counter = EventCounter::new();

        assert!(!counter.is_processed("evt-1"));
        counter.mark_processed("evt-1");
        assert!(counter.is_processed("evt-1"));
        assert!(!counter.is_processed("evt-2"));

        // Marking again is a no-op, not an error.
        counter.mark_processed("evt-1");
        assert!(counter.is_processed("evt-1"));
    }

    #[test]
    fn concurrent_records_never_lose_increments() {
        let counter = Arc::new(EventCounter::new());
        let threads: u64 = 8;
        let per_thread: u64 = 100;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        counter.record(EventKind::Created, "shared-user");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let created = tally_for(&counter, EventKind::Created);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].count, threads * per_thread);
    }

    #[test]
    fn persists_one_file_per_kind() {
        let counter = EventCounter::new();
        counter.record(EventKind::Created, "u1");
        counter.record(EventKind::Created, "u1");
        counter.record(EventKind::Updated, "u2");

        let dir = tempfile::tempdir().unwrap();
        counter.snapshot_and_persist(dir.path()).unwrap();

        let created: Vec<UserTally> =
            serde_json::from_slice(&fs::read(dir.path().join("created.json")).unwrap()).unwrap();
        assert_eq!(
            created,
            vec![UserTally { user_id: "u1".to_string(), count: 2 }]
        );

        let updated: Vec<UserTally> =
            serde_json::from_slice(&fs::read(dir.path().join("updated.json")).unwrap()).unwrap();
        assert_eq!(
            updated,
            vec![UserTally { user_id: "u2".to_string(), count: 1 }]
        );

        let deleted: Vec<UserTally> =
            serde_json::from_slice(&fs::read(dir.path().join("deleted.json")).unwrap()).unwrap();
        assert!(deleted.is_empty());
    }

    #[test]
    fn persists_empty_lists_when_nothing_was_counted() {
        let counter = EventCounter::new();
        let dir = tempfile::tempdir().unwrap();
        counter.snapshot_and_persist(dir.path()).unwrap();

        for kind in EventKind::ALL {
            let raw = fs::read_to_string(dir.path().join(format!("{kind}.json"))).unwrap();
            let users: Vec<UserTally> = serde_json::from_str(&raw).unwrap();
            assert!(users.is_empty(), "{kind} should have an empty list");
        }
    }

    #[test]
    fn persist_creates_the_output_directory() {
        let counter = EventCounter::new();
        counter.record(EventKind::Deleted, "u9");

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("results").join("latest");
        counter.snapshot_and_persist(&nested).unwrap();

        assert!(nested.join("deleted.json").exists());
    }
}

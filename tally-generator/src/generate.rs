use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

pub const EVENT_KINDS: [&str; 3] = ["created", "updated", "deleted"];

/// Kind outside the consumer's known set, for exercising its drop path.
pub const UNKNOWN_KIND: &str = "archived";

/// One synthetic event: the payload published to the topic plus the
/// routing key it is published under. Only the id lands in the payload.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedEvent {
    pub id: String,
    #[serde(skip)]
    pub routing_key: String,
    #[serde(skip)]
    pub user_id: String,
    #[serde(skip)]
    pub kind: &'static str,
}

pub fn generate<R: Rng>(
    count: usize,
    users: usize,
    unknown_ratio: f64,
    rng: &mut R,
) -> Vec<GeneratedEvent> {
    (0..count)
        .map(|_| {
            let user_id = format!("user-{}", rng.gen_range(1..=users));
            let kind = if unknown_ratio > 0.0 && rng.gen_bool(unknown_ratio) {
                UNKNOWN_KIND
            } else {
                EVENT_KINDS[rng.gen_range(0..EVENT_KINDS.len())]
            };
            GeneratedEvent {
                id: Uuid::new_v4().to_string(),
                routing_key: format!("{user_id}.event.{kind}"),
                user_id,
                kind,
            }
        })
        .collect()
}

/// Per-kind tallies this batch should produce in the consumer. Unknown
/// kinds are dropped over there, so they are left out here as well.
pub fn expected_counts(
    events: &[GeneratedEvent],
) -> BTreeMap<&'static str, BTreeMap<String, u64>> {
    let mut counts: BTreeMap<&'static str, BTreeMap<String, u64>> = EVENT_KINDS
        .iter()
        .map(|kind| (*kind, BTreeMap::new()))
        .collect();
    for event in events {
        if let Some(users) = counts.get_mut(event.kind) {
            *users.entry(event.user_id.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Write one `<kind>.json` summary per known kind under `dir`, each a
/// user-to-count object.
pub fn write_summaries(
    dir: &Path,
    counts: &BTreeMap<&'static str, BTreeMap<String, u64>>,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    for (kind, users) in counts {
        let path = dir.join(format!("{kind}.json"));
        std::fs::write(&path, serde_json::to_vec_pretty(users)?)?;
    }
    Ok(())
}

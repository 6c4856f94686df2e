use std::fmt;

use serde::Deserialize;

/// The closed set of user lifecycle events the service tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Updated, EventKind::Deleted];

    /// Case-insensitive match against the kind segment of a routing key.
    /// Anything outside the known set yields `None`.
    pub fn parse(raw: &str) -> Option<EventKind> {
        EventKind::ALL
            .into_iter()
            .find(|kind| raw.eq_ignore_ascii_case(kind.as_str()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accepted event on its way to a worker. The kind is kept as the raw
/// routing-key segment; the dispatcher resolves it against [`EventKind`].
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub user_id: String,
    pub kind: String,
    pub message_id: String,
}

/// Wire payload of a delivery. Only the id matters here, it is the
/// deduplication key for the whole pipeline.
#[derive(Debug, Deserialize)]
pub struct InboundEvent {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_kinds_case_insensitively() {
        assert_eq!(EventKind::parse("created"), Some(EventKind::Created));
        assert_eq!(EventKind::parse("UPDATED"), Some(EventKind::Updated));
        assert_eq!(EventKind::parse("Deleted"), Some(EventKind::Deleted));
    }

    #[test]
    fn rejects_unknown_kinds() {
        assert_eq!(EventKind::parse("renamed"), None);
        assert_eq!(EventKind::parse(""), None);
        assert_eq!(EventKind::parse("created "), None);
    }

    #[test]
    fn inbound_event_ignores_extra_fields() {
        let event: InboundEvent =
            serde_json::from_slice(br#"{"id": "evt-1", "source": "generator"}"#).unwrap();
        assert_eq!(event.id, "evt-1");
    }

    #[test]
    fn inbound_event_requires_an_id() {
        let result = serde_json::from_slice::<InboundEvent>(br#"{"source": "generator"}"#);
        assert!(result.is_err());
    }
}

/// Literal middle segment every routing key must carry.
const EVENT_SEGMENT: &str = "event";

/// A validated `<user_id>.event.<kind>` routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub user_id: String,
    pub kind: String,
}

/// Parse a routing key of the form `<user_id>.event.<kind>`.
///
/// Returns `None` for any other shape: a segment count other than three,
/// a middle segment that is not exactly `event`, or an empty user id or
/// kind. Callers never see partial values.
pub fn parse_routing_key(key: &str) -> Option<RoutingKey> {
    let segments: Vec<&str> = key.split('.').collect();
    let [user_id, middle, kind] = segments.as_slice() else {
        return None;
    };
    if *middle != EVENT_SEGMENT || user_id.is_empty() || kind.is_empty() {
        return None;
    }
    Some(RoutingKey {
        user_id: (*user_id).to_string(),
        kind: (*kind).to_string(),
    })
}

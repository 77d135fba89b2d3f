//! MQTT topic filter matching.

/// Match a concrete topic against a subscription filter.
///
/// Supports the MQTT wildcards: `+` matches exactly one level, `#` matches
/// the remainder of the topic (and must be the last level of the filter).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

//! Validation of topic names and topic filters
//!
//! Topic names identify the channel a message is published to, topic filters
//! are the patterns used in subscriptions. Both are UTF-8 strings with
//! restrictions on wildcard placement and forbidden code points.

use crate::parse::forbidden_code_point;

/// Check if a string is not allowed to appear in a topic name or filter.
///
/// U+0000 and noncharacters are already banned in every MQTT string; on top
/// of that a topic must not start with a byte order mark.
fn forbidden_code_points(s: &str) -> bool {
    s.starts_with('\u{FEFF}') || s.chars().any(forbidden_code_point)
}

/// Checks if a topic name is valid for publishing.
///
/// Wildcards are only allowed in subscription filters, never in the topic
/// of a PUBLISH packet.
pub fn valid_topic(topic: &str) -> bool {
    if topic.is_empty() || forbidden_code_points(topic) {
        return false;
    }

    !topic.contains('+') && !topic.contains('#')
}

/// Checks if a topic filter is valid for subscribing.
///
/// `+` must occupy an entire level, `#` must occupy an entire level and can
/// only be the last level of the filter. Shared subscription filters of the
/// form `$share/{name}/{filter}` are validated on their filter part.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() || forbidden_code_points(filter) {
        return false;
    }

    let filter = match shared_subscription(filter) {
        Some((name, rest)) => {
            // the share name itself must be a non-empty single level
            if name.is_empty() || name.contains('+') || name.contains('#') || rest.is_empty() {
                return false;
            }
            rest
        }
        None => filter,
    };

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level == "#" {
            // '#' must be the last level
            return levels.peek().is_none();
        }

        if level != "+" && (level.contains('+') || level.contains('#')) {
            return false;
        }
    }

    true
}

/// Split a shared subscription filter into its share name and actual filter.
///
/// Returns `None` if the filter is not a shared subscription.
pub fn shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let (name, filter) = rest.split_once('/').unwrap_or((rest, ""));
    Some((name, filter))
}

/// Does the filter contain `+` or `#` wildcards?
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_with_wildcards_are_invalid() {
        assert!(valid_topic("a/b/c"));
        assert!(valid_topic("a"));
        assert!(!valid_topic("a/+/c"));
        assert!(!valid_topic("a/#"));
        assert!(!valid_topic(""));
    }

    #[test]
    fn topics_with_forbidden_code_points_are_invalid() {
        assert!(!valid_topic("a/\u{0}/b"));
        assert!(!valid_topic("\u{FEFF}a/b"));
        assert!(!valid_topic("a/\u{FDD0}"));
        assert!(!valid_topic("a/\u{FFFF}"));
    }

    #[test]
    fn wildcard_placement_in_filters() {
        assert!(valid_filter("a/b/c"));
        assert!(valid_filter("a/+/c"));
        assert!(valid_filter("+"));
        assert!(valid_filter("#"));
        assert!(valid_filter("a/#"));
        assert!(valid_filter("+/+/#"));

        // '#' only as the terminal level
        assert!(!valid_filter("a/#/c"));
        assert!(!valid_filter("#/a"));
        // wildcards must be standalone levels
        assert!(!valid_filter("a+/b"));
        assert!(!valid_filter("a/b#"));
        assert!(!valid_filter(""));
    }

    #[test]
    fn shared_subscription_filters() {
        assert_eq!(
            shared_subscription("$share/group/a/b"),
            Some(("group", "a/b"))
        );
        assert_eq!(shared_subscription("a/b"), None);

        assert!(valid_filter("$share/group/a/+"));
        assert!(!valid_filter("$share//a"));
        assert!(!valid_filter("$share/group"));
        assert!(!valid_filter("$share/gr+up/a"));
    }
}

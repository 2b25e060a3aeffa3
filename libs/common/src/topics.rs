//! Logical topic names

use crate::errors::CommonError;

/// Broadcast topic every agent subscribes to
pub const ALL: &str = "ALL";
/// Agent log batches
pub const LOG: &str = "LOG";
/// Agent advertisements
pub const ADV: &str = "ADV";
/// Build packages
pub const PKG: &str = "PKG";

const ID_PREFIX: &str = "ID";
const TAG_PREFIX: &str = "TAG";
const SEPARATOR: &str = "-";

/// Topic patterns
pub struct Topics;

impl Topics {
    /// Topic reaching exactly one target
    pub fn id(id: &str) -> String {
        format!("{}{}{}", ID_PREFIX, SEPARATOR, id)
    }

    /// Topic reaching every target carrying the tag
    pub fn tag(tag: &str) -> String {
        format!("{}{}{}", TAG_PREFIX, SEPARATOR, tag)
    }

    pub fn parse_id(topic: &str) -> Option<&str> {
        Self::strip(topic, ID_PREFIX)
    }

    pub fn parse_tag(topic: &str) -> Option<&str> {
        Self::strip(topic, TAG_PREFIX)
    }

    fn strip<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
        topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .filter(|value| !value.is_empty())
    }

    /// Names owned by routing. A task named like one of these would be
    /// published where untargeted agents listen.
    pub fn is_reserved(name: &str) -> bool {
        matches!(name, ALL | LOG | ADV | PKG)
            || [ID_PREFIX, TAG_PREFIX].iter().any(|prefix| {
                name.strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with(SEPARATOR))
            })
    }

    /// Rejects topics that cannot be framed or routed
    pub fn validate(topic: &str) -> Result<(), CommonError> {
        if topic.is_empty() {
            return Err(CommonError::TopicError("empty topic".to_string()));
        }
        if let Some(c) = topic.chars().find(|c| matches!(c, ':' | '+' | '#')) {
            return Err(CommonError::TopicError(format!(
                "topic {:?} contains reserved character {:?}",
                topic, c
            )));
        }
        Ok(())
    }
}

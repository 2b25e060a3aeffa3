//! Requests published by the manager

use serde::{Deserialize, Serialize};

use crate::model::task::{Announcement, Task};

/// Asks an agent for the buffered records newer than a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    /// Unix milliseconds
    #[serde(rename = "ifModifiedSince", default)]
    pub if_modified_since: i64,
}

/// Payload of every manager to agent message. Exactly one variant is carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Request {
    Announcement(Announcement),
    Task(Task),
    LogRequest(LogRequest),
    /// One-off shell command run in the agent terminal
    Command(String),
    StopAll,
}

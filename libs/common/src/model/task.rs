//! Tasks and their announcements

use serde::{Deserialize, Serialize};

use crate::errors::CommonError;
use crate::model::base64_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Build,
    Deploy,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Build => write!(f, "build"),
            TaskKind::Deploy => write!(f, "deploy"),
        }
    }
}

/// Identity shared by tasks and their announcements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Assigned by the manager when an order omits it
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub debug: bool,

    /// Unix milliseconds
    #[serde(rename = "createdAt", default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    #[serde(default)]
    pub commands: Vec<String>,

    /// Paths relative to the task source directory packaged after the build
    #[serde(default)]
    pub artifacts: Vec<String>,

    /// Id of the target running the build
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Install {
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    #[serde(default)]
    pub commands: Vec<String>,

    #[serde(rename = "autoRestart", default)]
    pub auto_restart: bool,
}

/// Explicit target ids and tags a deployment is addressed to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub ids: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.tags.is_empty()
    }
}

/// Covering set computed for a selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Every matched target id
    #[serde(default)]
    pub list: Vec<String>,

    /// Targets reachable only through their id topic
    #[serde(default)]
    pub ids: Vec<String>,

    /// Tags whose topics reach the remaining targets
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    #[serde(default)]
    pub install: Install,

    #[serde(default)]
    pub run: Run,

    #[serde(default)]
    pub target: Selector,

    #[serde(rename = "match", default)]
    pub matched: MatchResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(flatten)]
    pub header: Header,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Deploy>,

    /// tar.gz archive extracted into the task source directory
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub artifacts: Vec<u8>,
}

impl Task {
    /// The task kind, rejecting tasks carrying both or neither payload
    pub fn kind(&self) -> Result<TaskKind, CommonError> {
        match (&self.build, &self.deploy) {
            (Some(_), None) => Ok(TaskKind::Build),
            (None, Some(_)) => Ok(TaskKind::Deploy),
            (Some(_), Some(_)) => Err(CommonError::ValidationError(format!(
                "task {} carries both build and deploy",
                self.header.id
            ))),
            (None, None) => Err(CommonError::ValidationError(format!(
                "task {} carries neither build nor deploy",
                self.header.id
            ))),
        }
    }

    pub fn announcement(&self) -> Result<Announcement, CommonError> {
        Ok(Announcement {
            header: self.header.clone(),
            kind: self.kind()?,
            size: self.artifacts.len() as u64,
        })
    }
}

/// Precedes a task so agents can assess it before the payload is sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(flatten)]
    pub header: Header,

    #[serde(rename = "type")]
    pub kind: TaskKind,

    /// Size of the inlined artifacts in bytes
    #[serde(default)]
    pub size: u64,
}

//! Task log records and the responses carrying them upstream

use serde::{Deserialize, Serialize};

use crate::model::base64_bytes;
use crate::utils::now_millis;

/// Command of records generated by the agent itself
pub const AGENT: &str = "$agent";
/// Command of records generated by the manager
pub const MANAGER: &str = "$manager";

pub const STAGE_START: &str = "STAGE-START";
pub const STAGE_END: &str = "STAGE-END";
pub const EXEC_START: &str = "EXEC-START";
pub const EXEC_END: &str = "EXEC-END";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Transfer,
    Install,
    Run,
    Build,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Transfer => "TRANSFER",
            Stage::Install => "INSTALL",
            Stage::Run => "RUN",
            Stage::Build => "BUILD",
        };
        f.write_str(name)
    }
}

/// One line of task output or a lifecycle marker.
///
/// Records are never mutated after creation. `debug` only drives local
/// batching and is not part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub task: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,

    pub command: String,

    pub output: String,

    #[serde(default)]
    pub error: bool,

    /// Unix milliseconds
    pub time: i64,

    #[serde(skip)]
    pub debug: bool,
}

impl Log {
    pub fn new(
        task: impl Into<String>,
        stage: Option<Stage>,
        command: impl Into<String>,
        output: impl Into<String>,
        error: bool,
        debug: bool,
    ) -> Self {
        Self {
            task: task.into(),
            stage,
            command: command.into(),
            output: output.into(),
            error,
            time: now_millis(),
            debug,
        }
    }

    /// A record generated by the agent rather than a supervised command
    pub fn agent(
        task: impl Into<String>,
        stage: Option<Stage>,
        output: impl Into<String>,
        error: bool,
        debug: bool,
    ) -> Self {
        Self::new(task, stage, AGENT, output, error, debug)
    }

    pub fn is_marker(&self) -> bool {
        matches!(
            self.output.as_str(),
            STAGE_START | STAGE_END | EXEC_START | EXEC_END
        )
    }
}

/// Batch of log records sent on the `LOG` topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "targetID")]
    pub target_id: String,

    #[serde(default)]
    pub logs: Vec<Log>,

    /// Set when the batch answers an explicit log request
    #[serde(rename = "onRequest", default)]
    pub on_request: bool,
}

/// Build output sent on the `PKG` topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Id of the target that ran the build
    pub assembler: String,

    pub task: String,

    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

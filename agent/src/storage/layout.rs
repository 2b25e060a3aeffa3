//! Storage layout configuration

use std::path::PathBuf;

use dt_common::filesys::dir::Dir;
use dt_common::filesys::file::File;
use dt_common::topics::Topics;

use crate::errors::AgentError;

/// Name of the per-task directory holding the unpacked artifacts
pub const SOURCE_DIR: &str = "src";

/// Storage layout for the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Persisted identity, task history and active run
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    pub fn keys_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("keys"))
    }

    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    pub fn tasks_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("tasks"))
    }

    pub fn task_dir(&self, task_id: &str) -> Dir {
        self.tasks_dir().subdir(task_id)
    }

    /// Working directory of every command of the task
    pub fn source_dir(&self, task_id: &str) -> Dir {
        self.task_dir(task_id).subdir(SOURCE_DIR)
    }

    /// Working directory of remote terminal commands
    pub fn terminal_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("terminal"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), AgentError> {
        self.tasks_dir().create().await?;
        self.terminal_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/etc/deployment-agent")
    }
}

/// Task ids name directories, so they must be a single plain path component
pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0', ':', '+', '#'])
        && !Topics::is_reserved(id)
}

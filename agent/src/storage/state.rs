//! Persisted target state: identity, task history and the active run

use dt_common::filesys::file::File;
use dt_common::model::{Location, TargetBase, TaskKind};
use dt_common::utils::generate_uuid;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::deploy::fsm::TaskState;
use crate::errors::AgentError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub kind: TaskKind,
    pub state: TaskState,
}

/// Run stage of the last installed deploy task, restarted at boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub task: String,

    pub commands: Vec<String>,

    #[serde(rename = "autoRestart", default)]
    pub auto_restart: bool,

    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    #[serde(default)]
    pub id: String,

    /// Generated id reused on every boot without an external id
    #[serde(rename = "autoID", default)]
    pub auto_id: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub location: Option<Location>,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    #[serde(rename = "activeRun", default)]
    pub active_run: Option<ActiveRun>,
}

/// Identity supplied by configuration
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub id: Option<String>,
    pub tags: Vec<String>,
    pub location: Option<Location>,
}

/// Owner of the persisted state. Every change is written back to the state
/// file under the same lock that guards the in-memory copy.
pub struct TargetStore {
    file: File,
    id: String,
    state: Mutex<TargetState>,
}

impl TargetStore {
    /// Load the state file, resolve the target id and persist if anything changed
    pub async fn load(file: File, identity: &Identity) -> Result<Self, AgentError> {
        let loaded = if file.exists().await {
            match file.read_json::<TargetState>().await {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("Ignoring unreadable state file {}: {}", file.path().display(), e);
                    None
                }
            }
        } else {
            None
        };
        let mut state = loaded.clone().unwrap_or_default();

        match identity.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => state.id = id.to_string(),
            None => {
                if state.auto_id.is_empty() {
                    state.auto_id = generate_uuid();
                    info!("Generated target id {}", state.auto_id);
                }
                state.id = state.auto_id.clone();
            }
        }
        state.tags = identity.tags.clone();
        state.location = identity.location;

        let store = Self {
            file,
            id: state.id.clone(),
            state: Mutex::new(state.clone()),
        };
        if loaded.as_ref() != Some(&state) {
            store.write(&state).await?;
        }
        Ok(store)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn target(&self) -> TargetBase {
        let state = self.state.lock().await;
        TargetBase {
            id: state.id.clone(),
            tags: state.tags.clone(),
            location: state.location,
        }
    }

    pub async fn tags(&self) -> Vec<String> {
        self.state.lock().await.tags.clone()
    }

    pub async fn task_state(&self, id: &str, kind: TaskKind) -> Option<TaskState> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .find(|entry| entry.id == id && entry.kind == kind)
            .map(|entry| entry.state)
    }

    /// Record a new announcement. False when the task is already known.
    pub async fn announce(&self, id: &str, kind: TaskKind) -> bool {
        self.admit(id, kind, TaskState::Announced, |current| current.is_none())
            .await
    }

    /// Record a received payload. False when the task was already received.
    pub async fn accept(&self, id: &str, kind: TaskKind) -> bool {
        self.admit(id, kind, TaskState::Received, |current| {
            matches!(current, None | Some(TaskState::Announced))
        })
        .await
    }

    async fn admit<F>(&self, id: &str, kind: TaskKind, next: TaskState, allowed: F) -> bool
    where
        F: Fn(Option<TaskState>) -> bool,
    {
        let mut state = self.state.lock().await;
        let position = state
            .history
            .iter()
            .position(|entry| entry.id == id && entry.kind == kind);
        if !allowed(position.map(|p| state.history[p].state)) {
            return false;
        }
        match position {
            Some(p) => state.history[p].state = next,
            None => state.history.push(HistoryEntry {
                id: id.to_string(),
                kind,
                state: next,
            }),
        }
        self.save(&state).await;
        true
    }

    /// Update the state of a known task
    pub async fn record(&self, id: &str, kind: TaskKind, next: TaskState) {
        let mut state = self.state.lock().await;
        match state
            .history
            .iter_mut()
            .find(|entry| entry.id == id && entry.kind == kind)
        {
            Some(entry) if entry.state == next => return,
            Some(entry) => entry.state = next,
            None => state.history.push(HistoryEntry {
                id: id.to_string(),
                kind,
                state: next,
            }),
        }
        self.save(&state).await;
    }

    pub async fn active_run(&self) -> Option<ActiveRun> {
        self.state.lock().await.active_run.clone()
    }

    pub async fn set_active_run(&self, active_run: Option<ActiveRun>) {
        let mut state = self.state.lock().await;
        if state.active_run == active_run {
            return;
        }
        state.active_run = active_run;
        self.save(&state).await;
    }

    async fn save(&self, state: &TargetState) {
        if let Err(e) = self.write(state).await {
            error!("Failed to save state to {}: {}", self.file.path().display(), e);
        }
    }

    async fn write(&self, state: &TargetState) -> Result<(), AgentError> {
        self.file.write_json(state).await?;
        self.file.set_permissions_600().await?;
        Ok(())
    }
}

//! Shared fixtures

use std::sync::Arc;
use std::time::Duration;

use dt_agent::deploy::engine::{self, TaskEngine};
use dt_agent::deploy::fsm::TaskState;
use dt_agent::storage::layout::StorageLayout;
use dt_agent::storage::state::{Identity, TargetStore};
use dt_agent::workers::reporter::{self, LogReceiver};
use dt_common::model::{Deploy, Header, Install, Log, Run, Task, TaskKind};
use dt_common::transport::{pipe, Pipe, PipeEnds};
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub layout: StorageLayout,
    pub engine: Arc<TaskEngine>,
    pub logs: LogReceiver,
    pub ends: PipeEnds,
    _pipe: Pipe,
}

pub fn engine_options() -> engine::Options {
    engine::Options {
        kill_grace: Duration::from_secs(1),
        memory_limit: Some(1024 * 1024),
    }
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::open(dir).await
    }

    /// A fresh engine over the same storage, as after a reboot
    pub async fn reboot(self) -> Self {
        self.engine.shutdown().await;
        Self::open(self.dir).await
    }

    async fn open(dir: TempDir) -> Self {
        let layout = StorageLayout::new(dir.path());
        layout.setup().await.unwrap();
        let identity = Identity {
            id: Some("a1".to_string()),
            tags: vec!["edge".to_string()],
            location: None,
        };
        let store = Arc::new(TargetStore::load(layout.state_file(), &identity).await.unwrap());
        let (sender, logs) = reporter::channel();
        let (pipe, ends) = pipe(64);
        let engine = Arc::new(TaskEngine::new(
            engine_options(),
            store,
            layout.clone(),
            sender,
            pipe.sender.clone(),
        ));
        Self {
            dir,
            layout,
            engine,
            logs,
            ends,
            _pipe: pipe,
        }
    }

    pub async fn state(&self, id: &str, kind: TaskKind) -> Option<TaskState> {
        self.engine.store().task_state(id, kind).await
    }

    /// Poll until the task reaches `state`
    pub async fn wait_for_state(&self, id: &str, kind: TaskKind, state: TaskState) {
        for _ in 0..100 {
            if self.state(id, kind).await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {} never reached {:?}", id, state);
    }
}

pub fn deploy_task(id: &str, install: &[&str], run: &[&str]) -> Task {
    Task {
        header: Header {
            id: id.to_string(),
            debug: false,
            created_at: 0,
        },
        build: None,
        deploy: Some(Deploy {
            install: Install {
                commands: install.iter().map(|c| c.to_string()).collect(),
            },
            run: Run {
                commands: run.iter().map(|c| c.to_string()).collect(),
                auto_restart: false,
            },
            ..Default::default()
        }),
        artifacts: Vec::new(),
    }
}

/// Outputs of the records of one task, markers included
pub fn outputs(logs: &[Log], task: &str) -> Vec<String> {
    logs.iter()
        .filter(|log| log.task == task)
        .map(|log| log.output.clone())
        .collect()
}

pub fn markers(logs: &[Log], task: &str) -> Vec<String> {
    logs.iter()
        .filter(|log| log.task == task && log.is_marker())
        .map(|log| match log.stage {
            Some(stage) => format!("{}:{}", stage, log.output),
            None => log.output.clone(),
        })
        .collect()
}

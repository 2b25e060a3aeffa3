//! Application state management

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dt_common::transport::PipeSender;
use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::engine::TaskEngine;
use crate::errors::AgentError;
use crate::storage::state::TargetStore;
use crate::workers::reporter::{self, LogReceiver, LogSender};

/// Main application state
pub struct AppState {
    /// Persisted identity and task history
    pub store: Arc<TargetStore>,

    pub engine: Arc<TaskEngine>,

    /// Producer side of the log reporter
    pub logs: LogSender,

    /// Broker connection status, written by the listener
    pub connected: Arc<AtomicBool>,
}

impl AppState {
    /// Initialize application state. The log receiver goes to the reporter worker.
    pub async fn init(
        options: &AppOptions,
        sender: PipeSender,
    ) -> Result<(Self, LogReceiver), AgentError> {
        info!("Initializing application state...");

        let layout = &options.storage.layout;
        layout.setup().await?;

        let store = Arc::new(TargetStore::load(layout.state_file(), &options.identity).await?);
        info!("Target id: {}", store.id());

        let (logs, receiver) = reporter::channel();
        let engine = Arc::new(TaskEngine::new(
            options.engine.clone(),
            store.clone(),
            layout.clone(),
            logs.clone(),
            sender,
        ));

        let state = Self {
            store,
            engine,
            logs,
            connected: Arc::new(AtomicBool::new(false)),
        };
        Ok((state, receiver))
    }

    /// Stop every task and wait for the pipelines to end
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("Shutting down application state...");
        self.engine.shutdown().await;
        Ok(())
    }
}

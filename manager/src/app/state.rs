//! Application state management

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dt_common::transport::PipeSender;
use tracing::info;

use crate::app::options::AppOptions;
use crate::dispatch::dispatcher::Dispatcher;
use crate::server::state::ServerState;
use crate::storage::memory::InMemoryStorage;
use crate::storage::Storage;

/// Main application state
pub struct AppState {
    pub storage: Arc<dyn Storage>,

    pub dispatcher: Arc<Dispatcher>,

    /// Broker connection status, written by the ingest worker
    pub connected: Arc<AtomicBool>,
}

impl AppState {
    /// Initialize application state over the in-memory store
    pub fn init(options: &AppOptions, sender: PipeSender) -> Self {
        Self::with_storage(options, Arc::new(InMemoryStorage::new()), sender)
    }

    pub fn with_storage(options: &AppOptions, storage: Arc<dyn Storage>, sender: PipeSender) -> Self {
        info!("Initializing application state...");
        let dispatcher = Arc::new(Dispatcher::new(
            options.dispatcher.clone(),
            storage.clone(),
            sender,
        ));
        Self {
            storage,
            dispatcher,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn server_state(&self) -> ServerState {
        ServerState::new(
            self.storage.clone(),
            self.dispatcher.clone(),
            self.connected.clone(),
        )
    }

    /// Stop tracking deliveries
    pub async fn shutdown(&self) {
        info!("Shutting down application state...");
        self.dispatcher.shutdown().await;
    }
}

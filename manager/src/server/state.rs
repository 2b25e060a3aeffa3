//! Server state

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::dispatch::dispatcher::Dispatcher;
use crate::storage::Storage;

/// Server state shared across handlers
pub struct ServerState {
    pub storage: Arc<dyn Storage>,
    pub dispatcher: Arc<Dispatcher>,
    pub connected: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new(
        storage: Arc<dyn Storage>,
        dispatcher: Arc<Dispatcher>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            connected,
        }
    }
}

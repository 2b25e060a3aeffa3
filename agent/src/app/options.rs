//! Application configuration options

use std::time::Duration;

use dt_common::transport::mqtt;

use crate::deploy::engine;
use crate::storage::layout::StorageLayout;
use crate::storage::state::Identity;
use crate::workers::{listener, reporter};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Externally configured identity
    pub identity: Identity,

    /// Broker connection
    pub transport: mqtt::Options,

    /// Capacity of each transport queue
    pub pipe_capacity: usize,

    /// Task engine options
    pub engine: engine::Options,

    /// Listener worker options
    pub listener: listener::Options,

    /// Reporter worker options
    pub reporter: reporter::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            identity: Identity::default(),
            transport: mqtt::Options::default(),
            pipe_capacity: 64,
            engine: engine::Options::default(),
            listener: listener::Options::default(),
            reporter: reporter::Options::default(),
        }
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}

//! Application configuration options

use std::time::Duration;

use dt_common::transport::mqtt;
use dt_common::transport::Role;

use crate::dispatch::dispatcher;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// HTTP API
    pub server: ServerOptions,

    /// Broker connection
    pub transport: mqtt::Options,

    /// Capacity of each transport queue
    pub pipe_capacity: usize,

    /// Dispatcher options
    pub dispatcher: dispatcher::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions::default(),
            transport: mqtt::Options {
                role: Role::Manager,
                ..Default::default()
            },
            pipe_capacity: 256,
            dispatcher: dispatcher::Options::default(),
        }
    }
}

/// Lifecycle options for the manager
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

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

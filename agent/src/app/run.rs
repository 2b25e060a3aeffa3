//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dt_common::errors::CommonError;
use dt_common::transport::{self, mqtt, Pipe, TransportEvent};
use dt_common::utils::generate_uuid;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::AgentError;
use crate::workers::reporter::LogReceiver;
use crate::workers::{listener, reporter};

/// A worker stopped by its own signal, after the workers feeding it are done
pub struct WorkerHandle<T> {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawn a worker receiving its shutdown signal from the handle
    pub fn spawn<F, Fut>(worker: F) -> Self
    where
        F: FnOnce(Pin<Box<dyn Future<Output = ()> + Send>>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (stop, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(worker(Box::pin(async move {
            let _ = stop_rx.await;
        })));
        Self { stop, handle }
    }

    async fn stop(self) -> Result<T, AgentError> {
        let _ = self.stop.send(());
        self.handle
            .await
            .map_err(|e| AgentError::ShutdownError(e.to_string()))
    }
}

pub type TransportHandle = WorkerHandle<Result<(), CommonError>>;

/// Run the agent over the configured MQTT broker
pub async fn run(
    mut options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing deployment agent...");

    options.transport.auth.check_key_files()?;
    if options.transport.client_id.is_empty() {
        options.transport.client_id = format!("deployment-agent-{}", generate_uuid());
    }

    let (pipe, ends) = transport::pipe(options.pipe_capacity);
    let mqtt_options = options.transport.clone();
    let transport = WorkerHandle::spawn(move |shutdown| mqtt::run(mqtt_options, ends, shutdown));

    run_with_pipe(options, pipe, Some(transport), shutdown_signal).await
}

/// Run the agent over an already connected pipe. When `transport` is given,
/// its exit ends the agent and it is stopped last on shutdown.
pub async fn run_with_pipe(
    options: AppOptions,
    pipe: Pipe,
    transport: Option<TransportHandle>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());
    if let Some(transport) = transport {
        shutdown_manager.with_transport_handle(transport)?;
    }

    if let Err(e) = init(&options, pipe, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start agent: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    let result = tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
            Ok(())
        }
        result = shutdown_manager.await_transport_exit() => {
            let result = result.and(Err(AgentError::TransportError("transport stopped".to_string())));
            if let Err(e) = &result {
                error!("Transport failed, shutting down: {}", e);
            }
            result
        }
    };

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await?;
    result
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    pipe: Pipe,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    let Pipe { events, sender } = pipe;

    let (app_state, log_receiver) = AppState::init(options, sender.clone()).await?;
    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_reporter_worker(
        options.reporter.clone(),
        app_state.clone(),
        log_receiver,
        sender.clone(),
        shutdown_manager,
    )?;

    let tags = app_state.store.tags().await;
    listener::subscribe_target(&sender, app_state.store.id(), &tags).await?;

    init_listener_worker(
        options.listener.clone(),
        app_state.clone(),
        events,
        sender,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    app_state.engine.autostart().await;
    Ok(())
}

fn init_reporter_worker(
    options: reporter::Options,
    app_state: Arc<AppState>,
    log_receiver: LogReceiver,
    sender: transport::PipeSender,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    info!("Initializing reporter worker...");

    let target_id = app_state.store.id().to_string();
    let connected = app_state.connected.clone();
    let reporter_handle = WorkerHandle::spawn(move |shutdown| async move {
        reporter::run(&options, target_id, log_receiver, sender, connected, shutdown).await;
    });

    shutdown_manager.with_reporter_worker_handle(reporter_handle)
}

fn init_listener_worker(
    options: listener::Options,
    app_state: Arc<AppState>,
    events: mpsc::Receiver<TransportEvent>,
    sender: transport::PipeSender,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing listener worker...");

    let engine = app_state.engine.clone();
    let logs = app_state.logs.clone();
    let connected = app_state.connected.clone();

    let listener_handle = tokio::spawn(async move {
        listener::run(
            &options,
            engine,
            events,
            sender,
            logs,
            connected,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_listener_worker_handle(listener_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    listener_worker_handle: Option<JoinHandle<()>>,
    reporter_worker_handle: Option<WorkerHandle<()>>,
    transport_handle: Option<TransportHandle>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            listener_worker_handle: None,
            reporter_worker_handle: None,
            transport_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), AgentError> {
        if self.app_state.is_some() {
            return Err(AgentError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_listener_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AgentError> {
        if self.listener_worker_handle.is_some() {
            return Err(AgentError::ShutdownError("listener_handle already set".to_string()));
        }
        self.listener_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_reporter_worker_handle(
        &mut self,
        handle: WorkerHandle<()>,
    ) -> Result<(), AgentError> {
        if self.reporter_worker_handle.is_some() {
            return Err(AgentError::ShutdownError("reporter_handle already set".to_string()));
        }
        self.reporter_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_transport_handle(&mut self, handle: TransportHandle) -> Result<(), AgentError> {
        if self.transport_handle.is_some() {
            return Err(AgentError::ShutdownError("transport_handle already set".to_string()));
        }
        self.transport_handle = Some(handle);
        Ok(())
    }

    /// Resolves when the transport stops on its own. Never resolves without one.
    async fn await_transport_exit(&mut self) -> Result<(), AgentError> {
        let Some(transport) = self.transport_handle.as_mut() else {
            return std::future::pending().await;
        };
        let result = (&mut transport.handle).await;
        self.transport_handle = None;
        match result {
            Ok(result) => Ok(result?),
            Err(e) => Err(AgentError::ShutdownError(e.to_string())),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down deployment agent...");

        // 1. Listener worker, no new requests
        if let Some(handle) = self.listener_worker_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        // 2. App state, stops every task
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        // 3. Reporter worker, flushes the last batch
        if let Some(handle) = self.reporter_worker_handle.take() {
            handle.stop().await?;
        }

        // 4. Transport
        if let Some(handle) = self.transport_handle.take() {
            if let Err(e) = handle.stop().await? {
                error!("Transport stopped with error: {}", e);
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

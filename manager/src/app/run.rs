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
use crate::errors::ManagerError;
use crate::server::serve::serve;
use crate::workers::ingest;

/// A worker stopped by its own signal
pub struct WorkerHandle<T> {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> WorkerHandle<T> {
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

    async fn stop(self) -> Result<T, ManagerError> {
        let _ = self.stop.send(());
        self.handle
            .await
            .map_err(|e| ManagerError::ShutdownError(e.to_string()))
    }
}

pub type TransportHandle = WorkerHandle<Result<(), CommonError>>;

/// Run the manager over the configured MQTT broker
pub async fn run(
    mut options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ManagerError> {
    info!("Initializing deployment manager...");

    options.transport.auth.check_key_files()?;
    if options.transport.client_id.is_empty() {
        options.transport.client_id = format!("deployment-manager-{}", generate_uuid());
    }

    let (pipe, ends) = transport::pipe(options.pipe_capacity);
    let mqtt_options = options.transport.clone();
    let transport = WorkerHandle::spawn(move |shutdown| mqtt::run(mqtt_options, ends, shutdown));

    run_with_pipe(options, pipe, Some(transport), shutdown_signal).await
}

/// Run the manager over an already connected pipe. When `transport` is
/// given, its exit ends the manager and it is stopped last on shutdown.
pub async fn run_with_pipe(
    options: AppOptions,
    pipe: Pipe,
    transport: Option<TransportHandle>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ManagerError> {
    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());
    if let Some(transport) = transport {
        shutdown_manager.with_transport_handle(transport)?;
    }

    if let Err(e) = init(&options, pipe, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start manager: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    let result = tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
            Ok(())
        }
        result = shutdown_manager.await_transport_exit() => {
            let result = result.and(Err(ManagerError::ShutdownError("transport stopped".to_string())));
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
) -> Result<(), ManagerError> {
    let Pipe { events, sender } = pipe;

    let app_state = Arc::new(AppState::init(options, sender));
    shutdown_manager.with_app_state(app_state.clone())?;

    init_ingest_worker(
        app_state.clone(),
        events,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    let mut server_shutdown = shutdown_tx.subscribe();
    let server_handle = serve(
        &options.server,
        Arc::new(app_state.server_state()),
        async move {
            let _ = server_shutdown.recv().await;
        },
    )
    .await?;
    shutdown_manager.with_server_handle(server_handle)?;

    Ok(())
}

fn init_ingest_worker(
    app_state: Arc<AppState>,
    events: mpsc::Receiver<TransportEvent>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ManagerError> {
    info!("Initializing ingest worker...");

    let storage = app_state.storage.clone();
    let dispatcher = app_state.dispatcher.clone();
    let connected = app_state.connected.clone();

    let ingest_handle = tokio::spawn(async move {
        ingest::run(
            storage,
            dispatcher,
            events,
            connected,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_ingest_worker_handle(ingest_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), ManagerError>>>,
    ingest_worker_handle: Option<JoinHandle<()>>,
    transport_handle: Option<TransportHandle>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            ingest_worker_handle: None,
            transport_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), ManagerError> {
        if self.app_state.is_some() {
            return Err(ManagerError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ManagerError>>,
    ) -> Result<(), ManagerError> {
        if self.server_handle.is_some() {
            return Err(ManagerError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub fn with_ingest_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ManagerError> {
        if self.ingest_worker_handle.is_some() {
            return Err(ManagerError::ShutdownError("ingest_handle already set".to_string()));
        }
        self.ingest_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_transport_handle(&mut self, handle: TransportHandle) -> Result<(), ManagerError> {
        if self.transport_handle.is_some() {
            return Err(ManagerError::ShutdownError("transport_handle already set".to_string()));
        }
        self.transport_handle = Some(handle);
        Ok(())
    }

    /// Resolves when the transport stops on its own. Never resolves without one.
    async fn await_transport_exit(&mut self) -> Result<(), ManagerError> {
        let Some(transport) = self.transport_handle.as_mut() else {
            return std::future::pending().await;
        };
        let result = (&mut transport.handle).await;
        self.transport_handle = None;
        match result {
            Ok(result) => Ok(result?),
            Err(e) => Err(ManagerError::ShutdownError(e.to_string())),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), ManagerError> {
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

    async fn shutdown_impl(&mut self) -> Result<(), ManagerError> {
        info!("Shutting down deployment manager...");

        // 1. HTTP server, no new orders
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| ManagerError::ShutdownError(e.to_string()))??;
        }

        // 2. Ingest worker
        if let Some(handle) = self.ingest_worker_handle.take() {
            handle.await.map_err(|e| ManagerError::ShutdownError(e.to_string()))?;
        }

        // 3. App state, abandons delivery tracking
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await;
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

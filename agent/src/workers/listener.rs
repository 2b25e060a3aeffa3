//! Listener worker: consumes transport events and dispatches requests

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dt_common::frame::Message;
use dt_common::model::Request;
use dt_common::topics::{Topics, ADV, ALL};
use dt_common::transport::{PipeSender, TransportEvent};
use dt_common::utils::sha256_hash;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::deploy::engine::TaskEngine;
use crate::errors::AgentError;
use crate::workers::reporter::LogSender;

/// Listener worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between advertisements while connected
    pub advertise_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            advertise_interval: Duration::from_secs(60),
        }
    }
}

/// Subscribe to the broadcast topic, the target id and every tag
pub async fn subscribe_target(
    sender: &PipeSender,
    id: &str,
    tags: &[String],
) -> Result<(), AgentError> {
    sender.subscribe(ALL).await?;
    sender.subscribe(&Topics::id(id)).await?;
    for tag in tags {
        sender.subscribe(&Topics::tag(tag)).await?;
    }
    Ok(())
}

struct Listener {
    engine: Arc<TaskEngine>,
    sender: PipeSender,
    logs: LogSender,
    connected: Arc<AtomicBool>,
    last_request: Option<String>,
}

impl Listener {
    async fn advertise(&self) {
        let target = self.engine.store().target().await;
        if let Err(e) = self.sender.send_json(ADV, &target).await {
            error!("Failed to advertise: {}", e);
        }
    }

    async fn handle(&mut self, message: Message) {
        // the same request often arrives on several topics (ID, TAG, ALL)
        let digest = sha256_hash(&message.payload);
        if self.last_request.as_deref() == Some(digest.as_str()) {
            debug!("Dropping repeated request on {}", message.topic);
            return;
        }
        self.last_request = Some(digest);

        let request: Request = match message.parse_json() {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping malformed request on {}: {}", message.topic, e);
                return;
            }
        };

        match request {
            Request::Announcement(announcement) => self.engine.announce(announcement).await,
            Request::Task(task) => self.engine.accept(task, &message.topic).await,
            Request::LogRequest(request) => self.logs.request(request.if_modified_since),
            Request::Command(command) => self.engine.command(command),
            Request::StopAll => {
                info!("Stop requested for all tasks");
                self.engine.stop_all().await;
            }
        }
    }
}

/// Run the listener worker
pub async fn run(
    options: &Options,
    engine: Arc<TaskEngine>,
    mut events: mpsc::Receiver<TransportEvent>,
    sender: PipeSender,
    logs: LogSender,
    connected: Arc<AtomicBool>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Listener worker starting...");

    let mut listener = Listener {
        engine,
        sender,
        logs,
        connected,
        last_request: None,
    };
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + options.advertise_interval,
        options.advertise_interval,
    );

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Listener worker shutting down...");
                return;
            }
            event = events.recv() => match event {
                Some(TransportEvent::Connected) => {
                    info!("Connected to broker");
                    listener.connected.store(true, Ordering::SeqCst);
                    listener.advertise().await;
                }
                Some(TransportEvent::Disconnected) => {
                    warn!("Disconnected from broker");
                    listener.connected.store(false, Ordering::SeqCst);
                }
                Some(TransportEvent::Message(message)) => listener.handle(message).await,
                None => {
                    info!("Transport closed, listener worker exiting...");
                    return;
                }
            },
            _ = ticker.tick() => {
                if listener.connected.load(Ordering::SeqCst) {
                    listener.advertise().await;
                }
            }
        }
    }
}

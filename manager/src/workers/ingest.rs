//! Ingest worker: consumes agent responses

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dt_common::frame::Message;
use dt_common::model::{Package, Response, TargetBase};
use dt_common::topics::{ADV, LOG, PKG};
use dt_common::transport::TransportEvent;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dispatch::dispatcher::Dispatcher;
use crate::errors::{ManagerError, StorageError};
use crate::storage::model::StoredLog;
use crate::storage::Storage;

struct Ingest {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<Dispatcher>,
}

impl Ingest {
    async fn handle(&self, message: Message) -> Result<(), ManagerError> {
        match message.topic.as_str() {
            LOG => self.logs(message.parse_json()?).await,
            ADV => self.advertisement(message.parse_json()?).await,
            PKG => {
                let package: Package = message.parse_json()?;
                self.dispatcher.deliver_package(package).await
            }
            other => {
                warn!("Dropping response on unexpected topic {}", other);
                Ok(())
            }
        }
    }

    async fn logs(&self, response: Response) -> Result<(), ManagerError> {
        debug!(
            "Received {} log(s) from {}",
            response.logs.len(),
            response.target_id
        );
        if self.storage.get_target(&response.target_id).await?.is_none() {
            info!("Log from unknown target {}, registering it", response.target_id);
            let target = TargetBase {
                id: response.target_id.clone(),
                tags: Vec::new(),
                location: None,
            };
            match self.storage.add_target(target).await {
                Ok(_) | Err(StorageError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if response.on_request {
            if let Some(newest) = response.logs.iter().map(|log| log.time).max() {
                self.storage
                    .update_log_request(&response.target_id, newest)
                    .await?;
            }
        }

        let logs = response
            .logs
            .into_iter()
            .map(|log| StoredLog {
                log,
                target: response.target_id.clone(),
            })
            .collect();
        self.storage.add_logs(logs).await?;
        Ok(())
    }

    async fn advertisement(&self, target: TargetBase) -> Result<(), ManagerError> {
        debug!("Discovered target {} {:?}", target.id, target.tags);
        if target.id.is_empty() {
            warn!("Dropping advertisement without id");
            return Ok(());
        }
        self.storage.index_target(target).await?;
        Ok(())
    }
}

/// Run the ingest worker
pub async fn run(
    storage: Arc<dyn Storage>,
    dispatcher: Arc<Dispatcher>,
    mut events: mpsc::Receiver<TransportEvent>,
    connected: Arc<AtomicBool>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Ingest worker starting...");
    let ingest = Ingest {
        storage,
        dispatcher,
    };

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Ingest worker shutting down...");
                return;
            }
            event = events.recv() => match event {
                Some(TransportEvent::Connected) => {
                    info!("Connected to broker");
                    connected.store(true, Ordering::SeqCst);
                }
                Some(TransportEvent::Disconnected) => {
                    warn!("Disconnected from broker");
                    connected.store(false, Ordering::SeqCst);
                }
                Some(TransportEvent::Message(message)) => {
                    let topic = message.topic.clone();
                    if let Err(e) = ingest.handle(message).await {
                        error!("Error processing response on {}: {}", topic, e);
                    }
                }
                None => {
                    info!("Transport closed, ingest worker exiting...");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatcher;
    use crate::storage::memory::InMemoryStorage;
    use dt_common::model::Log;
    use dt_common::transport::pipe;
    use std::time::Duration;

    async fn eventually<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ingests_logs_and_advertisements() {
        let storage: Arc<InMemoryStorage> = Arc::new(InMemoryStorage::new());
        let (pipe, _ends) = pipe(16);
        let dispatcher = Arc::new(Dispatcher::new(
            dispatcher::Options::default(),
            storage.clone(),
            pipe.sender,
        ));
        let (events_tx, events_rx) = mpsc::channel(16);
        let connected = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(run(
            storage.clone(),
            dispatcher,
            events_rx,
            connected.clone(),
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        ));

        events_tx.send(TransportEvent::Connected).await.unwrap();
        let advertisement = TargetBase {
            id: "a1".to_string(),
            tags: vec!["edge".to_string()],
            location: None,
        };
        events_tx
            .send(TransportEvent::Message(Message::json(ADV, &advertisement).unwrap()))
            .await
            .unwrap();
        let response = Response {
            target_id: "ghost".to_string(),
            logs: vec![Log::agent("t1", None, "received deploy task", false, false)],
            on_request: true,
        };
        events_tx
            .send(TransportEvent::Message(Message::json(LOG, &response).unwrap()))
            .await
            .unwrap();
        events_tx
            .send(TransportEvent::Message(Message::new(LOG, "not json")))
            .await
            .unwrap();

        let check = storage.clone();
        eventually(|| {
            let storage = check.clone();
            async move { storage.delivered_task("ghost", "t1").await.unwrap() }
        })
        .await;
        assert!(connected.load(Ordering::SeqCst));

        let a1 = storage.get_target("a1").await.unwrap().unwrap();
        assert_eq!(a1.base.tags, vec!["edge"]);
        let ghost = storage.get_target("ghost").await.unwrap().unwrap();
        assert!(ghost.base.tags.is_empty());
        assert!(ghost.log_request_at > 0);

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}

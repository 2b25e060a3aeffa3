//! Publishes tasks on their matched topics and tracks delivery.
//!
//! A task travels in two steps: its announcement goes out on every matched
//! topic, then after a short delay the task itself is published on the topic
//! named by the task id, which interested agents subscribed to. Agents never
//! acknowledge a task. Delivery is inferred from the first record the agent
//! logs for it, and targets without one are addressed again on their id
//! topics until the attempt budget runs out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dt_common::frame::Message;
use dt_common::model::log::MANAGER;
use dt_common::model::{
    Deploy, Header, Log, LogRequest, MatchResult, Package, Request, Task,
};
use dt_common::topics::{Topics, ALL};
use dt_common::transport::PipeSender;
use dt_common::utils::{generate_uuid, now_millis};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatch::matcher::match_targets;
use crate::dispatch::source::fetch_artifacts;
use crate::errors::ManagerError;
use crate::storage::model::{Order, StoredLog, Target};
use crate::storage::Storage;

/// Dispatcher options
#[derive(Debug, Clone)]
pub struct Options {
    /// Delay between the announcement and the task
    pub announce_delay: Duration,

    /// Wait before checking delivery and addressing pending targets again
    pub resend_interval: Duration,

    pub max_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            announce_delay: Duration::from_secs(1),
            resend_interval: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// Delivery state of every target of an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderStatus {
    pub order: String,
    pub delivered: usize,
    pub pending: usize,
    pub targets: BTreeMap<String, TargetStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub delivered: bool,
}

/// A serialized task and where it still has to go
struct Delivery {
    task_id: String,
    announcement: String,
    payload: String,
    topics: Vec<String>,
    targets: Vec<String>,
}

pub struct Dispatcher {
    options: Options,
    storage: Arc<dyn Storage>,
    sender: PipeSender,
    cancel: CancellationToken,
    trackers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(options: Options, storage: Arc<dyn Storage>, sender: PipeSender) -> Self {
        Self {
            options,
            storage,
            sender,
            cancel: CancellationToken::new(),
            trackers: Mutex::new(Vec::new()),
        }
    }

    /// Validate and store an order, then send its first task. A build goes to
    /// its host first and the deploy follows once the package arrives.
    pub async fn submit(self: &Arc<Self>, mut order: Order) -> Result<Order, ManagerError> {
        order.normalize();
        if order.header.id.trim().is_empty() {
            order.header.id = generate_uuid();
        }
        order.header.created_at = now_millis();
        order.validate()?;

        let artifacts = fetch_artifacts(order.source.as_ref(), self.storage.as_ref()).await?;
        self.storage.add_order(order.clone()).await?;
        info!("Added order {}", order.id());

        if let Some(build) = &order.build {
            let task = Task {
                header: order.header.clone(),
                build: Some(build.clone()),
                deploy: None,
                artifacts,
            };
            self.send(task, vec![Topics::id(&build.host)], vec![build.host.clone()])?;
        } else if let Some(deploy) = order.deploy.as_mut() {
            deploy.matched = self
                .dispatch_deploy(&order.header, deploy.clone(), artifacts)
                .await?;
        }
        Ok(order)
    }

    /// Store a build package and continue its order with the deploy part
    pub async fn deliver_package(self: &Arc<Self>, package: Package) -> Result<(), ManagerError> {
        info!(
            "Received package of {} bytes for {} from {}",
            package.payload.len(),
            package.task,
            package.assembler
        );
        self.storage.add_package(package.clone()).await?;

        let Some(order) = self.storage.get_order(&package.task).await? else {
            warn!("Package for unknown order {}", package.task);
            return Ok(());
        };
        self.record(
            order.id(),
            &package.assembler,
            format!("received package of {} bytes", package.payload.len()),
            false,
        )
        .await;

        if let Some(deploy) = order.deploy {
            self.dispatch_deploy(&order.header, deploy, package.payload)
                .await?;
        }
        Ok(())
    }

    async fn dispatch_deploy(
        self: &Arc<Self>,
        header: &Header,
        mut deploy: Deploy,
        artifacts: Vec<u8>,
    ) -> Result<MatchResult, ManagerError> {
        let matched = match_targets(self.storage.as_ref(), &deploy.target).await?;
        self.storage
            .update_order_match(&header.id, matched.clone())
            .await?;
        info!("Order {} receivers: {}", header.id, matched.list.len());
        if matched.list.is_empty() {
            warn!("Order {} matched no targets", header.id);
            return Ok(matched);
        }

        let topics = matched
            .tags
            .iter()
            .map(|tag| Topics::tag(tag))
            .chain(matched.ids.iter().map(|id| Topics::id(id)))
            .collect();
        deploy.matched = matched.clone();
        let task = Task {
            header: header.clone(),
            build: None,
            deploy: Some(deploy),
            artifacts,
        };
        self.send(task, topics, matched.list.clone())?;
        Ok(matched)
    }

    fn send(
        self: &Arc<Self>,
        task: Task,
        topics: Vec<String>,
        targets: Vec<String>,
    ) -> Result<(), ManagerError> {
        let announcement = serde_json::to_string(&Request::Announcement(task.announcement()?))?;
        let task_id = task.header.id.clone();
        let payload = serde_json::to_string(&Request::Task(task))?;

        let delivery = Delivery {
            task_id,
            announcement,
            payload,
            topics,
            targets,
        };
        let dispatcher = self.clone();
        let handle = tokio::spawn(async move { dispatcher.track(delivery).await });

        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers.retain(|tracker| !tracker.is_finished());
        trackers.push(handle);
        Ok(())
    }

    async fn track(&self, mut delivery: Delivery) {
        let attempts = self.options.max_attempts.max(1);
        let mut pending = delivery.targets.clone();

        for attempt in 1..=attempts {
            info!(
                "Sending task {} on {:?} (attempt {}/{})",
                delivery.task_id, delivery.topics, attempt, attempts
            );
            if let Err(e) = self.publish(&delivery).await {
                error!("Failed to send task {}: {}", delivery.task_id, e);
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.options.resend_interval) => {}
            }

            pending = match self.pending(&delivery.task_id, &delivery.targets).await {
                Ok(pending) => pending,
                Err(e) => {
                    error!("Unable to check delivery of {}: {}", delivery.task_id, e);
                    return;
                }
            };
            if pending.is_empty() {
                info!(
                    "Task {} received by all {} target(s)",
                    delivery.task_id,
                    delivery.targets.len()
                );
                return;
            }
            delivery.topics = pending.iter().map(|id| Topics::id(id)).collect();
        }

        warn!(
            "Task {} not delivered to {} target(s) after {} attempts",
            delivery.task_id,
            pending.len(),
            attempts
        );
        for target in &pending {
            self.record(
                &delivery.task_id,
                target,
                format!("not delivered after {} attempts", attempts),
                true,
            )
            .await;
        }
    }

    async fn publish(&self, delivery: &Delivery) -> Result<(), ManagerError> {
        for topic in &delivery.topics {
            self.sender
                .send(Message::new(topic.as_str(), delivery.announcement.as_str()))
                .await?;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.options.announce_delay) => {}
        }
        self.sender
            .send(Message::new(
                delivery.task_id.as_str(),
                delivery.payload.as_str(),
            ))
            .await?;
        Ok(())
    }

    async fn pending(&self, task: &str, targets: &[String]) -> Result<Vec<String>, ManagerError> {
        let mut pending = Vec::new();
        for target in targets {
            if !self.storage.delivered_task(target, task).await? {
                pending.push(target.clone());
            }
        }
        Ok(pending)
    }

    /// Store a record of the manager itself for the task
    async fn record(&self, task: &str, target: &str, output: String, error: bool) {
        let log = StoredLog {
            log: Log::new(task, None, MANAGER, output, error, false),
            target: target.to_string(),
        };
        if let Err(e) = self.storage.add_log(log).await {
            error!("Failed to store manager log for {}: {}", task, e);
        }
    }

    pub async fn order_status(&self, id: &str) -> Result<Option<OrderStatus>, ManagerError> {
        let Some(order) = self.storage.get_order(id).await? else {
            return Ok(None);
        };

        let mut receivers: Vec<String> = Vec::new();
        if let Some(build) = &order.build {
            receivers.push(build.host.clone());
        }
        if let Some(deploy) = &order.deploy {
            receivers.extend(deploy.matched.list.iter().cloned());
        }

        let mut targets = BTreeMap::new();
        for target in receivers {
            let delivered = self.storage.delivered_task(&target, id).await?;
            targets.insert(target, TargetStatus { delivered });
        }
        let delivered = targets.values().filter(|t| t.delivered).count();
        Ok(Some(OrderStatus {
            order: id.to_string(),
            delivered,
            pending: targets.len() - delivered,
            targets,
        }))
    }

    /// Ask a target for its buffered records newer than the last request
    pub async fn request_logs(&self, target: &Target) -> Result<(), ManagerError> {
        let request = Request::LogRequest(LogRequest {
            if_modified_since: target.log_request_at,
        });
        self.sender
            .send_json(&Topics::id(target.id()), &request)
            .await?;
        Ok(())
    }

    /// Run a command in the terminal of a target
    pub async fn command(&self, target: &str, command: &str) -> Result<(), ManagerError> {
        let request = Request::Command(command.to_string());
        self.sender.send_json(&Topics::id(target), &request).await?;
        Ok(())
    }

    /// Stop the tasks of one target, or of every target without one
    pub async fn stop(&self, target: Option<&str>) -> Result<(), ManagerError> {
        let topic = target.map_or_else(|| ALL.to_string(), Topics::id);
        self.sender.send_json(&topic, &Request::StopAll).await?;
        Ok(())
    }

    /// Abandon delivery tracking and wait for the trackers to end
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let trackers: Vec<JoinHandle<()>> = {
            let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            trackers.drain(..).collect()
        };
        for result in join_all(trackers).await {
            if let Err(e) = result {
                error!("Delivery tracker failed: {}", e);
            }
        }
    }
}

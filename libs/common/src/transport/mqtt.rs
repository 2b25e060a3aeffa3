//! MQTT carrier for the pipe.
//!
//! Logical topic `T` travels on `<namespace>/req/T` from the manager to agents
//! and on `<namespace>/res/T` from agents to the manager. The MQTT payload is
//! the complete `topic:payload` frame.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::CommonError;
use crate::frame::Message;
use crate::transport::auth::{tls_config, AuthOptions};
use crate::transport::{Operation, PipeEnds, Role, TransportEvent};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// MQTT broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl Default for BrokerAddress {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            use_tls: true,
        }
    }
}

impl BrokerAddress {
    /// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
    pub fn parse(raw: &str) -> Result<Self, CommonError> {
        let url = url::Url::parse(raw)
            .map_err(|e| CommonError::ConfigError(format!("invalid broker url {:?}: {}", raw, e)))?;
        let use_tls = match url.scheme() {
            "mqtts" | "ssl" | "tls" => true,
            "mqtt" | "tcp" => false,
            scheme => {
                return Err(CommonError::ConfigError(format!(
                    "unsupported broker scheme {:?}",
                    scheme
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CommonError::ConfigError(format!("broker url {:?} has no host", raw)))?
            .to_string();
        let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });
        Ok(Self {
            host,
            port,
            use_tls,
        })
    }
}

/// MQTT transport options
#[derive(Debug, Clone)]
pub struct Options {
    pub broker: BrokerAddress,

    /// MQTT client id, unique per connected process
    pub client_id: String,

    /// Topic namespace shared by a manager and its fleet
    pub namespace: String,

    pub role: Role,

    pub auth: AuthOptions,

    pub keep_alive: Duration,

    /// Largest frame accepted or sent, artifacts included
    pub max_packet_size: usize,

    /// Reconnect backoff, capped at the max reconnect interval
    pub reconnect: CooldownOptions,

    /// Delay before giving up after the broker rejects our credentials
    pub auth_failure_grace: Duration,

    /// Time allowed on shutdown to write out messages still queued
    pub drain_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            broker: BrokerAddress::default(),
            client_id: String::new(),
            namespace: "deploy".to_string(),
            role: Role::Agent,
            auth: AuthOptions::default(),
            keep_alive: Duration::from_secs(30),
            max_packet_size: 64 * 1024 * 1024,
            reconnect: CooldownOptions::default(),
            auth_failure_grace: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl Options {
    fn outbound_topic(&self, topic: &str) -> String {
        match self.role {
            Role::Manager => format!("{}/req/{}", self.namespace, topic),
            Role::Agent => format!("{}/res/{}", self.namespace, topic),
        }
    }

    fn inbound_filter(&self, topic: &str) -> String {
        match self.role {
            Role::Manager => format!("{}/res/{}", self.namespace, topic),
            Role::Agent => format!("{}/req/{}", self.namespace, topic),
        }
    }

    fn mqtt_options(&self) -> Result<MqttOptions, CommonError> {
        if self.broker.host.is_empty() {
            return Err(CommonError::ConfigError("MQTT host is not configured".to_string()));
        }
        if !self.broker.use_tls && !self.auth.disabled {
            return Err(CommonError::ConfigError(
                "certificate authentication requires a TLS broker address".to_string(),
            ));
        }

        let mut options = MqttOptions::new(&self.client_id, &self.broker.host, self.broker.port);
        options.set_keep_alive(self.keep_alive);
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        if self.broker.use_tls {
            let config = tls_config(&self.auth)?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(config),
            )));
        }
        Ok(options)
    }
}

type Subscriptions = Arc<Mutex<BTreeSet<String>>>;

/// Drive the pipe over MQTT until shutdown.
///
/// Returns an error for configuration problems and, after the grace delay,
/// when the broker rejects our credentials.
pub async fn run(
    options: Options,
    ends: PipeEnds,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), CommonError> {
    let mqtt_options = options.mqtt_options()?;
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 64);

    let PipeEnds {
        events,
        messages,
        operations,
    } = ends;

    let subscriptions: Subscriptions = Arc::new(Mutex::new(BTreeSet::new()));
    if options.role == Role::Manager {
        insert_filter(&subscriptions, options.inbound_filter("#"));
    }

    let operator = spawn_operator(options.clone(), client.clone(), subscriptions.clone(), operations);
    let (stop_responder, responder_stopped) = oneshot::channel::<()>();
    let responder = spawn_responder(options.clone(), client.clone(), messages, responder_stopped);

    info!(
        "Connecting to MQTT broker {}:{} as {}",
        options.broker.host, options.broker.port, options.client_id
    );

    let mut attempt: u32 = 0;
    let mut connected = false;
    let result = loop {
        let event = tokio::select! {
            _ = &mut shutdown_signal => break Ok(()),
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                attempt = 0;
                connected = true;
                resubscribe(&client, &subscriptions);
                if events.send(TransportEvent::Connected).await.is_err() {
                    break Ok(());
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match Message::decode(&publish.payload) {
                    Ok(message) => {
                        debug!("Received {} on {}", message.topic, publish.topic);
                        if events.send(TransportEvent::Message(message)).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(e) => warn!("Dropping malformed frame on {}: {}", publish.topic, e),
                }
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(
                code @ (ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword),
            )) => {
                error!(
                    "Broker rejected our credentials ({:?}), exiting in {:?}",
                    code, options.auth_failure_grace
                );
                tokio::select! {
                    _ = &mut shutdown_signal => break Ok(()),
                    _ = tokio::time::sleep(options.auth_failure_grace) => {}
                }
                break Err(CommonError::AuthError(format!(
                    "broker rejected credentials: {:?}",
                    code
                )));
            }
            Err(e) => {
                if connected {
                    connected = false;
                    if events.send(TransportEvent::Disconnected).await.is_err() {
                        break Ok(());
                    }
                }
                let delay = calc_exp_backoff(&options.reconnect, attempt);
                attempt = attempt.saturating_add(1);
                warn!("MQTT connection error: {}, retrying in {:?}", e, delay);
                tokio::select! {
                    _ = &mut shutdown_signal => break Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };

    operator.abort();
    if connected {
        let drained = tokio::time::timeout(
            options.drain_timeout,
            drain(&options, &client, &mut eventloop, stop_responder, responder),
        )
        .await;
        if drained.is_err() {
            warn!("Outbound queue not drained within {:?}", options.drain_timeout);
        }
    } else {
        responder.abort();
    }
    info!("MQTT transport stopped");
    result
}

/// Publish what the owner queued before shutdown, then disconnect. The event
/// loop keeps running until the broker closes the connection, which is what
/// actually writes the queued packets out.
async fn drain(
    options: &Options,
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    stop_responder: oneshot::Sender<()>,
    responder: JoinHandle<mpsc::Receiver<Message>>,
) {
    let flush = async {
        let _ = stop_responder.send(());
        let mut messages = match responder.await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("MQTT responder failed: {}", e);
                return;
            }
        };
        messages.close();
        let mut count = 0;
        while let Ok(message) = messages.try_recv() {
            publish(options, client, message).await;
            count += 1;
        }
        debug!("Flushed {} queued message(s) on shutdown", count);
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
    };
    let poll = async {
        loop {
            if let Err(e) = eventloop.poll().await {
                debug!("MQTT connection closed: {}", e);
                break;
            }
        }
    };
    tokio::join!(flush, poll);
}

fn insert_filter(subscriptions: &Subscriptions, filter: String) -> bool {
    subscriptions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(filter)
}

fn resubscribe(client: &AsyncClient, subscriptions: &Subscriptions) {
    let filters: Vec<String> = subscriptions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    for filter in filters {
        // the event loop is not polled while we are here, so never await
        if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
            warn!("Failed to subscribe to {}: {}", filter, e);
        }
    }
}

fn spawn_operator(
    options: Options,
    client: AsyncClient,
    subscriptions: Subscriptions,
    mut operations: mpsc::Receiver<Operation>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(operation) = operations.recv().await {
            match operation {
                Operation::Subscribe(topic) => {
                    let filter = options.inbound_filter(&topic);
                    if insert_filter(&subscriptions, filter.clone()) {
                        debug!("Subscribing to {}", filter);
                        if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                            warn!("Failed to subscribe to {}: {}", filter, e);
                        }
                    }
                }
                Operation::Unsubscribe(topic) => {
                    let filter = options.inbound_filter(&topic);
                    let removed = subscriptions
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&filter);
                    if removed {
                        debug!("Unsubscribing from {}", filter);
                        if let Err(e) = client.unsubscribe(&filter).await {
                            warn!("Failed to unsubscribe from {}: {}", filter, e);
                        }
                    }
                }
            }
        }
    })
}

/// Publishes outbound messages until stopped, then hands back the queue
fn spawn_responder(
    options: Options,
    client: AsyncClient,
    mut messages: mpsc::Receiver<Message>,
    mut stop: oneshot::Receiver<()>,
) -> JoinHandle<mpsc::Receiver<Message>> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                _ = &mut stop => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            publish(&options, &client, message).await;
        }
        messages
    })
}

async fn publish(options: &Options, client: &AsyncClient, message: Message) {
    let frame = match message.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dropping unroutable message: {}", e);
            return;
        }
    };
    let topic = options.outbound_topic(&message.topic);
    if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, frame).await {
        warn!("Failed to publish on {}: {}", topic, e);
    }
}

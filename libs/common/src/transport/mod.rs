//! Publish/subscribe transport.
//!
//! A transport hands its owner a [`Pipe`]: inbound events (messages and
//! connection changes) on one queue, and a cloneable [`PipeSender`] feeding the
//! outbound message queue and the subscription-control queue. The driver side
//! holds the matching [`PipeEnds`].

pub mod auth;
pub mod memory;
pub mod mqtt;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::errors::CommonError;
use crate::frame::Message;
use crate::topics::Topics;

/// Which side of the system a transport serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes requests, receives responses
    Manager,
    /// Publishes responses, receives requests on subscribed topics
    Agent,
}

/// Local subscription control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(Message),
}

/// Owner side of a transport
pub struct Pipe {
    pub events: mpsc::Receiver<TransportEvent>,
    pub sender: PipeSender,
}

/// Driver side of a transport
pub struct PipeEnds {
    pub events: mpsc::Sender<TransportEvent>,
    pub messages: mpsc::Receiver<Message>,
    pub operations: mpsc::Receiver<Operation>,
}

/// Create the three queues linking a transport driver to its owner
pub fn pipe(capacity: usize) -> (Pipe, PipeEnds) {
    let (events_tx, events_rx) = mpsc::channel(capacity);
    let (messages_tx, messages_rx) = mpsc::channel(capacity);
    let (operations_tx, operations_rx) = mpsc::channel(capacity);

    let pipe = Pipe {
        events: events_rx,
        sender: PipeSender {
            messages: messages_tx,
            operations: operations_tx,
        },
    };
    let ends = PipeEnds {
        events: events_tx,
        messages: messages_rx,
        operations: operations_rx,
    };
    (pipe, ends)
}

#[derive(Debug, Clone)]
pub struct PipeSender {
    messages: mpsc::Sender<Message>,
    operations: mpsc::Sender<Operation>,
}

impl PipeSender {
    pub async fn send(&self, message: Message) -> Result<(), CommonError> {
        Topics::validate(&message.topic)?;
        self.messages
            .send(message)
            .await
            .map_err(|_| CommonError::TransportError("outbound queue closed".to_string()))
    }

    pub async fn send_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), CommonError> {
        self.send(Message::json(topic, value)?).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), CommonError> {
        Topics::validate(topic)?;
        self.operate(Operation::Subscribe(topic.to_string())).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), CommonError> {
        self.operate(Operation::Unsubscribe(topic.to_string())).await
    }

    async fn operate(&self, operation: Operation) -> Result<(), CommonError> {
        self.operations
            .send(operation)
            .await
            .map_err(|_| CommonError::TransportError("operation queue closed".to_string()))
    }
}

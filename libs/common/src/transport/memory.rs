//! In-process bus with the same framing and subscription semantics as the
//! broker. Lets a manager and its agents talk without a network.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::frame::Message;
use crate::transport::{pipe, Operation, Pipe, PipeEnds, Role, TransportEvent};

#[derive(Default)]
struct BusState {
    next_port: usize,
    manager: Option<mpsc::Sender<TransportEvent>>,
    agents: Vec<AgentPort>,
}

struct AgentPort {
    port: usize,
    events: mpsc::Sender<TransportEvent>,
    subscriptions: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a participant. The returned pipe reports `Connected` first.
    pub fn connect(&self, role: Role, capacity: usize) -> Pipe {
        let (pipe, ends) = pipe(capacity);
        let port = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let port = state.next_port;
            state.next_port += 1;
            match role {
                Role::Manager => state.manager = Some(ends.events.clone()),
                Role::Agent => state.agents.push(AgentPort {
                    port,
                    events: ends.events.clone(),
                    subscriptions: HashSet::new(),
                }),
            }
            port
        };

        let bus = self.clone();
        tokio::spawn(async move { bus.drive(role, port, ends).await });
        pipe
    }

    async fn drive(self, role: Role, port: usize, ends: PipeEnds) {
        let PipeEnds {
            events,
            mut messages,
            mut operations,
        } = ends;

        if events.send(TransportEvent::Connected).await.is_err() {
            return;
        }

        let mut operations_open = true;
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => self.route(role, message).await,
                    None => break,
                },
                operation = operations.recv(), if operations_open => match operation {
                    Some(operation) => self.operate(port, operation),
                    None => operations_open = false,
                },
            }
        }
        self.detach(role, port);
    }

    async fn route(&self, from: Role, message: Message) {
        // go through the wire format like a real carrier would
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unroutable message: {}", e);
                return;
            }
        };
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        let receivers: Vec<mpsc::Sender<TransportEvent>> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match from {
                Role::Manager => state
                    .agents
                    .iter()
                    .filter(|agent| agent.subscriptions.contains(&message.topic))
                    .map(|agent| agent.events.clone())
                    .collect(),
                Role::Agent => state.manager.iter().cloned().collect(),
            }
        };

        debug!("Routing {} to {} receiver(s)", message.topic, receivers.len());
        for receiver in receivers {
            let _ = receiver.send(TransportEvent::Message(message.clone())).await;
        }
    }

    fn operate(&self, port: usize, operation: Operation) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = state.agents.iter_mut().find(|a| a.port == port) {
            match operation {
                Operation::Subscribe(topic) => {
                    agent.subscriptions.insert(topic);
                }
                Operation::Unsubscribe(topic) => {
                    agent.subscriptions.remove(&topic);
                }
            }
        }
    }

    fn detach(&self, role: Role, port: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match role {
            Role::Manager => state.manager = None,
            Role::Agent => state.agents.retain(|a| a.port != port),
        }
    }

    /// Subscriptions of every attached agent, in attach order
    pub fn subscriptions(&self) -> Vec<HashSet<String>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.agents.iter().map(|a| a.subscriptions.clone()).collect()
    }
}

//! Log reporter worker.
//!
//! Every record lands in an in-memory ring answering log requests. Records
//! that matter upstream (debug tasks, errors, stage and exec markers) are also
//! queued and published on `LOG` in periodic batches while connected.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dt_common::model::{Log, Response};
use dt_common::topics::LOG;
use dt_common::transport::PipeSender;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::cache::ring::RingBuffer;

/// Reporter worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Records kept for log requests
    pub memory_capacity: usize,

    /// Records waiting for the next batch, oldest dropped first
    pub outgoing_capacity: usize,

    pub flush_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            memory_capacity: 100,
            outgoing_capacity: 255,
            flush_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum ReportCommand {
    Record(Log),
    /// Published right away, bypassing the batch
    Priority(Log),
    /// Publish buffered records newer than the given time
    Report { since: i64 },
}

/// Cloneable handle feeding the reporter
#[derive(Debug, Clone)]
pub struct LogSender {
    tx: mpsc::UnboundedSender<ReportCommand>,
}

impl LogSender {
    pub fn send(&self, log: Log) {
        let _ = self.tx.send(ReportCommand::Record(log));
    }

    pub fn send_priority(&self, log: Log) {
        let _ = self.tx.send(ReportCommand::Priority(log));
    }

    pub fn request(&self, since: i64) {
        let _ = self.tx.send(ReportCommand::Report { since });
    }
}

pub struct LogReceiver {
    rx: mpsc::UnboundedReceiver<ReportCommand>,
}

impl LogReceiver {
    /// Records queued so far, for use without a running reporter
    pub fn drain_logs(&mut self) -> Vec<Log> {
        let mut logs = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            if let ReportCommand::Record(log) | ReportCommand::Priority(log) = command {
                logs.push(log);
            }
        }
        logs
    }
}

pub fn channel() -> (LogSender, LogReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LogSender { tx }, LogReceiver { rx })
}

struct Reporter {
    target_id: String,
    sender: PipeSender,
    connected: Arc<AtomicBool>,
    memory: RingBuffer<Log>,
    outgoing: RingBuffer<Log>,
}

impl Reporter {
    fn record(&self, log: Log) {
        if log.debug || log.error || log.is_marker() {
            self.outgoing.insert(log.clone());
        }
        self.memory.insert(log);
    }

    async fn priority(&self, log: Log) {
        self.memory.insert(log.clone());
        self.publish(vec![log], false).await;
    }

    async fn report(&self, since: i64) {
        let logs: Vec<Log> = self
            .memory
            .collect()
            .into_iter()
            .filter(|log| log.time >= since)
            .collect();
        debug!("Answering log request with {} records", logs.len());
        self.publish(logs, true).await;
    }

    async fn flush(&self) {
        if !self.connected.load(Ordering::SeqCst) || self.outgoing.is_empty() {
            return;
        }
        let logs = self.outgoing.drain();
        self.publish(logs, false).await;
    }

    async fn publish(&self, logs: Vec<Log>, on_request: bool) {
        let response = Response {
            target_id: self.target_id.clone(),
            logs,
            on_request,
        };
        if let Err(e) = self.sender.send_json(LOG, &response).await {
            error!("Failed to publish logs: {}", e);
        }
    }
}

/// Run the reporter worker
pub async fn run(
    options: &Options,
    target_id: String,
    mut receiver: LogReceiver,
    sender: PipeSender,
    connected: Arc<AtomicBool>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Reporter worker starting...");

    let reporter = Reporter {
        target_id,
        sender,
        connected,
        memory: RingBuffer::new(options.memory_capacity),
        outgoing: RingBuffer::new(options.outgoing_capacity),
    };
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + options.flush_interval,
        options.flush_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reporter worker shutting down...");
                break;
            }
            command = receiver.rx.recv() => match command {
                Some(ReportCommand::Record(log)) => reporter.record(log),
                Some(ReportCommand::Priority(log)) => reporter.priority(log).await,
                Some(ReportCommand::Report { since }) => reporter.report(since).await,
                None => break,
            },
            _ = ticker.tick() => reporter.flush().await,
        }
    }

    // Keep what was produced before shutdown
    while let Ok(command) = receiver.rx.try_recv() {
        if let ReportCommand::Record(log) | ReportCommand::Priority(log) = command {
            reporter.record(log);
        }
    }
    reporter.flush().await;
}

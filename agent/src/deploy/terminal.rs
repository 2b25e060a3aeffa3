//! One-off remote commands

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::deploy::executor::{ExecContext, Executor};

/// Task name of terminal records
pub const TERMINAL_TASK: &str = "$terminal";

/// Stops the running terminal command
pub const STOP_COMMAND: &str = "$stop";

/// Runs at most one command at a time, sending its output right away
pub struct Terminal {
    context: ExecContext,
    executor: Executor,
    busy: AtomicBool,
    root: CancellationToken,
    cancel: Mutex<CancellationToken>,
}

impl Terminal {
    /// `context` must point at the terminal directory
    pub fn new(context: ExecContext, root: CancellationToken) -> Self {
        let context = context.with_priority(true);
        Self {
            executor: Executor::new(context.clone()),
            context,
            busy: AtomicBool::new(false),
            cancel: Mutex::new(root.child_token()),
            root,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start a command in the background or handle `$stop`
    pub fn handle(self: &Arc<Self>, command: String) {
        let command = command.trim().to_string();
        if command.is_empty() {
            return;
        }
        if command == STOP_COMMAND {
            if self.stop() {
                self.context.agent_log("terminal stopped", false);
            } else {
                self.context.agent_log("failed to stop terminal", true);
            }
            return;
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            self.context
                .agent_log(format!("terminal busy, refusing: {}", command), true);
            return;
        }

        let cancel = self.root.child_token();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = cancel.clone();

        info!("Running terminal command: {}", command);
        let terminal = self.clone();
        tokio::spawn(async move {
            terminal.executor.execute(&command, &cancel).await;
            terminal.busy.store(false, Ordering::SeqCst);
        });
    }

    pub fn stop(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.executor.stop()
    }
}

//! Parallel run stage

use std::sync::{Arc, Mutex};

use dt_common::model::log::{STAGE_END, STAGE_START};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::deploy::executor::{ExecContext, Executor};

/// Launches one executor per run command and waits for all of them
pub struct Runner {
    context: ExecContext,
    cancel: CancellationToken,
    executors: Mutex<Vec<Arc<Executor>>>,
}

impl Runner {
    pub fn new(context: ExecContext, cancel: CancellationToken) -> Self {
        Self {
            context,
            cancel,
            executors: Mutex::new(Vec::new()),
        }
    }

    /// True when every command exited successfully
    pub async fn run(&self, commands: &[String]) -> bool {
        if commands.is_empty() {
            return true;
        }

        let executors: Vec<Arc<Executor>> = commands
            .iter()
            .map(|_| Arc::new(Executor::new(self.context.clone())))
            .collect();
        self.executors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(executors.iter().cloned());

        self.context.agent_log(STAGE_START, false);
        let results = join_all(
            executors
                .iter()
                .zip(commands)
                .map(|(executor, command)| executor.execute(command, &self.cancel)),
        )
        .await;
        let succeeded = results.iter().all(|ok| *ok);
        self.context.agent_log(STAGE_END, !succeeded);

        self.executors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        succeeded
    }

    /// Cancel the scope and terminate every running command
    pub fn stop(&self) -> bool {
        self.cancel.cancel();
        let executors = self
            .executors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        executors.iter().fold(true, |ok, executor| executor.stop() && ok)
    }
}

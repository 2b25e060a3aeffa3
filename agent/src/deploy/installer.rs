//! Sequential stages (install and build)

use dt_common::model::log::{STAGE_END, STAGE_START};
use tokio_util::sync::CancellationToken;

use crate::deploy::executor::{ExecContext, Executor};

/// Runs commands in order, stopping at the first failure
pub struct Installer {
    context: ExecContext,
    executor: Executor,
}

impl Installer {
    pub fn new(context: ExecContext) -> Self {
        Self {
            executor: Executor::new(context.clone()),
            context,
        }
    }

    /// True when every command succeeded or there was nothing to run
    pub async fn install(&self, commands: &[String], cancel: &CancellationToken) -> bool {
        if commands.is_empty() {
            return true;
        }
        let stage = self
            .context
            .stage
            .map(|stage| stage.to_string())
            .unwrap_or_default();

        self.context.agent_log(STAGE_START, false);
        for command in commands {
            if !self.executor.execute(command, cancel).await {
                self.context
                    .agent_log(format!("{} stage failed on: {}", stage, command), true);
                self.context.agent_log(STAGE_END, true);
                return false;
            }
        }
        self.context.agent_log(STAGE_END, false);
        true
    }
}

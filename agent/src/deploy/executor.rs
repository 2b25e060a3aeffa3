//! Supervised shell command execution

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use dt_common::model::log::{EXEC_END, EXEC_START};
use dt_common::model::{Log, Stage};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::workers::reporter::LogSender;

/// Time left to read buffered output once the command has exited
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// Where the commands of one stage run and where their output goes
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub task: String,
    pub stage: Option<Stage>,
    pub work_dir: PathBuf,
    pub debug: bool,
    /// Send records right away instead of batching them
    pub priority: bool,
    /// Delay between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    pub logs: LogSender,
}

impl ExecContext {
    pub fn new(task: impl Into<String>, work_dir: impl Into<PathBuf>, logs: LogSender) -> Self {
        Self {
            task: task.into(),
            stage: None,
            work_dir: work_dir.into(),
            debug: false,
            priority: false,
            kill_grace: Duration::from_secs(10),
            logs,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Record produced by the agent itself
    pub fn agent_log(&self, output: impl Into<String>, error: bool) {
        self.emit(Log::agent(&self.task, self.stage, output, error, self.debug));
    }

    pub fn emit(&self, log: Log) {
        if self.debug {
            debug!(
                task = %log.task,
                command = %log.command,
                error = log.error,
                "{}",
                log.output
            );
        }
        if self.priority {
            self.logs.send_priority(log);
        } else {
            self.logs.send(log);
        }
    }
}

/// Runs one command at a time as leader of its own process group
pub struct Executor {
    context: ExecContext,
    group: Mutex<Option<i32>>,
}

impl Executor {
    pub fn new(context: ExecContext) -> Self {
        Self {
            context,
            group: Mutex::new(None),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.group.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn log(&self, command: &str, output: &str, error: bool) {
        let ctx = &self.context;
        ctx.emit(Log::new(
            &ctx.task, ctx.stage, command, output, error, ctx.debug,
        ));
    }

    /// Run a command to completion, streaming every output line. Returns
    /// whether the command exited successfully.
    pub async fn execute(&self, command: &str, cancel: &CancellationToken) -> bool {
        self.log(command, EXEC_START, false);

        if cancel.is_cancelled() {
            self.log(command, "cancelled before start", true);
            self.log(command, EXEC_END, true);
            return false;
        }

        let mut child = match Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.context.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.log(command, &format!("failed to start: {}", e), true);
                self.log(command, EXEC_END, true);
                return false;
            }
        };

        if let Some(pid) = child.id() {
            *self.group.lock().unwrap_or_else(|e| e.into_inner()) = Some(pid as i32);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Background children may inherit the pipes and hold them open long
        // after the shell is gone, so reading stops shortly after it exits.
        let exited = CancellationToken::new();
        let wait = async {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    self.stop();
                    child.wait().await
                }
            };
            exited.cancel();
            status
        };
        let (status, _, _) = tokio::join!(
            wait,
            self.forward(command, stdout, false, &exited),
            self.forward(command, stderr, true, &exited),
        );

        *self.group.lock().unwrap_or_else(|e| e.into_inner()) = None;

        match status {
            Ok(status) if status.success() => {
                self.log(command, EXEC_END, false);
                true
            }
            Ok(status) => {
                let reason = match status.code() {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                };
                self.log(command, &reason, true);
                self.log(command, EXEC_END, true);
                false
            }
            Err(e) => {
                self.log(command, &format!("failed to wait: {}", e), true);
                self.log(command, EXEC_END, true);
                false
            }
        }
    }

    async fn forward<R>(
        &self,
        command: &str,
        stream: Option<R>,
        error: bool,
        exited: &CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        let Some(stream) = stream else {
            return;
        };
        let drained = async {
            exited.cancelled().await;
            tokio::time::sleep(OUTPUT_DRAIN).await;
        };
        tokio::pin!(drained);

        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut line) => read,
                _ = &mut drained => {
                    debug!("Output of {} still open after exit, detaching", command);
                    break;
                }
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    self.log(command, text.trim_end_matches(['\n', '\r']), error);
                }
                Err(e) => {
                    warn!("Failed to read output of {}: {}", command, e);
                    break;
                }
            }
        }
    }

    /// Terminate the running command and every process of its group.
    ///
    /// Returns without waiting once SIGTERM is delivered; SIGKILL follows after
    /// the grace period if the group is still alive.
    pub fn stop(&self) -> bool {
        let group = *self.group.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = group else {
            return true;
        };
        let pgid = Pid::from_raw(group);

        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {
                let grace = self.context.kill_grace;
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        tokio::time::sleep(grace).await;
                        if killpg(pgid, None).is_ok() {
                            debug!("Process group {} outlived the grace period", group);
                            let _ = killpg(pgid, Signal::SIGKILL);
                        }
                    });
                }
                true
            }
            Err(Errno::ESRCH) => true,
            Err(e) => {
                warn!("SIGTERM to process group {} failed: {}", group, e);
                match killpg(pgid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => true,
                    Err(e) => {
                        warn!("SIGKILL to process group {} failed: {}", group, e);
                        false
                    }
                }
            }
        }
    }
}

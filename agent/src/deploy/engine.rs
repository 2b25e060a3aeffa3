//! Task engine: admission, stage pipelines and task scopes

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dt_common::archive::{pack_async, relative_entries, unpack_async};
use dt_common::errors::CommonError;
use dt_common::model::log::{STAGE_END, STAGE_START};
use dt_common::model::{Announcement, Build, Deploy, Log, Package, Stage, Task, TaskKind};
use dt_common::topics::PKG;
use dt_common::transport::PipeSender;
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deploy::executor::ExecContext;
use crate::deploy::fsm::{TaskEvent, TaskFsm, TaskState};
use crate::deploy::installer::Installer;
use crate::deploy::runner::Runner;
use crate::deploy::terminal::{Terminal, TERMINAL_TASK};
use crate::storage::layout::{is_valid_task_id, StorageLayout, SOURCE_DIR};
use crate::storage::state::{ActiveRun, TargetStore};
use crate::workers::reporter::LogSender;

/// Task engine options
#[derive(Debug, Clone)]
pub struct Options {
    /// Delay between SIGTERM and SIGKILL when stopping commands
    pub kill_grace: Duration,

    /// Announced sizes above this are refused. Half of the total memory when unset.
    pub memory_limit: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(10),
            memory_limit: None,
        }
    }
}

struct TaskSlot {
    kind: TaskKind,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Directory name of a task. Build and deploy tasks of one order share the id.
fn workspace(id: &str, kind: TaskKind) -> String {
    match kind {
        TaskKind::Deploy => id.to_string(),
        TaskKind::Build => format!("{}.build", id),
    }
}

pub struct TaskEngine {
    options: Options,
    store: Arc<TargetStore>,
    layout: StorageLayout,
    logs: LogSender,
    sender: PipeSender,
    root: CancellationToken,
    tasks: Mutex<HashMap<(String, TaskKind), TaskSlot>>,
    terminal: Arc<Terminal>,
}

impl TaskEngine {
    pub fn new(
        options: Options,
        store: Arc<TargetStore>,
        layout: StorageLayout,
        logs: LogSender,
        sender: PipeSender,
    ) -> Self {
        let root = CancellationToken::new();
        let terminal_context =
            ExecContext::new(TERMINAL_TASK, layout.terminal_dir().path(), logs.clone())
                .with_kill_grace(options.kill_grace);
        Self {
            terminal: Arc::new(Terminal::new(terminal_context, root.clone())),
            options,
            store,
            layout,
            logs,
            sender,
            root,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TargetStore> {
        &self.store
    }

    fn context(&self, id: &str, kind: TaskKind, debug: bool) -> ExecContext {
        let work_dir = self.layout.source_dir(&workspace(id, kind));
        ExecContext::new(id, work_dir.path(), self.logs.clone())
            .with_debug(debug)
            .with_kill_grace(self.options.kill_grace)
    }

    fn memory_limit(&self) -> u64 {
        self.options.memory_limit.unwrap_or_else(|| {
            let mut system = System::new();
            system.refresh_memory();
            system.total_memory() / 2
        })
    }

    // ================================ ADMISSION ================================ //

    /// Handle an announcement: record it, check the size and subscribe to the
    /// task topic so the payload can follow
    pub async fn announce(&self, announcement: Announcement) {
        let id = announcement.header.id.clone();
        if !is_valid_task_id(&id) {
            warn!("Dropping announcement with invalid task id {:?}", id);
            return;
        }
        if !self.store.announce(&id, announcement.kind).await {
            debug!("Ignoring repeated announcement of {} task {}", announcement.kind, id);
            return;
        }
        self.logs.send(Log::agent(
            &id,
            None,
            format!("received announcement of {} task", announcement.kind),
            false,
            false,
        ));

        let limit = self.memory_limit();
        if announcement.size > limit {
            self.logs.send(Log::agent(
                &id,
                None,
                format!(
                    "task needs {} bytes but at most {} can be received",
                    announcement.size, limit
                ),
                true,
                announcement.header.debug,
            ));
            self.store
                .record(&id, announcement.kind, TaskState::Failed)
                .await;
            return;
        }

        if let Err(e) = self.sender.subscribe(&id).await {
            error!("Failed to subscribe to task {}: {}", id, e);
        }
    }

    /// Handle a task payload received on `topic`
    pub async fn accept(self: &Arc<Self>, task: Task, topic: &str) {
        let id = task.header.id.clone();
        let kind = match task.kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Dropping task: {}", e);
                return;
            }
        };
        if !is_valid_task_id(&id) {
            warn!("Dropping task with invalid id {:?}", id);
            return;
        }
        if !self.store.accept(&id, kind).await {
            debug!("Ignoring repeated {} task {}", kind, id);
            return;
        }
        if topic == id {
            if let Err(e) = self.sender.unsubscribe(&id).await {
                warn!("Failed to unsubscribe from task {}: {}", id, e);
            }
        }

        info!("Accepted {} task {}", kind, id);
        self.logs.send(Log::agent(
            &id,
            Some(Stage::Transfer),
            format!("received {} task", kind),
            false,
            true,
        ));

        let engine = self.clone();
        self.spawn(&id, kind, move |cancel| async move {
            match kind {
                TaskKind::Deploy => engine.deploy(task, cancel).await,
                TaskKind::Build => engine.build(task, cancel).await,
            }
        })
        .await;
    }

    async fn spawn<F, Fut>(&self, id: &str, kind: TaskKind, pipeline: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = self.root.child_token();
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, slot| !slot.handle.is_finished());
        let handle = tokio::spawn(pipeline(cancel.clone()));
        if let Some(previous) = tasks.insert(
            (id.to_string(), kind),
            TaskSlot {
                kind,
                cancel,
                handle,
            },
        ) {
            previous.cancel.cancel();
        }
    }

    // ================================ PIPELINES ================================ //

    async fn deploy(self: Arc<Self>, task: Task, cancel: CancellationToken) {
        let id = task.header.id.clone();
        let debug = task.header.debug;
        let Some(deploy) = task.deploy else {
            return;
        };
        let context = self.context(&id, TaskKind::Deploy, debug);
        let mut fsm = TaskFsm::received();

        if !self
            .transfer(&mut fsm, &context, TaskKind::Deploy, task.artifacts)
            .await
        {
            return;
        }

        if !deploy.install.commands.is_empty() {
            self.step(&mut fsm, &id, TaskKind::Deploy, TaskEvent::Install)
                .await;
            let installer = Installer::new(context.clone().with_stage(Stage::Install));
            if !installer.install(&deploy.install.commands, &cancel).await {
                self.finish(&mut fsm, &id, TaskKind::Deploy, &cancel, false, "install failed")
                    .await;
                return;
            }
        }
        if cancel.is_cancelled() {
            self.finish(&mut fsm, &id, TaskKind::Deploy, &cancel, false, "stopped")
                .await;
            return;
        }

        if !self.replace_deploys(&id, &cancel).await {
            self.finish(&mut fsm, &id, TaskKind::Deploy, &cancel, false, "stopped")
                .await;
            return;
        }
        self.cleanup().await;
        self.start_run(fsm, &id, &deploy, debug, cancel).await;
    }

    async fn start_run(
        &self,
        mut fsm: TaskFsm,
        id: &str,
        deploy: &Deploy,
        debug: bool,
        cancel: CancellationToken,
    ) {
        let commands = &deploy.run.commands;
        let active_run = (!commands.is_empty()).then(|| ActiveRun {
            task: id.to_string(),
            commands: commands.clone(),
            auto_restart: deploy.run.auto_restart,
            debug,
        });
        self.store.set_active_run(active_run).await;

        if commands.is_empty() {
            self.step(&mut fsm, id, TaskKind::Deploy, TaskEvent::Succeed)
                .await;
            return;
        }
        self.run_stage(fsm, id, commands, debug, cancel).await;
    }

    async fn run_stage(
        &self,
        mut fsm: TaskFsm,
        id: &str,
        commands: &[String],
        debug: bool,
        cancel: CancellationToken,
    ) {
        let event = match fsm.state() {
            TaskState::Transferring | TaskState::Installing => TaskEvent::Run,
            _ => TaskEvent::Restart,
        };
        self.step(&mut fsm, id, TaskKind::Deploy, event).await;

        let context = self
            .context(id, TaskKind::Deploy, debug)
            .with_stage(Stage::Run);
        let runner = Runner::new(context, cancel.clone());
        let succeeded = runner.run(commands).await;
        self.finish(&mut fsm, id, TaskKind::Deploy, &cancel, succeeded, "run failed")
            .await;
    }

    async fn build(self: Arc<Self>, task: Task, cancel: CancellationToken) {
        let id = task.header.id.clone();
        let Some(build) = task.build else {
            return;
        };
        let context = self.context(&id, TaskKind::Build, task.header.debug);
        let mut fsm = TaskFsm::received();

        if !self
            .transfer(&mut fsm, &context, TaskKind::Build, task.artifacts)
            .await
        {
            return;
        }

        self.step(&mut fsm, &id, TaskKind::Build, TaskEvent::Build)
            .await;
        let builder = Installer::new(context.clone().with_stage(Stage::Build));
        if !builder.install(&build.commands, &cancel).await {
            self.finish(&mut fsm, &id, TaskKind::Build, &cancel, false, "build failed")
                .await;
            return;
        }

        match self.package(&id, &build, &context).await {
            Ok(size) => {
                context
                    .clone()
                    .with_stage(Stage::Build)
                    .agent_log(format!("sent package of {} bytes", size), false);
                self.finish(&mut fsm, &id, TaskKind::Build, &cancel, true, "")
                    .await;
            }
            Err(e) => {
                context
                    .clone()
                    .with_stage(Stage::Build)
                    .agent_log(format!("packaging failed: {}", e), true);
                self.finish(&mut fsm, &id, TaskKind::Build, &cancel, false, "packaging failed")
                    .await;
            }
        }
    }

    async fn package(
        &self,
        id: &str,
        build: &Build,
        context: &ExecContext,
    ) -> Result<usize, String> {
        let entries =
            relative_entries(&context.work_dir, &build.artifacts).map_err(|e| e.to_string())?;
        let payload = pack_async(entries).await.map_err(|e| e.to_string())?;
        let size = payload.len();
        let package = Package {
            assembler: self.store.id().to_string(),
            task: id.to_string(),
            payload,
        };
        self.sender
            .send_json(PKG, &package)
            .await
            .map_err(|e| e.to_string())?;
        Ok(size)
    }

    /// Unpack the artifacts into a fresh source directory
    async fn transfer(
        &self,
        fsm: &mut TaskFsm,
        context: &ExecContext,
        kind: TaskKind,
        artifacts: Vec<u8>,
    ) -> bool {
        let id = context.task.clone();
        self.step(fsm, &id, kind, TaskEvent::Transfer).await;

        let context = context.clone().with_stage(Stage::Transfer);
        let task_dir = self.layout.task_dir(&workspace(&id, kind));
        let source_dir = task_dir.subdir(SOURCE_DIR);

        let result = async {
            task_dir.delete().await?;
            if artifacts.is_empty() {
                source_dir.create().await?;
                return Ok(None);
            }
            context.agent_log(STAGE_START, false);
            let size = artifacts.len();
            unpack_async(artifacts, source_dir.path().to_path_buf()).await?;
            Ok::<_, CommonError>(Some(size))
        }
        .await;

        match result {
            Ok(None) => true,
            Ok(Some(size)) => {
                context.agent_log(format!("decompressed archive of {} bytes", size), false);
                context.agent_log(STAGE_END, false);
                true
            }
            Err(e) => {
                context.agent_log(format!("transfer failed: {}", e), true);
                context.agent_log(STAGE_END, true);
                self.fail(fsm, &id, kind, "transfer failed").await;
                false
            }
        }
    }

    async fn step(&self, fsm: &mut TaskFsm, id: &str, kind: TaskKind, event: TaskEvent) {
        match fsm.process(event) {
            Ok(state) => self.store.record(id, kind, state).await,
            Err(e) => warn!("Task {}: {}", id, e),
        }
    }

    async fn fail(&self, fsm: &mut TaskFsm, id: &str, kind: TaskKind, reason: &str) {
        self.step(fsm, id, kind, TaskEvent::Fail(reason.to_string()))
            .await;
    }

    async fn finish(
        &self,
        fsm: &mut TaskFsm,
        id: &str,
        kind: TaskKind,
        cancel: &CancellationToken,
        succeeded: bool,
        reason: &str,
    ) {
        if cancel.is_cancelled() {
            info!("Task {} stopped", id);
            self.step(fsm, id, kind, TaskEvent::Stop).await;
        } else if succeeded {
            info!("Task {} completed", id);
            self.step(fsm, id, kind, TaskEvent::Succeed).await;
        } else {
            warn!("Task {} failed: {}", id, reason);
            self.fail(fsm, id, kind, reason).await;
        }
    }

    // ================================= SCOPES ================================== //

    /// Cancel every other deploy task and wait for it to wind down. False when
    /// the current task was itself replaced in the meantime.
    async fn replace_deploys(&self, current: &str, cancel: &CancellationToken) -> bool {
        let replaced: Vec<(String, TaskSlot)> = {
            let mut tasks = self.tasks.lock().await;
            if cancel.is_cancelled() {
                return false;
            }
            let keys: Vec<(String, TaskKind)> = tasks
                .iter()
                .filter(|((id, _), slot)| slot.kind == TaskKind::Deploy && id != current)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| tasks.remove(&key).map(|slot| (key.0, slot)))
                .inspect(|(_, slot)| slot.cancel.cancel())
                .collect()
        };

        for (id, slot) in replaced {
            info!("Task {} replaced by {}", id, current);
            if let Err(e) = slot.handle.await {
                error!("Task {} ended abnormally: {}", id, e);
            }
        }
        true
    }

    /// Best effort removal of task directories no active task uses
    async fn cleanup(&self) {
        let active: HashSet<String> = {
            let tasks = self.tasks.lock().await;
            tasks
                .iter()
                .filter(|(_, slot)| !slot.handle.is_finished())
                .map(|((id, kind), _)| workspace(id, *kind))
                .collect()
        };

        let dirs = match self.layout.tasks_dir().list_dirs().await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("Failed to list task directories: {}", e);
                return;
            }
        };
        for dir in dirs {
            let Some(name) = dir.name() else {
                continue;
            };
            if active.contains(name) {
                continue;
            }
            debug!("Removing task directory {}", dir.path().display());
            if let Err(e) = dir.delete().await {
                warn!("Failed to remove {}: {}", dir.path().display(), e);
            }
        }
    }

    /// Restart the persisted run stage after a reboot
    pub async fn autostart(self: &Arc<Self>) {
        let Some(active_run) = self.store.active_run().await else {
            return;
        };
        if !active_run.auto_restart {
            return;
        }
        let id = active_run.task.clone();
        if !self
            .layout
            .source_dir(&workspace(&id, TaskKind::Deploy))
            .exists()
            .await
        {
            warn!("Cannot restart task {}: its source directory is gone", id);
            return;
        }

        info!("Restarting run stage of task {}", id);
        let state = match self.store.task_state(&id, TaskKind::Deploy).await {
            Some(state @ (TaskState::Running | TaskState::Completed | TaskState::Stopped)) => state,
            _ => TaskState::Stopped,
        };
        let engine = self.clone();
        self.spawn(&id, TaskKind::Deploy, move |cancel| async move {
            engine
                .run_stage(
                    TaskFsm::from_state(state),
                    &active_run.task,
                    &active_run.commands,
                    active_run.debug,
                    cancel,
                )
                .await;
        })
        .await;
    }

    // ================================ CONTROL ================================== //

    pub fn command(&self, command: String) {
        self.terminal.handle(command);
    }

    /// Stop every active task
    pub async fn stop_all(&self) {
        let tasks = self.tasks.lock().await;
        for ((id, _), slot) in tasks.iter() {
            if !slot.handle.is_finished() {
                info!("Stopping task {}", id);
                slot.cancel.cancel();
            }
        }
    }

    /// Ids of tasks whose pipeline is still running
    pub async fn active_tasks(&self) -> Vec<(String, TaskKind)> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Wait until the pipeline of a task has ended
    pub async fn wait(&self, id: &str, kind: TaskKind) {
        let slot = self.tasks.lock().await.remove(&(id.to_string(), kind));
        if let Some(slot) = slot {
            if let Err(e) = slot.handle.await {
                error!("Task {} ended abnormally: {}", id, e);
            }
        }
    }

    /// Cancel every scope and wait for the pipelines to end
    pub async fn shutdown(&self) {
        info!("Stopping task engine...");
        self.root.cancel();
        self.terminal.stop();

        let slots: Vec<((String, TaskKind), TaskSlot)> =
            self.tasks.lock().await.drain().collect();
        for ((id, _), slot) in slots {
            if let Err(e) = slot.handle.await {
                error!("Task {} ended abnormally: {}", id, e);
            }
        }
    }
}

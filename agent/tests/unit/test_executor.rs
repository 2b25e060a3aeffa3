//! Executor, installer and runner tests

use std::time::{Duration, Instant};

use dt_agent::deploy::executor::{ExecContext, Executor};
use dt_agent::deploy::installer::Installer;
use dt_agent::deploy::runner::Runner;
use dt_agent::workers::reporter::{self, LogReceiver};
use dt_common::model::log::{EXEC_END, EXEC_START, STAGE_END, STAGE_START};
use dt_common::model::{Log, Stage};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn context() -> (TempDir, ExecContext, LogReceiver) {
    let dir = tempfile::tempdir().unwrap();
    let (logs, receiver) = reporter::channel();
    let context = ExecContext::new("t1", dir.path(), logs).with_kill_grace(Duration::from_secs(1));
    (dir, context, receiver)
}

fn find<'a>(logs: &'a [Log], output: &str) -> Option<&'a Log> {
    logs.iter().find(|log| log.output == output)
}

/// Whether a process is gone or left as a zombie waiting to be reaped
fn is_dead(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

#[tokio::test]
async fn test_execute_streams_both_outputs() {
    let (_dir, context, mut receiver) = context();
    let executor = Executor::new(context);

    let ok = executor
        .execute("echo out; echo err 1>&2", &CancellationToken::new())
        .await;
    assert!(ok);

    let logs = receiver.drain_logs();
    assert_eq!(logs.first().unwrap().output, EXEC_START);
    assert_eq!(logs.last().unwrap().output, EXEC_END);
    assert!(!logs.last().unwrap().error);
    assert!(!find(&logs, "out").unwrap().error);
    assert!(find(&logs, "err").unwrap().error);
    assert!(logs.iter().all(|log| log.command == "echo out; echo err 1>&2"));
}

#[tokio::test]
async fn test_execute_runs_in_work_dir() {
    let (dir, context, mut receiver) = context();
    std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
    let executor = Executor::new(context);

    assert!(executor.execute("cat marker.txt", &CancellationToken::new()).await);
    assert!(find(&receiver.drain_logs(), "here").is_some());
}

#[tokio::test]
async fn test_execute_reports_failure() {
    let (_dir, context, mut receiver) = context();
    let executor = Executor::new(context);

    assert!(!executor.execute("exit 3", &CancellationToken::new()).await);

    let logs = receiver.drain_logs();
    assert!(find(&logs, "exited with code 3").unwrap().error);
    let end = logs.last().unwrap();
    assert_eq!(end.output, EXEC_END);
    assert!(end.error);
}

#[tokio::test]
async fn test_execute_returns_when_shell_exits_before_background_child() {
    let (_dir, context, mut receiver) = context();
    let executor = Executor::new(context);

    let started = Instant::now();
    let ok = tokio::time::timeout(
        Duration::from_secs(3),
        executor.execute("sleep 5 & echo started", &CancellationToken::new()),
    )
    .await
    .expect("execute waited for the background child");
    assert!(ok);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!executor.is_busy());

    let logs = receiver.drain_logs();
    assert!(find(&logs, "started").is_some());
    assert_eq!(logs.last().unwrap().output, EXEC_END);
    assert!(!logs.last().unwrap().error);
}

#[tokio::test]
async fn test_stop_when_idle() {
    let (_dir, context, _receiver) = context();
    let executor = Executor::new(context);
    assert!(!executor.is_busy());
    assert!(executor.stop());
}

#[tokio::test]
async fn test_cancel_terminates_process_group() {
    let (dir, context, mut receiver) = context();
    let executor = Executor::new(context);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let ok = executor
        .execute("sleep 30 & echo $! > child.pid; sleep 30", &cancel)
        .await;
    canceller.await.unwrap();

    assert!(!ok);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!executor.is_busy());

    let pid: i32 = std::fs::read_to_string(dir.path().join("child.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut dead = false;
    for _ in 0..40 {
        if is_dead(pid) {
            dead = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(dead, "background child {} survived", pid);

    let logs = receiver.drain_logs();
    assert!(find(&logs, "terminated by signal").is_some());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (_dir, context, mut receiver) = context();
    let executor = Executor::new(context);
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(!executor.execute("echo never", &cancel).await);
    assert!(find(&receiver.drain_logs(), "never").is_none());
}

#[tokio::test]
async fn test_install_stops_at_first_failure() {
    let (_dir, context, mut receiver) = context();
    let installer = Installer::new(context.with_stage(Stage::Install));
    let commands = vec![
        "echo first".to_string(),
        "false".to_string(),
        "echo never".to_string(),
    ];

    assert!(!installer.install(&commands, &CancellationToken::new()).await);

    let logs = receiver.drain_logs();
    assert!(find(&logs, "first").is_some());
    assert!(find(&logs, "never").is_none());
    assert!(logs.iter().all(|log| log.command != "echo never"));
    assert_eq!(logs.first().unwrap().output, STAGE_START);
    let end = logs.last().unwrap();
    assert_eq!(end.output, STAGE_END);
    assert!(end.error);
    assert!(logs.iter().all(|log| log.stage == Some(Stage::Install)));
}

#[tokio::test]
async fn test_empty_install_emits_nothing() {
    let (_dir, context, mut receiver) = context();
    let installer = Installer::new(context.with_stage(Stage::Install));

    assert!(installer.install(&[], &CancellationToken::new()).await);
    assert!(receiver.drain_logs().is_empty());
}

#[tokio::test]
async fn test_run_commands_in_parallel() {
    let (_dir, context, mut receiver) = context();
    let runner = Runner::new(context.with_stage(Stage::Run), CancellationToken::new());
    let commands = vec!["sleep 1".to_string(), "sleep 1".to_string()];

    let started = Instant::now();
    assert!(runner.run(&commands).await);
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1900), "took {:?}", elapsed);

    let logs = receiver.drain_logs();
    let starts = logs.iter().filter(|log| log.output == EXEC_START).count();
    assert_eq!(starts, 2);
    assert_eq!(logs.last().unwrap().output, STAGE_END);
}

#[tokio::test]
async fn test_runner_stop() {
    let (_dir, context, mut receiver) = context();
    let runner = std::sync::Arc::new(Runner::new(
        context.with_stage(Stage::Run),
        CancellationToken::new(),
    ));
    let commands = vec!["sleep 30".to_string(), "sleep 30".to_string()];

    let handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run(&commands).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(runner.stop());

    let ok = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!ok);

    let end = receiver.drain_logs().pop().unwrap();
    assert_eq!(end.output, STAGE_END);
    assert!(end.error);
}

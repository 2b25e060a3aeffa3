//! Task engine tests

use std::time::Duration;

use dt_agent::deploy::fsm::TaskState;
use dt_common::archive::{pack, unpack, ArchiveEntry};
use dt_common::model::{Announcement, Build, Header, Package, Task, TaskKind};
use dt_common::topics::PKG;
use dt_common::transport::Operation;

use crate::common::{deploy_task, markers, outputs, Harness};

#[tokio::test]
async fn test_deploy_log_sequence() {
    let mut harness = Harness::new().await;
    let task = deploy_task("t1", &["echo installing"], &["echo running"]);

    harness.engine.accept(task, "ID-a1").await;
    harness.engine.wait("t1", TaskKind::Deploy).await;

    let logs = harness.logs.drain_logs();
    assert_eq!(
        markers(&logs, "t1"),
        vec![
            "INSTALL:STAGE-START",
            "INSTALL:EXEC-START",
            "INSTALL:EXEC-END",
            "INSTALL:STAGE-END",
            "RUN:STAGE-START",
            "RUN:EXEC-START",
            "RUN:EXEC-END",
            "RUN:STAGE-END",
        ]
    );
    let outputs = outputs(&logs, "t1");
    let installing = outputs.iter().position(|o| o == "installing").unwrap();
    let running = outputs.iter().position(|o| o == "running").unwrap();
    assert!(installing < running);
    assert_eq!(
        harness.state("t1", TaskKind::Deploy).await,
        Some(TaskState::Completed)
    );
}

#[tokio::test]
async fn test_duplicate_task_is_ignored() {
    let mut harness = Harness::new().await;
    let task = deploy_task("t1", &[], &["echo once"]);

    harness.engine.accept(task.clone(), "ID-a1").await;
    harness.engine.wait("t1", TaskKind::Deploy).await;
    harness.engine.accept(task.clone(), "TAG-edge").await;
    harness.engine.accept(task, "ALL").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let logs = harness.logs.drain_logs();
    let runs = outputs(&logs, "t1").iter().filter(|o| *o == "once").count();
    assert_eq!(runs, 1);
    assert!(harness.engine.active_tasks().await.is_empty());
}

#[tokio::test]
async fn test_task_named_like_a_routing_topic_is_dropped() {
    let mut harness = Harness::new().await;
    for id in ["ALL", "TAG-edge", "ID-a1"] {
        harness
            .engine
            .accept(deploy_task(id, &[], &["echo leaked"]), id)
            .await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let logs = harness.logs.drain_logs();
    assert!(logs.iter().all(|log| log.output != "leaked"));
    assert!(harness.engine.active_tasks().await.is_empty());
    assert_eq!(harness.state("ALL", TaskKind::Deploy).await, None);
}

#[tokio::test]
async fn test_failed_install_skips_run() {
    let mut harness = Harness::new().await;
    let task = deploy_task("t1", &["exit 1"], &["echo never"]);

    harness.engine.accept(task, "ID-a1").await;
    harness.engine.wait("t1", TaskKind::Deploy).await;

    let logs = harness.logs.drain_logs();
    assert!(!outputs(&logs, "t1").contains(&"never".to_string()));
    assert!(markers(&logs, "t1").iter().all(|m| !m.starts_with("RUN")));
    assert_eq!(
        harness.state("t1", TaskKind::Deploy).await,
        Some(TaskState::Failed)
    );
    assert!(harness.engine.store().active_run().await.is_none());
}

#[tokio::test]
async fn test_artifacts_are_unpacked_into_source_dir() {
    let mut harness = Harness::new().await;
    let scratch = tempfile::tempdir().unwrap();
    let script = scratch.path().join("hello.txt");
    std::fs::write(&script, "from archive").unwrap();

    let mut task = deploy_task("t1", &[], &["cat hello.txt"]);
    task.artifacts = pack(&[ArchiveEntry::from_path(&script).unwrap()]).unwrap();

    harness.engine.accept(task, "ID-a1").await;
    harness.engine.wait("t1", TaskKind::Deploy).await;

    let logs = harness.logs.drain_logs();
    let outputs = outputs(&logs, "t1");
    assert!(outputs.contains(&"from archive".to_string()));
    assert!(outputs.iter().any(|o| o.starts_with("decompressed archive of")));
    assert_eq!(markers(&logs, "t1")[0], "TRANSFER:STAGE-START");
}

#[tokio::test]
async fn test_corrupt_archive_fails_task() {
    let mut harness = Harness::new().await;
    let mut task = deploy_task("t1", &[], &["echo never"]);
    task.artifacts = b"not a tarball".to_vec();

    harness.engine.accept(task, "ID-a1").await;
    harness.engine.wait("t1", TaskKind::Deploy).await;

    let logs = harness.logs.drain_logs();
    assert!(logs.iter().any(|l| l.error && l.output.starts_with("transfer failed")));
    assert!(!outputs(&logs, "t1").contains(&"never".to_string()));
    assert_eq!(
        harness.state("t1", TaskKind::Deploy).await,
        Some(TaskState::Failed)
    );
}

#[tokio::test]
async fn test_announcement_subscribes_to_task_topic() {
    let mut harness = Harness::new().await;
    let task = deploy_task("t1", &[], &["true"]);
    let announcement = task.announcement().unwrap();

    harness.engine.announce(announcement.clone()).await;
    assert_eq!(
        harness.ends.operations.recv().await,
        Some(Operation::Subscribe("t1".to_string()))
    );
    assert_eq!(
        harness.state("t1", TaskKind::Deploy).await,
        Some(TaskState::Announced)
    );

    // repeated announcements are ignored
    harness.engine.announce(announcement).await;
    assert!(harness.ends.operations.try_recv().is_err());

    harness.engine.accept(task, "t1").await;
    assert_eq!(
        harness.ends.operations.recv().await,
        Some(Operation::Unsubscribe("t1".to_string()))
    );
    harness.engine.wait("t1", TaskKind::Deploy).await;
}

#[tokio::test]
async fn test_oversized_announcement_is_refused() {
    let mut harness = Harness::new().await;
    let announcement = Announcement {
        header: Header {
            id: "big".to_string(),
            debug: false,
            created_at: 0,
        },
        kind: TaskKind::Deploy,
        size: 1 << 40,
    };

    harness.engine.announce(announcement).await;
    assert!(harness.ends.operations.try_recv().is_err());
    assert_eq!(
        harness.state("big", TaskKind::Deploy).await,
        Some(TaskState::Failed)
    );
    let logs = harness.logs.drain_logs();
    assert!(logs.iter().any(|l| l.task == "big" && l.error));

    // the payload is refused as well
    harness
        .engine
        .accept(deploy_task("big", &[], &["true"]), "big")
        .await;
    assert!(harness.engine.active_tasks().await.is_empty());
}

#[tokio::test]
async fn test_newer_deploy_replaces_running_one() {
    let mut harness = Harness::new().await;

    harness
        .engine
        .accept(deploy_task("old", &[], &["sleep 30"]), "ID-a1")
        .await;
    harness
        .wait_for_state("old", TaskKind::Deploy, TaskState::Running)
        .await;

    harness
        .engine
        .accept(deploy_task("new", &[], &["echo replaced"]), "ID-a1")
        .await;
    tokio::time::timeout(
        Duration::from_secs(10),
        harness.engine.wait("new", TaskKind::Deploy),
    )
    .await
    .unwrap();

    assert_eq!(
        harness.state("old", TaskKind::Deploy).await,
        Some(TaskState::Stopped)
    );
    assert_eq!(
        harness.state("new", TaskKind::Deploy).await,
        Some(TaskState::Completed)
    );
    // the old working directory is cleaned up
    assert!(!harness.layout.task_dir("old").exists().await);
    assert!(harness.layout.task_dir("new").exists().await);

    let logs = harness.logs.drain_logs();
    assert_eq!(markers(&logs, "old").last().unwrap(), "RUN:STAGE-END");
}

#[tokio::test]
async fn test_stop_all() {
    let harness = Harness::new().await;

    harness
        .engine
        .accept(deploy_task("t1", &[], &["sleep 30", "sleep 30"]), "ID-a1")
        .await;
    harness
        .wait_for_state("t1", TaskKind::Deploy, TaskState::Running)
        .await;

    harness.engine.stop_all().await;
    tokio::time::timeout(
        Duration::from_secs(5),
        harness.engine.wait("t1", TaskKind::Deploy),
    )
    .await
    .unwrap();

    assert_eq!(
        harness.state("t1", TaskKind::Deploy).await,
        Some(TaskState::Stopped)
    );
}

#[tokio::test]
async fn test_build_publishes_package() {
    let mut harness = Harness::new().await;
    let task = Task {
        header: Header {
            id: "b1".to_string(),
            debug: false,
            created_at: 0,
        },
        build: Some(Build {
            commands: vec!["mkdir out && echo built > out/app.txt".to_string()],
            artifacts: vec!["out".to_string()],
            host: "a1".to_string(),
        }),
        deploy: None,
        artifacts: Vec::new(),
    };

    harness.engine.accept(task, "ID-a1").await;
    harness.engine.wait("b1", TaskKind::Build).await;

    let message = harness.ends.messages.recv().await.unwrap();
    assert_eq!(message.topic, PKG);
    let package: Package = message.parse_json().unwrap();
    assert_eq!(package.assembler, "a1");
    assert_eq!(package.task, "b1");

    let dest = tempfile::tempdir().unwrap();
    unpack(&package.payload, dest.path()).unwrap();
    let content = std::fs::read_to_string(dest.path().join("out").join("app.txt")).unwrap();
    assert_eq!(content.trim(), "built");

    let logs = harness.logs.drain_logs();
    assert_eq!(markers(&logs, "b1")[0], "BUILD:STAGE-START");
    assert_eq!(
        harness.state("b1", TaskKind::Build).await,
        Some(TaskState::Completed)
    );
}

#[tokio::test]
async fn test_autostart_after_reboot() {
    let harness = Harness::new().await;
    let mut task = deploy_task("t1", &[], &["echo started"]);
    if let Some(deploy) = task.deploy.as_mut() {
        deploy.run.auto_restart = true;
    }

    harness.engine.accept(task, "ID-a1").await;
    harness.engine.wait("t1", TaskKind::Deploy).await;

    let mut harness = harness.reboot().await;
    harness.engine.autostart().await;
    harness.engine.wait("t1", TaskKind::Deploy).await;

    let logs = harness.logs.drain_logs();
    assert!(outputs(&logs, "t1").contains(&"started".to_string()));
    assert_eq!(
        harness.state("t1", TaskKind::Deploy).await,
        Some(TaskState::Completed)
    );
}

#[tokio::test]
async fn test_terminal_command() {
    let mut harness = Harness::new().await;

    harness.engine.command("echo hello terminal".to_string());
    let mut seen = false;
    for _ in 0..100 {
        let logs = harness.logs.drain_logs();
        if outputs(&logs, "$terminal").contains(&"hello terminal".to_string()) {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen);
}

#[tokio::test]
async fn test_busy_terminal_refuses_and_stops() {
    let mut harness = Harness::new().await;

    harness.engine.command("sleep 30".to_string());
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.engine.command("echo second".to_string());
    harness.engine.command("$stop".to_string());
    tokio::time::sleep(Duration::from_millis(500)).await;

    let logs = harness.logs.drain_logs();
    let outputs = outputs(&logs, "$terminal");
    assert!(outputs.iter().any(|o| o.starts_with("terminal busy")));
    assert!(!outputs.contains(&"second".to_string()));
    assert!(outputs.contains(&"terminal stopped".to_string()));
}

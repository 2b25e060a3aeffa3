//! Manager and agent exchanging an order over the in-memory bus

use std::time::Duration;

use axum::http::{Method, StatusCode};
use dt_agent::app::options::{AppOptions as AgentOptions, StorageOptions};
use dt_agent::storage::layout::StorageLayout;
use dt_agent::storage::state::Identity;
use dt_agent::workers::reporter;
use dt_common::model::Stage;
use dt_common::transport::memory::MemoryBus;
use dt_common::transport::{Pipe, Role};
use dt_manager::storage::model::{LogFilter, LogSort, Page};
use dt_manager::workers::ingest;
use serde_json::json;
use tokio::sync::oneshot;

use crate::common::{eventually, Api};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deploy_order_runs_on_tagged_agent() {
    let bus = MemoryBus::new();
    let tmp = tempfile::tempdir().unwrap();

    // manager side
    let Pipe { events, sender } = bus.connect(Role::Manager, 64);
    let api = Api::new(sender);
    let (ingest_stop, ingest_stopped) = oneshot::channel::<()>();
    let ingest_handle = tokio::spawn(ingest::run(
        api.state.storage.clone(),
        api.state.dispatcher.clone(),
        events,
        api.state.connected.clone(),
        Box::pin(async move {
            let _ = ingest_stopped.await;
        }),
    ));

    // agent side
    let agent_options = AgentOptions {
        storage: StorageOptions {
            layout: StorageLayout::new(tmp.path()),
        },
        identity: Identity {
            id: Some("edge-1".to_string()),
            tags: vec!["edge".to_string()],
            location: None,
        },
        reporter: reporter::Options {
            flush_interval: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    };
    let (agent_stop, agent_stopped) = oneshot::channel::<()>();
    let agent_pipe = bus.connect(Role::Agent, 64);
    let agent_handle = tokio::spawn(dt_agent::app::run::run_with_pipe(
        agent_options,
        agent_pipe,
        None,
        async move {
            let _ = agent_stopped.await;
        },
    ));

    eventually("agent subscriptions", || {
        let bus = bus.clone();
        async move {
            bus.subscriptions()
                .first()
                .is_some_and(|topics| topics.contains("TAG-edge"))
        }
    })
    .await;
    eventually("target registration", || {
        let storage = api.state.storage.clone();
        async move { matches!(storage.get_target("edge-1").await, Ok(Some(_))) }
    })
    .await;

    let (status, body) = api
        .call(
            Method::POST,
            "/orders",
            Some(json!({
                "id": "rollout-1",
                "debug": true,
                "deploy": {
                    "install": { "commands": ["echo installing"] },
                    "run": { "commands": ["echo running"] },
                    "target": { "tags": ["edge"] }
                }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["deploy"]["match"]["list"], json!(["edge-1"]));

    let storage = api.state.storage.clone();
    let task_logs = LogFilter {
        task: Some("rollout-1".to_string()),
        ..Default::default()
    };
    eventually("run stage end", || {
        let storage = storage.clone();
        let filter = task_logs.clone();
        async move {
            let logs = storage
                .get_logs(&filter, LogSort::default(), Page::default())
                .await
                .unwrap();
            logs.items
                .iter()
                .any(|l| l.log.stage == Some(Stage::Run) && l.log.output == "STAGE-END")
        }
    })
    .await;

    let logs = storage
        .get_logs(&task_logs, LogSort::default(), Page::default())
        .await
        .unwrap();
    let markers: Vec<String> = logs
        .items
        .iter()
        .filter(|l| l.log.is_marker())
        .map(|l| {
            let stage = l.log.stage.map(|s| s.to_string()).unwrap_or_default();
            format!("{}:{}", stage, l.log.output)
        })
        .collect();
    assert_eq!(
        markers,
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
    assert!(logs.items.iter().all(|l| l.target == "edge-1"));
    assert!(logs.items.iter().any(|l| l.log.output == "running"));

    let (status, body) = api.get("/orders/rollout-1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivered"], 1);
    assert_eq!(body["pending"], 0);

    agent_stop.send(()).unwrap();
    agent_handle.await.unwrap().unwrap();
    ingest_stop.send(()).unwrap();
    ingest_handle.await.unwrap();
    api.state.shutdown().await;
}

//! HTTP API tests

use std::time::Duration;

use axum::http::{Method, StatusCode};
use dt_common::model::Request;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use crate::common::Api;

fn deploy_order(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "description": "edge rollout",
        "deploy": {
            "install": { "commands": ["./install.sh"] },
            "run": { "commands": ["./app"] },
            "target": { "ids": ["a3"], "tags": ["edge"] }
        }
    })
}

#[tokio::test]
async fn test_health() {
    let (api, _ends) = Api::detached();
    let (status, body) = api.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connected"], false);
}

#[tokio::test]
async fn test_create_and_get_orders() {
    let (api, _ends) = Api::detached();
    api.register("a1", &["edge"]).await;
    api.register("a2", &["edge", "arm"]).await;
    api.register("a3", &[]).await;

    let (status, body) = api
        .call(Method::POST, "/orders", Some(deploy_order("o1")))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "o1");
    assert!(body["createdAt"].as_i64().unwrap() > 0);
    assert_eq!(body["deploy"]["match"]["list"], json!(["a1", "a2", "a3"]));
    assert_eq!(body["deploy"]["match"]["tags"], json!(["edge"]));
    assert_eq!(body["deploy"]["match"]["ids"], json!(["a3"]));

    let (status, _) = api
        .call(Method::POST, "/orders", Some(deploy_order("o1")))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = api.get("/orders/o1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "edge rollout");

    let (status, body) = api.get("/orders/o1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 3);

    let (status, _) = api.get("/orders/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = api.get("/orders?description=rollout&perPage=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["perPage"], 5);

    api.state.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_generated_order_id() {
    let (api, _ends) = Api::detached();
    api.register("a1", &["edge"]).await;

    let mut order = deploy_order("");
    order.as_object_mut().unwrap().remove("id");
    let (status, body) = api.call(Method::POST, "/orders", Some(order)).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap();
    assert!(!id.is_empty());

    let (status, _) = api.get(&format!("/orders/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    api.state.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_invalid_orders() {
    let (api, _ends) = Api::detached();

    let (status, body) = api
        .call(Method::POST, "/orders", Some(json!({ "id": "o1" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("neither build nor deploy"));

    let build_with_reuse = json!({
        "id": "o2",
        "source": { "order": "o0" },
        "build": { "commands": ["make"], "artifacts": ["out"], "host": "b1" }
    });
    let (status, _) = api
        .call(Method::POST, "/orders", Some(build_with_reuse))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing_package = json!({
        "id": "o3",
        "source": { "order": "o0" },
        "deploy": { "run": { "commands": ["./app"] }, "target": { "tags": ["edge"] } }
    });
    let (status, _) = api
        .call(Method::POST, "/orders", Some(missing_package))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = api.get("/orders?page=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_targets() {
    let (api, _ends) = Api::detached();
    api.register("a1", &["edge"]).await;
    api.register("a2", &["edge", "arm"]).await;

    let (status, body) = api.get("/targets?tags=edge,arm").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], "a2");

    let (_, body) = api.get("/targets").await;
    assert_eq!(body["total"], 2);

    let (status, body) = api.get("/targets/a1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tags"], json!(["edge"]));

    let (status, _) = api.get("/targets/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_target_requests_reach_the_target_topic() {
    let (api, mut ends) = Api::detached();
    api.register("a1", &["edge"]).await;

    let (status, _) = api.call(Method::PUT, "/targets/a1/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    let message = assert_ok!(
        tokio::time::timeout(Duration::from_secs(1), ends.messages.recv()).await
    )
    .unwrap();
    assert_eq!(message.topic, "ID-a1");
    assert!(matches!(
        message.parse_json::<Request>().unwrap(),
        Request::LogRequest(_)
    ));

    let (status, _) = api
        .call(
            Method::PUT,
            "/targets/a1/command",
            Some(json!({ "command": " " })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = api
        .call(
            Method::PUT,
            "/targets/a1/command",
            Some(json!({ "command": "uptime" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let message = ends.messages.recv().await.unwrap();
    assert_eq!(
        message.parse_json::<Request>().unwrap(),
        Request::Command("uptime".to_string())
    );

    let (status, _) = api.call(Method::DELETE, "/targets/a1/command", None).await;
    assert_eq!(status, StatusCode::OK);
    let message = ends.messages.recv().await.unwrap();
    assert_eq!(
        message.parse_json::<Request>().unwrap(),
        Request::Command("$stop".to_string())
    );

    let (status, _) = api.call(Method::PUT, "/targets/a1/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    let message = ends.messages.recv().await.unwrap();
    assert_eq!(message.topic, "ID-a1");
    assert_eq!(message.parse_json::<Request>().unwrap(), Request::StopAll);

    let (status, _) = api.call(Method::PUT, "/targets/ghost/stop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_err!(ends.messages.try_recv());
}

#[tokio::test]
async fn test_log_queries() {
    use dt_common::model::{Log, Stage};
    use dt_manager::storage::model::StoredLog;

    let (api, _ends) = Api::detached();
    let logs = vec![
        StoredLog {
            log: Log::agent("t1", Some(Stage::Install), "STAGE-START", false, false),
            target: "a1".to_string(),
        },
        StoredLog {
            log: Log::new("t1", Some(Stage::Install), "./install.sh", "disk full", true, false),
            target: "a1".to_string(),
        },
        StoredLog {
            log: Log::agent("t2", None, "received deploy task", false, false),
            target: "a2".to_string(),
        },
    ];
    assert_ok!(api.state.storage.add_logs(logs).await);

    let (status, body) = api.get("/logs?task=t1&error=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["output"], "disk full");
    assert_eq!(body["items"][0]["target"], "a1");

    let (_, body) = api.get("/logs?stage=install&sortOrder=desc").await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["items"][0]["stage"], "INSTALL");

    let (status, _) = api.get("/logs?sortBy=color").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

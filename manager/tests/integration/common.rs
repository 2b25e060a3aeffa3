//! Shared fixtures

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use dt_common::model::TargetBase;
use dt_common::transport::{pipe, PipeEnds, PipeSender};
use dt_manager::app::options::AppOptions;
use dt_manager::app::state::AppState;
use dt_manager::dispatch::dispatcher;
use dt_manager::server::serve::router;
use serde_json::Value;
use tower::ServiceExt;

pub fn app_options() -> AppOptions {
    AppOptions {
        dispatcher: dispatcher::Options {
            announce_delay: Duration::from_millis(100),
            resend_interval: Duration::from_millis(500),
            max_attempts: 10,
        },
        ..Default::default()
    }
}

pub struct Api {
    pub state: Arc<AppState>,
    pub router: Router,
}

impl Api {
    pub fn new(sender: PipeSender) -> Self {
        let state = Arc::new(AppState::init(&app_options(), sender));
        let router = router(Arc::new(state.server_state()));
        Self { state, router }
    }

    /// An API whose outbound messages land in the returned ends
    pub fn detached() -> (Self, PipeEnds) {
        let (pipe, ends) = pipe(64);
        (Self::new(pipe.sender), ends)
    }

    pub async fn register(&self, id: &str, tags: &[&str]) {
        self.state
            .storage
            .index_target(TargetBase {
                id: id.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                location: None,
            })
            .await
            .unwrap();
    }

    pub async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Method::GET, uri, None).await
    }
}

/// Poll `check` until it holds, for up to ten seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

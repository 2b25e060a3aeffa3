//! HTTP request handlers

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use dt_common::utils::version_info;
use serde::{Deserialize, Serialize};

use crate::errors::ManagerError;
use crate::server::state::ServerState;
use crate::storage::model::{LogFilter, LogSort, LogSortField, Order, Page, Target};

/// Terminal command that stops the running terminal command
const TERMINAL_STOP: &str = "$stop";

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub connected: bool,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployment-manager".to_string(),
        version: version.version,
        connected: state.connected.load(Ordering::SeqCst),
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Plain acknowledgement of a request forwarded to targets
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

fn message(text: String) -> Json<MessageResponse> {
    Json(MessageResponse { message: text })
}

fn parse_page(page: Option<usize>, per_page: Option<usize>) -> Result<Page, ManagerError> {
    let page = page.unwrap_or(1);
    let per_page = per_page.unwrap_or(Page::DEFAULT_PER_PAGE);
    if page < 1 {
        return Err(ManagerError::ValidationError(
            "page query parameter must be positive".to_string(),
        ));
    }
    if !(1..=Page::MAX_PER_PAGE).contains(&per_page) {
        return Err(ManagerError::ValidationError(format!(
            "perPage query parameter must be between 1 and {}",
            Page::MAX_PER_PAGE
        )));
    }
    Ok(Page::new(page, per_page))
}

/// Ascending unless `desc` is given
fn parse_ascending(order: Option<&str>) -> Result<bool, ManagerError> {
    match order {
        None | Some("asc") => Ok(true),
        Some("desc") => Ok(false),
        Some(other) => Err(ManagerError::ValidationError(format!(
            "sortOrder query parameter has invalid value {:?}",
            other
        ))),
    }
}

async fn find_target(state: &ServerState, id: &str) -> Result<Target, ManagerError> {
    state
        .storage
        .get_target(id)
        .await?
        .ok_or_else(|| ManagerError::NotFound(format!("target {}", id)))
}

// ================================= ORDERS ======================================= //

/// Create order handler
pub async fn create_order_handler(
    State(state): State<Arc<ServerState>>,
    Json(order): Json<Order>,
) -> Result<impl IntoResponse, ManagerError> {
    let order = state.dispatcher.submit(order).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

#[derive(Debug, Default, Deserialize)]
pub struct OrdersQuery {
    pub description: Option<String>,
    #[serde(rename = "sortOrder")]
    pub sort_order: Option<String>,
    pub page: Option<usize>,
    #[serde(rename = "perPage")]
    pub per_page: Option<usize>,
}

/// List orders handler
pub async fn get_orders_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<OrdersQuery>,
) -> Result<impl IntoResponse, ManagerError> {
    let page = parse_page(query.page, query.per_page)?;
    let ascending = parse_ascending(query.sort_order.as_deref())?;
    let orders = state
        .storage
        .get_orders(query.description.as_deref(), ascending, page)
        .await?;
    Ok(Json(orders))
}

/// Get order handler
pub async fn get_order_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    let order = state
        .storage
        .get_order(&id)
        .await?
        .ok_or_else(|| ManagerError::NotFound(format!("order {}", id)))?;
    Ok(Json(order))
}

/// Order delivery status handler
pub async fn order_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    let status = state
        .dispatcher
        .order_status(&id)
        .await?
        .ok_or_else(|| ManagerError::NotFound(format!("order {}", id)))?;
    Ok(Json(status))
}

// ================================= TARGETS ====================================== //

#[derive(Debug, Default, Deserialize)]
pub struct TargetsQuery {
    /// Comma separated, every tag must be carried
    pub tags: Option<String>,
    pub page: Option<usize>,
    #[serde(rename = "perPage")]
    pub per_page: Option<usize>,
}

/// List targets handler
pub async fn get_targets_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<TargetsQuery>,
) -> Result<impl IntoResponse, ManagerError> {
    let page = parse_page(query.page, query.per_page)?;
    let tags: Vec<String> = query
        .tags
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect();
    let targets = state.storage.get_targets(&tags, page).await?;
    Ok(Json(targets))
}

/// Get target handler
pub async fn get_target_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    Ok(Json(find_target(&state, &id).await?))
}

/// Ask a target to send its buffered logs
pub async fn request_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    let target = find_target(&state, &id).await?;
    state.dispatcher.request_logs(&target).await?;
    Ok(message(format!("requested logs of {}", id)))
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: String,
}

/// Run a command in the terminal of a target
pub async fn target_command_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<impl IntoResponse, ManagerError> {
    let command = request.command.trim();
    if command.is_empty() {
        return Err(ManagerError::ValidationError("command not given".to_string()));
    }
    find_target(&state, &id).await?;
    state.dispatcher.command(&id, command).await?;
    Ok(message(format!("sent command to {}", id)))
}

/// Stop the terminal command of a target
pub async fn stop_command_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    find_target(&state, &id).await?;
    state.dispatcher.command(&id, TERMINAL_STOP).await?;
    Ok(message(format!("stopping command on {}", id)))
}

/// Stop every task of a target
pub async fn stop_target_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    find_target(&state, &id).await?;
    state.dispatcher.stop(Some(&id)).await?;
    Ok(message(format!("stopping tasks of {}", id)))
}

/// Stop every task of every target
pub async fn stop_all_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ManagerError> {
    state.dispatcher.stop(None).await?;
    Ok(message("stopping tasks of every target".to_string()))
}

// ================================== LOGS ======================================== //

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub target: Option<String>,
    pub task: Option<String>,
    pub stage: Option<String>,
    pub command: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortOrder")]
    pub sort_order: Option<String>,
    pub page: Option<usize>,
    #[serde(rename = "perPage")]
    pub per_page: Option<usize>,
}

impl LogsQuery {
    fn filter(&self) -> Result<LogFilter, ManagerError> {
        let error = match self.error.as_deref() {
            None | Some("") => None,
            Some("true") => Some(true),
            Some("false") => Some(false),
            Some(other) => {
                return Err(ManagerError::ValidationError(format!(
                    "error query parameter must be true or false, not {:?}",
                    other
                )))
            }
        };
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
        Ok(LogFilter {
            target: non_empty(&self.target),
            task: non_empty(&self.task),
            stage: non_empty(&self.stage),
            command: non_empty(&self.command),
            output: non_empty(&self.output),
            error,
        })
    }
}

/// Query stored logs handler
pub async fn get_logs_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ManagerError> {
    let filter = query.filter()?;
    let sort = LogSort {
        field: match query.sort_by.as_deref() {
            None | Some("") => LogSortField::default(),
            Some(field) => field.parse()?,
        },
        ascending: parse_ascending(query.sort_order.as_deref())?,
    };
    let page = parse_page(query.page, query.per_page)?;
    let logs = state.storage.get_logs(&filter, sort, page).await?;
    Ok(Json(logs))
}

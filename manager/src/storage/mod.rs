//! Persistent storage contract of the manager

pub mod layout;
pub mod memory;
pub mod model;
pub mod settings;

use async_trait::async_trait;
use dt_common::model::{MatchResult, Package, Selector, TargetBase};

use crate::errors::StorageError;
use crate::storage::model::{
    LogFilter, LogSort, Order, Page, Paged, SearchPage, StoredLog, Target,
};

/// Document store holding targets, orders, logs and build packages.
///
/// Every table is independent. Implementations must be safe to share
/// between the ingest worker, the dispatcher and the HTTP handlers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new target, failing with a conflict when the id is taken
    async fn add_target(&self, target: TargetBase) -> Result<Target, StorageError>;

    /// Insert or update a target from its advertisement
    async fn index_target(&self, target: TargetBase) -> Result<Target, StorageError>;

    async fn get_target(&self, id: &str) -> Result<Option<Target>, StorageError>;

    /// Targets carrying every given tag, ordered by id
    async fn get_targets(&self, tags: &[String], page: Page)
        -> Result<Paged<Target>, StorageError>;

    /// Scored search of the targets matching any id or tag of the selector,
    /// ordered by id. A tag at index `i` of `n` weighs `n - i`.
    async fn search_targets(
        &self,
        selector: &Selector,
        page: Page,
    ) -> Result<SearchPage, StorageError>;

    /// Remember the newest record time received on a log request
    async fn update_log_request(&self, id: &str, time: i64) -> Result<bool, StorageError>;

    async fn add_log(&self, log: StoredLog) -> Result<(), StorageError>;

    async fn add_logs(&self, logs: Vec<StoredLog>) -> Result<(), StorageError>;

    async fn get_logs(
        &self,
        filter: &LogFilter,
        sort: LogSort,
        page: Page,
    ) -> Result<Paged<StoredLog>, StorageError>;

    /// Whether the target logged anything from the agent itself for the task
    async fn delivered_task(&self, target: &str, task: &str) -> Result<bool, StorageError>;

    async fn add_order(&self, order: Order) -> Result<(), StorageError>;

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StorageError>;

    /// Orders whose description contains `description`, ordered by creation time
    async fn get_orders(
        &self,
        description: Option<&str>,
        ascending: bool,
        page: Page,
    ) -> Result<Paged<Order>, StorageError>;

    async fn update_order_match(&self, id: &str, matched: MatchResult)
        -> Result<(), StorageError>;

    /// Store a build package under its task id, replacing an older one
    async fn add_package(&self, package: Package) -> Result<(), StorageError>;

    async fn get_package(&self, task: &str) -> Result<Option<Package>, StorageError>;
}

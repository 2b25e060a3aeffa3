//! In-memory implementation of the storage contract

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use dt_common::model::log::AGENT;
use dt_common::model::{MatchResult, Package, Selector, TargetBase};
use dt_common::utils::now_millis;
use tracing::debug;

use crate::errors::StorageError;
use crate::storage::model::{
    LogFilter, LogSort, LogSortField, Order, Page, Paged, SearchHit, SearchPage, StoredLog,
    Target,
};
use crate::storage::Storage;

/// One lock per table
#[derive(Default)]
pub struct InMemoryStorage {
    targets: RwLock<BTreeMap<String, Target>>,
    logs: RwLock<Vec<StoredLog>>,
    orders: RwLock<HashMap<String, Order>>,
    packages: RwLock<HashMap<String, Package>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_target(base: TargetBase) -> Target {
    let now = now_millis();
    Target {
        base,
        created_at: now,
        updated_at: now,
        log_request_at: 0,
    }
}

/// Score a target against a selector. Earlier tags weigh more.
fn search_hit(target: &Target, selector: &Selector) -> Option<SearchHit> {
    let n = selector.tags.len();
    let matched_tag = selector
        .tags
        .iter()
        .enumerate()
        .filter(|(_, tag)| target.base.tags.contains(tag))
        .max_by_key(|(i, _)| n - i)
        .map(|(_, tag)| tag.clone());
    let matched_id = selector.ids.iter().any(|id| *id == target.base.id);

    (matched_tag.is_some() || matched_id).then(|| SearchHit {
        id: target.base.id.clone(),
        matched_tag,
    })
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn add_target(&self, target: TargetBase) -> Result<Target, StorageError> {
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        if targets.contains_key(&target.id) {
            return Err(StorageError::Conflict(format!("target {}", target.id)));
        }
        let target = new_target(target);
        targets.insert(target.base.id.clone(), target.clone());
        Ok(target)
    }

    async fn index_target(&self, target: TargetBase) -> Result<Target, StorageError> {
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        let stored = match targets.remove(&target.id) {
            Some(mut stored) => {
                if stored.base != target {
                    stored.base = target;
                    stored.updated_at = now_millis();
                }
                stored
            }
            None => new_target(target),
        };
        targets.insert(stored.base.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_target(&self, id: &str) -> Result<Option<Target>, StorageError> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        Ok(targets.get(id).cloned())
    }

    async fn get_targets(
        &self,
        tags: &[String],
        page: Page,
    ) -> Result<Paged<Target>, StorageError> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        let all: Vec<Target> = targets
            .values()
            .filter(|target| tags.iter().all(|tag| target.base.tags.contains(tag)))
            .cloned()
            .collect();
        Ok(Paged::new(all, page))
    }

    async fn search_targets(
        &self,
        selector: &Selector,
        page: Page,
    ) -> Result<SearchPage, StorageError> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        let hits: Vec<SearchHit> = targets
            .values()
            .filter_map(|target| search_hit(target, selector))
            .collect();
        Ok(SearchPage {
            total: hits.len(),
            hits: page.slice(hits),
        })
    }

    async fn update_log_request(&self, id: &str, time: i64) -> Result<bool, StorageError> {
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        match targets.get_mut(id) {
            Some(target) => {
                target.log_request_at = target.log_request_at.max(time);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_log(&self, log: StoredLog) -> Result<(), StorageError> {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.push(log);
        Ok(())
    }

    async fn add_logs(&self, batch: Vec<StoredLog>) -> Result<(), StorageError> {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        debug!("Indexed {} log(s)", batch.len());
        logs.extend(batch);
        Ok(())
    }

    async fn get_logs(
        &self,
        filter: &LogFilter,
        sort: LogSort,
        page: Page,
    ) -> Result<Paged<StoredLog>, StorageError> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<StoredLog> = logs.iter().filter(|l| filter.matches(l)).cloned().collect();
        drop(logs);

        // stable, so records of equal keys keep their arrival order
        all.sort_by(|a, b| {
            let ordering = match sort.field {
                LogSortField::Time => a.log.time.cmp(&b.log.time),
                LogSortField::Target => a.target.cmp(&b.target).then(a.log.time.cmp(&b.log.time)),
                LogSortField::Task => a.log.task.cmp(&b.log.task).then(a.log.time.cmp(&b.log.time)),
            };
            if sort.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
        Ok(Paged::new(all, page))
    }

    async fn delivered_task(&self, target: &str, task: &str) -> Result<bool, StorageError> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        Ok(logs
            .iter()
            .any(|l| l.target == target && l.log.task == task && l.log.command == AGENT))
    }

    async fn add_order(&self, order: Order) -> Result<(), StorageError> {
        let mut orders = self.orders.write().unwrap_or_else(|e| e.into_inner());
        if orders.contains_key(order.id()) {
            return Err(StorageError::Conflict(format!("order {}", order.id())));
        }
        orders.insert(order.id().to_string(), order);
        Ok(())
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StorageError> {
        let orders = self.orders.read().unwrap_or_else(|e| e.into_inner());
        Ok(orders.get(id).cloned())
    }

    async fn get_orders(
        &self,
        description: Option<&str>,
        ascending: bool,
        page: Page,
    ) -> Result<Paged<Order>, StorageError> {
        let orders = self.orders.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Order> = orders
            .values()
            .filter(|o| description.is_none_or(|d| o.description.contains(d)))
            .cloned()
            .collect();
        drop(orders);

        all.sort_by(|a, b| {
            let ordering = a
                .header
                .created_at
                .cmp(&b.header.created_at)
                .then_with(|| a.header.id.cmp(&b.header.id));
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
        Ok(Paged::new(all, page))
    }

    async fn update_order_match(
        &self,
        id: &str,
        matched: MatchResult,
    ) -> Result<(), StorageError> {
        let mut orders = self.orders.write().unwrap_or_else(|e| e.into_inner());
        let order = orders
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("order {}", id)))?;
        if let Some(deploy) = order.deploy.as_mut() {
            deploy.matched = matched;
        }
        Ok(())
    }

    async fn add_package(&self, package: Package) -> Result<(), StorageError> {
        let mut packages = self.packages.write().unwrap_or_else(|e| e.into_inner());
        packages.insert(package.task.clone(), package);
        Ok(())
    }

    async fn get_package(&self, task: &str) -> Result<Option<Package>, StorageError> {
        let packages = self.packages.read().unwrap_or_else(|e| e.into_inner());
        Ok(packages.get(task).cloned())
    }
}

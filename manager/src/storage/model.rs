//! Documents kept by the manager

use dt_common::archive::is_relative_inside;
use dt_common::model::{Build, Deploy, Header, Log, TargetBase};
use dt_common::topics::Topics;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::ManagerError;

/// Registry mirror of a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(flatten)]
    pub base: TargetBase,

    /// Unix milliseconds
    #[serde(rename = "createdAt", default)]
    pub created_at: i64,

    #[serde(rename = "updatedAt", default)]
    pub updated_at: i64,

    /// Time of the newest record received on request, sent with the next log request
    #[serde(rename = "logRequestAt", default)]
    pub log_request_at: i64,
}

impl Target {
    pub fn id(&self) -> &str {
        &self.base.id
    }
}

/// A log record and the target that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLog {
    #[serde(flatten)]
    pub log: Log,

    #[serde(default)]
    pub target: String,
}

/// Where the artifacts of an order come from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Files or directories on the manager, each packed under its file name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// base64 encoded tar.gz archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,

    /// Prior order whose build package is reused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

impl Source {
    fn kinds(&self) -> usize {
        usize::from(!self.paths.is_empty())
            + usize::from(self.archive.is_some())
            + usize::from(self.order.is_some())
    }
}

/// An operator submitted build and/or deploy request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(flatten)]
    pub header: Header,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Deploy>,
}

impl Order {
    pub fn id(&self) -> &str {
        &self.header.id
    }

    /// Drop build and deploy parts that carry nothing
    pub fn normalize(&mut self) {
        if self
            .build
            .as_ref()
            .is_some_and(|b| b.commands.is_empty() && b.artifacts.is_empty() && b.host.is_empty())
        {
            self.build = None;
        }
        if self.deploy.as_ref().is_some_and(|d| {
            d.install.commands.is_empty() && d.run.commands.is_empty() && d.target.is_empty()
        }) {
            self.deploy = None;
        }
        if self.source.as_ref().is_some_and(|s| s.kinds() == 0) {
            self.source = None;
        }
    }

    pub fn validate(&self) -> Result<(), ManagerError> {
        let invalid = |msg: String| Err(ManagerError::ValidationError(msg));

        let id = self.id();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', ':', '+', '#']) {
            return invalid(format!("order id {:?} cannot name a task", id));
        }
        if Topics::is_reserved(id) {
            return invalid(format!("order id {:?} collides with a routing topic", id));
        }
        if self.build.is_none() && self.deploy.is_none() {
            return invalid("neither build nor deploy are defined".to_string());
        }
        if let Some(source) = &self.source {
            if source.kinds() > 1 {
                return invalid("source takes exactly one of paths, archive or order".to_string());
            }
        }

        if let Some(build) = &self.build {
            if self.source.as_ref().is_some_and(|s| s.order.is_some()) {
                return invalid(
                    "source.order reuses the build of a previous order, build should be omitted"
                        .to_string(),
                );
            }
            if build.commands.is_empty() {
                return invalid("build.commands empty".to_string());
            }
            if build.artifacts.is_empty() {
                return invalid("build.artifacts empty".to_string());
            }
            if build.host.trim().is_empty() {
                return invalid("build.host not given".to_string());
            }
            if let Some(path) = build
                .artifacts
                .iter()
                .find(|path| !is_relative_inside(Path::new(path)))
            {
                return invalid(format!(
                    "build.artifacts must be relative to the source directory: {}",
                    path
                ));
            }
        }

        if let Some(deploy) = &self.deploy {
            if deploy.target.is_empty() {
                return invalid("both deploy.target.ids and deploy.target.tags are empty".to_string());
            }
            if deploy.install.commands.is_empty() && deploy.run.commands.is_empty() {
                return invalid(
                    "both deploy.install.commands and deploy.run.commands are empty".to_string(),
                );
            }
        }

        Ok(())
    }
}

/// 1-based page of a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: usize,
    pub per_page: usize,
}

impl Page {
    pub const DEFAULT_PER_PAGE: usize = 100;
    pub const MAX_PER_PAGE: usize = 1000;

    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page, per_page }
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.per_page)
    }

    /// The items of this page out of a complete, ordered listing
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset())
            .take(self.per_page)
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_PER_PAGE)
    }
}

/// One page of a listing and the size of the whole listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paged<T> {
    pub total: usize,
    pub items: Vec<T>,
    pub page: usize,
    #[serde(rename = "perPage")]
    pub per_page: usize,
}

impl<T> Paged<T> {
    pub fn new(all: Vec<T>, page: Page) -> Self {
        Self {
            total: all.len(),
            items: page.slice(all),
            page: page.page,
            per_page: page.per_page,
        }
    }
}

/// A target hit by a target search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub id: String,

    /// Highest priority selector tag carried by the target, if any
    pub matched_tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// Hits of the whole search
    pub total: usize,
    pub hits: Vec<SearchHit>,
}

/// Log query. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub task: Option<String>,

    #[serde(default)]
    pub stage: Option<String>,

    #[serde(default)]
    pub command: Option<String>,

    /// Every word must appear in the output
    #[serde(default)]
    pub output: Option<String>,

    #[serde(default)]
    pub error: Option<bool>,
}

impl LogFilter {
    pub fn matches(&self, stored: &StoredLog) -> bool {
        let log = &stored.log;
        let stage = log.stage.map(|stage| stage.to_string());
        self.target.as_ref().is_none_or(|t| *t == stored.target)
            && self.task.as_ref().is_none_or(|t| *t == log.task)
            && self
                .stage
                .as_ref()
                .is_none_or(|s| stage.as_ref().is_some_and(|stage| stage.eq_ignore_ascii_case(s)))
            && self.command.as_ref().is_none_or(|c| *c == log.command)
            && self
                .output
                .as_ref()
                .is_none_or(|o| o.split_whitespace().all(|word| log.output.contains(word)))
            && self.error.is_none_or(|e| e == log.error)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogSortField {
    #[default]
    Time,
    Target,
    Task,
}

impl std::str::FromStr for LogSortField {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" => Ok(Self::Time),
            "target" => Ok(Self::Target),
            "task" => Ok(Self::Task),
            other => Err(ManagerError::ValidationError(format!(
                "logs cannot be sorted by {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSort {
    pub field: LogSortField,
    pub ascending: bool,
}

impl Default for LogSort {
    fn default() -> Self {
        Self {
            field: LogSortField::Time,
            ascending: true,
        }
    }
}

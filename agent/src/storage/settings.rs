//! Settings file management

use dt_common::logs::LogLevel;
use dt_common::model::Location;
use dt_common::transport::auth::AuthOptions;
use serde::{Deserialize, Serialize};

use crate::storage::layout::StorageLayout;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit process diagnostics as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Also write process diagnostics to daily files under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub auth: AuthOptions,

    /// Externally assigned target id. A generated id is used when absent.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub location: Option<Location>,

    /// Records kept in memory for log requests
    #[serde(default = "default_memory_log_capacity")]
    pub memory_log_capacity: usize,

    /// Records waiting for the next batch
    #[serde(default = "default_outgoing_log_capacity")]
    pub outgoing_log_capacity: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_advertise_interval")]
    pub advertise_interval_secs: u64,

    /// Delay between the terminate and kill signals when stopping commands
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
}

fn default_memory_log_capacity() -> usize {
    100
}

fn default_outgoing_log_capacity() -> usize {
    255
}

fn default_flush_interval() -> u64 {
    5
}

fn default_advertise_interval() -> u64 {
    60
}

fn default_kill_grace() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            broker: BrokerSettings::default(),
            auth: AuthOptions::default(),
            id: None,
            tags: Vec::new(),
            location: None,
            memory_log_capacity: default_memory_log_capacity(),
            outgoing_log_capacity: default_outgoing_log_capacity(),
            flush_interval_secs: default_flush_interval(),
            advertise_interval_secs: default_advertise_interval(),
            kill_grace_secs: default_kill_grace(),
        }
    }
}

impl Settings {
    /// Apply the process environment on top of the file settings
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("ID").filter(|id| !id.trim().is_empty()) {
            self.id = Some(id.trim().to_string());
        }
        if let Some(tags) = lookup("TAGS") {
            self.tags = parse_tags(&tags);
        }
        let lat = lookup("LOCATION_LAT").and_then(|v| v.trim().parse::<f64>().ok());
        let lon = lookup("LOCATION_LON").and_then(|v| v.trim().parse::<f64>().ok());
        if let (Some(lat), Some(lon)) = (lat, lon) {
            self.location = Some(Location { lat, lon });
        }
        if let Some(url) = lookup("BROKER_URL") {
            self.broker.url = url;
        }
        if lookup("DISABLE_AUTH").is_some_and(|v| is_truthy(&v)) {
            self.auth.disabled = true;
        }
        if lookup("DEBUG").is_some_and(|v| is_truthy(&v)) {
            self.log_level = LogLevel::Debug;
        }
    }

    /// Fill unset key paths with the provisioned files of the layout
    pub fn resolve_key_paths(&mut self, layout: &StorageLayout) {
        let keys = layout.keys_dir();
        if self.auth.private_key_path.as_os_str().is_empty() {
            self.auth.private_key_path = keys.path().join("agent.key");
        }
        if self.auth.certificate_path.as_os_str().is_empty() {
            self.auth.certificate_path = keys.path().join("agent.crt");
        }
        if self.auth.ca_certificate_path.is_none() {
            let ca = keys.path().join("ca.crt");
            if ca.is_file() {
                self.auth.ca_certificate_path = Some(ca);
            }
        }
    }
}

/// Comma separated tags, trimmed, empty entries dropped
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// `mqtts://host:port` or `mqtt://host:port`
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Topic namespace shared with the manager
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_broker_url() -> String {
    "mqtts://localhost:8883".to_string()
}

fn default_namespace() -> String {
    "deploy".to_string()
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            namespace: default_namespace(),
        }
    }
}

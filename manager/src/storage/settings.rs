//! Settings file management

use dt_common::logs::LogLevel;
use dt_common::transport::auth::AuthOptions;
use serde::{Deserialize, Serialize};

use crate::storage::layout::StorageLayout;

/// Manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub auth: AuthOptions,

    #[serde(default)]
    pub http: HttpSettings,

    /// Delay between an announcement and its task
    #[serde(default = "default_announce_delay")]
    pub announce_delay_ms: u64,

    /// Interval between deliveries to targets that have not logged the task yet
    #[serde(default = "default_resend_interval")]
    pub resend_interval_secs: u64,

    /// Deliveries attempted per task before pending targets are given up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_announce_delay() -> u64 {
    1000
}

fn default_resend_interval() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            broker: BrokerSettings::default(),
            auth: AuthOptions::default(),
            http: HttpSettings::default(),
            announce_delay_ms: default_announce_delay(),
            resend_interval_secs: default_resend_interval(),
            max_attempts: default_max_attempts(),
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
        if let Some(url) = lookup("BROKER_URL") {
            self.broker.url = url;
        }
        if let Some(port) = lookup("HTTP_PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
            self.http.port = port;
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
            self.auth.private_key_path = keys.path().join("manager.key");
        }
        if self.auth.certificate_path.as_os_str().is_empty() {
            self.auth.certificate_path = keys.path().join("manager.crt");
        }
        if self.auth.ca_certificate_path.is_none() {
            let ca = keys.path().join("ca.crt");
            if ca.is_file() {
                self.auth.ca_certificate_path = Some(ca);
            }
        }
    }
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
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Topic namespace shared with the fleet
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

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_http_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_file() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.http.port, 8080);
        assert_eq!(settings.resend_interval_secs, 10);
        assert_eq!(settings.broker.namespace, "deploy");
        assert!(!settings.auth.disabled);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BROKER_URL", "mqtt://broker:1883"),
            ("HTTP_PORT", "9000"),
            ("DISABLE_AUTH", "true"),
        ]);
        let mut settings = Settings::default();
        settings.apply_env_with(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(settings.broker.url, "mqtt://broker:1883");
        assert_eq!(settings.http.port, 9000);
        assert!(settings.auth.disabled);
    }

    #[test]
    fn test_key_paths_from_layout() {
        let mut settings = Settings::default();
        settings.resolve_key_paths(&StorageLayout::new("/srv/manager"));
        assert_eq!(
            settings.auth.certificate_path,
            std::path::PathBuf::from("/srv/manager/keys/manager.crt")
        );
    }
}

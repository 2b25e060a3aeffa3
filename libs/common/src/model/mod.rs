//! Wire model exchanged between the manager and its agents

pub mod log;
pub mod request;
pub mod target;
pub mod task;

pub use log::{Log, Package, Response, Stage};
pub use request::{LogRequest, Request};
pub use target::{Location, TargetBase};
pub use task::{
    Announcement, Build, Deploy, Header, Install, MatchResult, Run, Selector, Task, TaskKind,
};

/// Serde helper carrying raw bytes as a base64 string
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

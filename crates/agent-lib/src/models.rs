//! Core data models shared by the engine client, normalizer and sinks

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default time-to-live attached to every record, in seconds
pub const DEFAULT_RECORD_TTL: u32 = 60;

/// One entry of the engine's running-container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Creation time in epoch seconds
    pub created: i64,
}

/// Cached inspection metadata for a running container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    /// Container name as reported by the engine (usually with a leading `/`)
    pub name: String,
    /// Image reference the container was started from, e.g. `centos:7`
    pub image: String,
    /// Resolved image id
    pub image_id: String,
    pub cmd: Vec<String>,
    /// Whether an interactive terminal is allocated
    pub tty: bool,
    pub started_at: String,
}

impl ContainerInfo {
    /// Container name without the engine's leading `/`
    pub fn display_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }
}

/// Which feed a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Event,
    Log,
    Stat,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Event => "event",
            RecordKind::Log => "log",
            RecordKind::Stat => "stat",
        };
        f.write_str(name)
    }
}

/// Sink-agnostic telemetry unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Epoch seconds
    pub time: i64,
    pub kind: RecordKind,
    pub state: String,
    pub service: String,
    pub tags: Vec<String>,
    /// Seconds
    pub ttl: u32,
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<i64>,
}

impl NormalizedRecord {
    /// Attribute lookup used mostly by tests and sinks
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

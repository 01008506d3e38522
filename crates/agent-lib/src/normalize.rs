//! Record normalizer
//!
//! Maps one raw payload (an engine event, a demultiplexed log line, or a
//! stats snapshot) to normalized records. Nothing here performs I/O, and a
//! failure only ever concerns the single payload being converted.

use crate::codec::{LogLine, StreamKind};
use crate::models::{ContainerInfo, NormalizedRecord, RecordKind, DEFAULT_RECORD_TTL};
use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Service name for daemon-wide events
pub const EVENT_SERVICE: &str = "docker";

/// Memory-cgroup counters forwarded from `memory_stats.stats`
const MEMORY_COUNTERS: &[&str] = &["cache", "rss", "swap"];

const STATE_OK: &str = "ok";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event payload is not a JSON object")]
    NotAnObject,

    #[error("event has no integer `time` field")]
    MissingTime,

    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
}

/// Converts raw payloads into [`NormalizedRecord`]s
#[derive(Debug, Clone)]
pub struct Normalizer {
    ttl: u32,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_RECORD_TTL)
    }
}

impl Normalizer {
    pub fn new(ttl: u32) -> Self {
        Self { ttl }
    }

    fn record(
        &self,
        kind: RecordKind,
        time: i64,
        service: String,
        attributes: BTreeMap<String, String>,
        metric: Option<i64>,
    ) -> NormalizedRecord {
        NormalizedRecord {
            time,
            kind,
            state: STATE_OK.to_string(),
            service,
            tags: Vec::new(),
            ttl: self.ttl,
            attributes,
            metric,
        }
    }

    /// One record per daemon event; every field but `time` becomes an
    /// `event_`-prefixed attribute.
    pub fn event(&self, raw: &[u8]) -> Result<Vec<NormalizedRecord>, NormalizeError> {
        let value: Value = serde_json::from_slice(raw)?;
        let Value::Object(fields) = value else {
            return Err(NormalizeError::NotAnObject);
        };
        let time = fields
            .get("time")
            .and_then(Value::as_i64)
            .ok_or(NormalizeError::MissingTime)?;

        let mut attributes = BTreeMap::new();
        for (key, value) in &fields {
            if key == "time" {
                continue;
            }
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            attributes.insert(format!("event_{key}"), text);
        }
        let timestamp = DateTime::from_timestamp(time, 0)
            .ok_or_else(|| NormalizeError::Timestamp(time.to_string()))?;
        attributes.insert(
            "@timestamp".to_string(),
            timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );

        Ok(vec![self.record(
            RecordKind::Event,
            time,
            EVENT_SERVICE.to_string(),
            attributes,
            None,
        )])
    }

    /// One record per log line.
    pub fn log(
        &self,
        line: &LogLine,
        info: &ContainerInfo,
    ) -> Result<Vec<NormalizedRecord>, NormalizeError> {
        let (time, timestamp) = parse_engine_time(&line.timestamp)?;
        let stream = line.stream.as_str();

        let mut attributes = container_attributes(info);
        attributes.insert("log".to_string(), line.text.clone());
        attributes.insert("stream".to_string(), stream.to_string());
        attributes.insert("@timestamp".to_string(), timestamp);

        let mut record = self.record(
            RecordKind::Log,
            time,
            format!("container {} {}", info.display_name(), stream),
            attributes,
            None,
        );
        if line.stream == StreamKind::Stderr {
            if let Some(severity) = glog_severity(&line.text) {
                record.state = severity.to_string();
            }
        }

        Ok(vec![record])
    }

    /// Fans one stats snapshot out into one record per tracked metric path.
    pub fn stats(
        &self,
        raw: &[u8],
        info: &ContainerInfo,
    ) -> Result<Vec<NormalizedRecord>, NormalizeError> {
        let snapshot: StatsSnapshot = serde_json::from_slice(raw)?;
        let (time, timestamp) = parse_engine_time(&snapshot.read)?;

        let mut attributes = container_attributes(info);
        attributes.insert("@timestamp".to_string(), timestamp);

        let name = info.display_name();
        let mut metrics: Vec<(String, i64)> = Vec::new();

        for (section, entries) in snapshot.blkio_stats.iter().flatten() {
            for entry in entries.iter().flatten() {
                metrics.push((
                    format!("blkio {} {}", section, entry.op.to_lowercase()),
                    clamp(entry.value),
                ));
            }
        }

        if let Some(usage) = snapshot.cpu_stats.as_ref().and_then(|c| c.cpu_usage.as_ref()) {
            metrics.push(("cpu total usage".to_string(), clamp(usage.total_usage)));
        }

        if let Some(memory) = &snapshot.memory_stats {
            if let Some(limit) = memory.limit {
                metrics.push(("memory limit".to_string(), clamp(limit)));
            }
            if let Some(usage) = memory.usage {
                metrics.push(("memory usage".to_string(), clamp(usage)));
            }
            if let (Some(usage), Some(limit)) = (memory.usage, memory.limit) {
                if limit > 0 {
                    let percent = (usage as f64 / limit as f64 * 100.0).round() as i64;
                    metrics.push(("memory usage percent".to_string(), percent));
                }
            }
            for stats in memory.stats.iter() {
                for counter in MEMORY_COUNTERS {
                    let value = stats
                        .get(&format!("total_{counter}"))
                        .or_else(|| stats.get(*counter));
                    if let Some(value) = value.and_then(metric_value) {
                        metrics.push((format!("memory {counter}"), value));
                    }
                }
            }
        }

        for (counter, value) in snapshot.network.iter().flatten() {
            if let Some(value) = metric_value(value) {
                metrics.push((format!("network {counter}"), value));
            }
        }
        for (iface, counters) in snapshot.networks.iter().flatten() {
            for (counter, value) in counters {
                if let Some(value) = metric_value(value) {
                    metrics.push((format!("network {iface} {counter}"), value));
                }
            }
        }

        Ok(metrics
            .into_iter()
            .map(|(path, value)| {
                self.record(
                    RecordKind::Stat,
                    time,
                    format!("container {name} {path}"),
                    attributes.clone(),
                    Some(value),
                )
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct StatsSnapshot {
    read: String,
    #[serde(default)]
    blkio_stats: Option<BTreeMap<String, Option<Vec<BlkioEntry>>>>,
    #[serde(default)]
    cpu_stats: Option<CpuStats>,
    #[serde(default)]
    memory_stats: Option<MemoryStats>,
    /// Flat counters reported by older engine versions
    #[serde(default)]
    network: Option<BTreeMap<String, Value>>,
    /// Per-interface counters
    #[serde(default)]
    networks: Option<BTreeMap<String, BTreeMap<String, Value>>>,
}

#[derive(Debug, Deserialize)]
struct BlkioEntry {
    op: String,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct CpuStats {
    #[serde(default)]
    cpu_usage: Option<CpuUsage>,
}

#[derive(Debug, Deserialize)]
struct CpuUsage {
    total_usage: u64,
}

#[derive(Debug, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    usage: Option<u64>,
    #[serde(default)]
    stats: Option<BTreeMap<String, Value>>,
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn metric_value(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().map(clamp))
}

/// Parse an engine timestamp (`2015-09-23T04:13:56.297129480Z`) to whole
/// epoch seconds plus its `YYYY-MM-DDTHH:MM:SSZ` rendering.
pub fn parse_engine_time(raw: &str) -> Result<(i64, String), NormalizeError> {
    let seconds = raw
        .get(..19)
        .ok_or_else(|| NormalizeError::Timestamp(raw.to_string()))?;
    let parsed = NaiveDateTime::parse_from_str(seconds, "%Y-%m-%dT%H:%M:%S")
        .map_err(|_| NormalizeError::Timestamp(raw.to_string()))?;
    Ok((parsed.and_utc().timestamp(), format!("{seconds}Z")))
}

fn container_attributes(info: &ContainerInfo) -> BTreeMap<String, String> {
    let command = info
        .cmd
        .iter()
        .map(|arg| shell_escape::unix::escape(Cow::from(arg.as_str())).into_owned())
        .collect::<Vec<_>>()
        .join(" ");

    BTreeMap::from([
        ("container".to_string(), info.display_name().to_string()),
        ("container_id".to_string(), info.id.clone()),
        ("image".to_string(), info.image.clone()),
        ("image_id".to_string(), info.image_id.clone()),
        ("container_cmd".to_string(), command),
    ])
}

fn glog_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([IWEF])\d{4} \d{2}:\d{2}:\d{2}\.\d{6}\s+\d+ \S*?:\d+\] ")
            .expect("valid glog regex")
    })
}

/// Severity of a glog-formatted line (`E1013 02:44:56.495528    13 slave.cpp:3301] ...`)
fn glog_severity(text: &str) -> Option<&'static str> {
    let captures = glog_pattern().captures(text)?;
    match &captures[1] {
        "I" => Some("info"),
        "W" => Some("warning"),
        "E" => Some("error"),
        "F" => Some("fatal"),
        _ => None,
    }
}

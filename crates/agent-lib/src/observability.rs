//! Observability infrastructure for the tailing agent
//!
//! Provides:
//! - Prometheus metrics (records forwarded, dropped frames, sink failures, subscriptions)
//! - Structured logging helpers with tracing

use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    records_emitted: IntCounter,
    sink_failures: IntCounter,
    malformed_frames: IntCounter,
    normalize_failures: IntCounter,
    subscriptions_opened: IntCounter,
    subscriptions_closed: IntCounter,
    containers_tracked: IntGauge,
    subscriptions_active: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            records_emitted: register_int_counter!(
                "container_tail_records_emitted_total",
                "Normalized records handed to the sink"
            )
            .expect("Failed to register records_emitted"),

            sink_failures: register_int_counter!(
                "container_tail_sink_failures_total",
                "Record batches the sink failed to accept"
            )
            .expect("Failed to register sink_failures"),

            malformed_frames: register_int_counter!(
                "container_tail_malformed_frames_total",
                "Frames dropped because they could not be decoded"
            )
            .expect("Failed to register malformed_frames"),

            normalize_failures: register_int_counter!(
                "container_tail_normalize_failures_total",
                "Payloads dropped because they could not be normalized"
            )
            .expect("Failed to register normalize_failures"),

            subscriptions_opened: register_int_counter!(
                "container_tail_subscriptions_opened_total",
                "Log and stats subscriptions registered with the reactor"
            )
            .expect("Failed to register subscriptions_opened"),

            subscriptions_closed: register_int_counter!(
                "container_tail_subscriptions_closed_total",
                "Log and stats subscriptions closed"
            )
            .expect("Failed to register subscriptions_closed"),

            containers_tracked: register_int_gauge!(
                "container_tail_containers_tracked",
                "Containers currently tracked by the registry"
            )
            .expect("Failed to register containers_tracked"),

            subscriptions_active: register_int_gauge!(
                "container_tail_subscriptions_active",
                "Subscriptions whose stream is registered with the reactor"
            )
            .expect("Failed to register subscriptions_active"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics; clones share the same counters.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn add_records_emitted(&self, count: usize) {
        self.inner().records_emitted.inc_by(count as u64);
    }

    pub fn inc_sink_failures(&self) {
        self.inner().sink_failures.inc();
    }

    pub fn inc_malformed_frames(&self) {
        self.inner().malformed_frames.inc();
    }

    pub fn inc_normalize_failures(&self) {
        self.inner().normalize_failures.inc();
    }

    pub fn inc_subscriptions_opened(&self) {
        self.inner().subscriptions_opened.inc();
        self.inner().subscriptions_active.inc();
    }

    pub fn inc_subscriptions_closed(&self, was_active: bool) {
        self.inner().subscriptions_closed.inc();
        if was_active {
            self.inner().subscriptions_active.dec();
        }
    }

    pub fn set_containers_tracked(&self, count: usize) {
        self.inner().containers_tracked.set(count as i64);
    }

    /// Total records emitted so far
    pub fn records_emitted(&self) -> u64 {
        self.inner().records_emitted.get()
    }
}

/// Truncate `text` to `width` characters, marking the cut with `...`
pub fn summarise(text: &str, width: usize) -> String {
    match text.char_indices().nth(width) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Structured logger for agent lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn log_startup(&self, version: &str, since: i64) {
        info!(
            event = "agent_started",
            host = %self.host,
            agent_version = %version,
            since = since,
            "Container tail agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            host = %self.host,
            reason = %reason,
            "Container tail agent shutting down"
        );
    }

    pub fn log_container_added(&self, container: &str, name: &str) {
        info!(
            event = "container_added",
            host = %self.host,
            container = %container,
            name = %name,
            "Tracking container"
        );
    }

    pub fn log_container_removed(&self, container: &str) {
        info!(
            event = "container_removed",
            host = %self.host,
            container = %container,
            "Container no longer running"
        );
    }

    pub fn log_subscription_opened(&self, container: &str, kind: &str) {
        debug!(
            event = "subscription_opened",
            container = %container,
            kind = %kind,
            "Subscription registered"
        );
    }

    pub fn log_subscription_closed(&self, container: &str, kind: &str, remaining: &[u8]) {
        if remaining.is_empty() {
            debug!(
                event = "subscription_closed",
                container = %container,
                kind = %kind,
                "Subscription closed"
            );
        } else {
            info!(
                event = "subscription_closed",
                container = %container,
                kind = %kind,
                remaining_bytes = remaining.len(),
                remaining = %summarise(&format!("{:?}", String::from_utf8_lossy(remaining)), 60),
                "Subscription closed with undecoded bytes"
            );
        }
    }

    pub fn log_dropped_frame(&self, container: &str, kind: &str, reason: &str, payload: &[u8]) {
        warn!(
            event = "frame_dropped",
            container = %container,
            kind = %kind,
            reason = %reason,
            payload = %summarise(&String::from_utf8_lossy(payload), 60),
            "Dropped undecodable frame"
        );
    }

    pub fn log_throughput(&self, records: u64, window_secs: u64) {
        info!(
            event = "throughput",
            host = %self.host,
            records = records,
            window_secs = window_secs,
            "Records forwarded"
        );
    }

    pub fn log_stall(&self, idle_secs: u64, pid: Option<u32>) {
        warn!(
            event = "agent_stalled",
            host = %self.host,
            idle_secs = idle_secs,
            pid = ?pid,
            "Resume marker stopped advancing"
        );
    }
}

//! Agent library for tailing container telemetry
//!
//! This crate provides the core functionality for:
//! - Talking to the container engine over its Unix socket
//! - Decoding chunked and multiplexed log frames
//! - Normalizing events, log lines and stats samples into records
//! - Multiplexing per-container streams in a single reactor loop
//! - Forwarding records to file, Riemann or log sinks
//! - Supervising the agent's liveness through its resume marker
//! - Health checks and observability

pub mod codec;
pub mod connect;
pub mod engine;
pub mod health;
pub mod marker;
pub mod models;
pub mod normalize;
pub mod observability;
pub mod proto;
pub mod reactor;
pub mod registry;
pub mod sink;
pub mod watchdog;

pub use engine::{Engine, EngineError, UnixEngine};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use marker::ResumeMarker;
pub use models::*;
pub use normalize::Normalizer;
pub use observability::{AgentMetrics, StructuredLogger};
pub use reactor::{Reactor, ReactorConfig};
pub use sink::{FileSink, FileSinkConfig, LogSink, RiemannSink, RiemannSinkConfig, Sink};
pub use watchdog::{Watchdog, WatchdogConfig};

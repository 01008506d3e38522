//! Record sinks
//!
//! Delivery is best-effort: the reactor hands each batch to the sink once,
//! logs a failure and moves on with the next batch.

mod file;
mod log;
mod riemann;

pub use file::{FileSink, FileSinkConfig};
pub use log::LogSink;
pub use riemann::{RiemannSink, RiemannSinkConfig};

use crate::models::NormalizedRecord;
use async_trait::async_trait;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to decode riemann reply: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("riemann rejected the batch: {0}")]
    Rejected(String),

    #[error("sink timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Destination for normalized records
#[async_trait]
pub trait Sink: Send {
    /// Deliver one batch. Records within a batch keep their order.
    async fn emit(&mut self, records: &[NormalizedRecord]) -> Result<(), SinkError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}


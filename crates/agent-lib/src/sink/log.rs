//! Diagnostics sink that writes records to the agent's own log

use super::{Sink, SinkError};
use crate::models::NormalizedRecord;
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Default)]
pub struct LogSink {
    emitted: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

#[async_trait]
impl Sink for LogSink {
    async fn emit(&mut self, records: &[NormalizedRecord]) -> Result<(), SinkError> {
        for record in records {
            debug!(
                kind = %record.kind,
                service = %record.service,
                time = record.time,
                state = %record.state,
                metric = ?record.metric,
                attributes = ?record.attributes,
                "Record"
            );
        }
        self.emitted += records.len() as u64;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

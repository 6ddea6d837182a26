//! Append-only run audit sinks.
//!
//! Sinks observe the run; they never steer it. A sink that cannot accept a
//! record logs the loss at `warn` and the pipeline continues.

use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::{RunLogRecord, RunStatus};

/// Receives one record per pipeline step transition.
pub trait RunLogSink: Send + Sync {
    fn record(&self, record: RunLogRecord);
}

/// Emits each record as a structured tracing event.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl RunLogSink for TracingLogSink {
    fn record(&self, record: RunLogRecord) {
        match record.status {
            RunStatus::Failed => warn!(
                run.process_id = record.process_id,
                run.dataset_id = record.dataset_id,
                run.batch_id = record.batch_id,
                run.phase = ?record.phase,
                run.status = ?record.status,
                run.detail = record.detail.as_deref().unwrap_or(""),
                "Run step failed"
            ),
            _ => info!(
                run.process_id = record.process_id,
                run.dataset_id = record.dataset_id,
                run.batch_id = record.batch_id,
                run.phase = ?record.phase,
                run.status = ?record.status,
                run.detail = record.detail.as_deref().unwrap_or(""),
                "Run step recorded"
            ),
        }
    }
}

/// Collects records in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<RunLogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RunLogRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl RunLogSink for MemoryLogSink {
    fn record(&self, record: RunLogRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(_) => warn!("run log sink is poisoned; record dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunPhase;

    #[test]
    fn memory_sink_keeps_records_in_order() {
        let sink = MemoryLogSink::new();
        sink.record(RunLogRecord::start(100, 7, 42, RunPhase::Transformation).succeeded(None));
        sink.record(
            RunLogRecord::start(100, 7, 42, RunPhase::Quality).failed("QualityViolation"),
        );

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].phase, RunPhase::Transformation);
        assert_eq!(records[1].status, RunStatus::Failed);
    }
}

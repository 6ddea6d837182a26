//! Run orchestration: per-run identity, audit sinks, and the dataset
//! runner.

pub mod context;
pub mod log;
pub mod runner;

pub use context::RunContext;
pub use log::{MemoryLogSink, RunLogSink, TracingLogSink};
pub use runner::{PipelineRunner, PipelineRunnerBuilder};

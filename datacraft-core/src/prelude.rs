//! Convenience re-exports for embedding the pipeline engine.
//!
//! ```
//! use datacraft_core::prelude::*;
//! ```

pub use crate::config::{
    ColumnDescriptor, ColumnType, ConfigRecords, ConfigSnapshot, Criticality, DatasetDescriptor,
    DependencyEdge, JoinHow, QcType, QualityRule, RunLogRecord, RunPhase, RunStatus,
    TransformationKind,
};
pub use crate::dqm::{
    CriticalityPolicy, CustomCheckRegistry, QualityEngine, QualityReport, RuleOutcome, RuleStatus,
};
pub use crate::engine::{
    ComputeEngine, DataFusionEngine, MemoryTableStore, TableHandle, TableStore, WriteMode,
};
pub use crate::error::{DatacraftError, ErrorContext, Result};
pub use crate::resolver::{DependencyResolver, ExecutionGroup, ExecutionPlan};
pub use crate::run::{MemoryLogSink, PipelineRunner, RunContext, RunLogSink, TracingLogSink};
pub use crate::scd2::{HistoryMergeEngine, MergeStats};
pub use crate::transform::TransformationEngine;

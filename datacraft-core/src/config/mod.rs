//! Control-table configuration model.
//!
//! All pipeline behavior is driven by configuration records rather than
//! code: datasets, column metadata, quality rules, and dependency edges.
//! [`model`] defines the typed rows; [`snapshot`] assembles them into the
//! validated, per-run [`ConfigSnapshot`].

pub mod model;
pub mod snapshot;

pub use model::{
    ColumnDescriptor, ColumnType, Criticality, DatasetDescriptor, DependencyEdge, JoinHow, QcType,
    QualityRule, RunLogRecord, RunPhase, RunStatus, TransformationKind,
};
pub use snapshot::{ConfigRecords, ConfigSnapshot};

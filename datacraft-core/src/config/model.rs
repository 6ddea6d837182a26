//! Typed control-table rows.
//!
//! Each struct here mirrors one logical record family of the configuration
//! store. Rows are pure data: validation happens once, when a
//! [`ConfigSnapshot`](super::ConfigSnapshot) is assembled, and the snapshot
//! is immutable for the duration of a run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity tier attached to a quality rule, used to weight pipeline-halting
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Criticality {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Criticality::High => write!(f, "HIGH"),
            Criticality::Medium => write!(f, "MEDIUM"),
            Criticality::Low => write!(f, "LOW"),
        }
    }
}

/// Declared data type of a configured column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Decimal,
    Date,
    Timestamp,
    Boolean,
}

/// Identifies one dataset and its layer-specific storage tables.
///
/// `(process_id, dataset_id)` is unique and immutable once referenced by
/// dependent rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub process_id: i64,
    pub dataset_id: i64,
    pub dataset_name: String,
    /// Standardized/quality-checked input table for this dataset.
    pub staging_table: String,
    /// Business-transformed output table.
    pub transformation_table: String,
    /// Append-only history sink (all record versions).
    pub history_table: String,
    /// Current-records-only publish sink.
    pub publish_table: String,
    #[serde(default)]
    pub staging_partition_columns: Vec<String>,
    #[serde(default)]
    pub transformation_partition_columns: Vec<String>,
    #[serde(default)]
    pub publish_partition_columns: Vec<String>,
    /// Primary keys used by the SCD2 merge into history/publish sinks.
    #[serde(default)]
    pub primary_keys: Vec<String>,
}

/// Metadata for one column of a configured table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub table_name: String,
    pub dataset_id: i64,
    pub column_name: String,
    pub data_type: ColumnType,
    /// Parse format when `data_type` is `Date` or `Timestamp`.
    #[serde(default)]
    pub date_format: Option<String>,
    /// JSON extraction path; only meaningful when the owning dataset's source
    /// is nested JSON.
    #[serde(default)]
    pub json_path: Option<String>,
    /// Defines output column order. Unique within a table.
    pub sequence_number: u32,
    #[serde(default)]
    pub source_column_name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// The kind of quality check a rule performs, carrying only the parameters
/// that kind needs. The raw `qc_param` JSON of the control row deserializes
/// directly into the matching variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "qc_type", content = "qc_param", rename_all = "kebab-case")]
pub enum QcType {
    NotNull,
    Uniqueness,
    NumericRange { min: f64, max: f64 },
    Length { min: usize, max: usize },
    DateValidity { format: String },
    DomainMembership { allowed: Vec<String> },
    Regex { pattern: String },
    Custom { function: String },
}

impl QcType {
    /// Short tag used in log records and rule names.
    pub fn kind(&self) -> &'static str {
        match self {
            QcType::NotNull => "not-null",
            QcType::Uniqueness => "uniqueness",
            QcType::NumericRange { .. } => "numeric-range",
            QcType::Length { .. } => "length",
            QcType::DateValidity { .. } => "date-validity",
            QcType::DomainMembership { .. } => "domain-membership",
            QcType::Regex { .. } => "regex",
            QcType::Custom { .. } => "custom",
        }
    }
}

fn default_active() -> bool {
    true
}

/// One configured data-quality rule scoped to a dataset column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRule {
    pub qc_id: i64,
    pub process_id: i64,
    pub dataset_id: i64,
    pub column_name: String,
    #[serde(flatten)]
    pub qc: QcType,
    /// Optional row filter restricting the rule's denominator.
    #[serde(default)]
    pub filter: Option<String>,
    pub criticality: Criticality,
    /// Maximum allowed failure percentage before the rule is violated.
    /// `None` means zero tolerance: any failing row violates the rule.
    #[serde(default)]
    pub threshold_pct: Option<f64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl QualityRule {
    /// Human-readable rule name used in reports and log records.
    pub fn name(&self) -> String {
        format!("{}:{}", self.qc.kind(), self.column_name)
    }
}

/// Join strategy for a join-typed dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinHow {
    Inner,
    Left,
    Outer,
}

impl std::fmt::Display for JoinHow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinHow::Inner => write!(f, "inner"),
            JoinHow::Left => write!(f, "left"),
            JoinHow::Outer => write!(f, "outer"),
        }
    }
}

/// The transformation a dependency edge applies when its input is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transformation_type", rename_all = "lowercase")]
pub enum TransformationKind {
    /// Pass the dependent dataset through unchanged (modulo projection).
    Direct,
    /// Join the accumulated output with the dependent dataset.
    Join {
        how: JoinHow,
        left_on: Vec<String>,
        right_on: Vec<String>,
    },
    /// Union the dependent dataset onto the accumulated output.
    Union,
    /// Run a configured query verbatim against the compute engine.
    Custom { query: String },
}

impl TransformationKind {
    pub fn kind(&self) -> &'static str {
        match self {
            TransformationKind::Direct => "direct",
            TransformationKind::Join { .. } => "join",
            TransformationKind::Union => "union",
            TransformationKind::Custom { .. } => "custom",
        }
    }
}

/// A declared requirement that `dataset_id`'s transformation at
/// `transformation_step` needs `dependent_dataset_id`'s output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub process_id: i64,
    pub dataset_id: i64,
    pub dependent_dataset_id: i64,
    /// Secondary deterministic ordering among edges with no dependency
    /// relationship to each other; later steps consume earlier step output.
    pub transformation_step: u32,
    #[serde(flatten)]
    pub transformation: TransformationKind,
    /// Literal columns added to a union source, or named parameters bound
    /// into a custom query.
    #[serde(default)]
    pub extra_values: BTreeMap<String, String>,
}

/// Phase of a dataset run that a log record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Resolution,
    Transformation,
    Quality,
    Merge,
}

/// Status of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// One row of the append-only execution audit trail.
///
/// Created at step start, finalized once at step completion, never deleted.
/// The core writes these but never reads them back for control decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogRecord {
    pub process_id: i64,
    pub dataset_id: i64,
    pub batch_id: i64,
    pub run_date: NaiveDate,
    pub phase: RunPhase,
    pub status: RunStatus,
    /// Rule or edge identifier, or the failure classification and message.
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunLogRecord {
    /// Creates a record in the `Running` state.
    pub fn start(process_id: i64, dataset_id: i64, batch_id: i64, phase: RunPhase) -> Self {
        let now = Utc::now();
        Self {
            process_id,
            dataset_id,
            batch_id,
            run_date: now.date_naive(),
            phase,
            status: RunStatus::Running,
            detail: None,
            started_at: now,
            ended_at: None,
        }
    }

    /// Finalizes the record as succeeded.
    pub fn succeeded(mut self, detail: impl Into<Option<String>>) -> Self {
        self.status = RunStatus::Succeeded;
        self.detail = detail.into();
        self.ended_at = Some(Utc::now());
        self
    }

    /// Finalizes the record as failed with exception detail.
    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.status = RunStatus::Failed;
        self.detail = Some(detail.into());
        self.ended_at = Some(Utc::now());
        self
    }
}

//! Error types for the Datacraft pipeline engine.
//!
//! All failures in the engine are represented by [`DatacraftError`], a
//! classified taxonomy built with `thiserror`. Step-level failures are caught
//! at the step boundary, written to the run-log sink with their context, and
//! then re-raised as one of these variants; nothing inside the core retries.

use thiserror::Error;

/// The main error type for the Datacraft pipeline engine.
#[derive(Error, Debug)]
pub enum DatacraftError {
    /// A malformed or missing control-table row. Fatal for the affected
    /// dataset only; sibling datasets are unaffected.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The dependency edges for a dataset do not form a DAG. The payload
    /// names the smallest cyclic subset of dataset ids found.
    #[error("Dependency cycle detected among datasets {datasets:?}")]
    CycleDetected {
        /// Dataset ids participating in the smallest cycle found.
        datasets: Vec<i64>,
    },

    /// Two inputs to a union (or a projection target) disagree on columns.
    #[error("Schema mismatch for '{table}': missing columns {missing:?}, unexpected columns {extra:?}")]
    SchemaMismatch {
        table: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    /// A blocking-criticality quality rule failed past its threshold.
    #[error("Quality violation on dataset {dataset_id}: rule '{rule}' failed at {error_pct:.2}% errors")]
    QualityViolation {
        dataset_id: i64,
        rule: String,
        error_pct: f64,
    },

    /// An incoming merge batch has null or duplicated primary keys, so the
    /// SCD2 merge cannot be deterministic. Nothing is written.
    #[error("Ambiguous primary key in '{table}': {detail}")]
    AmbiguousKey { table: String, detail: String },

    /// Opaque failure surfaced from the compute or storage collaborator.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Error from DataFusion operations.
    #[error("DataFusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),

    /// Error from Arrow operations.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Error from I/O operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error deserializing configuration records.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A config-supplied identifier or expression was rejected before being
    /// spliced into SQL.
    #[error("Security error: {0}")]
    Security(String),

    /// Generic internal error for unexpected conditions.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, DatacraftError>`.
pub type Result<T> = std::result::Result<T, DatacraftError>;

impl DatacraftError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an engine error from a collaborator failure.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Creates an ambiguous-key merge error.
    pub fn ambiguous_key(table: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::AmbiguousKey {
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// The short classification tag written to run-log records.
    pub fn classification(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::CycleDetected { .. } => "CycleDetected",
            Self::SchemaMismatch { .. } => "SchemaMismatch",
            Self::QualityViolation { .. } => "QualityViolation",
            Self::AmbiguousKey { .. } => "AmbiguousKey",
            Self::Engine(_)
            | Self::DataFusion(_)
            | Self::Arrow(_)
            | Self::Io(_)
            | Self::Serialization(_) => "EngineError",
            Self::Security(_) => "SecurityError",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, msg: &str) -> Result<T>;

    /// Adds context with a lazily computed message.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<DatacraftError>,
{
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| {
            let base = e.into();
            DatacraftError::Internal(format!("{}: {}", msg, base))
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base = e.into();
            DatacraftError::Internal(format!("{}: {}", f(), base))
        })
    }
}

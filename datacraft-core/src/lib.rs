//! # Datacraft Core
//!
//! A metadata-driven batch pipeline engine: datasets, quality rules, and
//! transformation dependencies live in configuration records, and the
//! engine turns them into validated, transformed, history-merged tables
//! over DataFusion.
//!
//! A run moves one dataset through four phases:
//!
//! 1. **Resolve** its transformation edges into ordered execution groups.
//! 2. **Transform** by folding each group's steps (join, union, custom
//!    query, passthrough) over the compute engine.
//! 3. **Validate** the output against the dataset's quality rules, with
//!    per-rule thresholds and criticality tiers.
//! 4. **Merge** the result into publish and history sinks with type-2
//!    versioning: current rows in publish, every version in history.
//!
//! ## Example
//!
//! ```
//! use datacraft_core::config::{ConfigRecords, ConfigSnapshot, DatasetDescriptor};
//! use datacraft_core::dqm::CustomCheckRegistry;
//!
//! let records = ConfigRecords {
//!     datasets: vec![DatasetDescriptor {
//!         process_id: 100,
//!         dataset_id: 1,
//!         dataset_name: "orders".to_string(),
//!         staging_table: "stg_orders".to_string(),
//!         transformation_table: "trf_orders".to_string(),
//!         history_table: "hist_orders".to_string(),
//!         publish_table: "pub_orders".to_string(),
//!         staging_partition_columns: vec![],
//!         transformation_partition_columns: vec![],
//!         publish_partition_columns: vec![],
//!         primary_keys: vec!["order_id".to_string()],
//!     }],
//!     ..Default::default()
//! };
//!
//! let snapshot = ConfigSnapshot::new(records, &CustomCheckRegistry::new()).unwrap();
//! assert_eq!(snapshot.datasets_for(100).len(), 1);
//! ```
//!
//! Configuration is loaded once per run into an immutable
//! [`ConfigSnapshot`](config::ConfigSnapshot); concurrent configuration
//! edits take effect on the next run. The engine retries nothing and hides
//! nothing: every step failure is classified, written to the run log, and
//! re-raised.

pub mod config;
pub mod dqm;
pub mod engine;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod resolver;
pub mod run;
pub mod scd2;
pub mod security;
pub mod transform;

pub use error::{DatacraftError, ErrorContext, Result};

//! Immutable configuration snapshot for one run.
//!
//! A [`ConfigSnapshot`] is loaded once per run from the external
//! configuration store and validated up front: malformed rows, duplicate
//! identities, unparseable rule parameters, and unknown custom check names
//! all fail here, before any data is touched. Concurrent configuration
//! changes take effect only on the next run.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::info;

use super::model::{
    ColumnDescriptor, DatasetDescriptor, DependencyEdge, QcType, QualityRule, TransformationKind,
};
use crate::dqm::CustomCheckRegistry;
use crate::error::{DatacraftError, Result};
use crate::security::SqlGuard;

/// The raw record families as loaded from the configuration store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigRecords {
    #[serde(default)]
    pub datasets: Vec<DatasetDescriptor>,
    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub quality_rules: Vec<QualityRule>,
    #[serde(default)]
    pub dependency_edges: Vec<DependencyEdge>,
}

/// A validated, read-only view of the control tables for one run.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    datasets: HashMap<(i64, i64), DatasetDescriptor>,
    columns: Vec<ColumnDescriptor>,
    rules: Vec<QualityRule>,
    edges: Vec<DependencyEdge>,
}

impl ConfigSnapshot {
    /// Validates the record families and assembles a snapshot.
    pub fn new(records: ConfigRecords, registry: &CustomCheckRegistry) -> Result<Self> {
        let mut datasets = HashMap::new();
        for descriptor in records.datasets {
            validate_dataset(&descriptor)?;
            let key = (descriptor.process_id, descriptor.dataset_id);
            if datasets.insert(key, descriptor).is_some() {
                return Err(DatacraftError::configuration(format!(
                    "duplicate dataset descriptor for process {} dataset {}",
                    key.0, key.1
                )));
            }
        }

        validate_columns(&records.columns)?;
        for rule in &records.quality_rules {
            validate_rule(rule, registry)?;
        }
        for edge in &records.dependency_edges {
            validate_edge(edge, &datasets)?;
        }

        info!(
            config.datasets = datasets.len(),
            config.columns = records.columns.len(),
            config.rules = records.quality_rules.len(),
            config.edges = records.dependency_edges.len(),
            "Configuration snapshot loaded"
        );

        Ok(Self {
            datasets,
            columns: records.columns,
            rules: records.quality_rules,
            edges: records.dependency_edges,
        })
    }

    /// Loads and validates a snapshot from a JSON document of record
    /// families.
    pub fn from_json(json: &str, registry: &CustomCheckRegistry) -> Result<Self> {
        let records: ConfigRecords = serde_json::from_str(json)?;
        Self::new(records, registry)
    }

    /// Looks up one dataset descriptor.
    pub fn dataset(&self, process_id: i64, dataset_id: i64) -> Result<&DatasetDescriptor> {
        self.datasets.get(&(process_id, dataset_id)).ok_or_else(|| {
            DatacraftError::configuration(format!(
                "no dataset descriptor for process {process_id} dataset {dataset_id}"
            ))
        })
    }

    /// All dataset descriptors for one process.
    pub fn datasets_for(&self, process_id: i64) -> Vec<&DatasetDescriptor> {
        let mut found: Vec<_> = self
            .datasets
            .values()
            .filter(|d| d.process_id == process_id)
            .collect();
        found.sort_by_key(|d| d.dataset_id);
        found
    }

    /// Column metadata for one dataset, ordered by sequence number.
    pub fn columns_for(&self, dataset_id: i64) -> Vec<&ColumnDescriptor> {
        let mut found: Vec<_> = self
            .columns
            .iter()
            .filter(|c| c.dataset_id == dataset_id)
            .collect();
        found.sort_by_key(|c| c.sequence_number);
        found
    }

    /// Active quality rules scoped to one dataset. Inactive rules are loaded
    /// but never evaluated.
    pub fn active_rules_for(&self, process_id: i64, dataset_id: i64) -> Vec<&QualityRule> {
        self.rules
            .iter()
            .filter(|r| r.process_id == process_id && r.dataset_id == dataset_id && r.active)
            .collect()
    }

    /// All dependency edges for one process. The resolver narrows these to
    /// the closure reachable from a target dataset.
    pub fn edges_for(&self, process_id: i64) -> Vec<&DependencyEdge> {
        self.edges
            .iter()
            .filter(|e| e.process_id == process_id)
            .collect()
    }
}

fn validate_dataset(descriptor: &DatasetDescriptor) -> Result<()> {
    for table in [
        &descriptor.staging_table,
        &descriptor.transformation_table,
        &descriptor.history_table,
        &descriptor.publish_table,
    ] {
        SqlGuard::validate_identifier(table)?;
    }
    for column in descriptor
        .primary_keys
        .iter()
        .chain(&descriptor.staging_partition_columns)
        .chain(&descriptor.transformation_partition_columns)
        .chain(&descriptor.publish_partition_columns)
    {
        SqlGuard::validate_identifier(column)?;
    }
    Ok(())
}

fn validate_columns(columns: &[ColumnDescriptor]) -> Result<()> {
    let mut seen_sequence: HashSet<(&str, i64, u32)> = HashSet::new();
    let mut seen_name: HashSet<(&str, i64, &str)> = HashSet::new();
    for column in columns {
        SqlGuard::validate_identifier(&column.table_name)?;
        SqlGuard::validate_identifier(&column.column_name)?;
        if !seen_sequence.insert((
            column.table_name.as_str(),
            column.dataset_id,
            column.sequence_number,
        )) {
            return Err(DatacraftError::configuration(format!(
                "duplicate column sequence number {} in table '{}' (dataset {})",
                column.sequence_number, column.table_name, column.dataset_id
            )));
        }
        if !seen_name.insert((
            column.table_name.as_str(),
            column.dataset_id,
            column.column_name.as_str(),
        )) {
            return Err(DatacraftError::configuration(format!(
                "duplicate column '{}' in table '{}' (dataset {})",
                column.column_name, column.table_name, column.dataset_id
            )));
        }
    }
    Ok(())
}

fn validate_rule(rule: &QualityRule, registry: &CustomCheckRegistry) -> Result<()> {
    SqlGuard::validate_identifier(&rule.column_name)?;
    if let Some(filter) = &rule.filter {
        SqlGuard::validate_filter(filter)?;
    }
    if let Some(pct) = rule.threshold_pct {
        if !(0.0..=100.0).contains(&pct) {
            return Err(DatacraftError::configuration(format!(
                "rule {} threshold_pct {pct} is outside 0..=100",
                rule.qc_id
            )));
        }
    }
    match &rule.qc {
        QcType::NumericRange { min, max } if min > max => {
            Err(DatacraftError::configuration(format!(
                "rule {}: numeric-range min {min} exceeds max {max}",
                rule.qc_id
            )))
        }
        QcType::Length { min, max } if min > max => Err(DatacraftError::configuration(format!(
            "rule {}: length min {min} exceeds max {max}",
            rule.qc_id
        ))),
        QcType::DateValidity { format } if format.trim().is_empty() => {
            Err(DatacraftError::configuration(format!(
                "rule {}: date-validity format is empty",
                rule.qc_id
            )))
        }
        QcType::DomainMembership { allowed } if allowed.is_empty() => {
            Err(DatacraftError::configuration(format!(
                "rule {}: domain-membership allowed set is empty",
                rule.qc_id
            )))
        }
        QcType::Regex { pattern } => SqlGuard::validate_pattern(pattern),
        // Unknown custom names fail fast here, never mid-run.
        QcType::Custom { function } if !registry.contains(function) => {
            Err(DatacraftError::configuration(format!(
                "rule {}: custom check function '{}' is not registered",
                rule.qc_id, function
            )))
        }
        _ => Ok(()),
    }
}

fn validate_edge(
    edge: &DependencyEdge,
    datasets: &HashMap<(i64, i64), DatasetDescriptor>,
) -> Result<()> {
    if edge.dataset_id == edge.dependent_dataset_id {
        return Err(DatacraftError::configuration(format!(
            "dataset {} depends on itself",
            edge.dataset_id
        )));
    }
    if !datasets.contains_key(&(edge.process_id, edge.dependent_dataset_id)) {
        return Err(DatacraftError::configuration(format!(
            "edge for dataset {} references unknown dependent dataset {}",
            edge.dataset_id, edge.dependent_dataset_id
        )));
    }
    for key in edge.extra_values.keys() {
        SqlGuard::validate_identifier(key)?;
    }
    match &edge.transformation {
        TransformationKind::Join { left_on, right_on, .. } => {
            if left_on.is_empty() || left_on.len() != right_on.len() {
                return Err(DatacraftError::configuration(format!(
                    "edge for dataset {}: join key count mismatch ({} left vs {} right)",
                    edge.dataset_id,
                    left_on.len(),
                    right_on.len()
                )));
            }
            for column in left_on.iter().chain(right_on) {
                SqlGuard::validate_identifier(column)?;
            }
            Ok(())
        }
        TransformationKind::Custom { query } if query.trim().is_empty() => {
            Err(DatacraftError::configuration(format!(
                "edge for dataset {}: custom query is empty",
                edge.dataset_id
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::Criticality;

    fn descriptor(process_id: i64, dataset_id: i64, name: &str) -> DatasetDescriptor {
        DatasetDescriptor {
            process_id,
            dataset_id,
            dataset_name: name.to_string(),
            staging_table: format!("stg_{name}"),
            transformation_table: format!("trf_{name}"),
            history_table: format!("hist_{name}"),
            publish_table: format!("pub_{name}"),
            staging_partition_columns: vec![],
            transformation_partition_columns: vec![],
            publish_partition_columns: vec![],
            primary_keys: vec!["id".to_string()],
        }
    }

    #[test]
    fn duplicate_descriptor_is_rejected() {
        let records = ConfigRecords {
            datasets: vec![descriptor(1, 1, "orders"), descriptor(1, 1, "orders_v2")],
            ..Default::default()
        };
        let err = ConfigSnapshot::new(records, &CustomCheckRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("duplicate dataset descriptor"));
    }

    #[test]
    fn duplicate_sequence_number_is_rejected() {
        let column = |name: &str, seq: u32| ColumnDescriptor {
            table_name: "stg_orders".to_string(),
            dataset_id: 1,
            column_name: name.to_string(),
            data_type: crate::config::model::ColumnType::String,
            date_format: None,
            json_path: None,
            sequence_number: seq,
            source_column_name: None,
            tag: None,
        };
        let records = ConfigRecords {
            datasets: vec![descriptor(1, 1, "orders")],
            columns: vec![column("id", 1), column("region", 1)],
            ..Default::default()
        };
        let err = ConfigSnapshot::new(records, &CustomCheckRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("duplicate column sequence number"));
    }

    #[test]
    fn unknown_custom_check_fails_at_load() {
        let records = ConfigRecords {
            datasets: vec![descriptor(1, 1, "orders")],
            quality_rules: vec![QualityRule {
                qc_id: 1,
                process_id: 1,
                dataset_id: 1,
                column_name: "amount".to_string(),
                qc: QcType::Custom {
                    function: "no_such_check".to_string(),
                },
                filter: None,
                criticality: Criticality::High,
                threshold_pct: None,
                active: true,
            }],
            ..Default::default()
        };
        let err = ConfigSnapshot::new(records, &CustomCheckRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("no_such_check"));
    }

    #[test]
    fn malformed_qc_param_fails_at_load() {
        let json = serde_json::json!({
            "datasets": [],
            "quality_rules": [{
                "qc_id": 1,
                "process_id": 1,
                "dataset_id": 1,
                "column_name": "amount",
                "qc_type": "numeric-range",
                "qc_param": {"min": "not-a-number"},
                "criticality": "HIGH"
            }]
        });
        let err =
            ConfigSnapshot::from_json(&json.to_string(), &CustomCheckRegistry::new()).unwrap_err();
        assert!(matches!(err, DatacraftError::Serialization(_)));
    }

    #[test]
    fn inverted_range_fails_at_load() {
        let records = ConfigRecords {
            datasets: vec![descriptor(1, 1, "orders")],
            quality_rules: vec![QualityRule {
                qc_id: 9,
                process_id: 1,
                dataset_id: 1,
                column_name: "amount".to_string(),
                qc: QcType::NumericRange { min: 10.0, max: 1.0 },
                filter: None,
                criticality: Criticality::Low,
                threshold_pct: Some(5.0),
                active: true,
            }],
            ..Default::default()
        };
        let err = ConfigSnapshot::new(records, &CustomCheckRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("exceeds max"));
    }

    #[test]
    fn edge_referencing_unknown_dataset_is_rejected() {
        let records = ConfigRecords {
            datasets: vec![descriptor(1, 10, "orders")],
            dependency_edges: vec![DependencyEdge {
                process_id: 1,
                dataset_id: 10,
                dependent_dataset_id: 99,
                transformation_step: 1,
                transformation: TransformationKind::Direct,
                extra_values: Default::default(),
            }],
            ..Default::default()
        };
        let err = ConfigSnapshot::new(records, &CustomCheckRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("unknown dependent dataset"));
    }

    #[test]
    fn inactive_rules_are_loaded_but_not_served() {
        let mut rule = QualityRule {
            qc_id: 1,
            process_id: 1,
            dataset_id: 1,
            column_name: "region".to_string(),
            qc: QcType::NotNull,
            filter: None,
            criticality: Criticality::High,
            threshold_pct: None,
            active: false,
        };
        let records = ConfigRecords {
            datasets: vec![descriptor(1, 1, "orders")],
            quality_rules: vec![rule.clone()],
            ..Default::default()
        };
        let snapshot = ConfigSnapshot::new(records, &CustomCheckRegistry::new()).unwrap();
        assert!(snapshot.active_rules_for(1, 1).is_empty());

        rule.active = true;
        let records = ConfigRecords {
            datasets: vec![descriptor(1, 1, "orders")],
            quality_rules: vec![rule],
            ..Default::default()
        };
        let snapshot = ConfigSnapshot::new(records, &CustomCheckRegistry::new()).unwrap();
        assert_eq!(snapshot.active_rules_for(1, 1).len(), 1);
    }
}

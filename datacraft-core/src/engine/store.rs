//! Storage seam for named tables.
//!
//! The pipeline reads and writes whole tables through [`TableStore`];
//! everything above it sees snapshot-style replacement and never partial
//! writes. [`MemoryTableStore`] is the in-tree implementation backing tests
//! and embedded use. A production store is expected to provide the same
//! all-or-nothing replacement semantics.

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{DatacraftError, Result};

/// Named-table storage. The schema travels with the data so an empty table
/// keeps its shape.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Reads a table's schema and batches. Missing tables are an error.
    async fn read(&self, table: &str) -> Result<(SchemaRef, Vec<RecordBatch>)>;

    async fn exists(&self, table: &str) -> bool;

    /// Appends batches to a table, creating it when absent.
    async fn append(&self, table: &str, schema: SchemaRef, batches: Vec<RecordBatch>)
        -> Result<()>;

    /// Replaces a table's content wholesale.
    async fn overwrite(
        &self,
        table: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()>;
}

/// In-memory table store over Arrow record batches.
#[derive(Default)]
pub struct MemoryTableStore {
    tables: RwLock<HashMap<String, (SchemaRef, Vec<RecordBatch>)>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total row count of a table, for inspection and tests.
    pub async fn row_count(&self, table: &str) -> Result<usize> {
        let (_, batches) = self.read(table).await?;
        Ok(batches.iter().map(RecordBatch::num_rows).sum())
    }

    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn check_schema(table: &str, existing: &SchemaRef, incoming: &SchemaRef) -> Result<()> {
    let existing_names: Vec<&str> = existing.fields().iter().map(|f| f.name().as_str()).collect();
    let incoming_names: Vec<&str> = incoming.fields().iter().map(|f| f.name().as_str()).collect();
    if existing_names == incoming_names {
        return Ok(());
    }
    let missing = existing_names
        .iter()
        .filter(|n| !incoming_names.contains(n))
        .map(|n| n.to_string())
        .collect();
    let extra = incoming_names
        .iter()
        .filter(|n| !existing_names.contains(n))
        .map(|n| n.to_string())
        .collect();
    Err(DatacraftError::SchemaMismatch {
        table: table.to_string(),
        missing,
        extra,
    })
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn read(&self, table: &str) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let tables = self.tables.read().await;
        let (schema, batches) = tables
            .get(table)
            .ok_or_else(|| DatacraftError::engine(format!("table '{table}' does not exist")))?;
        Ok((schema.clone(), batches.clone()))
    }

    async fn exists(&self, table: &str) -> bool {
        self.tables.read().await.contains_key(table)
    }

    async fn append(
        &self,
        table: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
        let mut tables = self.tables.write().await;
        match tables.get_mut(table) {
            Some((existing_schema, existing)) => {
                check_schema(table, existing_schema, &schema)?;
                existing.extend(batches);
            }
            None => {
                tables.insert(table.to_string(), (schema, batches));
            }
        }
        debug!(store.table = %table, store.rows = rows, store.mode = "append", "Table written");
        Ok(())
    }

    async fn overwrite(
        &self,
        table: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
        self.tables
            .write()
            .await
            .insert(table.to_string(), (schema, batches));
        debug!(store.table = %table, store.rows = rows, store.mode = "overwrite", "Table written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch(values: Vec<i64>) -> (SchemaRef, RecordBatch) {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(values))]).unwrap();
        (schema, batch)
    }

    #[tokio::test]
    async fn append_accumulates_and_overwrite_replaces() {
        let store = MemoryTableStore::new();
        let (schema, first) = batch(vec![1, 2]);
        store.append("t", schema.clone(), vec![first]).await.unwrap();
        let (_, second) = batch(vec![3]);
        store.append("t", schema.clone(), vec![second]).await.unwrap();
        assert_eq!(store.row_count("t").await.unwrap(), 3);

        let (_, replacement) = batch(vec![9]);
        store.overwrite("t", schema, vec![replacement]).await.unwrap();
        assert_eq!(store.row_count("t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_table_read_is_an_error() {
        let store = MemoryTableStore::new();
        assert!(!store.exists("absent").await);
        assert!(store.read("absent").await.is_err());
    }

    #[tokio::test]
    async fn append_rejects_mismatched_schema() {
        let store = MemoryTableStore::new();
        let (schema, first) = batch(vec![1]);
        store.append("t", schema, vec![first]).await.unwrap();

        let other_schema = Arc::new(Schema::new(vec![Field::new(
            "name",
            DataType::Utf8,
            true,
        )]));
        let err = store
            .append("t", other_schema, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DatacraftError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn empty_overwrite_keeps_schema() {
        let store = MemoryTableStore::new();
        let (schema, _) = batch(vec![]);
        store.overwrite("t", schema, vec![]).await.unwrap();
        let (read_schema, batches) = store.read("t").await.unwrap();
        assert_eq!(read_schema.fields().len(), 1);
        assert!(batches.is_empty());
    }
}

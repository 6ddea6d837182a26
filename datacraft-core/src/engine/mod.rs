//! Compute seam over DataFusion.
//!
//! Transformation and merge logic never touch batches directly; they work
//! with opaque [`TableHandle`]s naming tables registered in a session
//! context, and persist results through the [`TableStore`] seam. Step
//! outputs materialize eagerly under generated intermediate names, so each
//! handle is a stable input for later steps.

pub mod store;

pub use store::{MemoryTableStore, TableStore};

use arrow::array::Int64Array;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use datafusion::scalar::ScalarValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{DatacraftError, Result};
use crate::security::SqlGuard;

/// Opaque reference to a table registered with the compute engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableHandle {
    name: String,
}

impl TableHandle {
    fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The handle's name escaped for splicing into generated SQL.
    pub fn sql_name(&self) -> Result<String> {
        SqlGuard::escape_identifier(&self.name)
    }
}

impl std::fmt::Display for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// How a handle's content lands in a stored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Overwrite,
    /// Replace stored rows matching the source on the given keys, keep the
    /// rest, insert the remainder.
    Upsert,
}

/// Query execution and persistence operations the pipeline is written
/// against.
#[async_trait]
pub trait ComputeEngine: Send + Sync {
    /// Registers a stored table for querying and returns its handle.
    async fn load(&self, table: &str) -> Result<TableHandle>;

    /// Runs a query and materializes the result under a fresh handle.
    async fn sql(&self, query: &str) -> Result<TableHandle>;

    /// Like [`sql`](Self::sql), with `$name` placeholders bound to string
    /// values.
    async fn sql_with_params(
        &self,
        query: &str,
        params: Vec<(String, String)>,
    ) -> Result<TableHandle>;

    /// Column names of a handle, in schema order.
    async fn columns(&self, handle: &TableHandle) -> Result<Vec<String>>;

    async fn row_count(&self, handle: &TableHandle) -> Result<u64>;

    /// Persists a handle into a stored table. Returns the source row count.
    async fn write(
        &self,
        handle: &TableHandle,
        table: &str,
        mode: WriteMode,
        keys: &[String],
    ) -> Result<u64>;
}

/// [`ComputeEngine`] over a DataFusion session context and a [`TableStore`].
pub struct DataFusionEngine {
    ctx: Arc<SessionContext>,
    store: Arc<dyn TableStore>,
    next_handle: AtomicU64,
}

impl DataFusionEngine {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            ctx: Arc::new(SessionContext::new()),
            store,
            next_handle: AtomicU64::new(0),
        }
    }

    pub fn ctx(&self) -> Arc<SessionContext> {
        Arc::clone(&self.ctx)
    }

    pub fn store(&self) -> Arc<dyn TableStore> {
        Arc::clone(&self.store)
    }

    fn intermediate_name(&self) -> String {
        let n = self.next_handle.fetch_add(1, Ordering::Relaxed);
        format!("__step_{n}")
    }

    fn register_batches(
        &self,
        name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<TableHandle> {
        let provider = MemTable::try_new(schema, vec![batches])?;
        self.ctx.deregister_table(name)?;
        self.ctx.register_table(name, Arc::new(provider))?;
        Ok(TableHandle::named(name))
    }

    async fn materialize(&self, df: datafusion::dataframe::DataFrame) -> Result<TableHandle> {
        let schema: SchemaRef = Arc::new(df.schema().as_arrow().clone());
        let batches = df.collect().await?;
        let name = self.intermediate_name();
        self.register_batches(&name, schema, batches)
    }

    async fn handle_content(&self, handle: &TableHandle) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let df = self.ctx.table(handle.name()).await?;
        let schema: SchemaRef = Arc::new(df.schema().as_arrow().clone());
        let batches = df.collect().await?;
        Ok((schema, batches))
    }

    /// Runs a single-scalar count query against registered tables.
    pub async fn count(&self, sql: &str) -> Result<u64> {
        let batches = self.ctx.sql(sql).await?.collect().await?;
        let batch = batches
            .first()
            .ok_or_else(|| DatacraftError::engine("count query returned no batches"))?;
        let counts = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| DatacraftError::engine("count query did not return an Int64 column"))?;
        Ok(counts.value(0).max(0) as u64)
    }
}

#[async_trait]
impl ComputeEngine for DataFusionEngine {
    async fn load(&self, table: &str) -> Result<TableHandle> {
        let (schema, batches) = self.store.read(table).await?;
        self.register_batches(table, schema, batches)
    }

    async fn sql(&self, query: &str) -> Result<TableHandle> {
        let df = self.ctx.sql(query).await?;
        self.materialize(df).await
    }

    async fn sql_with_params(
        &self,
        query: &str,
        params: Vec<(String, String)>,
    ) -> Result<TableHandle> {
        let values: Vec<(String, ScalarValue)> = params
            .into_iter()
            .map(|(name, value)| (name, ScalarValue::Utf8(Some(value))))
            .collect();
        let df = self.ctx.sql(query).await?.with_param_values(values)?;
        self.materialize(df).await
    }

    async fn columns(&self, handle: &TableHandle) -> Result<Vec<String>> {
        let df = self.ctx.table(handle.name()).await?;
        Ok(df
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect())
    }

    async fn row_count(&self, handle: &TableHandle) -> Result<u64> {
        let sql_name = handle.sql_name()?;
        self.count(&format!("SELECT COUNT(*) FROM {sql_name}")).await
    }

    async fn write(
        &self,
        handle: &TableHandle,
        table: &str,
        mode: WriteMode,
        keys: &[String],
    ) -> Result<u64> {
        SqlGuard::validate_identifier(table)?;
        let (schema, batches) = self.handle_content(handle).await?;
        let rows: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();

        match mode {
            WriteMode::Append => {
                self.store.append(table, schema, batches).await?;
            }
            WriteMode::Overwrite => {
                self.store.overwrite(table, schema, batches).await?;
            }
            WriteMode::Upsert => {
                if keys.is_empty() {
                    return Err(DatacraftError::configuration(format!(
                        "upsert into '{table}' requires key columns"
                    )));
                }
                if !self.store.exists(table).await {
                    self.store.overwrite(table, schema, batches).await?;
                } else {
                    self.load(table).await?;
                    let target_sql = SqlGuard::escape_identifier(table)?;
                    let source_sql = handle.sql_name()?;
                    let join_on = keys
                        .iter()
                        .map(|k| {
                            let key = SqlGuard::escape_identifier(k)?;
                            Ok(format!("t.{key} = s.{key}"))
                        })
                        .collect::<Result<Vec<_>>>()?
                        .join(" AND ");
                    let probe_key = SqlGuard::escape_identifier(&keys[0])?;
                    let column_list = |alias: &str| -> Result<String> {
                        Ok(schema
                            .fields()
                            .iter()
                            .map(|f| {
                                Ok(format!(
                                    "{alias}.{}",
                                    SqlGuard::escape_identifier(f.name())?
                                ))
                            })
                            .collect::<Result<Vec<_>>>()?
                            .join(", "))
                    };
                    // One statement produces both halves, so the stored
                    // schema and batches always agree.
                    let df = self
                        .ctx
                        .sql(&format!(
                            "SELECT {} FROM {target_sql} t \
                             LEFT JOIN {source_sql} s ON {join_on} \
                             WHERE s.{probe_key} IS NULL \
                             UNION ALL \
                             SELECT {} FROM {source_sql} s",
                            column_list("t")?,
                            column_list("s")?
                        ))
                        .await?;
                    let combined_schema: SchemaRef = Arc::new(df.schema().as_arrow().clone());
                    let combined = df.collect().await?;
                    self.store.overwrite(table, combined_schema, combined).await?;
                }
            }
        }

        // Refresh the registration so queries observe the stored state.
        self.load(table).await?;
        debug!(
            engine.table = %table,
            engine.rows = rows,
            engine.mode = ?mode,
            "Handle persisted"
        );
        Ok(rows)
    }
}

//! Type-2 history merge into the publish and history sinks.
//!
//! The publish sink holds exactly the current version of every key; the
//! history sink is append-only and holds all versions, with superseded rows
//! closed by an end timestamp and a delete flag. Change detection is by
//! content hash over the non-key columns, so column-order-stable inputs
//! merge idempotently. Every result table is fully computed before the
//! first sink write, so a failed merge leaves both sinks untouched.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::DatasetDescriptor;
use crate::engine::{ComputeEngine, DataFusionEngine, TableHandle, WriteMode};
use crate::error::{DatacraftError, Result};
use crate::security::SqlGuard;

/// System columns appended to every merged row.
pub const SYS_COLUMNS: [&str; 5] = [
    "batch_id",
    "eff_strt_dt",
    "eff_end_dt",
    "sys_del_flg",
    "sys_checksum",
];

/// End timestamp marking a row as current.
pub const OPEN_END_TS: &str = "9999-12-31 23:59:59";

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Row movement counts for one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Keys seen for the first time.
    pub inserted: u64,
    /// Keys whose content hash changed; the old version was closed.
    pub updated: u64,
    /// Keys whose content hash matched; nothing was written for them.
    pub unchanged: u64,
}

impl MergeStats {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

/// Merges transformation output into a dataset's history and publish sinks.
pub struct HistoryMergeEngine {
    engine: Arc<DataFusionEngine>,
}

impl HistoryMergeEngine {
    pub fn new(engine: Arc<DataFusionEngine>) -> Self {
        Self { engine }
    }

    /// Merges `incoming` under SCD2 semantics.
    ///
    /// Keys absent from the batch stay current in both sinks; the merge
    /// never deletes. Null or within-batch duplicated keys abort with
    /// [`DatacraftError::AmbiguousKey`] before anything is written.
    pub async fn merge(
        &self,
        incoming: &TableHandle,
        descriptor: &DatasetDescriptor,
        batch_id: i64,
        run_ts: DateTime<Utc>,
    ) -> Result<MergeStats> {
        let keys = &descriptor.primary_keys;
        if keys.is_empty() {
            return Err(DatacraftError::configuration(format!(
                "dataset {} has no primary keys; SCD2 merge needs at least one",
                descriptor.dataset_id
            )));
        }
        for key in keys {
            SqlGuard::validate_identifier(key)?;
        }

        let business_cols: Vec<String> = self
            .engine
            .columns(incoming)
            .await?
            .into_iter()
            .filter(|c| !SYS_COLUMNS.contains(&c.as_str()))
            .collect();
        for column in keys {
            if !business_cols.contains(column) {
                return Err(DatacraftError::configuration(format!(
                    "primary key column '{column}' is missing from the merge input"
                )));
            }
        }

        self.check_key_ambiguity(incoming, descriptor, keys).await?;

        let staged = self
            .stage(incoming, &business_cols, keys, batch_id, run_ts)
            .await?;
        let staged_cols: Vec<String> = business_cols
            .iter()
            .cloned()
            .chain(SYS_COLUMNS.iter().map(|c| c.to_string()))
            .collect();
        let staged_total = self.engine.row_count(&staged).await?;

        let store = self.engine.store();
        if !store.exists(&descriptor.publish_table).await {
            // First merge for this dataset: everything is an insert.
            self.engine
                .write(&staged, &descriptor.publish_table, WriteMode::Overwrite, &[])
                .await?;
            self.engine
                .write(&staged, &descriptor.history_table, WriteMode::Overwrite, &[])
                .await?;
            let stats = MergeStats {
                inserted: staged_total,
                ..Default::default()
            };
            self.log_stats(descriptor, &stats);
            return Ok(stats);
        }

        let publish = self.engine.load(&descriptor.publish_table).await?;
        let history = self.engine.load(&descriptor.history_table).await?;
        let publish_cols: Vec<String> = self
            .engine
            .columns(&publish)
            .await?
            .into_iter()
            .collect();
        if publish_cols != staged_cols {
            let missing = staged_cols
                .iter()
                .filter(|c| !publish_cols.contains(c))
                .cloned()
                .collect();
            let extra = publish_cols
                .iter()
                .filter(|c| !staged_cols.contains(c))
                .cloned()
                .collect();
            return Err(DatacraftError::SchemaMismatch {
                table: descriptor.publish_table.clone(),
                missing,
                extra,
            });
        }

        let staged_sql = staged.sql_name()?;
        let publish_sql = publish.sql_name()?;
        let history_sql = history.sql_name()?;
        let key_join = join_condition("s", "p", keys)?;
        let probe = SqlGuard::escape_identifier(&keys[0])?;

        // Rows carrying a new key or new content.
        let changed = self
            .engine
            .sql(&format!(
                "SELECT {} FROM {staged_sql} s LEFT JOIN {publish_sql} p ON {key_join} \
                 WHERE p.{probe} IS NULL OR p.\"sys_checksum\" <> s.\"sys_checksum\"",
                column_list("s", &staged_cols)?
            ))
            .await?;
        let changed_total = self.engine.row_count(&changed).await?;
        if changed_total == 0 {
            let stats = MergeStats {
                unchanged: staged_total,
                ..Default::default()
            };
            self.log_stats(descriptor, &stats);
            return Ok(stats);
        }
        let changed_sql = changed.sql_name()?;
        let inserted = self
            .engine
            .count(&format!(
                "SELECT COUNT(*) FROM {changed_sql} s LEFT JOIN {publish_sql} p ON {key_join} \
                 WHERE p.{probe} IS NULL"
            ))
            .await?;

        // Current rows being superseded, closed for the history sink.
        let closed_list = staged_cols
            .iter()
            .map(|column| {
                let escaped = SqlGuard::escape_identifier(column)?;
                Ok(match column.as_str() {
                    "eff_end_dt" => format!(
                        "'{}' AS {escaped}",
                        run_ts.format(TS_FORMAT)
                    ),
                    "sys_del_flg" => format!("'Y' AS {escaped}"),
                    _ => format!("p.{escaped}"),
                })
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let superseded_join = join_condition("c", "p", keys)?;
        let closed = self
            .engine
            .sql(&format!(
                "SELECT {closed_list} FROM {publish_sql} p \
                 INNER JOIN {changed_sql} c ON {superseded_join} \
                 WHERE p.\"sys_checksum\" <> c.\"sys_checksum\""
            ))
            .await?;

        // Publish keeps everything the batch did not supersede.
        let untouched_join = join_condition("c", "p", keys)?;
        let publish_next = self
            .engine
            .sql(&format!(
                "SELECT {} FROM {publish_sql} p LEFT JOIN {changed_sql} c ON {untouched_join} \
                 WHERE c.{probe} IS NULL \
                 UNION ALL \
                 SELECT {} FROM {changed_sql} c",
                column_list("p", &staged_cols)?,
                column_list("c", &staged_cols)?
            ))
            .await?;

        // History keeps every row except the open versions being closed,
        // then gains the closed versions and the new ones.
        let closed_sql = closed.sql_name()?;
        let history_untouched_join = join_condition("x", "h", keys)?;
        let history_next = self
            .engine
            .sql(&format!(
                "SELECT {} FROM {history_sql} h LEFT JOIN {closed_sql} x ON {history_untouched_join} \
                 WHERE x.{probe} IS NULL OR h.\"eff_end_dt\" <> '{OPEN_END_TS}' \
                 UNION ALL \
                 SELECT {} FROM {closed_sql} x \
                 UNION ALL \
                 SELECT {} FROM {changed_sql} c",
                column_list("h", &staged_cols)?,
                column_list("x", &staged_cols)?,
                column_list("c", &staged_cols)?
            ))
            .await?;

        // Both results are materialized; sink writes start only now.
        self.engine
            .write(
                &publish_next,
                &descriptor.publish_table,
                WriteMode::Overwrite,
                &[],
            )
            .await?;
        self.engine
            .write(
                &history_next,
                &descriptor.history_table,
                WriteMode::Overwrite,
                &[],
            )
            .await?;

        let stats = MergeStats {
            inserted,
            updated: changed_total - inserted,
            unchanged: staged_total - changed_total,
        };
        self.log_stats(descriptor, &stats);
        Ok(stats)
    }

    async fn check_key_ambiguity(
        &self,
        incoming: &TableHandle,
        descriptor: &DatasetDescriptor,
        keys: &[String],
    ) -> Result<()> {
        let incoming_sql = incoming.sql_name()?;
        let null_predicate = keys
            .iter()
            .map(|k| Ok(format!("{} IS NULL", SqlGuard::escape_identifier(k)?)))
            .collect::<Result<Vec<_>>>()?
            .join(" OR ");
        let null_keys = self
            .engine
            .count(&format!(
                "SELECT COUNT(*) FROM {incoming_sql} WHERE {null_predicate}"
            ))
            .await?;
        if null_keys > 0 {
            return Err(DatacraftError::ambiguous_key(
                &descriptor.publish_table,
                format!("{null_keys} rows with null primary key columns"),
            ));
        }

        let group_by = keys
            .iter()
            .map(|k| SqlGuard::escape_identifier(k))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let duplicates = self
            .engine
            .count(&format!(
                "SELECT COALESCE(SUM(grp_count), 0) FROM ( \
                   SELECT COUNT(*) AS grp_count FROM {incoming_sql} \
                   GROUP BY {group_by} HAVING COUNT(*) > 1 \
                 ) dup_groups"
            ))
            .await?;
        if duplicates > 0 {
            return Err(DatacraftError::ambiguous_key(
                &descriptor.publish_table,
                format!("{duplicates} rows share a primary key within the batch"),
            ));
        }
        Ok(())
    }

    /// Appends the system columns to the incoming rows.
    async fn stage(
        &self,
        incoming: &TableHandle,
        business_cols: &[String],
        keys: &[String],
        batch_id: i64,
        run_ts: DateTime<Utc>,
    ) -> Result<TableHandle> {
        let hashed: Vec<&String> = business_cols.iter().filter(|c| !keys.contains(c)).collect();
        let checksum_expr = if hashed.is_empty() {
            "''".to_string()
        } else {
            let parts = hashed
                .iter()
                .map(|c| {
                    Ok(format!(
                        "coalesce(CAST({} AS VARCHAR), '')",
                        SqlGuard::escape_identifier(c)?
                    ))
                })
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            format!("encode(sha256(concat_ws('|', {parts})), 'hex')")
        };

        let business_list = business_cols
            .iter()
            .map(|c| SqlGuard::escape_identifier(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let incoming_sql = incoming.sql_name()?;
        self.engine
            .sql(&format!(
                "SELECT {business_list}, \
                 {batch_id} AS \"batch_id\", \
                 '{}' AS \"eff_strt_dt\", \
                 '{OPEN_END_TS}' AS \"eff_end_dt\", \
                 'N' AS \"sys_del_flg\", \
                 {checksum_expr} AS \"sys_checksum\" \
                 FROM {incoming_sql}",
                run_ts.format(TS_FORMAT)
            ))
            .await
    }

    fn log_stats(&self, descriptor: &DatasetDescriptor, stats: &MergeStats) {
        if stats.inserted == 0 && stats.updated == 0 {
            info!(
                merge.dataset_id = descriptor.dataset_id,
                merge.publish_table = %descriptor.publish_table,
                merge.unchanged = stats.unchanged,
                "Merge was a no-op"
            );
        } else {
            info!(
                merge.dataset_id = descriptor.dataset_id,
                merge.publish_table = %descriptor.publish_table,
                merge.inserted = stats.inserted,
                merge.updated = stats.updated,
                merge.unchanged = stats.unchanged,
                "Merge applied"
            );
        }
        // Keys absent from the batch stay current; surfacing that here keeps
        // the behavior visible to operators expecting deletions.
        if stats.total() == 0 {
            warn!(
                merge.dataset_id = descriptor.dataset_id,
                "Merge input was empty; existing records remain current"
            );
        }
    }
}

fn column_list(alias: &str, columns: &[String]) -> Result<String> {
    Ok(columns
        .iter()
        .map(|c| Ok(format!("{alias}.{}", SqlGuard::escape_identifier(c)?)))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn join_condition(left_alias: &str, right_alias: &str, keys: &[String]) -> Result<String> {
    Ok(keys
        .iter()
        .map(|k| {
            let key = SqlGuard::escape_identifier(k)?;
            Ok(format!("{left_alias}.{key} = {right_alias}.{key}"))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryTableStore, TableStore};
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use arrow::record_batch::RecordBatch;
    use chrono::TimeZone;

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor {
            process_id: 100,
            dataset_id: 7,
            dataset_name: "customers".to_string(),
            staging_table: "stg_customers".to_string(),
            transformation_table: "trf_customers".to_string(),
            history_table: "hist_customers".to_string(),
            publish_table: "pub_customers".to_string(),
            staging_partition_columns: vec![],
            transformation_partition_columns: vec![],
            publish_partition_columns: vec![],
            primary_keys: vec!["id".to_string()],
        }
    }

    fn customers(rows: &[(Option<i64>, &str)]) -> (SchemaRef, Vec<RecordBatch>) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("region", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(
                    rows.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter().map(|(_, r)| Some(*r)).collect::<Vec<_>>(),
                )),
            ],
        )
        .unwrap();
        (schema, vec![batch])
    }

    fn run_ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 25, hour, 0, 0).unwrap()
    }

    async fn engine_with(rows: &[(Option<i64>, &str)]) -> (Arc<DataFusionEngine>, TableHandle) {
        let store = Arc::new(MemoryTableStore::new());
        let (schema, batches) = customers(rows);
        store.overwrite("trf_customers", schema, batches).await.unwrap();
        let engine = Arc::new(DataFusionEngine::new(store));
        let handle = engine.load("trf_customers").await.unwrap();
        (engine, handle)
    }

    #[tokio::test]
    async fn first_merge_inserts_everything() {
        let (engine, incoming) = engine_with(&[(Some(1), "EMEA"), (Some(2), "APAC")]).await;
        let merge = HistoryMergeEngine::new(engine.clone());
        let stats = merge
            .merge(&incoming, &descriptor(), 42, run_ts(1))
            .await
            .unwrap();

        assert_eq!(stats, MergeStats { inserted: 2, updated: 0, unchanged: 0 });
        let open = engine
            .count(&format!(
                "SELECT COUNT(*) FROM pub_customers WHERE eff_end_dt = '{OPEN_END_TS}'"
            ))
            .await
            .unwrap();
        assert_eq!(open, 2);
    }

    #[tokio::test]
    async fn identical_rerun_is_a_no_op() {
        let (engine, incoming) = engine_with(&[(Some(1), "EMEA"), (Some(2), "APAC")]).await;
        let merge = HistoryMergeEngine::new(engine.clone());
        merge.merge(&incoming, &descriptor(), 42, run_ts(1)).await.unwrap();
        let stats = merge
            .merge(&incoming, &descriptor(), 43, run_ts(2))
            .await
            .unwrap();

        assert_eq!(stats, MergeStats { inserted: 0, updated: 0, unchanged: 2 });
        // No second version appeared anywhere.
        assert_eq!(engine.count("SELECT COUNT(*) FROM hist_customers").await.unwrap(), 2);
        let stale_batch = engine
            .count("SELECT COUNT(*) FROM pub_customers WHERE batch_id <> 42")
            .await
            .unwrap();
        assert_eq!(stale_batch, 0);
    }

    #[tokio::test]
    async fn changed_row_closes_the_old_version() {
        let (engine, incoming) = engine_with(&[(Some(1), "EMEA"), (Some(2), "APAC")]).await;
        let merge = HistoryMergeEngine::new(engine.clone());
        merge.merge(&incoming, &descriptor(), 42, run_ts(1)).await.unwrap();

        let (schema, batches) = customers(&[(Some(1), "LATAM"), (Some(2), "APAC")]);
        engine
            .store()
            .overwrite("trf_customers", schema, batches)
            .await
            .unwrap();
        let second = engine.load("trf_customers").await.unwrap();
        let stats = merge
            .merge(&second, &descriptor(), 43, run_ts(2))
            .await
            .unwrap();

        assert_eq!(stats, MergeStats { inserted: 0, updated: 1, unchanged: 1 });

        // Publish holds exactly one current row per key.
        assert_eq!(engine.count("SELECT COUNT(*) FROM pub_customers").await.unwrap(), 2);
        let current = engine
            .count("SELECT COUNT(*) FROM pub_customers WHERE id = 1 AND region = 'LATAM'")
            .await
            .unwrap();
        assert_eq!(current, 1);

        // History carries both versions of key 1, the old one closed.
        assert_eq!(engine.count("SELECT COUNT(*) FROM hist_customers WHERE id = 1").await.unwrap(), 2);
        let closed = engine
            .count(
                "SELECT COUNT(*) FROM hist_customers \
                 WHERE id = 1 AND sys_del_flg = 'Y' AND eff_end_dt = '2026-08-25 02:00:00'",
            )
            .await
            .unwrap();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn missing_keys_are_never_deleted() {
        let (engine, incoming) = engine_with(&[(Some(1), "EMEA"), (Some(2), "APAC")]).await;
        let merge = HistoryMergeEngine::new(engine.clone());
        merge.merge(&incoming, &descriptor(), 42, run_ts(1)).await.unwrap();

        // Key 2 disappears from the batch; key 3 is new.
        let (schema, batches) = customers(&[(Some(1), "EMEA"), (Some(3), "AMER")]);
        engine
            .store()
            .overwrite("trf_customers", schema, batches)
            .await
            .unwrap();
        let second = engine.load("trf_customers").await.unwrap();
        let stats = merge
            .merge(&second, &descriptor(), 43, run_ts(2))
            .await
            .unwrap();

        assert_eq!(stats, MergeStats { inserted: 1, updated: 0, unchanged: 1 });
        assert_eq!(engine.count("SELECT COUNT(*) FROM pub_customers").await.unwrap(), 3);
        let survivor = engine
            .count("SELECT COUNT(*) FROM pub_customers WHERE id = 2")
            .await
            .unwrap();
        assert_eq!(survivor, 1);
    }

    #[tokio::test]
    async fn null_keys_abort_without_writing() {
        let (engine, incoming) = engine_with(&[(Some(1), "EMEA"), (None, "APAC")]).await;
        let merge = HistoryMergeEngine::new(engine.clone());
        let err = merge
            .merge(&incoming, &descriptor(), 42, run_ts(1))
            .await
            .unwrap_err();

        assert!(matches!(err, DatacraftError::AmbiguousKey { .. }));
        assert!(!engine.store().exists("pub_customers").await);
        assert!(!engine.store().exists("hist_customers").await);
    }

    #[tokio::test]
    async fn duplicate_keys_abort_and_leave_sinks_intact() {
        let (engine, incoming) = engine_with(&[(Some(1), "EMEA"), (Some(2), "APAC")]).await;
        let merge = HistoryMergeEngine::new(engine.clone());
        merge.merge(&incoming, &descriptor(), 42, run_ts(1)).await.unwrap();
        let before = engine.count("SELECT COUNT(*) FROM pub_customers").await.unwrap();

        let (schema, batches) = customers(&[(Some(5), "EMEA"), (Some(5), "APAC")]);
        engine
            .store()
            .overwrite("trf_customers", schema, batches)
            .await
            .unwrap();
        let second = engine.load("trf_customers").await.unwrap();
        let err = merge
            .merge(&second, &descriptor(), 43, run_ts(2))
            .await
            .unwrap_err();

        assert!(matches!(err, DatacraftError::AmbiguousKey { .. }));
        let publish = engine.load("pub_customers").await.unwrap();
        assert_eq!(engine.row_count(&publish).await.unwrap(), before);
    }
}

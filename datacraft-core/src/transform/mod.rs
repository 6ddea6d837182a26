//! Metadata-driven transformation steps.
//!
//! A dataset's output is built by folding its dependency edges in plan
//! order: the first edge's input becomes the base, and every later edge
//! combines its input into the accumulated result. Steps never mutate their
//! inputs; each produces a fresh handle, so a failed step leaves nothing
//! half-applied.

use std::sync::Arc;
use tracing::debug;

use crate::config::{DependencyEdge, JoinHow, TransformationKind};
use crate::engine::{ComputeEngine, TableHandle};
use crate::error::{DatacraftError, Result};
use crate::security::SqlGuard;

/// Executes configured transformation steps against a compute engine.
pub struct TransformationEngine {
    engine: Arc<dyn ComputeEngine>,
}

impl TransformationEngine {
    pub fn new(engine: Arc<dyn ComputeEngine>) -> Self {
        Self { engine }
    }

    /// Executes one edge, combining `dep` into the accumulated output.
    ///
    /// With no accumulator the edge establishes the base: join and direct
    /// steps pass their input through, union steps project it into the
    /// configured column shape. `output_columns` is the dataset's declared
    /// column order; empty means no column metadata, shapes pass through.
    pub async fn execute_step(
        &self,
        edge: &DependencyEdge,
        acc: Option<&TableHandle>,
        dep: &TableHandle,
        output_columns: &[String],
    ) -> Result<TableHandle> {
        let result = match (&edge.transformation, acc) {
            (TransformationKind::Custom { query }, _) => {
                let params = edge
                    .extra_values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.engine.sql_with_params(query, params).await?
            }
            (TransformationKind::Direct, None) => dep.clone(),
            (TransformationKind::Direct, Some(_)) => {
                return Err(DatacraftError::configuration(format!(
                    "dataset {}: a direct transformation cannot follow earlier steps",
                    edge.dataset_id
                )))
            }
            (TransformationKind::Join { .. }, None) => dep.clone(),
            (
                TransformationKind::Join {
                    how,
                    left_on,
                    right_on,
                },
                Some(acc),
            ) => {
                self.join(edge, acc, dep, *how, left_on, right_on).await?
            }
            (TransformationKind::Union, None) => {
                self.union_source(edge, dep, output_columns).await?
            }
            (TransformationKind::Union, Some(acc)) => {
                let projected = self.union_source(edge, dep, output_columns).await?;
                if output_columns.is_empty() {
                    // No declared shape to project into; both sides must
                    // already agree before the union.
                    let acc_columns = self.engine.columns(acc).await?;
                    let dep_columns = self.engine.columns(&projected).await?;
                    if acc_columns != dep_columns {
                        let missing = acc_columns
                            .iter()
                            .filter(|c| !dep_columns.contains(c))
                            .cloned()
                            .collect();
                        let extra = dep_columns
                            .iter()
                            .filter(|c| !acc_columns.contains(c))
                            .cloned()
                            .collect();
                        return Err(DatacraftError::SchemaMismatch {
                            table: projected.name().to_string(),
                            missing,
                            extra,
                        });
                    }
                }
                let acc_sql = acc.sql_name()?;
                let dep_sql = projected.sql_name()?;
                self.engine
                    .sql(&format!(
                        "SELECT * FROM {acc_sql} UNION ALL SELECT * FROM {dep_sql}"
                    ))
                    .await?
            }
        };

        debug!(
            step.dataset_id = edge.dataset_id,
            step.dependent_dataset_id = edge.dependent_dataset_id,
            step.transformation_step = edge.transformation_step,
            step.kind = edge.transformation.kind(),
            step.output = %result,
            "Transformation step executed"
        );
        Ok(result)
    }

    /// Projects a handle into the dataset's declared column order.
    pub async fn project(
        &self,
        handle: &TableHandle,
        output_columns: &[String],
        table: &str,
    ) -> Result<TableHandle> {
        if output_columns.is_empty() {
            return Ok(handle.clone());
        }
        let available = self.engine.columns(handle).await?;
        let missing: Vec<String> = output_columns
            .iter()
            .filter(|c| !available.contains(c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let extra = available
                .iter()
                .filter(|c| !output_columns.contains(c))
                .cloned()
                .collect();
            return Err(DatacraftError::SchemaMismatch {
                table: table.to_string(),
                missing,
                extra,
            });
        }

        let select = output_columns
            .iter()
            .map(|c| SqlGuard::escape_identifier(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let from = handle.sql_name()?;
        self.engine
            .sql(&format!("SELECT {select} FROM {from}"))
            .await
    }

    async fn join(
        &self,
        edge: &DependencyEdge,
        acc: &TableHandle,
        dep: &TableHandle,
        how: JoinHow,
        left_on: &[String],
        right_on: &[String],
    ) -> Result<TableHandle> {
        if left_on.is_empty() || left_on.len() != right_on.len() {
            return Err(DatacraftError::configuration(format!(
                "dataset {}: join key count mismatch ({} left vs {} right)",
                edge.dataset_id,
                left_on.len(),
                right_on.len()
            )));
        }

        let left_columns = self.engine.columns(acc).await?;
        let right_columns = self.engine.columns(dep).await?;

        let mut select = Vec::with_capacity(left_columns.len() + right_columns.len());
        for column in &left_columns {
            select.push(format!("t.{}", SqlGuard::escape_identifier(column)?));
        }
        for column in &right_columns {
            if right_on.contains(column) {
                continue;
            }
            let escaped = SqlGuard::escape_identifier(column)?;
            if left_columns.contains(column) {
                // Collisions keep both sides; the right one is renamed
                // deterministically after the dataset it came from.
                let alias = SqlGuard::escape_identifier(&format!(
                    "{column}_r{}",
                    edge.dependent_dataset_id
                ))?;
                select.push(format!("s.{escaped} AS {alias}"));
            } else {
                select.push(format!("s.{escaped}"));
            }
        }

        let join_kind = match how {
            JoinHow::Inner => "INNER JOIN",
            JoinHow::Left => "LEFT JOIN",
            JoinHow::Outer => "FULL OUTER JOIN",
        };
        let on = left_on
            .iter()
            .zip(right_on)
            .map(|(l, r)| {
                Ok(format!(
                    "t.{} = s.{}",
                    SqlGuard::escape_identifier(l)?,
                    SqlGuard::escape_identifier(r)?
                ))
            })
            .collect::<Result<Vec<_>>>()?
            .join(" AND ");

        let acc_sql = acc.sql_name()?;
        let dep_sql = dep.sql_name()?;
        self.engine
            .sql(&format!(
                "SELECT {} FROM {acc_sql} t {join_kind} {dep_sql} s ON {on}",
                select.join(", ")
            ))
            .await
    }

    /// Projects one union source into the configured shape, filling declared
    /// columns from the edge's literal values where the source lacks them.
    async fn union_source(
        &self,
        edge: &DependencyEdge,
        dep: &TableHandle,
        output_columns: &[String],
    ) -> Result<TableHandle> {
        if output_columns.is_empty() {
            return Ok(dep.clone());
        }
        let available = self.engine.columns(dep).await?;
        let missing: Vec<String> = output_columns
            .iter()
            .filter(|c| !available.contains(c) && !edge.extra_values.contains_key(*c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let extra = available
                .iter()
                .filter(|c| !output_columns.contains(c))
                .cloned()
                .collect();
            return Err(DatacraftError::SchemaMismatch {
                table: dep.name().to_string(),
                missing,
                extra,
            });
        }

        let select = output_columns
            .iter()
            .map(|column| {
                let escaped = SqlGuard::escape_identifier(column)?;
                match edge.extra_values.get(column) {
                    Some(value) if !available.contains(column) => {
                        Ok(format!("{} AS {escaped}", SqlGuard::escape_literal(value)))
                    }
                    _ => Ok(escaped),
                }
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let from = dep.sql_name()?;
        self.engine
            .sql(&format!("SELECT {select} FROM {from}"))
            .await
    }
}

//! Rule evaluation against a staged table.
//!
//! Most rule kinds compile to a pair of `COUNT` queries (denominator and
//! failing rows) pushed down to the compute engine, so only two scalars come
//! back per rule. Date validity and custom checks pull the filtered column
//! out and evaluate row by row, since their predicates have no SQL
//! equivalent.

use arrow::array::{Array, ArrayRef, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use chrono::{NaiveDate, NaiveDateTime};
use datafusion::prelude::SessionContext;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::CustomCheckRegistry;
use super::{QualityReport, RuleOutcome, RuleStatus};
use crate::config::{QcType, QualityRule};
use crate::error::{DatacraftError, Result};
use crate::security::SqlGuard;

/// Evaluates quality rules against tables registered in a session context.
pub struct QualityEngine {
    ctx: Arc<SessionContext>,
    registry: CustomCheckRegistry,
}

impl QualityEngine {
    pub fn new(ctx: Arc<SessionContext>, registry: CustomCheckRegistry) -> Self {
        Self { ctx, registry }
    }

    /// Evaluates every rule against `table` and reports all outcomes.
    ///
    /// Rules never see each other's results: a failing rule does not narrow
    /// the rows later rules examine. An `Err` here means a rule could not be
    /// evaluated at all, not that data failed a check.
    pub async fn evaluate(
        &self,
        table: &str,
        dataset_id: i64,
        rules: &[&QualityRule],
    ) -> Result<QualityReport> {
        let mut outcomes = Vec::with_capacity(rules.len());
        for rule in rules {
            let outcome = self.evaluate_rule(table, rule).await?;
            debug!(
                rule.qc_id = rule.qc_id,
                rule.name = %outcome.rule,
                rule.total_rows = outcome.total_rows,
                rule.failed_rows = outcome.failed_rows,
                rule.error_pct = outcome.error_pct,
                rule.status = ?outcome.status,
                "Quality rule evaluated"
            );
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| !o.passed()).count();
        if failed > 0 {
            warn!(
                quality.dataset_id = dataset_id,
                quality.table = %table,
                quality.rules = outcomes.len(),
                quality.failed = failed,
                "Quality validation finished with failures"
            );
        } else {
            info!(
                quality.dataset_id = dataset_id,
                quality.table = %table,
                quality.rules = outcomes.len(),
                "Quality validation passed"
            );
        }

        Ok(QualityReport {
            dataset_id,
            outcomes,
        })
    }

    async fn evaluate_rule(&self, table: &str, rule: &QualityRule) -> Result<RuleOutcome> {
        let table_sql = SqlGuard::escape_identifier(table)?;
        let column_sql = SqlGuard::escape_identifier(&rule.column_name)?;
        let filter_sql = match &rule.filter {
            Some(filter) => {
                SqlGuard::validate_filter(filter)?;
                filter.clone()
            }
            None => "TRUE".to_string(),
        };

        let total_rows = self
            .count(&format!(
                "SELECT COUNT(*) FROM {table_sql} WHERE {filter_sql}"
            ))
            .await?;
        if total_rows == 0 {
            // Nothing to examine; an empty denominator is a clean pass.
            return Ok(outcome_for(rule, 0, 0));
        }

        let failed_rows = match &rule.qc {
            QcType::NotNull => {
                self.count_failures(
                    &table_sql,
                    &filter_sql,
                    &format!(
                        "{column_sql} IS NULL OR trim(CAST({column_sql} AS VARCHAR)) = ''"
                    ),
                )
                .await?
            }
            // Every member of a duplicated group counts as failing, so a key
            // appearing three times contributes three failed rows.
            QcType::Uniqueness => {
                self.count(&format!(
                    "SELECT COALESCE(SUM(grp_count), 0) FROM ( \
                       SELECT COUNT(*) AS grp_count FROM {table_sql} \
                       WHERE {filter_sql} GROUP BY {column_sql} HAVING COUNT(*) > 1 \
                     ) dup_groups"
                ))
                .await?
            }
            QcType::NumericRange { min, max } => {
                self.count_failures(
                    &table_sql,
                    &filter_sql,
                    &format!(
                        "TRY_CAST({column_sql} AS DOUBLE) IS NULL \
                         OR TRY_CAST({column_sql} AS DOUBLE) < {min} \
                         OR TRY_CAST({column_sql} AS DOUBLE) > {max}"
                    ),
                )
                .await?
            }
            QcType::Length { min, max } => {
                self.count_failures(
                    &table_sql,
                    &filter_sql,
                    &format!(
                        "{column_sql} IS NULL \
                         OR char_length(CAST({column_sql} AS VARCHAR)) < {min} \
                         OR char_length(CAST({column_sql} AS VARCHAR)) > {max}"
                    ),
                )
                .await?
            }
            QcType::DomainMembership { allowed } => {
                let literals: Vec<String> =
                    allowed.iter().map(|v| SqlGuard::escape_literal(v)).collect();
                self.count_failures(
                    &table_sql,
                    &filter_sql,
                    &format!(
                        "{column_sql} IS NULL \
                         OR CAST({column_sql} AS VARCHAR) NOT IN ({})",
                        literals.join(", ")
                    ),
                )
                .await?
            }
            QcType::Regex { pattern } => {
                let pattern_sql = SqlGuard::escape_literal(pattern);
                self.count_failures(
                    &table_sql,
                    &filter_sql,
                    &format!(
                        "{column_sql} IS NULL \
                         OR NOT regexp_like(CAST({column_sql} AS VARCHAR), {pattern_sql})"
                    ),
                )
                .await?
            }
            QcType::DateValidity { format } => {
                self.count_invalid_dates(&table_sql, &column_sql, &filter_sql, format)
                    .await?
            }
            QcType::Custom { function } => {
                self.count_custom_failures(&table_sql, &column_sql, &filter_sql, function)
                    .await?
            }
        };

        Ok(outcome_for(rule, total_rows, failed_rows))
    }

    async fn count_failures(
        &self,
        table_sql: &str,
        filter_sql: &str,
        fail_predicate: &str,
    ) -> Result<u64> {
        self.count(&format!(
            "SELECT COUNT(*) FROM {table_sql} WHERE ({filter_sql}) AND ({fail_predicate})"
        ))
        .await
    }

    /// Runs a single-scalar count query.
    async fn count(&self, sql: &str) -> Result<u64> {
        let df = self.ctx.sql(sql).await?;
        let batches = df.collect().await?;
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

    async fn count_invalid_dates(
        &self,
        table_sql: &str,
        column_sql: &str,
        filter_sql: &str,
        format: &str,
    ) -> Result<u64> {
        let df = self
            .ctx
            .sql(&format!(
                "SELECT CAST({column_sql} AS VARCHAR) AS v FROM {table_sql} WHERE {filter_sql}"
            ))
            .await?;
        let batches = df.collect().await?;

        let mut failed = 0u64;
        for batch in &batches {
            // The engine may hand the VARCHAR back as a string-view column;
            // normalize to Utf8 before reading values.
            let column = cast(batch.column(0), &DataType::Utf8)?;
            let values = column
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| DatacraftError::engine("date column did not cast to VARCHAR"))?;
            for row in 0..values.len() {
                if values.is_null(row) {
                    failed += 1;
                    continue;
                }
                let text = values.value(row);
                let valid = NaiveDateTime::parse_from_str(text, format).is_ok()
                    || NaiveDate::parse_from_str(text, format).is_ok();
                if !valid {
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    async fn count_custom_failures(
        &self,
        table_sql: &str,
        column_sql: &str,
        filter_sql: &str,
        function: &str,
    ) -> Result<u64> {
        let check = self.registry.get(function).ok_or_else(|| {
            DatacraftError::configuration(format!(
                "custom check function '{function}' is not registered"
            ))
        })?;

        let df = self
            .ctx
            .sql(&format!(
                "SELECT {column_sql} FROM {table_sql} WHERE {filter_sql}"
            ))
            .await?;
        let batches = df.collect().await?;

        let mut failed = 0u64;
        for batch in &batches {
            let column: ArrayRef = Arc::clone(batch.column(0));
            let mask = check(&column)?;
            if mask.len() != column.len() {
                return Err(DatacraftError::engine(format!(
                    "custom check '{function}' returned a mask of length {} for {} rows",
                    mask.len(),
                    column.len()
                )));
            }
            // Null in the mask means the check could not decide; counted as
            // a failure, same as the SQL predicates treat null input.
            for row in 0..mask.len() {
                if mask.is_null(row) || !mask.value(row) {
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }
}

fn outcome_for(rule: &QualityRule, total_rows: u64, failed_rows: u64) -> RuleOutcome {
    let error_pct = if total_rows == 0 {
        0.0
    } else {
        failed_rows as f64 / total_rows as f64 * 100.0
    };
    let violated = match rule.threshold_pct {
        Some(threshold) => error_pct > threshold,
        None => failed_rows > 0,
    };
    RuleOutcome {
        qc_id: rule.qc_id,
        rule: rule.name(),
        column: rule.column_name.clone(),
        criticality: rule.criticality,
        total_rows,
        failed_rows,
        error_pct,
        threshold_pct: rule.threshold_pct,
        status: if violated {
            RuleStatus::Failed
        } else {
            RuleStatus::Passed
        },
    }
}

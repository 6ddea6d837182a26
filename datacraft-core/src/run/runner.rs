//! Dataset run orchestration.
//!
//! One dataset run is resolve, transform, validate, merge, in that order,
//! with a run-log record per phase. Groups from the execution plan run
//! their dataset partitions as parallel tasks bounded by a worker budget;
//! edges of one dataset always fold sequentially. A failure aborts the
//! remaining phases of that dataset only.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::info;

use super::context::RunContext;
use super::log::{RunLogSink, TracingLogSink};
use crate::config::{
    ConfigSnapshot, DatasetDescriptor, DependencyEdge, RunLogRecord, RunPhase,
};
use crate::dqm::{CriticalityPolicy, CustomCheckRegistry, QualityEngine, QualityReport};
use crate::engine::{ComputeEngine, DataFusionEngine, TableHandle, WriteMode};
use crate::error::{DatacraftError, Result};
use crate::resolver::{DependencyResolver, ExecutionPlan};
use crate::scd2::{HistoryMergeEngine, MergeStats};
use crate::transform::TransformationEngine;

/// Orchestrates dataset runs over a compute engine and a configuration
/// snapshot.
pub struct PipelineRunner {
    engine: Arc<DataFusionEngine>,
    snapshot: Arc<ConfigSnapshot>,
    sink: Arc<dyn RunLogSink>,
    policy: CriticalityPolicy,
    registry: CustomCheckRegistry,
    max_workers: usize,
}

/// Builder for [`PipelineRunner`].
pub struct PipelineRunnerBuilder {
    engine: Arc<DataFusionEngine>,
    snapshot: Arc<ConfigSnapshot>,
    sink: Option<Arc<dyn RunLogSink>>,
    policy: CriticalityPolicy,
    registry: CustomCheckRegistry,
    max_workers: Option<usize>,
}

impl PipelineRunnerBuilder {
    pub fn log_sink(mut self, sink: Arc<dyn RunLogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn criticality_policy(mut self, policy: CriticalityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn custom_checks(mut self, registry: CustomCheckRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Upper bound on concurrent transformation tasks. Defaults to the
    /// machine's logical CPU count.
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers.max(1));
        self
    }

    pub fn build(self) -> PipelineRunner {
        PipelineRunner {
            engine: self.engine,
            snapshot: self.snapshot,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingLogSink)),
            policy: self.policy,
            registry: self.registry,
            max_workers: self.max_workers.unwrap_or_else(num_cpus::get),
        }
    }
}

impl PipelineRunner {
    pub fn builder(
        engine: Arc<DataFusionEngine>,
        snapshot: Arc<ConfigSnapshot>,
    ) -> PipelineRunnerBuilder {
        PipelineRunnerBuilder {
            engine,
            snapshot,
            sink: None,
            policy: CriticalityPolicy::default(),
            registry: CustomCheckRegistry::new(),
            max_workers: None,
        }
    }

    /// Runs one dataset end to end and returns its merge statistics.
    pub async fn run_dataset(&self, ctx: &RunContext, dataset_id: i64) -> Result<MergeStats> {
        let descriptor = self.snapshot.dataset(ctx.process_id, dataset_id)?.clone();
        info!(
            run.process_id = ctx.process_id,
            run.dataset_id = dataset_id,
            run.batch_id = ctx.batch_id,
            "Dataset run starting"
        );

        let plan = self.resolve_phase(ctx, &descriptor)?;
        let output = self.transform_phase(ctx, &descriptor, &plan).await?;
        self.quality_phase(ctx, &descriptor, &descriptor.transformation_table)
            .await?;
        self.merge_phase(ctx, &descriptor, &output).await
    }

    /// Runs several datasets, isolating failures: one dataset's error never
    /// stops its siblings.
    pub async fn run_datasets(
        &self,
        ctx: &RunContext,
        dataset_ids: &[i64],
    ) -> Vec<(i64, Result<MergeStats>)> {
        let mut results = Vec::with_capacity(dataset_ids.len());
        for &dataset_id in dataset_ids {
            results.push((dataset_id, self.run_dataset(ctx, dataset_id).await));
        }
        results
    }

    /// Standalone quality pass over a dataset's staged input, without
    /// transforming or merging.
    pub async fn validate_dataset(
        &self,
        ctx: &RunContext,
        dataset_id: i64,
    ) -> Result<QualityReport> {
        let descriptor = self.snapshot.dataset(ctx.process_id, dataset_id)?.clone();
        self.quality_phase(ctx, &descriptor, &descriptor.staging_table)
            .await
    }

    fn resolve_phase(
        &self,
        ctx: &RunContext,
        descriptor: &DatasetDescriptor,
    ) -> Result<ExecutionPlan> {
        let record = self.start_record(ctx, descriptor, RunPhase::Resolution);
        let edges = self.snapshot.edges_for(ctx.process_id);
        match DependencyResolver::resolve(&edges, descriptor.dataset_id) {
            Ok(plan) => {
                self.sink.record(record.succeeded(Some(format!(
                    "{} groups, {} edges",
                    plan.groups.len(),
                    plan.edge_count()
                ))));
                Ok(plan)
            }
            Err(error) => {
                self.sink.record(record.failed(failure_detail(&error)));
                Err(error)
            }
        }
    }

    async fn transform_phase(
        &self,
        ctx: &RunContext,
        descriptor: &DatasetDescriptor,
        plan: &ExecutionPlan,
    ) -> Result<TableHandle> {
        let record = self.start_record(ctx, descriptor, RunPhase::Transformation);
        match self.execute_plan(ctx, descriptor, plan).await {
            Ok(handle) => {
                self.sink
                    .record(record.succeeded(Some(format!("output={}", handle))));
                Ok(handle)
            }
            Err(error) => {
                self.sink.record(record.failed(failure_detail(&error)));
                Err(error)
            }
        }
    }

    async fn execute_plan(
        &self,
        ctx: &RunContext,
        descriptor: &DatasetDescriptor,
        plan: &ExecutionPlan,
    ) -> Result<TableHandle> {
        let transform = Arc::new(TransformationEngine::new(
            self.engine.clone() as Arc<dyn ComputeEngine>
        ));
        let outputs: Arc<Mutex<HashMap<i64, TableHandle>>> = Arc::new(Mutex::new(HashMap::new()));

        for group in &plan.groups {
            let mut partitions: BTreeMap<i64, Vec<DependencyEdge>> = BTreeMap::new();
            for edge in &group.edges {
                partitions
                    .entry(edge.dataset_id)
                    .or_default()
                    .push(edge.clone());
            }

            let semaphore = Arc::new(Semaphore::new(self.max_workers));
            let mut tasks: JoinSet<Result<()>> = JoinSet::new();
            for (partition_dataset, edges) in partitions {
                let partition_descriptor = self
                    .snapshot
                    .dataset(ctx.process_id, partition_dataset)?
                    .clone();
                let partition_columns = self.output_columns(&partition_descriptor);
                let semaphore = Arc::clone(&semaphore);
                let outputs = Arc::clone(&outputs);
                let transform = Arc::clone(&transform);
                let engine = Arc::clone(&self.engine);
                let snapshot = Arc::clone(&self.snapshot);
                let process_id = ctx.process_id;

                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| {
                        DatacraftError::Internal("worker semaphore closed".to_string())
                    })?;
                    let mut acc = outputs.lock().await.get(&partition_dataset).cloned();
                    for edge in &edges {
                        let dep = resolve_input(
                            &engine,
                            &snapshot,
                            &outputs,
                            process_id,
                            edge.dependent_dataset_id,
                        )
                        .await?;
                        let next = transform
                            .execute_step(edge, acc.as_ref(), &dep, &partition_columns)
                            .await?;
                        acc = Some(next);
                    }
                    if let Some(handle) = acc {
                        outputs.lock().await.insert(partition_dataset, handle);
                    }
                    Ok(())
                });
            }
            // Group barrier: every partition finishes before the next group.
            while let Some(joined) = tasks.join_next().await {
                joined.map_err(|e| {
                    DatacraftError::Internal(format!("transformation task panicked: {e}"))
                })??;
            }
        }

        let produced = outputs.lock().await.get(&descriptor.dataset_id).cloned();
        let raw = match produced {
            Some(handle) => handle,
            // Leaf dataset: its staged input passes straight through.
            None => self.engine.load(&descriptor.staging_table).await?,
        };
        let projected = transform
            .project(
                &raw,
                &self.output_columns(descriptor),
                &descriptor.transformation_table,
            )
            .await?;
        self.engine
            .write(
                &projected,
                &descriptor.transformation_table,
                WriteMode::Overwrite,
                &[],
            )
            .await?;
        self.engine.load(&descriptor.transformation_table).await
    }

    async fn quality_phase(
        &self,
        ctx: &RunContext,
        descriptor: &DatasetDescriptor,
        table: &str,
    ) -> Result<QualityReport> {
        let record = self.start_record(ctx, descriptor, RunPhase::Quality);
        match self.quality_check(ctx, descriptor, table).await {
            Ok(report) => {
                self.sink.record(record.succeeded(Some(format!(
                    "{} rules evaluated",
                    report.outcomes.len()
                ))));
                Ok(report)
            }
            Err(error) => {
                self.sink.record(record.failed(failure_detail(&error)));
                Err(error)
            }
        }
    }

    async fn quality_check(
        &self,
        ctx: &RunContext,
        descriptor: &DatasetDescriptor,
        table: &str,
    ) -> Result<QualityReport> {
        let rules = self
            .snapshot
            .active_rules_for(ctx.process_id, descriptor.dataset_id);
        if rules.is_empty() {
            return Ok(QualityReport {
                dataset_id: descriptor.dataset_id,
                outcomes: Vec::new(),
            });
        }

        self.engine.load(table).await?;
        let quality = QualityEngine::new(self.engine.ctx(), self.registry.clone());
        let report = quality.evaluate(table, descriptor.dataset_id, &rules).await?;

        for outcome in &report.outcomes {
            let record = self.start_record(ctx, descriptor, RunPhase::Quality);
            let detail = format!(
                "{} failed_rows={} error_pct={:.2}",
                outcome.rule, outcome.failed_rows, outcome.error_pct
            );
            self.sink.record(if outcome.passed() {
                record.succeeded(Some(detail))
            } else {
                record.failed(detail)
            });
        }

        report.enforce(&self.policy)?;
        Ok(report)
    }

    async fn merge_phase(
        &self,
        ctx: &RunContext,
        descriptor: &DatasetDescriptor,
        output: &TableHandle,
    ) -> Result<MergeStats> {
        let record = self.start_record(ctx, descriptor, RunPhase::Merge);
        let merge = HistoryMergeEngine::new(Arc::clone(&self.engine));
        match merge
            .merge(output, descriptor, ctx.batch_id, ctx.run_ts)
            .await
        {
            Ok(stats) => {
                self.sink.record(record.succeeded(Some(format!(
                    "inserted={} updated={} unchanged={}",
                    stats.inserted, stats.updated, stats.unchanged
                ))));
                Ok(stats)
            }
            Err(error) => {
                self.sink.record(record.failed(failure_detail(&error)));
                Err(error)
            }
        }
    }

    /// The dataset's declared output columns, in sequence order.
    fn output_columns(&self, descriptor: &DatasetDescriptor) -> Vec<String> {
        self.snapshot
            .columns_for(descriptor.dataset_id)
            .into_iter()
            .filter(|c| c.table_name == descriptor.transformation_table)
            .map(|c| c.column_name.clone())
            .collect()
    }

    fn start_record(
        &self,
        ctx: &RunContext,
        descriptor: &DatasetDescriptor,
        phase: RunPhase,
    ) -> RunLogRecord {
        RunLogRecord::start(ctx.process_id, descriptor.dataset_id, ctx.batch_id, phase)
    }
}

/// Finds the input for a dependency: a handle produced earlier in this run,
/// else the dependency's published current records, else its staged input.
async fn resolve_input(
    engine: &Arc<DataFusionEngine>,
    snapshot: &Arc<ConfigSnapshot>,
    outputs: &Arc<Mutex<HashMap<i64, TableHandle>>>,
    process_id: i64,
    dependent_dataset_id: i64,
) -> Result<TableHandle> {
    if let Some(handle) = outputs.lock().await.get(&dependent_dataset_id).cloned() {
        return Ok(handle);
    }
    let descriptor = snapshot.dataset(process_id, dependent_dataset_id)?;
    if engine.store().exists(&descriptor.publish_table).await {
        engine.load(&descriptor.publish_table).await
    } else {
        engine.load(&descriptor.staging_table).await
    }
}

fn failure_detail(error: &DatacraftError) -> String {
    format!("{}: {}", error.classification(), error)
}

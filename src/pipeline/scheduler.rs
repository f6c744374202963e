//! Run scheduling: map stages, barrier, balancing, reduce dispatch, finalize.
//!
//! Each map phase fans its tasks out with bounded concurrency and waits for all
//! of them before the next phase starts. Reduce tasks of every reference chunk
//! are interleaved in one pool, and their parts are handed to the coordinator
//! only once every worker has returned.

use super::balancer::{PartitionBalancer, PartitionPlan};
use super::coordinator::{MultipartCoordinator, UploadPart};
use super::metrics::{Metrics, MetricsReporter};
use super::reducer::{ReduceTask, ReduceWorker};
use super::stages::ChunkStages;
use super::task::TaskReport;
use super::telemetry::RunTelemetry;
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::index::{ChunkManifest, ChunkRef, KeyLayout, Stage, StageKey};
use crate::io::{ChunkSource, ObjectKey, RecordSource, Storage};
use crate::tool::ExternalTool;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent map-stage tasks
    pub map_concurrency: usize,

    /// Concurrent reduce workers, across all reference chunks
    pub reduce_concurrency: usize,

    /// Balance from key-count sidecars instead of querying pileups
    pub use_key_sidecars: bool,

    /// Only reduce reference chunks with ids in this inclusive range
    pub fasta_chunk_range: Option<[u32; 2]>,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<String>,

    /// Optional path to save task telemetry JSON after run completes
    pub telemetry_output_path: Option<String>,

    /// Store the telemetry JSON under the run prefix
    pub upload_telemetry: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            map_concurrency: 16,
            reduce_concurrency: 16,
            use_key_sidecars: true,
            fasta_chunk_range: None,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
            telemetry_output_path: None,
            upload_telemetry: true,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        let processing = &config.processing;
        Self {
            map_concurrency: processing.map_concurrency.max(1),
            reduce_concurrency: processing.reduce_concurrency.max(1),
            use_key_sidecars: processing.use_key_sidecars,
            fasta_chunk_range: config.run.fasta_chunk_range,
            enable_metrics: processing.enable_metrics,
            metrics_interval_secs: processing.metrics_interval_secs,
            metrics_output_path: processing.metrics_output_path.clone(),
            telemetry_output_path: processing.telemetry_output_path.clone(),
            upload_telemetry: processing.upload_telemetry,
        }
    }
}

/// Pileups of one reference chunk and the ranges they balance into.
#[derive(Debug, Clone)]
pub struct PartitionJob {
    pub fasta_id: u32,
    /// Pileup keys ordered by read chunk id
    pub sources: Vec<ObjectKey>,
    pub plan: PartitionPlan,
}

/// Drives one run end to end.
pub struct Scheduler {
    storage: Storage,
    stages: ChunkStages,
    balancer: PartitionBalancer,
    worker: ReduceWorker,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        storage: Storage,
        stages: ChunkStages,
        balancer: PartitionBalancer,
        worker: ReduceWorker,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            stages,
            balancer,
            worker,
            metrics,
            config,
        }
    }

    /// Wire up stages, balancer and reduce worker from a run configuration.
    pub fn from_config(
        config: &Config,
        storage: Storage,
        chunks: Arc<dyn ChunkSource>,
        records: Arc<dyn RecordSource>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let stages = ChunkStages::new(config, storage.clone(), chunks, metrics.clone());
        let balancer = PartitionBalancer::new(
            storage.clone(),
            records.clone(),
            config.processing.partition_budget,
            config.processing.reduce_concurrency,
            metrics.clone(),
        );
        let worker = ReduceWorker::new(
            storage.clone(),
            records,
            ExternalTool::new("reducer", config.tools.reducer.clone()),
            config.tools.threads(),
            config.processing.scratch_dir.clone(),
            metrics.clone(),
        );
        Self::new(
            storage,
            stages,
            balancer,
            worker,
            metrics,
            SchedulerConfig::from_config(config),
        )
    }

    pub fn layout(&self) -> &KeyLayout {
        self.stages.layout()
    }

    /// Run every phase for `manifest`.
    pub async fn run(&self, manifest: &ChunkManifest) -> Result<SchedulerStats> {
        let estimate = WorkEstimate::new(manifest);
        tracing::info!("Work estimate: {}", estimate);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                estimate.map_tasks() as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut stats = SchedulerStats::default();
        let mut telemetry = RunTelemetry::new(self.layout().run_id());
        let result = self.run_phases(manifest, &mut stats, &mut telemetry).await;

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        self.save_telemetry(&telemetry).await;
        for summary in telemetry.stage_summaries() {
            tracing::info!("Stage {}", summary);
        }
        if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                estimate.map_tasks() as u64,
            );
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        result.map(|_| stats)
    }

    async fn run_phases(
        &self,
        manifest: &ChunkManifest,
        stats: &mut SchedulerStats,
        telemetry: &mut RunTelemetry,
    ) -> Result<()> {
        self.map_phase(manifest, stats, telemetry).await?;

        let fasta_ids = self.reduce_fasta_ids(manifest);
        let fastq_ids: Vec<u32> = manifest.fastq.iter().map(|c| c.id).collect();
        let jobs = self.plan(&fasta_ids, &fastq_ids).await?;
        self.reduce_phase(jobs, stats, telemetry).await
    }

    /// Index build, alignment, index correction and pileup, one barrier after each.
    pub async fn map_phase(
        &self,
        manifest: &ChunkManifest,
        stats: &mut SchedulerStats,
        telemetry: &mut RunTelemetry,
    ) -> Result<()> {
        let n = self.config.map_concurrency;
        let stages = &self.stages;
        let pairs: Vec<(&ChunkRef, &ChunkRef)> = manifest
            .fasta
            .iter()
            .flat_map(|a| manifest.fastq.iter().map(move |q| (a, q)))
            .collect();
        let fasta_ids: Vec<u32> = manifest.fasta.iter().map(|c| c.id).collect();

        tracing::info!(
            "Scheduling {} reference x {} read chunks ({} concurrent)",
            manifest.fasta.len(),
            manifest.fastq.len(),
            n
        );

        let results: Vec<_> = stream::iter(&manifest.fasta)
            .map(|fasta| stages.build_index(fasta))
            .buffer_unordered(n)
            .collect()
            .await;
        tally(Stage::IndexBuild, results, stats, telemetry)?;

        let results: Vec<_> = stream::iter(&pairs)
            .map(|(fasta, fastq)| stages.align_and_filter(fasta, fastq))
            .buffer_unordered(n)
            .collect()
            .await;
        tally(Stage::AlignFilter, results, stats, telemetry)?;

        let fasta_ids = &fasta_ids;
        let results: Vec<_> = stream::iter(&manifest.fastq)
            .map(|fastq| stages.correct_index(fastq.id, fasta_ids))
            .buffer_unordered(n)
            .collect()
            .await;
        tally(Stage::IndexCorrection, results, stats, telemetry)?;

        let results: Vec<_> = stream::iter(&pairs)
            .map(|(fasta, fastq)| stages.pileup(fasta, fastq.id))
            .buffer_unordered(n)
            .collect()
            .await;
        tally(Stage::Pileup, results, stats, telemetry)?;

        Ok(())
    }

    fn reduce_fasta_ids(&self, manifest: &ChunkManifest) -> Vec<u32> {
        let mut manifest = manifest.clone();
        if let Some([first, last]) = self.config.fasta_chunk_range {
            manifest.restrict_fasta(first, last);
        }
        manifest.fasta.iter().map(|c| c.id).collect()
    }

    /// Pileups of `fastq_ids` for each of `fasta_ids`, ordered by read chunk.
    ///
    /// Every expected pileup must be stored. Pileups of other read chunks left
    /// under the same run are ignored.
    pub async fn pileups_by_fasta(
        &self,
        fasta_ids: &[u32],
        fastq_ids: &[u32],
    ) -> PipelineResult<BTreeMap<u32, Vec<ObjectKey>>> {
        let layout = self.layout();
        let stored: BTreeSet<ObjectKey> = self
            .storage
            .list(&layout.pileup_prefix())
            .await?
            .into_iter()
            .collect();
        let mut fastq_ids = fastq_ids.to_vec();
        fastq_ids.sort_unstable();
        fastq_ids.dedup();

        let mut grouped = BTreeMap::new();
        for &a in fasta_ids {
            let mut sources = Vec::with_capacity(fastq_ids.len());
            for &q in &fastq_ids {
                let key = layout.resolve(&StageKey::pileup(a, q));
                if !stored.contains(&key) {
                    return Err(PipelineError::MissingOutput {
                        stage: Stage::Pileup.to_string(),
                        key: key.to_string(),
                    });
                }
                sources.push(key);
            }
            grouped.insert(a, sources);
        }
        Ok(grouped)
    }

    /// Balance the pileups of each reference chunk into ranges.
    pub async fn plan(&self, fasta_ids: &[u32], fastq_ids: &[u32]) -> Result<Vec<PartitionJob>> {
        let layout = self.layout();
        let mut jobs = Vec::new();
        for (fasta_id, sources) in self.pileups_by_fasta(fasta_ids, fastq_ids).await? {
            let sidecars: Option<Vec<ObjectKey>> = if self.config.use_key_sidecars {
                let sidecars = sources
                    .iter()
                    .filter_map(|key| layout.parse(key))
                    .filter_map(|k| Some(StageKey::pileup_key_counts(k.fasta_chunk_id?, k.fastq_chunk_id?)))
                    .map(|k| layout.resolve(&k))
                    .collect();
                Some(sidecars)
            } else {
                None
            };

            let (plan, counts) = self
                .balancer
                .plan(&sources, sidecars.as_deref())
                .await
                .with_context(|| format!("Failed to balance pileups of reference chunk {}", fasta_id))?;
            tracing::info!(
                "Reference chunk {}: {} pileups, {} records, {} ranges",
                fasta_id,
                sources.len(),
                counts.total(),
                plan.len()
            );
            jobs.push(PartitionJob {
                fasta_id,
                sources,
                plan,
            });
        }
        Ok(jobs)
    }

    /// Open one upload per non-empty job, run every reduce task, then finalize.
    pub async fn reduce_phase(
        &self,
        jobs: Vec<PartitionJob>,
        stats: &mut SchedulerStats,
        telemetry: &mut RunTelemetry,
    ) -> Result<()> {
        let mut coordinator = MultipartCoordinator::new(self.storage.clone(), self.metrics.clone());
        let result = self
            .dispatch(&mut coordinator, jobs, stats, telemetry)
            .await;
        if result.is_err() {
            let aborted = coordinator.abort_incomplete().await;
            if aborted > 0 {
                tracing::warn!("Aborted {} incomplete multipart uploads", aborted);
            }
        }
        result
    }

    async fn dispatch(
        &self,
        coordinator: &mut MultipartCoordinator,
        jobs: Vec<PartitionJob>,
        stats: &mut SchedulerStats,
        telemetry: &mut RunTelemetry,
    ) -> Result<()> {
        let layout = self.layout();
        let mut tasks = Vec::new();
        for job in jobs {
            if job.plan.is_empty() {
                tracing::info!("Reference chunk {} has no records, nothing to reduce", job.fasta_id);
                continue;
            }
            let target = layout.resolve(&StageKey::merged(job.fasta_id));
            let upload_id = coordinator
                .create(job.fasta_id, target.clone(), job.plan.len() as u32)
                .await?;
            stats.partitions += 1;
            for (i, range) in job.plan.ranges().into_iter().enumerate() {
                tasks.push(ReduceTask {
                    partition_id: job.fasta_id,
                    range,
                    sources: job.sources.clone(),
                    target: target.clone(),
                    upload_id: upload_id.clone(),
                    part_number: i as u32 + 1,
                });
            }
        }

        stats.reduce_tasks = tasks.len();
        tracing::info!(
            "Dispatching {} reduce tasks over {} uploads ({} concurrent)",
            tasks.len(),
            stats.partitions,
            self.config.reduce_concurrency
        );

        let worker = &self.worker;
        let results: Vec<_> = stream::iter(&tasks)
            .map(|task| worker.run(task))
            .buffer_unordered(self.config.reduce_concurrency)
            .collect()
            .await;

        let mut parts: Vec<UploadPart> = Vec::with_capacity(results.len());
        let mut first_error: Option<PipelineError> = None;
        for result in results {
            match result {
                Ok(reduced) => {
                    telemetry.push(reduced.telemetry);
                    parts.push(reduced.part);
                }
                Err(e) => {
                    stats.tasks_failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(anyhow::Error::from(e).context(format!(
                "{} of {} reduce tasks failed",
                stats.tasks_failed,
                tasks.len()
            )));
        }

        stats.parts_uploaded = parts.len();
        coordinator.collect(parts)?;
        stats.uploads_completed = coordinator
            .finalize_all()
            .await
            .context("Failed to finalize multipart uploads")?;
        Ok(())
    }

    async fn save_telemetry(&self, telemetry: &RunTelemetry) {
        if let Some(ref path) = self.config.telemetry_output_path {
            if let Err(e) = telemetry.save_to_file(path) {
                tracing::warn!("Failed to save telemetry to {}: {}", path, e);
            }
        }
        if self.config.upload_telemetry {
            let key = self.layout().telemetry();
            let upload = match telemetry.to_json() {
                Ok(json) => self
                    .storage
                    .put(&key, Bytes::from(json))
                    .await
                    .map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = upload {
                tracing::warn!("Failed to store telemetry at {}: {}", key, e);
            }
        }
    }
}

/// Fold one phase's results into the run totals; any failure stops the run.
fn tally(
    stage: Stage,
    results: Vec<PipelineResult<TaskReport>>,
    stats: &mut SchedulerStats,
    telemetry: &mut RunTelemetry,
) -> Result<()> {
    let total = results.len();
    let mut failed = 0;
    let mut first_error = None;
    for result in results {
        stats.map_tasks += 1;
        match result {
            Ok(report) => {
                if report.outcome.is_skipped() {
                    stats.tasks_skipped += 1;
                } else {
                    stats.tasks_computed += 1;
                }
                telemetry.push(report.telemetry);
            }
            Err(e) => {
                failed += 1;
                stats.tasks_failed += 1;
                tracing::error!("{} task failed: {}", stage, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(anyhow::Error::from(e)
            .context(format!("{} failed for {} of {} tasks", stage, failed, total))),
        None => {
            tracing::info!("{} complete: {} tasks", stage, total);
            Ok(())
        }
    }
}

/// Statistics from a scheduler run.
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    /// Map-stage tasks attempted
    pub map_tasks: usize,

    /// Map-stage tasks that ran their tools
    pub tasks_computed: usize,

    /// Map-stage tasks whose outputs already existed
    pub tasks_skipped: usize,

    /// Tasks that failed, map or reduce
    pub tasks_failed: usize,

    /// Multipart uploads opened
    pub partitions: usize,

    /// Reduce tasks dispatched
    pub reduce_tasks: usize,

    pub parts_uploaded: usize,

    pub uploads_completed: usize,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Map: {} computed, {} skipped of {}; Reduce: {} parts over {} uploads, {} completed; Failed: {}",
            self.tasks_computed,
            self.tasks_skipped,
            self.map_tasks,
            self.parts_uploaded,
            self.partitions,
            self.uploads_completed,
            self.tasks_failed
        )
    }
}

/// Work estimate for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkEstimate {
    pub fasta_chunks: usize,
    pub fastq_chunks: usize,
    pub pairs: usize,
}

impl WorkEstimate {
    pub fn new(manifest: &ChunkManifest) -> Self {
        Self {
            fasta_chunks: manifest.fasta.len(),
            fastq_chunks: manifest.fastq.len(),
            pairs: manifest.pair_count(),
        }
    }

    /// Index builds + alignments + corrections + pileups.
    pub fn map_tasks(&self) -> usize {
        self.fasta_chunks + 2 * self.pairs + self.fastq_chunks
    }
}

impl std::fmt::Display for WorkEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Reference chunks: {}, Read chunks: {}, Pairs: {}, Map tasks: {}",
            self.fasta_chunks,
            self.fastq_chunks,
            self.pairs,
            self.map_tasks()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u32) -> ChunkRef {
        ChunkRef {
            id,
            source_locator: format!("s3://bucket/in/{}", id),
            byte_range: None,
        }
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.map_concurrency, 16);
        assert!(config.use_key_sidecars);
        assert!(config.enable_metrics);
        assert!(config.metrics_output_path.is_none());
    }

    #[test]
    fn test_scheduler_stats_display() {
        let stats = SchedulerStats {
            map_tasks: 100,
            tasks_computed: 80,
            tasks_skipped: 15,
            tasks_failed: 5,
            partitions: 3,
            reduce_tasks: 12,
            parts_uploaded: 12,
            uploads_completed: 3,
        };

        let display = format!("{}", stats);
        assert!(display.contains("80 computed"));
        assert!(display.contains("15 skipped"));
        assert!(display.contains("Failed: 5"));
    }

    #[test]
    fn test_work_estimate() {
        let manifest = ChunkManifest {
            fasta: vec![chunk(0), chunk(1)],
            fastq: vec![chunk(0), chunk(1), chunk(2)],
        };
        let estimate = WorkEstimate::new(&manifest);
        assert_eq!(estimate.pairs, 6);
        assert_eq!(estimate.map_tasks(), 2 + 12 + 3);
    }
}

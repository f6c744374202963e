//! Variant-calling map-reduce orchestration.
//!
//! Runs a sequencing workload as a chain of idempotent, chunk-granular tasks that
//! exchange intermediate artifacts through an object store, then merges the
//! per-pair pileups of every reference chunk into one object with a load-balanced
//! set of reducers and a multipart upload.
//!
//! # Architecture
//!
//! - **Index**: chunk manifests, deterministic artifact keys, integer-keyed records
//! - **I/O**: object storage, multipart backends, record queries and chunk fetches
//! - **Tool**: external programs with templated arguments
//! - **Pipeline**: idempotent tasks, map stages, partition balancing, reduce workers,
//!   multipart assembly and the scheduler that drives them
//!
//! # Usage
//!
//! ```no_run
//! use varcall_mapreduce::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod pipeline;
pub mod tool;

pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use index::{ChunkManifest, ChunkRef, KeyLayout, PartitionRange, StageKey};
pub use io::{ObjectKey, Storage};
pub use pipeline::{Metrics, PartitionJob, Scheduler, SchedulerStats};

use anyhow::{Context, Result};
use std::sync::Arc;

/// Key layout of the run described by `config`.
pub fn run_layout(config: &Config) -> KeyLayout {
    KeyLayout::new(
        &config.storage.bucket,
        &config.run.tmp_prefix,
        &config.run.run_id,
        &config.run.base_name,
    )
}

fn create_scheduler(config: &Config, storage: Storage, metrics: Arc<Metrics>) -> Scheduler {
    let chunks = Arc::new(io::StoreChunkSource::new(storage.clone()));
    let records = Arc::new(io::StoreScan::new(
        storage.clone(),
        config.processing.key_column,
    ));
    Scheduler::from_config(config, storage, chunks, records, metrics)
}

fn load_manifest(config: &Config) -> Result<ChunkManifest> {
    let path = &config.run.chunk_manifest;
    tracing::info!("Loading chunk manifest from {}", path.display());
    let manifest = ChunkManifest::from_file(path)?;
    tracing::info!(
        "Loaded {} reference chunks and {} read chunks",
        manifest.fasta.len(),
        manifest.fastq.len()
    );
    Ok(manifest)
}

/// Run the full pipeline with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<SchedulerStats> {
    config.validate()?;

    tracing::info!("Starting run {}", config.run.run_id);
    let manifest = load_manifest(&config)?;
    if manifest.fasta.is_empty() {
        anyhow::bail!("Chunk manifest has no reference chunks");
    }

    let storage = Storage::from_config(&config.storage)?;
    tracing::info!("Using bucket {}", storage.bucket());

    let scheduler = create_scheduler(&config, storage, Metrics::new());
    let stats = scheduler
        .run(&manifest)
        .await
        .with_context(|| format!("Run {} failed", config.run.run_id))?;

    tracing::info!("Pipeline complete: {}", stats);
    Ok(stats)
}

/// Balance the stored pileups of a run without reducing them.
pub async fn plan_partitions(config: Config) -> Result<Vec<PartitionJob>> {
    config.validate()?;
    let mut manifest = load_manifest(&config)?;
    if let Some([first, last]) = config.run.fasta_chunk_range {
        manifest.restrict_fasta(first, last);
    }
    let fasta_ids: Vec<u32> = manifest.fasta.iter().map(|c| c.id).collect();
    let fastq_ids: Vec<u32> = manifest.fastq.iter().map(|c| c.id).collect();

    let storage = Storage::from_config(&config.storage)?;
    let scheduler = create_scheduler(&config, storage, Metrics::new());
    scheduler.plan(&fasta_ids, &fastq_ids).await
}

/// Delete the run's temporary artifacts and, optionally, the cached reference indexes.
/// Returns the number of objects deleted.
pub async fn clean_run(config: Config, include_indexes: bool) -> Result<usize> {
    config.validate()?;
    let storage = Storage::from_config(&config.storage)?;
    let layout = run_layout(&config);

    let mut deleted = storage
        .delete_prefix(&layout.run_prefix())
        .await
        .with_context(|| format!("Failed to delete {}", layout.run_prefix()))?;
    if include_indexes {
        deleted += storage
            .delete_prefix(&layout.index_prefix())
            .await
            .with_context(|| format!("Failed to delete {}", layout.index_prefix()))?;
    }

    tracing::info!("Deleted {} objects", deleted);
    Ok(deleted)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

//! Idempotent task execution.
//!
//! An [`IdempotentTask`] declares the object keys it produces. Running it first
//! probes the store: if every output is already present the task is skipped.
//! Otherwise the compute closure runs inside a fresh private directory, each
//! declared artifact is uploaded from that directory, and the directory is
//! removed when the task returns, whether it succeeded or not.
//!
//! Two concurrent invocations of the same task write the same keys with
//! equivalent content, so they converge without coordination.

use super::metrics::Metrics;
use super::telemetry::{TaskTelemetry, TelemetryHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::index::{ChunkRef, Stage};
use crate::io::{ChunkSource, ObjectKey, Storage};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Result of a task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The compute step ran and every output was uploaded.
    Computed { bytes_written: u64 },
    /// Every output already existed.
    Skipped,
}

impl TaskOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskOutcome::Skipped)
    }
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    pub outputs: Vec<ObjectKey>,
    pub telemetry: TaskTelemetry,
}

/// One declared output: the file the compute step leaves in the work area and
/// the key it is uploaded to.
#[derive(Debug, Clone)]
struct TaskOutput {
    key: ObjectKey,
    file_name: String,
}

/// Private working directory handed to a compute closure.
pub struct WorkArea {
    dir: PathBuf,
    storage: Storage,
    telemetry: TelemetryHandle,
    metrics: Arc<Metrics>,
}

impl WorkArea {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of a file inside the work area.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    /// Download an object into the work area as `name`.
    pub async fn download(&self, key: &ObjectKey, name: &str) -> PipelineResult<PathBuf> {
        let dest = self.file(name);
        let start = Instant::now();
        let size = self.storage.download_file(key, &dest).await?;
        self.metrics.add_fetch_time(start.elapsed());
        self.metrics.add_bytes_read(size);
        self.telemetry.record_size(name, size);
        Ok(dest)
    }

    /// Download an artifact written by the earlier stage `producer`. An absent
    /// object is reported as that stage's missing output.
    pub async fn download_artifact(
        &self,
        producer: Stage,
        key: &ObjectKey,
        name: &str,
    ) -> PipelineResult<PathBuf> {
        self.download(key, name).await.map_err(|e| match e {
            PipelineError::Storage(object_store::Error::NotFound { .. }) => {
                PipelineError::MissingOutput {
                    stage: producer.to_string(),
                    key: key.to_string(),
                }
            }
            other => other,
        })
    }

    /// Materialize an input chunk into the work area as `name`.
    pub async fn fetch_chunk(
        &self,
        source: &dyn ChunkSource,
        chunk: &ChunkRef,
        name: &str,
    ) -> PipelineResult<PathBuf> {
        let dest = self.file(name);
        let start = Instant::now();
        let size = source.fetch(chunk, &dest).await?;
        self.metrics.add_fetch_time(start.elapsed());
        self.metrics.add_bytes_read(size);
        self.telemetry.record_size(name, size);
        Ok(dest)
    }
}

/// A unit of work with deterministic outputs.
pub struct IdempotentTask {
    name: String,
    stage: Stage,
    storage: Storage,
    outputs: Vec<TaskOutput>,
    scratch_dir: Option<PathBuf>,
    metrics: Arc<Metrics>,
}

impl IdempotentTask {
    pub fn new(name: impl Into<String>, stage: Stage, storage: Storage) -> Self {
        Self {
            name: name.into(),
            stage,
            storage,
            outputs: Vec::new(),
            scratch_dir: None,
            metrics: Metrics::new(),
        }
    }

    /// Declare an output: `file_name` in the work area is uploaded to `key`.
    pub fn with_output(mut self, key: ObjectKey, file_name: impl Into<String>) -> Self {
        self.outputs.push(TaskOutput {
            key,
            file_name: file_name.into(),
        });
        self
    }

    /// Create work areas under `dir` instead of the system temp directory.
    pub fn in_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn output_keys(&self) -> Vec<ObjectKey> {
        self.outputs.iter().map(|o| o.key.clone()).collect()
    }

    /// Whether every declared output already exists.
    pub async fn is_complete(&self) -> PipelineResult<bool> {
        if self.outputs.is_empty() {
            return Ok(false);
        }
        self.storage.exists_all(&self.output_keys()).await
    }

    /// Run the task, skipping it if its outputs exist.
    pub async fn run<F, Fut>(self, compute: F) -> PipelineResult<TaskReport>
    where
        F: FnOnce(WorkArea) -> Fut,
        Fut: Future<Output = PipelineResult<()>>,
    {
        let telemetry = TelemetryHandle::new(TaskTelemetry::new(&self.name, self.stage.name()));
        telemetry.mark("start");

        let result = self.execute(compute, &telemetry).await;
        telemetry.mark("end");

        match result {
            Ok(outcome) => {
                match &outcome {
                    TaskOutcome::Skipped => {
                        self.metrics.add_task_skipped();
                        tracing::debug!("{} {}: outputs exist, skipping", self.stage, self.name);
                    }
                    TaskOutcome::Computed { bytes_written } => {
                        self.metrics.add_task_computed();
                        tracing::debug!(
                            "{} {}: uploaded {} bytes",
                            self.stage,
                            self.name,
                            bytes_written
                        );
                    }
                }
                Ok(TaskReport {
                    outcome,
                    outputs: self.output_keys(),
                    telemetry: telemetry.snapshot(),
                })
            }
            Err(e) => {
                self.metrics.add_task_failed();
                tracing::warn!("{} {} failed: {}", self.stage, self.name, e);
                Err(e)
            }
        }
    }

    async fn execute<F, Fut>(&self, compute: F, telemetry: &TelemetryHandle) -> PipelineResult<TaskOutcome>
    where
        F: FnOnce(WorkArea) -> Fut,
        Fut: Future<Output = PipelineResult<()>>,
    {
        if self.is_complete().await? {
            telemetry.mark("skipped");
            return Ok(TaskOutcome::Skipped);
        }

        // Removed on drop, on every exit path
        let workdir = self.create_workdir().await?;

        telemetry.mark("compute");
        let start = Instant::now();
        compute(WorkArea {
            dir: workdir.path().to_path_buf(),
            storage: self.storage.clone(),
            telemetry: telemetry.clone(),
            metrics: self.metrics.clone(),
        })
        .await?;
        self.metrics.add_compute_time(start.elapsed());

        telemetry.mark("upload");
        let start = Instant::now();
        let mut bytes_written = 0;
        for output in &self.outputs {
            let local = workdir.path().join(&output.file_name);
            if !tokio::fs::try_exists(&local).await? {
                return Err(PipelineError::MissingOutput {
                    stage: self.stage.to_string(),
                    key: output.key.to_string(),
                });
            }
            let size = self.storage.upload_file(&output.key, &local).await?;
            telemetry.record_size(&output.file_name, size);
            bytes_written += size;
        }
        self.metrics.add_upload_time(start.elapsed());
        self.metrics.add_bytes_written(bytes_written);

        Ok(TaskOutcome::Computed { bytes_written })
    }

    async fn create_workdir(&self) -> PipelineResult<tempfile::TempDir> {
        let prefix = format!("{}-", self.stage);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.scratch_dir {
            Some(parent) => {
                tokio::fs::create_dir_all(parent).await?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

//! Reduce workers.
//!
//! A reduce task owns one key range of one reference chunk. It pulls the rows
//! in that range from every pileup, pipes them through the reducer tool, and
//! uploads the result as one part of the chunk's multipart upload. Re-running
//! a task re-uploads the same part number, which replaces the earlier part.

use super::coordinator::UploadPart;
use super::metrics::Metrics;
use super::telemetry::TaskTelemetry;
use crate::error::PipelineResult;
use crate::index::{PartitionRange, Stage};
use crate::io::{ObjectKey, RecordSource, Storage};
use crate::tool::{ExternalTool, ToolVars};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Sources queried concurrently by one worker; results keep source order.
const QUERY_CONCURRENCY: usize = 8;

/// Everything a reduce worker needs; independent of any other task.
#[derive(Debug, Clone)]
pub struct ReduceTask {
    pub partition_id: u32,
    pub range: PartitionRange,
    pub sources: Vec<ObjectKey>,
    pub target: ObjectKey,
    pub upload_id: String,
    pub part_number: u32,
}

impl ReduceTask {
    pub fn name(&self) -> String {
        format!("fa{}-part{}", self.partition_id, self.part_number)
    }
}

#[derive(Debug, Clone)]
pub struct ReduceResult {
    pub part: UploadPart,
    pub telemetry: TaskTelemetry,
}

pub struct ReduceWorker {
    storage: Storage,
    source: Arc<dyn RecordSource>,
    reducer: ExternalTool,
    threads: usize,
    scratch_dir: Option<PathBuf>,
    metrics: Arc<Metrics>,
}

impl ReduceWorker {
    pub fn new(
        storage: Storage,
        source: Arc<dyn RecordSource>,
        reducer: ExternalTool,
        threads: usize,
        scratch_dir: Option<PathBuf>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            source,
            reducer,
            threads,
            scratch_dir,
            metrics,
        }
    }

    /// Rows of every source within the task's range, concatenated in source order.
    pub async fn gather(&self, task: &ReduceTask) -> PipelineResult<Bytes> {
        let source = &self.source;
        let range = task.range;
        let chunks: Vec<Bytes> = stream::iter(&task.sources)
            .map(|key| async move { source.select_range(key, range).await })
            .buffered(QUERY_CONCURRENCY)
            .try_collect()
            .await?;

        let mut payload = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            payload.extend_from_slice(&chunk);
        }
        Ok(payload.freeze())
    }

    pub async fn run(&self, task: &ReduceTask) -> PipelineResult<ReduceResult> {
        let result = self.execute(task).await;
        match &result {
            Ok(_) => self.metrics.add_task_computed(),
            Err(e) => {
                self.metrics.add_task_failed();
                tracing::warn!("reduce {} {} failed: {}", task.name(), task.range, e);
            }
        }
        result
    }

    async fn execute(&self, task: &ReduceTask) -> PipelineResult<ReduceResult> {
        let mut telemetry = TaskTelemetry::new(task.name(), Stage::Reduce.name());
        telemetry.mark("start");

        let start = Instant::now();
        let payload = self.gather(task).await?;
        self.metrics.add_fetch_time(start.elapsed());
        self.metrics.add_bytes_read(payload.len() as u64);
        telemetry.record_size("rows", payload.len() as u64);
        telemetry.mark("reduce");

        let workdir = match &self.scratch_dir {
            Some(parent) => {
                tokio::fs::create_dir_all(parent).await?;
                tempfile::Builder::new().prefix("reduce-").tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix("reduce-").tempdir()?,
        };
        let start = Instant::now();
        let vars = ToolVars::new().set("threads", self.threads);
        let merged = self
            .reducer
            .pipe(Stage::Reduce, workdir.path(), &vars, payload)
            .await?;
        self.metrics.add_compute_time(start.elapsed());
        telemetry.record_size("merged", merged.len() as u64);
        telemetry.mark("upload");

        let start = Instant::now();
        let size = merged.len() as u64;
        let etag = self
            .storage
            .upload_part(&task.target, &task.upload_id, task.part_number, merged)
            .await?;
        self.metrics.add_upload_time(start.elapsed());
        self.metrics.add_bytes_written(size);
        self.metrics.add_part_uploaded();
        telemetry.mark("end");

        tracing::debug!(
            "Uploaded part {} of {} ({} bytes, range {})",
            task.part_number,
            task.target,
            size,
            task.range
        );

        Ok(ReduceResult {
            part: UploadPart {
                upload_id: task.upload_id.clone(),
                part_number: task.part_number,
                etag,
            },
            telemetry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSpec;
    use crate::error::PipelineError;
    use crate::io::StoreScan;
    use crate::pipeline::coordinator::MultipartCoordinator;

    async fn setup(reducer: ToolSpec) -> (Storage, ReduceWorker, Vec<ObjectKey>) {
        let storage = Storage::in_memory("bucket");
        let a = storage.key("p/a.mpileup");
        let b = storage.key("p/b.mpileup");
        storage
            .put(&a, Bytes::from_static(b"c\t5\ta1\nc\t1\ta2\nc\t3\ta3\n"))
            .await
            .unwrap();
        storage
            .put(&b, Bytes::from_static(b"c\t2\tb1\nc\t9\tb2\n"))
            .await
            .unwrap();

        let worker = ReduceWorker::new(
            storage.clone(),
            Arc::new(StoreScan::new(storage.clone(), 1)),
            ExternalTool::new("reducer", reducer),
            1,
            None,
            Metrics::new(),
        );
        (storage, worker, vec![a, b])
    }

    fn task(sources: Vec<ObjectKey>, target: ObjectKey, upload_id: &str, range: PartitionRange, n: u32) -> ReduceTask {
        ReduceTask {
            partition_id: 0,
            range,
            sources,
            target,
            upload_id: upload_id.to_string(),
            part_number: n,
        }
    }

    #[tokio::test]
    async fn test_gather_keeps_source_order() {
        let (storage, worker, sources) = setup(ToolSpec::new("cat", &[])).await;
        let t = task(sources, storage.key("out"), "u", PartitionRange::new(1, 5), 1);
        let rows = worker.gather(&t).await.unwrap();
        assert_eq!(&rows[..], b"c\t5\ta1\nc\t1\ta2\nc\t3\ta3\nc\t2\tb1\n");
    }

    #[tokio::test]
    async fn test_ranges_reassemble_all_rows() {
        let (storage, worker, sources) = setup(ToolSpec::new("cat", &[])).await;
        let target = storage.key("out/fa0.sinple");
        let mut coordinator = MultipartCoordinator::new(storage.clone(), Metrics::new());
        let id = coordinator.create(0, target.clone(), 2).await.unwrap();

        let second = worker
            .run(&task(sources.clone(), target.clone(), &id, PartitionRange::new(4, 9), 2))
            .await
            .unwrap();
        let first = worker
            .run(&task(sources, target.clone(), &id, PartitionRange::new(1, 3), 1))
            .await
            .unwrap();
        assert_eq!(first.part.part_number, 1);
        assert!(first.telemetry.timestamp("upload").is_some());

        coordinator.collect(vec![second.part, first.part]).unwrap();
        coordinator.finalize(&id).await.unwrap();

        let data = storage.get(&target).await.unwrap();
        assert_eq!(
            &data[..],
            b"c\t1\ta2\nc\t3\ta3\nc\t2\tb1\nc\t5\ta1\nc\t9\tb2\n"
        );
    }

    #[tokio::test]
    async fn test_reducer_transforms_payload() {
        let reducer = ToolSpec::new("sh", &["-c", "sort -t '\t' -k2,2n"]);
        let (storage, worker, sources) = setup(reducer).await;
        let target = storage.key("out/fa0.sinple");
        let mut coordinator = MultipartCoordinator::new(storage.clone(), Metrics::new());
        let id = coordinator.create(0, target.clone(), 1).await.unwrap();

        let result = worker
            .run(&task(sources, target.clone(), &id, PartitionRange::new(1, 9), 1))
            .await
            .unwrap();
        coordinator.collect(vec![result.part]).unwrap();
        coordinator.finalize(&id).await.unwrap();

        let data = storage.get(&target).await.unwrap();
        let keys: Vec<&str> = std::str::from_utf8(&data)
            .unwrap()
            .lines()
            .map(|l| l.split('\t').nth(1).unwrap())
            .collect();
        assert_eq!(keys, vec!["1", "2", "3", "5", "9"]);
    }

    #[tokio::test]
    async fn test_reducer_failure() {
        let (storage, worker, sources) = setup(ToolSpec::new("sh", &["-c", "exit 4"])).await;
        let target = storage.key("out/x");
        let id = storage.create_multipart(&target).await.unwrap();
        let err = worker
            .run(&task(sources, target, &id, PartitionRange::new(1, 9), 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ExternalToolFailure { code: Some(4), .. }
        ));
    }
}

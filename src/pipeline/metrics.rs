//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Metrics for a run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Tasks that ran their compute step
    pub tasks_computed: AtomicU64,

    /// Tasks skipped because every output already existed
    pub tasks_skipped: AtomicU64,

    /// Tasks that returned an error
    pub tasks_failed: AtomicU64,

    /// Bytes downloaded from the object store
    pub bytes_read: AtomicU64,

    /// Bytes uploaded to the object store
    pub bytes_written: AtomicU64,

    /// Multipart parts uploaded by reduce workers
    pub parts_uploaded: AtomicU64,

    /// Multipart uploads completed
    pub uploads_completed: AtomicU64,

    /// Multipart uploads aborted after a failure
    pub uploads_aborted: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-phase timing (in microseconds for precision)
    /// Time spent fetching inputs (microseconds)
    pub fetch_us: AtomicU64,

    /// Time spent in external tools (microseconds)
    pub compute_us: AtomicU64,

    /// Time spent uploading outputs (microseconds)
    pub upload_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_task_computed(&self) {
        self.tasks_computed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_skipped(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_part_uploaded(&self) {
        self.parts_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_upload_completed(&self) {
        self.uploads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_upload_aborted(&self) {
        self.uploads_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_fetch_time(&self, duration: Duration) {
        self.fetch_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_compute_time(&self, duration: Duration) {
        self.compute_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_upload_time(&self, duration: Duration) {
        self.upload_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Tasks finished (computed or skipped) per second.
    pub fn tasks_per_second(&self) -> f64 {
        let done = self.tasks_computed.load(Ordering::Relaxed)
            + self.tasks_skipped.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_computed: self.tasks_computed.load(Ordering::Relaxed),
            tasks_skipped: self.tasks_skipped.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            parts_uploaded: self.parts_uploaded.load(Ordering::Relaxed),
            uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
            uploads_aborted: self.uploads_aborted.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            tasks_per_second: self.tasks_per_second(),
            fetch_secs: self.fetch_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            compute_secs: self.compute_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            upload_secs: self.upload_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_computed: u64,
    pub tasks_skipped: u64,
    pub tasks_failed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub parts_uploaded: u64,
    pub uploads_completed: u64,
    pub uploads_aborted: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub tasks_per_second: f64,
    /// Total time spent fetching inputs (seconds, summed across tasks)
    pub fetch_secs: f64,
    /// Total time spent in external tools (seconds, summed across tasks)
    pub compute_secs: f64,
    /// Total time spent uploading (seconds, summed across tasks)
    pub upload_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    pub fn tasks_done(&self) -> u64 {
        self.tasks_computed + self.tasks_skipped
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_phase_time = self.fetch_secs + self.compute_secs + self.upload_secs;
        let (fetch_pct, compute_pct, upload_pct) = if total_phase_time > 0.0 {
            (
                self.fetch_secs / total_phase_time * 100.0,
                self.compute_secs / total_phase_time * 100.0,
                self.upload_secs / total_phase_time * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Tasks: {} computed, {} skipped, {} failed | Parts: {} | Uploads: {} | \
             Read: {:.2} GB | Write: {:.2} GB | Rate: {:.1} tasks/s | Elapsed: {:.1}s | \
             Time: fetch {:.0}% | tools {:.0}% | upload {:.0}%",
            self.tasks_computed,
            self.tasks_skipped,
            self.tasks_failed,
            self.parts_uploaded,
            self.uploads_completed,
            self.bytes_read as f64 / GIB,
            self.bytes_written as f64 / GIB,
            self.tasks_per_second,
            self.elapsed.as_secs_f64(),
            fetch_pct,
            compute_pct,
            upload_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_tasks: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_tasks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_tasks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_tasks > 0 {
                        snapshot.tasks_done() as f64 / self.total_tasks as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Run Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Tasks computed: {}", snapshot.tasks_computed);
        println!("Tasks skipped: {}", snapshot.tasks_skipped);
        println!("Tasks failed: {}", snapshot.tasks_failed);
        println!("Parts uploaded: {}", snapshot.parts_uploaded);
        println!("Uploads completed: {}", snapshot.uploads_completed);
        if snapshot.uploads_aborted > 0 {
            println!("Uploads aborted: {}", snapshot.uploads_aborted);
        }
        println!("Data read: {:.2} GB", snapshot.bytes_read as f64 / GIB);
        println!("Data written: {:.2} GB", snapshot.bytes_written as f64 / GIB);
        println!("===================\n");
    }
}

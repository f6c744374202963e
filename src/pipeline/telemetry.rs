//! Per-task timing and size records.
//!
//! Each task owns a [`TaskTelemetry`] and returns it with its result; the
//! scheduler collects them into a [`RunTelemetry`] that is written out once the
//! run finishes. Nothing here affects control flow.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Named timestamps and sizes for one task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTelemetry {
    pub task: String,
    pub stage: String,
    /// `(event, unix seconds)` in the order they happened
    pub timestamps: Vec<(String, f64)>,
    /// `(artifact, bytes)`
    pub sizes: Vec<(String, u64)>,
}

impl TaskTelemetry {
    pub fn new(task: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            stage: stage.into(),
            timestamps: Vec::new(),
            sizes: Vec::new(),
        }
    }

    pub fn mark(&mut self, event: &str) {
        self.timestamps.push((event.to_string(), unix_secs()));
    }

    pub fn record_size(&mut self, artifact: &str, bytes: u64) {
        self.sizes.push((artifact.to_string(), bytes));
    }

    pub fn timestamp(&self, event: &str) -> Option<f64> {
        self.timestamps
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, t)| *t)
    }

    /// Seconds between two marked events, if both were marked.
    pub fn between(&self, from: &str, to: &str) -> Option<f64> {
        Some(self.timestamp(to)? - self.timestamp(from)?)
    }

    pub fn total_size(&self) -> u64 {
        self.sizes.iter().map(|(_, b)| b).sum()
    }
}

/// Shared handle used while a task is running.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    inner: Arc<Mutex<TaskTelemetry>>,
}

impl TelemetryHandle {
    pub fn new(telemetry: TaskTelemetry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(telemetry)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskTelemetry> {
        // Telemetry is append-only; a poisoned lock still holds usable data
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark(&self, event: &str) {
        self.lock().mark(event);
    }

    pub fn record_size(&self, artifact: &str, bytes: u64) {
        self.lock().record_size(artifact, bytes);
    }

    pub fn snapshot(&self) -> TaskTelemetry {
        self.lock().clone()
    }
}

/// Telemetry of a whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTelemetry {
    pub run_id: String,
    pub tasks: Vec<TaskTelemetry>,
}

impl RunTelemetry {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, task: TaskTelemetry) {
        self.tasks.push(task);
    }

    /// Bytes recorded by tasks of `stage`.
    pub fn stage_bytes(&self, stage: &str) -> u64 {
        self.tasks
            .iter()
            .filter(|t| t.stage == stage)
            .map(TaskTelemetry::total_size)
            .sum()
    }

    /// Task count, bytes and mean duration of each stage, in first-seen order.
    pub fn stage_summaries(&self) -> Vec<StageSummary> {
        let mut stages: Vec<&str> = Vec::new();
        for task in &self.tasks {
            if !stages.contains(&task.stage.as_str()) {
                stages.push(&task.stage);
            }
        }

        stages
            .into_iter()
            .map(|stage| {
                let durations: Vec<f64> = self
                    .tasks
                    .iter()
                    .filter(|t| t.stage == stage)
                    .filter_map(|t| t.between("start", "end"))
                    .collect();
                let mean_secs = if durations.is_empty() {
                    0.0
                } else {
                    durations.iter().sum::<f64>() / durations.len() as f64
                };
                StageSummary {
                    stage: stage.to_string(),
                    tasks: self.tasks.iter().filter(|t| t.stage == stage).count(),
                    bytes: self.stage_bytes(stage),
                    mean_secs,
                }
            })
            .collect()
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save telemetry to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        tracing::info!("Telemetry saved to {}", path);
        Ok(())
    }
}

/// Per-stage totals of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSummary {
    pub stage: String,
    pub tasks: usize,
    pub bytes: u64,
    pub mean_secs: f64,
}

impl fmt::Display for StageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} tasks, {:.2} MB, {:.2}s mean",
            self.stage,
            self.tasks,
            self.bytes as f64 / 1_000_000.0,
            self.mean_secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marks_are_ordered() {
        let mut telemetry = TaskTelemetry::new("fa0-fq0", "pileup");
        telemetry.mark("start");
        telemetry.mark("end");
        assert!(telemetry.between("start", "end").unwrap() >= 0.0);
        assert_eq!(telemetry.between("start", "missing"), None);
    }

    #[test]
    fn test_handle_shares_state() {
        let handle = TelemetryHandle::new(TaskTelemetry::new("t", "reduce"));
        let clone = handle.clone();
        clone.record_size("payload", 10);
        handle.record_size("part", 5);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.total_size(), 15);
        assert_eq!(snapshot.sizes[0].0, "payload");
    }

    #[test]
    fn test_run_telemetry_save() {
        let dir = TempDir::new().unwrap();
        let mut run = RunTelemetry::new("run-1");
        let mut task = TaskTelemetry::new("fa0", "index-build");
        task.record_size("gem", 100);
        run.push(task);

        run.push(TaskTelemetry::new("fa1", "index-build"));
        assert_eq!(run.tasks.len(), 2);
        assert_eq!(run.stage_bytes("index-build"), 100);

        let path = dir.path().join("telemetry.json");
        run.save_to_file(path.to_str().unwrap()).unwrap();
        let parsed: RunTelemetry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.run_id, "run-1");
        assert_eq!(parsed.tasks[0].sizes, vec![("gem".to_string(), 100)]);
    }

    #[test]
    fn test_stage_summaries() {
        let mut run = RunTelemetry::new("run-1");
        for (task, stage, bytes, start, end) in [
            ("fa0", "index-build", 10, 0.0, 2.0),
            ("fa0-fq0", "pileup", 5, 1.0, 2.0),
            ("fa1", "index-build", 30, 1.0, 5.0),
        ] {
            let mut t = TaskTelemetry::new(task, stage);
            t.timestamps = vec![("start".to_string(), start), ("end".to_string(), end)];
            t.record_size("out", bytes);
            run.push(t);
        }
        // No end mark: counted but left out of the mean
        run.push(TaskTelemetry::new("fa1-fq0", "pileup"));

        let summaries = run.stage_summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(
            summaries[0],
            StageSummary {
                stage: "index-build".to_string(),
                tasks: 2,
                bytes: 40,
                mean_secs: 3.0,
            }
        );
        assert_eq!(summaries[1].stage, "pileup");
        assert_eq!(summaries[1].tasks, 2);
        assert_eq!(summaries[1].mean_secs, 1.0);
        assert!(summaries[0].to_string().starts_with("index-build: 2 tasks"));
    }
}

//! Pipeline orchestration: idempotent tasks, map stages, balancing, reduce and upload assembly.

mod balancer;
mod coordinator;
mod metrics;
mod reducer;
mod scheduler;
mod stages;
mod task;
mod telemetry;


pub use balancer::{balance, PartitionBalancer, PartitionPlan, DEFAULT_BUDGET};
pub use coordinator::{group_parts, MultipartCoordinator, PartitionUpload, UploadPart, UploadState};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use reducer::{ReduceResult, ReduceTask, ReduceWorker};
pub use scheduler::{PartitionJob, Scheduler, SchedulerConfig, SchedulerStats, WorkEstimate};
pub use stages::{ChunkStages, StageTools};
pub use task::{IdempotentTask, TaskOutcome, TaskReport, WorkArea};
pub use telemetry::{RunTelemetry, StageSummary, TaskTelemetry, TelemetryHandle};

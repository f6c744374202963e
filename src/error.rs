//! Error taxonomy for pipeline tasks.
//!
//! Every variant carries enough context (stage, key, upload id) for the caller
//! to re-run just the failed task. Nothing in this crate retries in-process.

use thiserror::Error;

/// Errors surfaced by stage functions, reduce workers and the multipart coordinator.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An expected artifact is absent after a stage claimed completion.
    #[error("stage '{stage}' finished without producing {key}")]
    MissingOutput { stage: String, key: String },

    /// An external binary or script exited with a non-success status.
    #[error("tool '{tool}' failed in stage '{stage}' (exit code {code:?}): {stderr}")]
    ExternalToolFailure {
        tool: String,
        stage: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Fewer parts were collected than the dispatch plan expects.
    #[error("multipart upload {upload_id} for {target} has {collected} of {expected} parts")]
    IncompleteMultipartUpload {
        upload_id: String,
        target: String,
        expected: u32,
        collected: u32,
    },

    /// A structured query against a source object failed.
    #[error("query against {key} failed: {reason}")]
    QueryFailure { key: String, reason: String },

    /// A part references an upload id the coordinator never created.
    #[error("no multipart upload with id {upload_id}")]
    UnknownUpload { upload_id: String },

    /// A part number outside `1..=expected` for its upload.
    #[error("part {part_number} is outside 1..={expected} for upload {upload_id}")]
    UnexpectedPart {
        upload_id: String,
        part_number: u32,
        expected: u32,
    },

    /// A staged part was replaced after its etag was reported.
    #[error("part {part_number} of upload {upload_id} no longer matches etag {etag}")]
    PartMismatch {
        upload_id: String,
        part_number: u32,
        etag: String,
    },

    #[error("key {key} does not belong to bucket '{bucket}'")]
    ForeignBucket { key: String, bucket: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("parse error in {context}: {message}")]
    Parse { context: String, message: String },

    #[error(transparent)]
    Storage(#[from] object_store::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used across the library modules.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = PipelineError::MissingOutput {
            stage: "align".to_string(),
            key: "s3://bucket/tmp/run/a".to_string(),
        };
        assert!(err.to_string().contains("align"));
        assert!(err.to_string().contains("s3://bucket/tmp/run/a"));

        let err = PipelineError::IncompleteMultipartUpload {
            upload_id: "u1".to_string(),
            target: "s3://bucket/out".to_string(),
            expected: 3,
            collected: 2,
        };
        assert!(err.to_string().contains("2 of 3"));
    }
}

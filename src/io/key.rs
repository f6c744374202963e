//! Structured object-store keys.
//!
//! A key is a bucket plus an ordered list of non-empty segments. There is no
//! notion of `..`, absolute paths or a working directory: joining only appends.

use crate::error::{PipelineError, PipelineResult};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A bucket-qualified object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    bucket: String,
    segments: Vec<String>,
}

impl ObjectKey {
    /// Build a key from a bucket and a `/`-delimited key string.
    ///
    /// Empty segments (leading, trailing or doubled slashes) are dropped.
    pub fn new(bucket: impl Into<String>, key: &str) -> Self {
        Self {
            bucket: bucket.into(),
            segments: split_segments(key),
        }
    }

    /// Parse an `s3://bucket/key` URI.
    pub fn parse_uri(uri: &str) -> PipelineResult<Self> {
        let (bucket, key) = parse_s3_uri(uri)?;
        let key = Self::new(bucket, key);
        if key.segments.is_empty() {
            return Err(PipelineError::InvalidKey(format!("'{}' has an empty key", uri)));
        }
        Ok(key)
    }

    /// Append one or more segments (a `/` in `segment` splits it).
    pub fn join(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(split_segments(segment));
        Self {
            bucket: self.bucket.clone(),
            segments,
        }
    }

    /// Append a suffix to the final segment (e.g. `.keys`).
    pub fn with_suffix(&self, suffix: &str) -> Self {
        let mut key = self.clone();
        match key.segments.last_mut() {
            Some(last) => last.push_str(suffix),
            None => key.segments.push(suffix.to_string()),
        }
        key
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Final segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The key without the bucket, segments joined by `/`.
    pub fn key(&self) -> String {
        self.segments.join("/")
    }

    /// Whether `self` lies under `prefix` (segment-wise, same bucket).
    pub fn starts_with(&self, prefix: &ObjectKey) -> bool {
        self.bucket == prefix.bucket && self.segments.starts_with(&prefix.segments)
    }

    /// Location of this key inside its bucket's object store.
    pub fn location(&self) -> Path {
        Path::from(self.key())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key())
    }
}

fn split_segments(key: &str) -> Vec<String> {
    key.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
pub fn parse_s3_uri(uri: &str) -> PipelineResult<(&str, &str)> {
    let without_scheme = uri.strip_prefix("s3://").ok_or_else(|| {
        PipelineError::InvalidKey(format!("expected 's3://' prefix in '{}'", uri))
    })?;

    without_scheme
        .split_once('/')
        .ok_or_else(|| PipelineError::InvalidKey(format!("expected 's3://bucket/key' in '{}'", uri)))
}

//! Structured queries over tab-separated artifacts.
//!
//! Reducers and the balancer only ever ask two things of a stored artifact:
//! the sequence of keys it holds, and the rows whose key falls in a range.
//! [`RecordSource`] is that interface; [`StoreScan`] answers it by fetching the
//! object and filtering locally.

use super::key::ObjectKey;
use super::store::Storage;
use crate::error::{PipelineError, PipelineResult};
use crate::index::{filter_range, parse_records, PartitionRange};
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Keys of every row in `source`, in source order.
    async fn select_keys(&self, source: &ObjectKey) -> PipelineResult<Vec<i64>>;

    /// Rows of `source` whose key lies in `range`, in source order, newline-terminated.
    async fn select_range(&self, source: &ObjectKey, range: PartitionRange) -> PipelineResult<Bytes>;
}

/// Query by downloading the whole object and scanning it.
pub struct StoreScan {
    storage: Storage,
    key_column: usize,
}

impl StoreScan {
    pub fn new(storage: Storage, key_column: usize) -> Self {
        Self {
            storage,
            key_column,
        }
    }

    async fn fetch(&self, source: &ObjectKey) -> PipelineResult<Bytes> {
        self.storage
            .get(source)
            .await
            .map_err(|e| query_failure(source, e))
    }
}

fn query_failure(source: &ObjectKey, err: PipelineError) -> PipelineError {
    PipelineError::QueryFailure {
        key: source.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl RecordSource for StoreScan {
    async fn select_keys(&self, source: &ObjectKey) -> PipelineResult<Vec<i64>> {
        let data = self.fetch(source).await?;
        let records = parse_records(&data, self.key_column).map_err(|e| query_failure(source, e))?;
        Ok(records.into_iter().map(|r| r.key).collect())
    }

    async fn select_range(&self, source: &ObjectKey, range: PartitionRange) -> PipelineResult<Bytes> {
        let data = self.fetch(source).await?;
        filter_range(&data, range, self.key_column).map_err(|e| query_failure(source, e))
    }
}

//! Acquisition of input chunk bytes.

use super::key::ObjectKey;
use super::store::Storage;
use crate::error::PipelineResult;
use crate::index::ChunkRef;
use async_trait::async_trait;
use std::path::Path;

/// Materializes a [`ChunkRef`] as a local file.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Write the chunk's bytes to `dest`, returning how many were written.
    async fn fetch(&self, chunk: &ChunkRef, dest: &Path) -> PipelineResult<u64>;
}

/// Reads chunks from the object store, honoring byte ranges.
pub struct StoreChunkSource {
    storage: Storage,
}

impl StoreChunkSource {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ChunkSource for StoreChunkSource {
    async fn fetch(&self, chunk: &ChunkRef, dest: &Path) -> PipelineResult<u64> {
        let key = ObjectKey::parse_uri(&chunk.source_locator)?;
        let data = match chunk.byte_range {
            Some(range) => self.storage.get_range(&key, range.start..range.end).await?,
            None => self.storage.get(&key).await?,
        };
        tokio::fs::write(dest, &data).await?;
        tracing::debug!(
            "Fetched chunk {} ({} bytes) from {}",
            chunk.id,
            data.len(),
            chunk.source_locator
        );
        Ok(data.len() as u64)
    }
}

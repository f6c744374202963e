//! Object store configuration for S3, local filesystem and in-memory access.
//!
//! [`Storage`] binds one bucket to an [`ObjectStore`] plus the multipart
//! protocol appropriate for that backend. Every operation takes an
//! [`ObjectKey`] and refuses keys from other buckets.

use super::key::ObjectKey;
use super::multipart::{MultipartBackend, NativeMultipart, StagedMultipart};
use crate::config::StorageConfig;
use crate::error::{PipelineError, PipelineResult};
use anyhow::Result;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, ObjectStoreExt, PutPayload, RetryConfig};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

/// Create client options for many concurrent S3 requests from one process.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        // Part uploads carry whole partitions; allow them time
        .with_timeout(Duration::from_secs(300))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(256)
}

/// Create retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
fn create_s3_store(config: &StorageConfig) -> Result<Arc<AmazonS3>> {
    tracing::info!("Creating authenticated S3 client for bucket: {}", config.bucket);

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&config.bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    if let Some(region) = &config.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &config.endpoint_url {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false);
    }

    Ok(Arc::new(builder.build()?))
}

/// A single bucket with its object store and multipart protocol.
#[derive(Clone)]
pub struct Storage {
    bucket: String,
    store: Arc<dyn ObjectStore>,
    multipart: Arc<dyn MultipartBackend>,
}

impl Storage {
    pub fn new(
        bucket: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        multipart: Arc<dyn MultipartBackend>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            store,
            multipart,
        }
    }

    /// Storage backed by a plain object store, with staged multipart uploads.
    pub fn staged(bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        let multipart = Arc::new(StagedMultipart::new(store.clone()));
        Self::new(bucket, store, multipart)
    }

    /// Fresh in-memory bucket.
    pub fn in_memory(bucket: impl Into<String>) -> Self {
        Self::staged(bucket, Arc::new(InMemory::new()))
    }

    /// Build storage from configuration.
    /// Uses LocalFileSystem if local_path is set, otherwise S3 with credentials.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match &config.local_path {
            Some(local_path) => {
                let path = std::path::Path::new(local_path);
                if !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
                tracing::info!(
                    "Creating LocalFileSystem store at {} for bucket '{}'",
                    path.display(),
                    config.bucket
                );
                let store: Arc<dyn ObjectStore> =
                    Arc::new(LocalFileSystem::new_with_prefix(path)?);
                Ok(Self::staged(&config.bucket, store))
            }
            None => {
                let s3 = create_s3_store(config)?;
                let multipart = Arc::new(NativeMultipart::new(s3.clone()));
                Ok(Self::new(&config.bucket, s3, multipart))
            }
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key in this bucket.
    pub fn key(&self, key: &str) -> ObjectKey {
        ObjectKey::new(&self.bucket, key)
    }

    fn location(&self, key: &ObjectKey) -> PipelineResult<Path> {
        if key.bucket() != self.bucket {
            return Err(PipelineError::ForeignBucket {
                key: key.to_string(),
                bucket: self.bucket.clone(),
            });
        }
        Ok(key.location())
    }

    pub async fn exists(&self, key: &ObjectKey) -> PipelineResult<bool> {
        match self.store.head(&self.location(key)?).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether every key exists. Stops probing at the first missing key.
    pub async fn exists_all(&self, keys: &[ObjectKey]) -> PipelineResult<bool> {
        for key in keys {
            if !self.exists(key).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn get(&self, key: &ObjectKey) -> PipelineResult<Bytes> {
        let location = self.location(key)?;
        Ok(self.store.get(&location).await?.bytes().await?)
    }

    pub async fn get_range(&self, key: &ObjectKey, range: Range<u64>) -> PipelineResult<Bytes> {
        let location = self.location(key)?;
        Ok(self.store.get_range(&location, range).await?)
    }

    pub async fn put(&self, key: &ObjectKey, data: Bytes) -> PipelineResult<()> {
        let location = self.location(key)?;
        self.store.put(&location, PutPayload::from(data)).await?;
        Ok(())
    }

    /// Upload a local file, returning its size in bytes.
    pub async fn upload_file(&self, key: &ObjectKey, file: &std::path::Path) -> PipelineResult<u64> {
        let data = tokio::fs::read(file).await?;
        let size = data.len() as u64;
        self.put(key, Bytes::from(data)).await?;
        Ok(size)
    }

    /// Download an object to a local file, returning its size in bytes.
    pub async fn download_file(&self, key: &ObjectKey, file: &std::path::Path) -> PipelineResult<u64> {
        let data = self.get(key).await?;
        tokio::fs::write(file, &data).await?;
        Ok(data.len() as u64)
    }

    /// All keys under `prefix`, sorted.
    pub async fn list(&self, prefix: &ObjectKey) -> PipelineResult<Vec<ObjectKey>> {
        let location = self.location(prefix)?;
        let metas: Vec<_> = self.store.list(Some(&location)).try_collect().await?;
        let mut keys: Vec<ObjectKey> = metas
            .into_iter()
            .map(|meta| ObjectKey::new(&self.bucket, meta.location.as_ref()))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete an object. Missing objects are not an error.
    pub async fn delete(&self, key: &ObjectKey) -> PipelineResult<()> {
        match self.store.delete(&self.location(key)?).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete everything under `prefix`, returning how many objects were removed.
    pub async fn delete_prefix(&self, prefix: &ObjectKey) -> PipelineResult<usize> {
        let keys = self.list(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        tracing::info!("Deleting {} objects under {}", keys.len(), prefix);

        let results: Vec<PipelineResult<()>> = stream::iter(keys)
            .map(|key| async move { self.delete(&key).await })
            .buffer_unordered(64)
            .collect()
            .await;

        let mut deleted = 0;
        for result in results {
            result?;
            deleted += 1;
        }
        Ok(deleted)
    }

    pub async fn create_multipart(&self, target: &ObjectKey) -> PipelineResult<String> {
        let location = self.location(target)?;
        self.multipart.create(&location).await
    }

    pub async fn upload_part(
        &self,
        target: &ObjectKey,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> PipelineResult<String> {
        let location = self.location(target)?;
        self.multipart
            .upload_part(&location, upload_id, part_number, data)
            .await
    }

    pub async fn complete_multipart(
        &self,
        target: &ObjectKey,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> PipelineResult<()> {
        let location = self.location(target)?;
        self.multipart.complete(&location, upload_id, parts).await
    }

    pub async fn abort_multipart(&self, target: &ObjectKey, upload_id: &str) -> PipelineResult<()> {
        let location = self.location(target)?;
        self.multipart.abort(&location, upload_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_s3_store() {
        let config = StorageConfig {
            bucket: "test-bucket".to_string(),
            local_path: None,
            region: Some("us-east-1".to_string()),
            endpoint_url: None,
        };
        assert!(Storage::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_local_storage_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            bucket: "genomics".to_string(),
            local_path: Some(dir.path().to_string_lossy().to_string()),
            region: None,
            endpoint_url: None,
        };
        let storage = Storage::from_config(&config).unwrap();
        let key = storage.key("tmp/run-1/a.txt");

        assert!(!storage.exists(&key).await.unwrap());
        storage.put(&key, Bytes::from_static(b"hello")).await.unwrap();
        assert!(storage.exists(&key).await.unwrap());
        assert_eq!(&storage.get(&key).await.unwrap()[..], b"hello");
        assert_eq!(&storage.get_range(&key, 1..4).await.unwrap()[..], b"ell");
        assert!(dir.path().join("tmp/run-1/a.txt").exists());
    }

    #[tokio::test]
    async fn test_foreign_bucket_rejected() {
        let storage = Storage::in_memory("mine");
        let err = storage
            .put(&ObjectKey::new("theirs", "x"), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ForeignBucket { .. }));
    }

    #[tokio::test]
    async fn test_list_and_delete_prefix() {
        let storage = Storage::in_memory("bucket");
        for name in ["tmp/run/b", "tmp/run/a", "tmp/other/c"] {
            storage.put(&storage.key(name), Bytes::from_static(b"x")).await.unwrap();
        }

        let listed = storage.list(&storage.key("tmp/run")).await.unwrap();
        let names: Vec<_> = listed.iter().map(|k| k.key()).collect();
        assert_eq!(names, vec!["tmp/run/a", "tmp/run/b"]);

        assert_eq!(storage.delete_prefix(&storage.key("tmp/run")).await.unwrap(), 2);
        assert!(storage.list(&storage.key("tmp/run")).await.unwrap().is_empty());
        assert!(storage.exists(&storage.key("tmp/other/c")).await.unwrap());

        // Deleting a missing key is fine
        storage.delete(&storage.key("tmp/run/a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_exists_all() {
        let storage = Storage::in_memory("bucket");
        let a = storage.key("a");
        let b = storage.key("b");
        storage.put(&a, Bytes::from_static(b"1")).await.unwrap();
        assert!(storage.exists_all(&[a.clone()]).await.unwrap());
        assert!(!storage.exists_all(&[a, b]).await.unwrap());
        assert!(storage.exists_all(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_transfer() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::in_memory("bucket");
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"line1\nline2\n").unwrap();

        let key = storage.key("in/src.txt");
        assert_eq!(storage.upload_file(&key, &src).await.unwrap(), 12);

        let dest = dir.path().join("dest.txt");
        assert_eq!(storage.download_file(&key, &dest).await.unwrap(), 12);
        assert_eq!(std::fs::read(&dest).unwrap(), b"line1\nline2\n");
    }
}

//! Multipart-upload sub-protocol.
//!
//! S3 exposes multipart uploads natively through [`MultipartStore`]. Local and
//! in-memory stores do not, so [`StagedMultipart`] emulates the protocol by
//! writing each part as its own object and concatenating them on completion.
//! Both keep all upload state in the store, so any worker can upload a part
//! for any upload id.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Multipart-upload operations on a single bucket.
///
/// Part numbers are 1-based, as in S3. Uploading the same part number twice
/// replaces the earlier part.
#[async_trait]
pub trait MultipartBackend: Send + Sync {
    /// Start an upload for `location`, returning its upload id.
    async fn create(&self, location: &Path) -> PipelineResult<String>;

    /// Upload one part, returning its etag.
    async fn upload_part(
        &self,
        location: &Path,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> PipelineResult<String>;

    /// Assemble the object from `(part_number, etag)` pairs in ascending order.
    async fn complete(
        &self,
        location: &Path,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> PipelineResult<()>;

    /// Discard an upload and any parts stored for it.
    async fn abort(&self, location: &Path, upload_id: &str) -> PipelineResult<()>;
}

/// Require `parts` to be exactly `1..=n` in ascending order.
fn check_part_sequence(upload_id: &str, parts: &[(u32, String)]) -> PipelineResult<()> {
    let expected = parts.len() as u32;
    for (idx, (part_number, _)) in parts.iter().enumerate() {
        if *part_number != idx as u32 + 1 {
            return Err(PipelineError::UnexpectedPart {
                upload_id: upload_id.to_string(),
                part_number: *part_number,
                expected,
            });
        }
    }
    Ok(())
}

/// Native multipart uploads (S3 and compatible stores).
pub struct NativeMultipart {
    store: Arc<dyn MultipartStore>,
}

impl NativeMultipart {
    pub fn new(store: Arc<dyn MultipartStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MultipartBackend for NativeMultipart {
    async fn create(&self, location: &Path) -> PipelineResult<String> {
        Ok(self.store.create_multipart(location).await?)
    }

    async fn upload_part(
        &self,
        location: &Path,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> PipelineResult<String> {
        if part_number == 0 {
            return Err(PipelineError::UnexpectedPart {
                upload_id: upload_id.to_string(),
                part_number,
                expected: 0,
            });
        }
        let id = upload_id.to_string();
        let part = self
            .store
            .put_part(location, &id, part_number as usize - 1, PutPayload::from(data))
            .await?;
        Ok(part.content_id)
    }

    async fn complete(
        &self,
        location: &Path,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> PipelineResult<()> {
        // Part numbers are positional in the completion request.
        check_part_sequence(upload_id, parts)?;
        let part_ids = parts
            .iter()
            .map(|(_, etag)| PartId {
                content_id: etag.clone(),
            })
            .collect();
        let id = upload_id.to_string();
        self.store.complete_multipart(location, &id, part_ids).await?;
        Ok(())
    }

    async fn abort(&self, location: &Path, upload_id: &str) -> PipelineResult<()> {
        let id = upload_id.to_string();
        self.store.abort_multipart(location, &id).await?;
        Ok(())
    }
}

/// Multipart uploads emulated on top of plain object puts.
///
/// Parts live under `<location>.multipart/<upload_id>/` until completion.
pub struct StagedMultipart {
    store: Arc<dyn ObjectStore>,
    counter: AtomicU64,
}

impl StagedMultipart {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            counter: AtomicU64::new(0),
        }
    }

    fn staging_prefix(location: &Path, upload_id: &str) -> Path {
        Path::from(format!("{}.multipart/{}", location, upload_id))
    }

    fn marker(location: &Path, upload_id: &str) -> Path {
        Path::from(format!("{}.multipart/{}/upload", location, upload_id))
    }

    fn part_location(location: &Path, upload_id: &str, part_number: u32) -> Path {
        Path::from(format!(
            "{}.multipart/{}/part-{:05}",
            location, upload_id, part_number
        ))
    }

    fn new_upload_id(&self, location: &Path) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = DefaultHasher::new();
        location.as_ref().hash(&mut hasher);
        format!("{:x}-{:x}-{:04x}", nanos, hasher.finish() & 0xffff_ffff, seq)
    }

    async fn require_upload(&self, location: &Path, upload_id: &str) -> PipelineResult<()> {
        match self.store.head(&Self::marker(location, upload_id)).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Err(PipelineError::UnknownUpload {
                upload_id: upload_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_staged(&self, location: &Path, upload_id: &str) -> PipelineResult<()> {
        let prefix = Self::staging_prefix(location, upload_id);
        let staged: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        for meta in staged {
            match self.store.delete(&meta.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn content_etag(data: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl MultipartBackend for StagedMultipart {
    async fn create(&self, location: &Path) -> PipelineResult<String> {
        let upload_id = self.new_upload_id(location);
        self.store
            .put(
                &Self::marker(location, &upload_id),
                PutPayload::from(location.to_string().into_bytes()),
            )
            .await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        location: &Path,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> PipelineResult<String> {
        if part_number == 0 {
            return Err(PipelineError::UnexpectedPart {
                upload_id: upload_id.to_string(),
                part_number,
                expected: 0,
            });
        }
        self.require_upload(location, upload_id).await?;

        let fallback = content_etag(&data);
        let result = self
            .store
            .put(
                &Self::part_location(location, upload_id, part_number),
                PutPayload::from(data),
            )
            .await?;
        Ok(result.e_tag.unwrap_or(fallback))
    }

    async fn complete(
        &self,
        location: &Path,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> PipelineResult<()> {
        check_part_sequence(upload_id, parts)?;
        self.require_upload(location, upload_id).await?;

        let mut assembled = BytesMut::new();
        for (part_number, etag) in parts {
            let part_location = Self::part_location(location, upload_id, *part_number);
            let result = self.store.get(&part_location).await?;
            let stored_etag = result.meta.e_tag.clone();
            let data = result.bytes().await?;

            let current = stored_etag.unwrap_or_else(|| content_etag(&data));
            if &current != etag {
                return Err(PipelineError::PartMismatch {
                    upload_id: upload_id.to_string(),
                    part_number: *part_number,
                    etag: etag.clone(),
                });
            }
            assembled.extend_from_slice(&data);
        }

        self.store
            .put(location, PutPayload::from(assembled.freeze()))
            .await?;
        self.delete_staged(location, upload_id).await
    }

    async fn abort(&self, location: &Path, upload_id: &str) -> PipelineResult<()> {
        self.delete_staged(location, upload_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn staged() -> (Arc<InMemory>, StagedMultipart) {
        let store = Arc::new(InMemory::new());
        let multipart = StagedMultipart::new(store.clone());
        (store, multipart)
    }

    #[tokio::test]
    async fn test_staged_upload_assembles_in_part_order() {
        let (store, multipart) = staged();
        let location = Path::from("out/fa0.sinple");

        let upload_id = multipart.create(&location).await.unwrap();
        let e2 = multipart
            .upload_part(&location, &upload_id, 2, Bytes::from_static(b"second\n"))
            .await
            .unwrap();
        let e1 = multipart
            .upload_part(&location, &upload_id, 1, Bytes::from_static(b"first\n"))
            .await
            .unwrap();

        multipart
            .complete(&location, &upload_id, &[(1, e1), (2, e2)])
            .await
            .unwrap();

        let data = store.get(&location).await.unwrap().bytes().await.unwrap();
        assert_eq!(&data[..], b"first\nsecond\n");

        // Staging area is cleaned up
        let staged: Vec<_> = store
            .list(Some(&Path::from("out/fa0.sinple.multipart")))
            .try_collect()
            .await
            .unwrap();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn test_staged_part_replacement() {
        let (store, multipart) = staged();
        let location = Path::from("out/fa1.sinple");
        let upload_id = multipart.create(&location).await.unwrap();

        let _stale = multipart
            .upload_part(&location, &upload_id, 1, Bytes::from_static(b"old\n"))
            .await
            .unwrap();
        let fresh = multipart
            .upload_part(&location, &upload_id, 1, Bytes::from_static(b"new\n"))
            .await
            .unwrap();

        multipart
            .complete(&location, &upload_id, &[(1, fresh)])
            .await
            .unwrap();
        let data = store.get(&location).await.unwrap().bytes().await.unwrap();
        assert_eq!(&data[..], b"new\n");
    }

    #[tokio::test]
    async fn test_staged_rejects_stale_etag() {
        let (_store, multipart) = staged();
        let location = Path::from("out/fa2.sinple");
        let upload_id = multipart.create(&location).await.unwrap();

        let stale = multipart
            .upload_part(&location, &upload_id, 1, Bytes::from_static(b"old\n"))
            .await
            .unwrap();
        multipart
            .upload_part(&location, &upload_id, 1, Bytes::from_static(b"replaced\n"))
            .await
            .unwrap();

        let err = multipart
            .complete(&location, &upload_id, &[(1, stale)])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PartMismatch { part_number: 1, .. }));
    }

    #[tokio::test]
    async fn test_staged_unknown_upload() {
        let (_store, multipart) = staged();
        let location = Path::from("out/fa3.sinple");
        let err = multipart
            .upload_part(&location, "missing", 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownUpload { .. }));
    }

    #[tokio::test]
    async fn test_staged_abort_discards_parts() {
        let (store, multipart) = staged();
        let location = Path::from("out/fa4.sinple");
        let upload_id = multipart.create(&location).await.unwrap();
        multipart
            .upload_part(&location, &upload_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();

        multipart.abort(&location, &upload_id).await.unwrap();

        assert!(store.head(&location).await.is_err());
        let err = multipart
            .upload_part(&location, &upload_id, 2, Bytes::from_static(b"y"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownUpload { .. }));
    }

    #[test]
    fn test_part_sequence_must_be_contiguous() {
        assert!(check_part_sequence("u", &[(1, "a".into()), (2, "b".into())]).is_ok());
        assert!(check_part_sequence("u", &[(2, "b".into()), (1, "a".into())]).is_err());
        assert!(check_part_sequence("u", &[(1, "a".into()), (3, "c".into())]).is_err());
        assert!(check_part_sequence("u", &[]).is_ok());
    }
}

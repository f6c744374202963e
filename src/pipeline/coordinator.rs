//! Multipart upload coordination.
//!
//! One [`PartitionUpload`] per reference chunk assembles that chunk's reduced
//! output from the parts written by its reduce workers. Parts come back in
//! whatever order the workers finish, interleaved across uploads; they are
//! grouped by upload id before anything is ordered or completed.
//!
//! State per upload: `Created -> Collecting -> Finalizing -> Completed`, or
//! `Aborted` when a run gives up on it.

use super::metrics::Metrics;
use crate::error::{PipelineError, PipelineResult};
use crate::io::{ObjectKey, Storage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A part written by a reduce worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPart {
    pub upload_id: String,
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Created,
    Collecting,
    Finalizing,
    Completed,
    Aborted,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Created => "created",
            UploadState::Collecting => "collecting",
            UploadState::Finalizing => "finalizing",
            UploadState::Completed => "completed",
            UploadState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One multipart upload and the parts collected for it so far.
#[derive(Debug, Clone)]
pub struct PartitionUpload {
    pub partition_id: u32,
    pub upload_id: String,
    pub target: ObjectKey,
    pub expected_parts: u32,
    /// part number -> etag; a later part with the same number replaces the earlier
    collected: BTreeMap<u32, String>,
    state: UploadState,
}

impl PartitionUpload {
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Collected parts in ascending part-number order.
    pub fn collected_parts(&self) -> Vec<UploadPart> {
        self.collected
            .iter()
            .map(|(n, etag)| UploadPart {
                upload_id: self.upload_id.clone(),
                part_number: *n,
                etag: etag.clone(),
            })
            .collect()
    }

    pub fn collected_count(&self) -> u32 {
        self.collected.len() as u32
    }

    /// Whether parts `1..=expected_parts` have all arrived.
    pub fn is_complete(&self) -> bool {
        self.collected.len() as u32 == self.expected_parts
            && self.collected.keys().copied().eq(1..=self.expected_parts)
    }
}

/// Group parts by upload id, each group sorted by part number.
///
/// Later duplicates of a part number replace earlier ones.
pub fn group_parts(parts: impl IntoIterator<Item = UploadPart>) -> BTreeMap<String, Vec<UploadPart>> {
    let mut grouped: BTreeMap<String, BTreeMap<u32, UploadPart>> = BTreeMap::new();
    for part in parts {
        grouped
            .entry(part.upload_id.clone())
            .or_default()
            .insert(part.part_number, part);
    }
    grouped
        .into_iter()
        .map(|(id, parts)| (id, parts.into_values().collect()))
        .collect()
}

/// Owns every multipart upload of a run.
pub struct MultipartCoordinator {
    storage: Storage,
    uploads: BTreeMap<String, PartitionUpload>,
    metrics: Arc<Metrics>,
}

impl MultipartCoordinator {
    pub fn new(storage: Storage, metrics: Arc<Metrics>) -> Self {
        Self {
            storage,
            uploads: BTreeMap::new(),
            metrics,
        }
    }

    /// Start an upload for `target` that will receive `expected_parts` parts.
    pub async fn create(
        &mut self,
        partition_id: u32,
        target: ObjectKey,
        expected_parts: u32,
    ) -> PipelineResult<String> {
        let upload_id = self.storage.create_multipart(&target).await?;
        tracing::info!(
            "Created multipart upload {} for {} ({} parts)",
            upload_id,
            target,
            expected_parts
        );
        self.uploads.insert(
            upload_id.clone(),
            PartitionUpload {
                partition_id,
                upload_id: upload_id.clone(),
                target,
                expected_parts,
                collected: BTreeMap::new(),
                state: UploadState::Created,
            },
        );
        Ok(upload_id)
    }

    pub fn upload(&self, upload_id: &str) -> Option<&PartitionUpload> {
        self.uploads.get(upload_id)
    }

    pub fn uploads(&self) -> impl Iterator<Item = &PartitionUpload> {
        self.uploads.values()
    }

    /// Record parts from any mix of uploads, in any order.
    ///
    /// The batch is checked as a whole first: a part for an unknown or closed
    /// upload, or with a number outside `1..=expected`, rejects the batch.
    pub fn collect(&mut self, parts: impl IntoIterator<Item = UploadPart>) -> PipelineResult<()> {
        let grouped = group_parts(parts);

        for (upload_id, parts) in &grouped {
            let upload = self.open_upload(upload_id)?;
            for part in parts {
                if part.part_number == 0 || part.part_number > upload.expected_parts {
                    return Err(PipelineError::UnexpectedPart {
                        upload_id: upload_id.clone(),
                        part_number: part.part_number,
                        expected: upload.expected_parts,
                    });
                }
            }
        }

        for (upload_id, parts) in grouped {
            if let Some(upload) = self.uploads.get_mut(&upload_id) {
                for part in parts {
                    if upload.collected.insert(part.part_number, part.etag).is_some() {
                        tracing::debug!(
                            "Part {} of upload {} replaced by a retry",
                            part.part_number,
                            upload_id
                        );
                    }
                }
                upload.state = UploadState::Collecting;
            }
        }
        Ok(())
    }

    fn open_upload(&self, upload_id: &str) -> PipelineResult<&PartitionUpload> {
        match self.uploads.get(upload_id) {
            Some(upload)
                if !matches!(upload.state, UploadState::Completed | UploadState::Aborted) =>
            {
                Ok(upload)
            }
            _ => Err(PipelineError::UnknownUpload {
                upload_id: upload_id.to_string(),
            }),
        }
    }

    /// Complete one upload once all of its parts have arrived.
    ///
    /// Fails with `IncompleteMultipartUpload`, without calling the store, when
    /// any expected part is missing. Finalizing a completed upload is a no-op.
    pub async fn finalize(&mut self, upload_id: &str) -> PipelineResult<()> {
        let upload = match self.uploads.get_mut(upload_id) {
            Some(upload) if upload.state == UploadState::Completed => return Ok(()),
            Some(upload) if upload.state != UploadState::Aborted => upload,
            _ => {
                return Err(PipelineError::UnknownUpload {
                    upload_id: upload_id.to_string(),
                })
            }
        };

        if !upload.is_complete() {
            return Err(PipelineError::IncompleteMultipartUpload {
                upload_id: upload_id.to_string(),
                target: upload.target.to_string(),
                expected: upload.expected_parts,
                collected: upload.collected_count(),
            });
        }

        upload.state = UploadState::Finalizing;
        let parts: Vec<(u32, String)> = upload
            .collected
            .iter()
            .map(|(n, etag)| (*n, etag.clone()))
            .collect();

        match self
            .storage
            .complete_multipart(&upload.target, upload_id, &parts)
            .await
        {
            Ok(()) => {
                upload.state = UploadState::Completed;
                self.metrics.add_upload_completed();
                tracing::info!(
                    "Completed {} from {} parts (partition {})",
                    upload.target,
                    parts.len(),
                    upload.partition_id
                );
                Ok(())
            }
            Err(e) => {
                // Parts are still staged; finalize may be retried
                upload.state = UploadState::Collecting;
                Err(e)
            }
        }
    }

    /// Finalize every open upload. All are attempted; the first error is returned.
    pub async fn finalize_all(&mut self) -> PipelineResult<usize> {
        let pending: Vec<String> = self
            .uploads
            .values()
            .filter(|u| !matches!(u.state, UploadState::Completed | UploadState::Aborted))
            .map(|u| u.upload_id.clone())
            .collect();

        let mut completed = 0;
        let mut first_error = None;
        for upload_id in pending {
            match self.finalize(&upload_id).await {
                Ok(()) => completed += 1,
                Err(e) => {
                    tracing::error!("Failed to finalize upload {}: {}", upload_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    /// Abort an upload so the store discards its parts.
    pub async fn abort(&mut self, upload_id: &str) -> PipelineResult<()> {
        let upload = self
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| PipelineError::UnknownUpload {
                upload_id: upload_id.to_string(),
            })?;
        if matches!(upload.state, UploadState::Completed | UploadState::Aborted) {
            return Ok(());
        }
        self.storage
            .abort_multipart(&upload.target, upload_id)
            .await?;
        upload.state = UploadState::Aborted;
        self.metrics.add_upload_aborted();
        tracing::warn!("Aborted multipart upload {} for {}", upload_id, upload.target);
        Ok(())
    }

    /// Abort every upload that has not completed, returning how many were aborted.
    pub async fn abort_incomplete(&mut self) -> usize {
        let open: Vec<String> = self
            .uploads
            .values()
            .filter(|u| !matches!(u.state, UploadState::Completed | UploadState::Aborted))
            .map(|u| u.upload_id.clone())
            .collect();

        let mut aborted = 0;
        for upload_id in open {
            match self.abort(&upload_id).await {
                Ok(()) => aborted += 1,
                Err(e) => tracing::warn!("Failed to abort upload {}: {}", upload_id, e),
            }
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn part(upload_id: &str, part_number: u32, etag: &str) -> UploadPart {
        UploadPart {
            upload_id: upload_id.to_string(),
            part_number,
            etag: etag.to_string(),
        }
    }

    #[test]
    fn test_group_parts_by_upload() {
        let grouped = group_parts(vec![
            part("u1", 2, "a"),
            part("u2", 1, "b"),
            part("u1", 1, "c"),
            part("u1", 2, "d"),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["u1"], vec![part("u1", 1, "c"), part("u1", 2, "d")]);
        assert_eq!(grouped["u2"], vec![part("u2", 1, "b")]);
    }

    async fn upload_bytes(
        storage: &Storage,
        target: &ObjectKey,
        upload_id: &str,
        n: u32,
        data: &'static [u8],
    ) -> UploadPart {
        let etag = storage
            .upload_part(target, upload_id, n, Bytes::from_static(data))
            .await
            .unwrap();
        UploadPart {
            upload_id: upload_id.to_string(),
            part_number: n,
            etag,
        }
    }

    #[tokio::test]
    async fn test_interleaved_parts_assemble_each_target() {
        let storage = Storage::in_memory("bucket");
        let mut coordinator = MultipartCoordinator::new(storage.clone(), Metrics::new());
        let targets: Vec<ObjectKey> = (1..=3).map(|i| storage.key(&format!("out/fa{}.sinple", i))).collect();

        let mut ids = Vec::new();
        for (i, target) in targets.iter().enumerate() {
            ids.push(coordinator.create(i as u32 + 1, target.clone(), 2).await.unwrap());
        }

        // [U1P1, U2P1, U1P2, U3P1, U2P2, U3P2]
        let arrivals = vec![
            upload_bytes(&storage, &targets[0], &ids[0], 1, b"1a\n").await,
            upload_bytes(&storage, &targets[1], &ids[1], 1, b"2a\n").await,
            upload_bytes(&storage, &targets[0], &ids[0], 2, b"1b\n").await,
            upload_bytes(&storage, &targets[2], &ids[2], 1, b"3a\n").await,
            upload_bytes(&storage, &targets[1], &ids[1], 2, b"2b\n").await,
            upload_bytes(&storage, &targets[2], &ids[2], 2, b"3b\n").await,
        ];
        coordinator.collect(arrivals).unwrap();
        assert_eq!(coordinator.finalize_all().await.unwrap(), 3);

        for (i, target) in targets.iter().enumerate() {
            let data = storage.get(target).await.unwrap();
            let expected = format!("{0}a\n{0}b\n", i + 1);
            assert_eq!(&data[..], expected.as_bytes());
            assert_eq!(coordinator.upload(&ids[i]).unwrap().state(), UploadState::Completed);
        }
    }

    #[tokio::test]
    async fn test_reverse_arrival_completes_in_order() {
        let storage = Storage::in_memory("bucket");
        let mut coordinator = MultipartCoordinator::new(storage.clone(), Metrics::new());
        let target = storage.key("out/fa0.sinple");
        let id = coordinator.create(0, target.clone(), 3).await.unwrap();

        let p3 = upload_bytes(&storage, &target, &id, 3, b"c").await;
        let p2 = upload_bytes(&storage, &target, &id, 2, b"b").await;
        let p1 = upload_bytes(&storage, &target, &id, 1, b"a").await;
        coordinator.collect(vec![p3]).unwrap();
        assert_eq!(coordinator.upload(&id).unwrap().state(), UploadState::Collecting);
        coordinator.collect(vec![p2, p1]).unwrap();

        coordinator.finalize(&id).await.unwrap();
        assert_eq!(&storage.get(&target).await.unwrap()[..], b"abc");

        // Second finalize is a no-op
        coordinator.finalize(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_incomplete_upload_is_not_completed() {
        let storage = Storage::in_memory("bucket");
        let mut coordinator = MultipartCoordinator::new(storage.clone(), Metrics::new());
        let target = storage.key("out/fa0.sinple");
        let id = coordinator.create(0, target.clone(), 3).await.unwrap();

        let p1 = upload_bytes(&storage, &target, &id, 1, b"a").await;
        let p3 = upload_bytes(&storage, &target, &id, 3, b"c").await;
        coordinator.collect(vec![p1, p3]).unwrap();

        match coordinator.finalize(&id).await {
            Err(PipelineError::IncompleteMultipartUpload {
                expected, collected, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(collected, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!storage.exists(&target).await.unwrap());
        assert_eq!(coordinator.upload(&id).unwrap().state(), UploadState::Collecting);
    }

    #[tokio::test]
    async fn test_unknown_upload_rejected() {
        let storage = Storage::in_memory("bucket");
        let mut coordinator = MultipartCoordinator::new(storage.clone(), Metrics::new());
        let id = coordinator.create(0, storage.key("out/x"), 1).await.unwrap();

        let err = coordinator
            .collect(vec![part(&id, 1, "a"), part("bogus", 1, "b")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownUpload { .. }));
        // Nothing from the rejected batch was recorded
        assert_eq!(coordinator.upload(&id).unwrap().collected_count(), 0);

        assert!(matches!(
            coordinator.finalize("bogus").await,
            Err(PipelineError::UnknownUpload { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_part_rejected() {
        let storage = Storage::in_memory("bucket");
        let mut coordinator = MultipartCoordinator::new(storage.clone(), Metrics::new());
        let id = coordinator.create(0, storage.key("out/x"), 2).await.unwrap();

        for n in [0, 3] {
            let err = coordinator.collect(vec![part(&id, n, "a")]).unwrap_err();
            assert!(matches!(err, PipelineError::UnexpectedPart { .. }));
        }
    }

    #[tokio::test]
    async fn test_retried_part_replaces_earlier() {
        let storage = Storage::in_memory("bucket");
        let mut coordinator = MultipartCoordinator::new(storage.clone(), Metrics::new());
        let target = storage.key("out/fa0.sinple");
        let id = coordinator.create(0, target.clone(), 1).await.unwrap();

        let first = upload_bytes(&storage, &target, &id, 1, b"first").await;
        coordinator.collect(vec![first]).unwrap();
        let retry = upload_bytes(&storage, &target, &id, 1, b"retry").await;
        coordinator.collect(vec![retry.clone()]).unwrap();

        assert_eq!(coordinator.upload(&id).unwrap().collected_parts(), vec![retry]);
        coordinator.finalize(&id).await.unwrap();
        assert_eq!(&storage.get(&target).await.unwrap()[..], b"retry");
    }

    #[tokio::test]
    async fn test_abort_incomplete() {
        let storage = Storage::in_memory("bucket");
        let metrics = Metrics::new();
        let mut coordinator = MultipartCoordinator::new(storage.clone(), metrics.clone());
        let done_target = storage.key("out/done");
        let done = coordinator.create(0, done_target.clone(), 1).await.unwrap();
        let open = coordinator.create(1, storage.key("out/open"), 2).await.unwrap();

        let p = upload_bytes(&storage, &done_target, &done, 1, b"x").await;
        coordinator.collect(vec![p]).unwrap();
        coordinator.finalize(&done).await.unwrap();

        assert_eq!(coordinator.abort_incomplete().await, 1);
        assert_eq!(coordinator.upload(&open).unwrap().state(), UploadState::Aborted);
        assert_eq!(coordinator.upload(&done).unwrap().state(), UploadState::Completed);
        assert!(coordinator.collect(vec![part(&open, 1, "a")]).is_err());
        assert_eq!(metrics.snapshot().uploads_aborted, 1);
    }
}

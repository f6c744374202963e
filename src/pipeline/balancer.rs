//! Partition balancing.
//!
//! Splits the key domain of a set of sources into contiguous ranges holding at
//! most `budget` records each. A single key with more than `budget` records
//! cannot be split and gets a range of its own.

use super::metrics::Metrics;
use crate::error::PipelineResult;
use crate::index::{KeyCounts, PartitionRange};
use crate::io::{ObjectKey, RecordSource, Storage};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;

/// Default maximum number of records per range.
pub const DEFAULT_BUDGET: u64 = 20_000_000;

/// Ranges computed from one snapshot of key counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Inclusive end key of each range, ascending
    pub ends: Vec<i64>,
    /// Smallest key observed
    pub domain_min: Option<i64>,
    /// Records per range, parallel to `ends`
    pub counts: Vec<u64>,
}

impl PartitionPlan {
    pub fn empty() -> Self {
        Self {
            ends: Vec::new(),
            domain_min: None,
            counts: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    /// Ranges in order; each starts one past the previous end.
    pub fn ranges(&self) -> Vec<PartitionRange> {
        let Some(mut start) = self.domain_min else {
            return Vec::new();
        };
        let mut ranges = Vec::with_capacity(self.ends.len());
        for &end in &self.ends {
            ranges.push(PartitionRange::new(start, end));
            // Ends ascend, so a range ending at i64::MAX is the last one
            match end.checked_add(1) {
                Some(next) => start = next,
                None => break,
            }
        }
        ranges
    }
}

/// Walk the sorted key domain once, closing a range whenever the next key
/// would push it past `budget`.
pub fn balance(counts: &KeyCounts, budget: u64) -> PartitionPlan {
    let mut ends = Vec::new();
    let mut range_counts = Vec::new();
    let mut acc: u64 = 0;
    // Last key added to the open range; None until a range is open
    let mut current_end: Option<i64> = None;

    for (key, count) in counts.iter() {
        match current_end {
            Some(end) if acc.saturating_add(count) > budget => {
                ends.push(end);
                range_counts.push(acc);
                acc = count;
            }
            _ => acc = acc.saturating_add(count),
        }
        if count > budget {
            tracing::warn!(
                "Key {} has {} records, more than the partition budget of {}",
                key,
                count,
                budget
            );
        }
        current_end = Some(key);
    }

    if let Some(end) = current_end {
        ends.push(end);
        range_counts.push(acc);
    }

    PartitionPlan {
        ends,
        domain_min: counts.min_key(),
        counts: range_counts,
    }
}

/// Counts keys across sources and balances them.
pub struct PartitionBalancer {
    storage: Storage,
    source: Arc<dyn RecordSource>,
    budget: u64,
    concurrency: usize,
    metrics: Arc<Metrics>,
}

impl PartitionBalancer {
    pub fn new(
        storage: Storage,
        source: Arc<dyn RecordSource>,
        budget: u64,
        concurrency: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            source,
            budget,
            concurrency: concurrency.max(1),
            metrics,
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Count keys by querying the key column of every source.
    pub async fn count_keys(&self, sources: &[ObjectKey]) -> PipelineResult<KeyCounts> {
        let source = &self.source;
        let results: Vec<PipelineResult<Vec<i64>>> = stream::iter(sources)
            .map(|key| async move { source.select_keys(key).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut counts = KeyCounts::new();
        for keys in results {
            counts.extend_keys(keys?);
        }
        Ok(counts)
    }

    /// Merge the key-count sidecars stored next to each source.
    pub async fn count_from_sidecars(&self, sidecars: &[ObjectKey]) -> PipelineResult<KeyCounts> {
        let storage = &self.storage;
        let metrics = &self.metrics;
        let results: Vec<PipelineResult<KeyCounts>> = stream::iter(sidecars)
            .map(|key| async move {
                let data = storage.get(key).await?;
                metrics.add_bytes_read(data.len() as u64);
                KeyCounts::from_sidecar(&data)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut counts = KeyCounts::new();
        for partial in results {
            counts.merge(&partial?);
        }
        Ok(counts)
    }

    /// Plan ranges for `sources`, reading sidecars when given.
    pub async fn plan(
        &self,
        sources: &[ObjectKey],
        sidecars: Option<&[ObjectKey]>,
    ) -> PipelineResult<(PartitionPlan, KeyCounts)> {
        let start = Instant::now();
        let counts = match sidecars {
            Some(sidecars) => self.count_from_sidecars(sidecars).await?,
            None => self.count_keys(sources).await?,
        };
        let plan = balance(&counts, self.budget);
        tracing::info!(
            "Balanced {} records over {} keys from {} sources into {} ranges in {:.2}s",
            counts.total(),
            counts.len(),
            sources.len(),
            plan.len(),
            start.elapsed().as_secs_f64()
        );
        Ok((plan, counts))
    }
}

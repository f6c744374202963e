//! Integer-keyed records, per-key counts and partition ranges.
//!
//! Intermediate artifacts are tab-separated text with one record per line; the
//! record key is an integer read from a fixed column (the position column of an
//! mpileup, by default).

use crate::error::{PipelineError, PipelineResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Zero-based column holding the record key (mpileup position).
pub const DEFAULT_KEY_COLUMN: usize = 1;

/// One row of an intermediate artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRecord {
    pub key: i64,
    /// The full line, including its trailing newline when present.
    pub payload: Bytes,
}

/// Parse the key out of one line.
fn parse_key(line: &[u8], key_column: usize) -> PipelineResult<i64> {
    let line = strip_newline(line);
    let field = line
        .split(|b| *b == b'\t')
        .nth(key_column)
        .ok_or_else(|| PipelineError::Parse {
            context: "record".to_string(),
            message: format!(
                "missing column {} in '{}'",
                key_column,
                String::from_utf8_lossy(line)
            ),
        })?;

    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| PipelineError::Parse {
            context: "record".to_string(),
            message: format!("non-integer key '{}'", String::from_utf8_lossy(field)),
        })
}

fn strip_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Iterate the non-empty lines of `data`, each with its newline.
fn lines(data: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    let mut start = 0;
    std::iter::from_fn(move || {
        while start < data.len() {
            let end = data[start..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|p| start + p + 1)
                .unwrap_or(data.len());
            let line = data.slice(start..end);
            start = end;
            if !strip_newline(&line).is_empty() {
                return Some(line);
            }
        }
        None
    })
}

/// Parse every record in a tab-separated artifact, preserving order.
pub fn parse_records(data: &Bytes, key_column: usize) -> PipelineResult<Vec<IndexedRecord>> {
    lines(data)
        .map(|line| {
            Ok(IndexedRecord {
                key: parse_key(&line, key_column)?,
                payload: line,
            })
        })
        .collect()
}

/// Occurrence count per key, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCounts {
    counts: BTreeMap<i64, u64>,
}

impl KeyCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: i64, count: u64) {
        let entry = self.counts.entry(key).or_insert(0);
        *entry = entry.saturating_add(count);
    }

    pub fn extend_keys(&mut self, keys: impl IntoIterator<Item = i64>) {
        for key in keys {
            self.add(key, 1);
        }
    }

    pub fn merge(&mut self, other: &KeyCounts) {
        for (key, count) in &other.counts {
            self.add(*key, *count);
        }
    }

    pub fn get(&self, key: i64) -> u64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    /// Total number of records.
    pub fn total(&self) -> u64 {
        self.counts.values().fold(0, |acc, c| acc.saturating_add(*c))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn min_key(&self) -> Option<i64> {
        self.counts.keys().next().copied()
    }

    pub fn max_key(&self) -> Option<i64> {
        self.counts.keys().next_back().copied()
    }

    /// `(key, count)` pairs in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, u64)> + '_ {
        self.counts.iter().map(|(k, c)| (*k, *c))
    }

    /// Records whose key lies in `range`.
    pub fn count_in(&self, range: PartitionRange) -> u64 {
        self.counts
            .range(range.start..=range.end)
            .fold(0, |acc, (_, c)| acc.saturating_add(*c))
    }

    /// Count keys in a tab-separated artifact.
    pub fn from_records(data: &Bytes, key_column: usize) -> PipelineResult<Self> {
        let mut counts = Self::new();
        for line in lines(data) {
            counts.add(parse_key(&line, key_column)?, 1);
        }
        Ok(counts)
    }

    /// Render as `key\tcount` lines.
    pub fn to_sidecar(&self) -> String {
        let mut out = String::new();
        for (key, count) in self.iter() {
            out.push_str(&format!("{}\t{}\n", key, count));
        }
        out
    }

    /// Parse `key\tcount` lines.
    pub fn from_sidecar(data: &Bytes) -> PipelineResult<Self> {
        let mut counts = Self::new();
        for line in lines(data) {
            let text = String::from_utf8_lossy(strip_newline(&line)).to_string();
            let parsed = text
                .split_once('\t')
                .and_then(|(k, c)| Some((k.parse::<i64>().ok()?, c.parse::<u64>().ok()?)));
            match parsed {
                Some((key, count)) => counts.add(key, count),
                None => {
                    return Err(PipelineError::Parse {
                        context: "key-count sidecar".to_string(),
                        message: format!("malformed line '{}'", text),
                    })
                }
            }
        }
        Ok(counts)
    }
}

impl FromIterator<i64> for KeyCounts {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        let mut counts = Self::new();
        counts.extend_keys(iter);
        counts
    }
}

/// Closed key interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionRange {
    pub start: i64,
    pub end: i64,
}

impl PartitionRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: i64) -> bool {
        self.start <= key && key <= self.end
    }
}

impl fmt::Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Keep the lines of `data` whose key lies in `range`, in source order.
pub fn filter_range(data: &Bytes, range: PartitionRange, key_column: usize) -> PipelineResult<Bytes> {
    let mut out = Vec::with_capacity(data.len());
    for record in parse_records(data, key_column)? {
        if range.contains(record.key) {
            out.extend_from_slice(&record.payload);
            if !record.payload.ends_with(b"\n") {
                out.push(b'\n');
            }
        }
    }
    Ok(Bytes::from(out))
}

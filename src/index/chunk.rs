//! Input chunk references and the run's chunk manifest.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Byte span `[start, end)` within a source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One immutable slice of an input sequence file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: u32,
    /// `s3://bucket/key` of the file the slice is taken from.
    pub source_locator: String,
    /// Slice of the source; the whole object when absent.
    #[serde(default)]
    pub byte_range: Option<ByteRange>,
}

/// The reference (FASTA) and read (FASTQ) chunks of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    #[serde(default)]
    pub fasta: Vec<ChunkRef>,
    #[serde(default)]
    pub fastq: Vec<ChunkRef>,
}

impl ChunkManifest {
    /// Load a manifest from a YAML or JSON file, by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chunk manifest {}", path.display()))?;
        let manifest: ChunkManifest = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Chunk ids must be unique within each list.
    pub fn validate(&self) -> Result<()> {
        for (name, chunks) in [("fasta", &self.fasta), ("fastq", &self.fastq)] {
            let mut seen = BTreeSet::new();
            for chunk in chunks {
                if !seen.insert(chunk.id) {
                    anyhow::bail!("Duplicate {} chunk id {}", name, chunk.id);
                }
                if let Some(range) = chunk.byte_range {
                    if range.end < range.start {
                        anyhow::bail!(
                            "{} chunk {} has an inverted byte range {}..{}",
                            name,
                            chunk.id,
                            range.start,
                            range.end
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Restrict reference chunks to the inclusive id range `[first, last]`.
    pub fn restrict_fasta(&mut self, first: u32, last: u32) {
        self.fasta.retain(|c| first <= c.id && c.id <= last);
    }

    /// Number of (reference, read) pairs.
    pub fn pair_count(&self) -> usize {
        self.fasta.len() * self.fastq.len()
    }
}

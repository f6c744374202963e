//! Deterministic object keys for every pipeline artifact.
//!
//! A [`StageKey`] names an artifact by what produced it: the artifact kind plus
//! the reference and read chunk ids involved. [`KeyLayout`] maps it to an
//! [`ObjectKey`] for a given run, and maps keys back for grouping.
//!
//! Layout under `<tmp>/<run_id>/`:
//!
//! ```text
//! gem-mapper/fq<q>/fa<a>/<base>_map.index.txt
//! gem-mapper/fq<q>/fa<a>/<base>_filt_wline_no.map
//! index-correction/fq<q>/merged_filtered_index.txt
//! mpileups/fq<q>/fa<a>/<base>_fa<a>-fq<q>.mpileup[.keys]
//! multipart_uploads/fa<a>.sinple
//! ```
//!
//! Reference indexes live at `gem/fa<a>.gem`, outside any run.

use crate::io::ObjectKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage that produces an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    IndexBuild,
    AlignFilter,
    IndexCorrection,
    Pileup,
    Reduce,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::IndexBuild => "index-build",
            Stage::AlignFilter => "align-filter",
            Stage::IndexCorrection => "index-correction",
            Stage::Pileup => "pileup",
            Stage::Reduce => "reduce",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Artifact {
    GemIndex,
    MapIndex,
    FilteredMap,
    CorrectedIndex,
    Pileup,
    PileupKeyCounts,
    Merged,
}

impl Artifact {
    pub fn stage(&self) -> Stage {
        match self {
            Artifact::GemIndex => Stage::IndexBuild,
            Artifact::MapIndex | Artifact::FilteredMap => Stage::AlignFilter,
            Artifact::CorrectedIndex => Stage::IndexCorrection,
            Artifact::Pileup | Artifact::PileupKeyCounts => Stage::Pileup,
            Artifact::Merged => Stage::Reduce,
        }
    }
}

/// Structured identity of one artifact within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageKey {
    pub artifact: Artifact,
    pub fasta_chunk_id: Option<u32>,
    pub fastq_chunk_id: Option<u32>,
}

impl StageKey {
    pub fn gem_index(fasta: u32) -> Self {
        Self::new(Artifact::GemIndex, Some(fasta), None)
    }

    pub fn map_index(fasta: u32, fastq: u32) -> Self {
        Self::new(Artifact::MapIndex, Some(fasta), Some(fastq))
    }

    pub fn filtered_map(fasta: u32, fastq: u32) -> Self {
        Self::new(Artifact::FilteredMap, Some(fasta), Some(fastq))
    }

    pub fn corrected_index(fastq: u32) -> Self {
        Self::new(Artifact::CorrectedIndex, None, Some(fastq))
    }

    pub fn pileup(fasta: u32, fastq: u32) -> Self {
        Self::new(Artifact::Pileup, Some(fasta), Some(fastq))
    }

    pub fn pileup_key_counts(fasta: u32, fastq: u32) -> Self {
        Self::new(Artifact::PileupKeyCounts, Some(fasta), Some(fastq))
    }

    pub fn merged(fasta: u32) -> Self {
        Self::new(Artifact::Merged, Some(fasta), None)
    }

    fn new(artifact: Artifact, fasta_chunk_id: Option<u32>, fastq_chunk_id: Option<u32>) -> Self {
        Self {
            artifact,
            fasta_chunk_id,
            fastq_chunk_id,
        }
    }

    pub fn stage(&self) -> Stage {
        self.artifact.stage()
    }
}

const GEM_DIR: &str = "gem";
const MAPPER_DIR: &str = "gem-mapper";
const CORRECTION_DIR: &str = "index-correction";
const PILEUP_DIR: &str = "mpileups";
const MULTIPART_DIR: &str = "multipart_uploads";
const CORRECTED_INDEX_NAME: &str = "merged_filtered_index.txt";
const KEYS_SUFFIX: &str = ".keys";

/// Maps stage keys to object keys for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    bucket: String,
    tmp_prefix: String,
    run_id: String,
    base_name: String,
}

impl KeyLayout {
    pub fn new(
        bucket: impl Into<String>,
        tmp_prefix: impl Into<String>,
        run_id: impl Into<String>,
        base_name: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            tmp_prefix: tmp_prefix.into(),
            run_id: run_id.into(),
            base_name: base_name.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Prefix holding every temporary artifact of this run.
    pub fn run_prefix(&self) -> ObjectKey {
        ObjectKey::new(&self.bucket, &self.tmp_prefix).join(&self.run_id)
    }

    /// Prefix holding cached reference indexes (shared across runs).
    pub fn index_prefix(&self) -> ObjectKey {
        ObjectKey::new(&self.bucket, GEM_DIR)
    }

    pub fn pileup_prefix(&self) -> ObjectKey {
        self.run_prefix().join(PILEUP_DIR)
    }

    /// Where the run's telemetry summary is stored.
    pub fn telemetry(&self) -> ObjectKey {
        self.run_prefix().join("telemetry.json")
    }

    /// Resolve a stage key.
    pub fn resolve(&self, key: &StageKey) -> ObjectKey {
        let fa = key.fasta_chunk_id.unwrap_or_default();
        let fq = key.fastq_chunk_id.unwrap_or_default();
        let base = &self.base_name;
        match key.artifact {
            Artifact::GemIndex => self.index_prefix().join(&format!("fa{}.gem", fa)),
            Artifact::MapIndex => self
                .mapper_dir(fa, fq)
                .join(&format!("{}_map.index.txt", base)),
            Artifact::FilteredMap => self
                .mapper_dir(fa, fq)
                .join(&format!("{}_filt_wline_no.map", base)),
            Artifact::CorrectedIndex => self
                .run_prefix()
                .join(CORRECTION_DIR)
                .join(&format!("fq{}", fq))
                .join(CORRECTED_INDEX_NAME),
            Artifact::Pileup => self.pileup_object(base, fa, fq),
            Artifact::PileupKeyCounts => self.pileup_object(base, fa, fq).with_suffix(KEYS_SUFFIX),
            Artifact::Merged => self
                .run_prefix()
                .join(MULTIPART_DIR)
                .join(&format!("fa{}.sinple", fa)),
        }
    }

    fn mapper_dir(&self, fa: u32, fq: u32) -> ObjectKey {
        self.run_prefix()
            .join(MAPPER_DIR)
            .join(&format!("fq{}", fq))
            .join(&format!("fa{}", fa))
    }

    fn pileup_object(&self, base: &str, fa: u32, fq: u32) -> ObjectKey {
        self.pileup_prefix()
            .join(&format!("fq{}", fq))
            .join(&format!("fa{}", fa))
            .join(&format!("{}_fa{}-fq{}.mpileup", base, fa, fq))
    }

    /// Recover the stage key of an object produced by this layout.
    pub fn parse(&self, key: &ObjectKey) -> Option<StageKey> {
        if key.bucket() != self.bucket {
            return None;
        }

        let index_prefix = self.index_prefix();
        if key.starts_with(&index_prefix) {
            let rest = &key.segments()[index_prefix.segments().len()..];
            return match rest {
                [name] => {
                    let fa = parse_id(name.strip_suffix(".gem")?, "fa")?;
                    Some(StageKey::gem_index(fa))
                }
                _ => None,
            };
        }

        let run_prefix = self.run_prefix();
        if !key.starts_with(&run_prefix) {
            return None;
        }
        let rest: Vec<&str> = key.segments()[run_prefix.segments().len()..]
            .iter()
            .map(String::as_str)
            .collect();

        match rest.as_slice() {
            [MAPPER_DIR, fq, fa, name] => {
                let (fa, fq) = (parse_id(fa, "fa")?, parse_id(fq, "fq")?);
                if *name == format!("{}_map.index.txt", self.base_name) {
                    Some(StageKey::map_index(fa, fq))
                } else if *name == format!("{}_filt_wline_no.map", self.base_name) {
                    Some(StageKey::filtered_map(fa, fq))
                } else {
                    None
                }
            }
            [CORRECTION_DIR, fq, CORRECTED_INDEX_NAME] => {
                Some(StageKey::corrected_index(parse_id(fq, "fq")?))
            }
            [PILEUP_DIR, fq, fa, name] => {
                let (fa, fq) = (parse_id(fa, "fa")?, parse_id(fq, "fq")?);
                let pileup = format!("{}_fa{}-fq{}.mpileup", self.base_name, fa, fq);
                if *name == pileup {
                    Some(StageKey::pileup(fa, fq))
                } else if name.strip_suffix(KEYS_SUFFIX) == Some(pileup.as_str()) {
                    Some(StageKey::pileup_key_counts(fa, fq))
                } else {
                    None
                }
            }
            [MULTIPART_DIR, name] => {
                let fa = parse_id(name.strip_suffix(".sinple")?, "fa")?;
                Some(StageKey::merged(fa))
            }
            _ => None,
        }
    }
}

fn parse_id(segment: &str, prefix: &str) -> Option<u32> {
    segment.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> KeyLayout {
        KeyLayout::new("bucket", "tmp", "run-7", "sample")
    }

    #[test]
    fn test_layout_keys() {
        let layout = layout();
        assert_eq!(layout.resolve(&StageKey::gem_index(3)).key(), "gem/fa3.gem");
        assert_eq!(
            layout.resolve(&StageKey::map_index(1, 2)).key(),
            "tmp/run-7/gem-mapper/fq2/fa1/sample_map.index.txt"
        );
        assert_eq!(
            layout.resolve(&StageKey::filtered_map(1, 2)).key(),
            "tmp/run-7/gem-mapper/fq2/fa1/sample_filt_wline_no.map"
        );
        assert_eq!(
            layout.resolve(&StageKey::corrected_index(2)).key(),
            "tmp/run-7/index-correction/fq2/merged_filtered_index.txt"
        );
        assert_eq!(
            layout.resolve(&StageKey::pileup(1, 2)).key(),
            "tmp/run-7/mpileups/fq2/fa1/sample_fa1-fq2.mpileup"
        );
        assert_eq!(
            layout.resolve(&StageKey::pileup_key_counts(1, 2)).key(),
            "tmp/run-7/mpileups/fq2/fa1/sample_fa1-fq2.mpileup.keys"
        );
        assert_eq!(
            layout.resolve(&StageKey::merged(4)).key(),
            "tmp/run-7/multipart_uploads/fa4.sinple"
        );
    }

    #[test]
    fn test_keys_are_deterministic() {
        let a = layout().resolve(&StageKey::pileup(0, 9));
        let b = layout().resolve(&StageKey::pileup(0, 9));
        assert_eq!(a, b);
        assert_ne!(a, layout().resolve(&StageKey::pileup(9, 0)));
    }

    #[test]
    fn test_index_key_is_run_independent() {
        let other_run = KeyLayout::new("bucket", "tmp", "run-8", "sample");
        assert_eq!(
            layout().resolve(&StageKey::gem_index(0)),
            other_run.resolve(&StageKey::gem_index(0))
        );
    }

    #[test]
    fn test_parse_inverts_resolve() {
        let layout = layout();
        let keys = [
            StageKey::gem_index(5),
            StageKey::map_index(1, 2),
            StageKey::filtered_map(1, 2),
            StageKey::corrected_index(2),
            StageKey::pileup(10, 11),
            StageKey::pileup_key_counts(10, 11),
            StageKey::merged(4),
        ];
        for key in keys {
            assert_eq!(layout.parse(&layout.resolve(&key)), Some(key));
        }
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        let layout = layout();
        assert_eq!(layout.parse(&ObjectKey::new("bucket", "tmp/run-8/mpileups/fq0/fa0/x")), None);
        assert_eq!(layout.parse(&ObjectKey::new("other", "gem/fa0.gem")), None);
        assert_eq!(
            layout.parse(&ObjectKey::new("bucket", "tmp/run-7/mpileups/fq0/fa0/other.mpileup")),
            None
        );
        assert_eq!(
            layout.parse(&ObjectKey::new("bucket", "tmp/run-7/telemetry.json")),
            None
        );
    }
}

//! Data model: input chunks, artifact keys and integer-keyed records.

mod chunk;
mod records;
mod stage_key;

pub use chunk::{ByteRange, ChunkManifest, ChunkRef};
pub use records::{
    filter_range, parse_records, IndexedRecord, KeyCounts, PartitionRange, DEFAULT_KEY_COLUMN,
};
pub use stage_key::{Artifact, KeyLayout, Stage, StageKey};

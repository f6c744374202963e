//! Object-store access: keys, storage, multipart uploads, queries and chunk fetching.

mod chunk_source;
mod key;
mod multipart;
mod query;
mod store;

pub use chunk_source::{ChunkSource, StoreChunkSource};
pub use key::{parse_s3_uri, ObjectKey};
pub use multipart::{MultipartBackend, NativeMultipart, StagedMultipart};
pub use query::{RecordSource, StoreScan};
pub use store::Storage;

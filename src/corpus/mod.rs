//! Offline corpus: document storage, chunking, incremental indexing, and
//! file loading.

pub mod chunker;
pub mod indexer;
pub mod loader;
pub mod store;
pub mod types;

pub use indexer::{BatchReport, IndexCheckReport, IngestReport};
pub use types::{Chunk, Document, OffsetRange, RawDocument, Source};

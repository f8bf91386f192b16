//! Exact vector retrieval for ragdb: the flat L2 index, its on-disk artifact,
//! the [`Indexer`] that builds it and the [`Retriever`] that serves it.

pub mod artifact;
pub mod flat;
pub mod indexer;
pub mod retriever;
pub mod slot;

pub use artifact::{read_header, ArtifactPaths, IndexHeader, MappingRecord, MAPPING_SUFFIX};
pub use flat::FlatL2Index;
pub use indexer::{BuiltIndex, IngestReport, Indexer};
pub use retriever::Retriever;
pub use slot::RetrieverSlot;

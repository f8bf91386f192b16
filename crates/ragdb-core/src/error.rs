use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Document source unavailable at {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("No usable documents to index")]
    EmptyCorpus,

    #[error("Embedding backend failed: {0}")]
    EmbeddingBackend(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingShape { expected: usize, actual: usize },

    #[error("Corrupt index artifact at {path}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Query exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptIndex { path: path.into(), reason: reason.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Wraps a collaborator failure, keeping the whole context chain.
    pub fn backend(err: &anyhow::Error) -> Self {
        Self::EmbeddingBackend(format!("{err:#}"))
    }

    /// Errors scoped to a single request. A serving process keeps going after these.
    pub fn is_per_query(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::Timeout(_) | Self::EmbeddingBackend(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use std::path::Path;
use std::sync::{PoisonError, RwLock};

use tracing::info;

use ragdb_core::error::Result;
use ragdb_core::traits::Embedder;

use crate::retriever::Retriever;

/// Holder for the serving [`Retriever`] that can be replaced while queries run.
///
/// Readers take a snapshot and query it without holding the lock; a swap
/// only affects snapshots taken afterwards.
#[derive(Debug)]
pub struct RetrieverSlot {
    current: RwLock<Retriever>,
}

impl RetrieverSlot {
    pub fn new(retriever: Retriever) -> Self {
        Self { current: RwLock::new(retriever) }
    }

    pub fn snapshot(&self) -> Retriever {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Installs `next` and hands back the previous retriever.
    pub fn swap(&self, next: Retriever) -> Retriever {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, next)
    }

    /// Loads the artifact at `index_path` and swaps it in. On error the
    /// current retriever stays in place.
    pub fn reload(&self, index_path: impl AsRef<Path>, embedder: &dyn Embedder) -> Result<()> {
        let next = Retriever::open(index_path, embedder)?;
        let vectors = next.len();
        let previous = self.swap(next);
        info!(vectors, previous = previous.len(), "retriever swapped");
        Ok(())
    }
}

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::Neighbor;

/// Text to vector collaborator.
///
/// `embed_batch` must be order-preserving and 1:1: output `i` is the
/// embedding of input `i`, and every output has length `dim()`.
pub trait Embedder: Send + Sync {
    /// Stable identity of the model behind this embedder (e.g. `hash:d384`).
    fn id(&self) -> &str;
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    fn embed_one(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for a single input"))
    }

    /// `embed_batch` that gives up once `cancel` fires. Backends that work in
    /// chunks should check the token between chunks.
    fn embed_batch_cancellable(&self, texts: &[String], cancel: &CancellationToken) -> anyhow::Result<Vec<Vec<f32>>> {
        if cancel.is_cancelled() {
            anyhow::bail!("embedding cancelled");
        }
        self.embed_batch(texts)
    }
}

/// Capability surface of a nearest-neighbor index, so an approximate index
/// can replace the exact one without touching the indexer or retriever.
pub trait VectorIndex: Send + Sync {
    fn dim(&self) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends vectors; positions continue from the current `len()`.
    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()>;

    /// The `min(k, len())` nearest stored vectors, ascending by distance.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;
}

use std::hash::{Hash, Hasher};

use anyhow::Result;
use ragdb_core::traits::Embedder;
use twox_hash::XxHash64;

/// Deterministic bag-of-tokens embedder.
///
/// Each lowercased whitespace token is hashed into one of `dim` buckets; the
/// result is L2-normalized. No model files, identical output across runs,
/// which makes it the embedder of choice for tests and offline development.
/// A zero `dim` yields empty vectors, which the indexer rejects.
pub struct HashingEmbedder {
    dim: usize,
    id: String,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, id: format!("hash:xx64:d{dim}") }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        if self.dim == 0 {
            return v;
        }
        for token in text.split_whitespace() {
            let mut hasher = XxHash64::with_seed(0);
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            let weight = ((h >> 32) as u32) as f32 / u32::MAX as f32;
            v[idx] += 0.5 + 0.5 * weight;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Embedder for HashingEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        usize::MAX
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

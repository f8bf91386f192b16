//! Exact brute-force L2 index.
//!
//! Vectors are kept in one contiguous row-major `Vec<f32>`; position `i` is
//! the `i`-th vector added. Search is a full scan with a bounded max-heap,
//! O(n log k) per query.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ragdb_core::error::{Error, Result};
use ragdb_core::traits::VectorIndex;
use ragdb_core::types::Neighbor;

#[derive(Debug, Clone, PartialEq)]
pub struct FlatL2Index {
    dim: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dim: usize) -> Self {
        Self { dim, data: Vec::new() }
    }

    pub fn from_vectors(dim: usize, vectors: &[Vec<f32>]) -> Result<Self> {
        let mut index = Self::new(dim);
        index.add(vectors)?;
        Ok(index)
    }

    /// Wraps an already flattened payload. `data.len()` must be a multiple of `dim`.
    pub(crate) fn from_raw(dim: usize, data: Vec<f32>) -> Self {
        debug_assert!(dim == 0 || data.len() % dim == 0);
        Self { dim, data }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dim)?;
        self.data.get(start..start + self.dim)
    }

    fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dim.max(1))
    }
}

pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Heap entry ordered by (distance, position); the heap top is the worst kept hit.
#[derive(Clone, Copy)]
struct Candidate {
    distance: f32,
    position: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then(self.position.cmp(&other.position))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl VectorIndex for FlatL2Index {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.data.len().checked_div(self.dim).unwrap_or(0)
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dim) {
            return Err(Error::EmbeddingShape { expected: self.dim, actual: bad.len() });
        }
        self.data.reserve(vectors.len() * self.dim);
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be a positive integer".into()));
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dim {
            return Err(Error::EmbeddingShape { expected: self.dim, actual: query.len() });
        }

        let k = k.min(self.len());
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for (position, row) in self.rows().enumerate() {
            let candidate = Candidate { distance: squared_l2(query, row), position };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor { position: c.position, distance: c.distance.sqrt() })
            .collect())
    }
}

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ragdb_core::error::{Error, Result};
use ragdb_core::traits::{Embedder, VectorIndex};
use ragdb_core::types::{Mapping, QueryResult, RetrievedDocument};

use crate::artifact::{self, ArtifactPaths};
use crate::flat::FlatL2Index;

struct Loaded {
    index: FlatL2Index,
    mapping: Mapping,
    embedder_id: String,
    built_at: DateTime<Utc>,
    paths: ArtifactPaths,
}

/// Read-only handle over one loaded index + mapping pair.
///
/// Cloning is cheap and every clone sees the same snapshot, so a handle can
/// be moved into as many concurrent queries as needed without locking.
#[derive(Clone)]
pub struct Retriever {
    inner: Arc<Loaded>,
}

impl fmt::Debug for Retriever {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retriever")
            .field("index", &self.inner.paths.index)
            .field("vectors", &self.len())
            .field("dim", &self.dim())
            .field("embedder_id", &self.inner.embedder_id)
            .finish()
    }
}

impl Retriever {
    /// Reads and validates the artifact pair rooted at `index_path`.
    pub fn load(index_path: impl AsRef<Path>) -> Result<Self> {
        let paths = ArtifactPaths::for_index(index_path.as_ref());
        let loaded = artifact::read_pair(&paths)?;
        info!(
            path = %paths.index.display(),
            vectors = loaded.index.len(),
            dim = loaded.index.dim(),
            embedder = %loaded.embedder_id,
            "index loaded"
        );
        Ok(Self {
            inner: Arc::new(Loaded {
                index: loaded.index,
                mapping: loaded.mapping,
                embedder_id: loaded.embedder_id,
                built_at: loaded.built_at,
                paths,
            }),
        })
    }

    /// Like [`Retriever::load`], and also fails when `embedder` cannot produce
    /// vectors of the stored dimension.
    pub fn open(index_path: impl AsRef<Path>, embedder: &dyn Embedder) -> Result<Self> {
        let retriever = Self::load(index_path)?;
        retriever.check_embedder(embedder)?;
        Ok(retriever)
    }

    fn check_embedder(&self, embedder: &dyn Embedder) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if embedder.dim() != self.dim() {
            return Err(Error::EmbeddingShape { expected: self.dim(), actual: embedder.dim() });
        }
        if embedder.id() != self.embedder_id() {
            warn!(stored = %self.embedder_id(), current = %embedder.id(), "index was built with a different embedder");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.index.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.inner.index.dim()
    }

    pub fn embedder_id(&self) -> &str {
        &self.inner.embedder_id
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.inner.built_at
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.inner.paths
    }

    /// Nearest stored documents to an already computed query embedding.
    pub fn search_vector(&self, query: &[f32], top_k: usize) -> Result<QueryResult> {
        let neighbors = self.inner.index.search(query, top_k)?;
        let hits = neighbors
            .into_iter()
            .map(|n| {
                let (id, text) = self.inner.mapping.get(n.position).ok_or_else(|| {
                    Error::corrupt(&self.inner.paths.mapping, format!("no mapping entry for position {}", n.position))
                })?;
                Ok(RetrievedDocument { id: id.to_string(), text: text.to_string(), distance: n.distance })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResult { hits })
    }

    /// Embeds `text` and searches, on the calling thread.
    pub fn query_blocking(&self, embedder: &dyn Embedder, text: &str, top_k: usize) -> Result<QueryResult> {
        self.query_until(embedder, text, top_k, &CancellationToken::new())
    }

    /// [`Retriever::query_blocking`] that stops at the next checkpoint once
    /// `cancel` fires: inside the embedder, and again before the scan.
    pub fn query_until(
        &self,
        embedder: &dyn Embedder,
        text: &str,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<QueryResult> {
        if top_k == 0 {
            return Err(Error::InvalidArgument("top_k must be a positive integer".into()));
        }
        let start = Instant::now();
        let embedding = embedder
            .embed_batch_cancellable(&[text.to_string()], cancel)
            .map_err(|e| Error::backend(&e))?
            .pop()
            .ok_or_else(|| Error::EmbeddingBackend("embedder returned no vector for the query".into()))?;
        if cancel.is_cancelled() {
            return Err(Error::EmbeddingBackend("query cancelled before the scan".into()));
        }
        let result = self.search_vector(&embedding, top_k)?;
        debug!(top_k, hits = result.len(), elapsed_ms = start.elapsed().as_millis() as u64, "query served");
        Ok(result)
    }

    /// Runs the embed and the scan on the blocking pool so a slow embedder
    /// never stalls other queries. Past the deadline the caller gets
    /// [`Error::Timeout`]; leaving early by any route cancels the task.
    pub async fn query(
        &self,
        embedder: Arc<dyn Embedder>,
        text: &str,
        top_k: usize,
        deadline: Option<Duration>,
    ) -> Result<QueryResult> {
        if top_k == 0 {
            return Err(Error::InvalidArgument("top_k must be a positive integer".into()));
        }
        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();
        let this = self.clone();
        let text = text.to_string();
        let task = tokio::task::spawn_blocking(move || this.query_until(embedder.as_ref(), &text, top_k, &cancel));

        let joined = match deadline {
            Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| {
                warn!(deadline_ms = limit.as_millis() as u64, "query timed out");
                Error::Timeout(limit)
            })?,
            None => task.await,
        };
        joined.map_err(|e| Error::EmbeddingBackend(format!("query task failed: {e}")))?
    }
}

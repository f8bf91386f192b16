//! One-shot ingestion: documents in, persisted index + mapping out.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use ragdb_core::config::Settings;
use ragdb_core::error::{Error, Result};
use ragdb_core::source::DirectorySource;
use ragdb_core::traits::{Embedder, VectorIndex};
use ragdb_core::types::{Document, Mapping};

use crate::artifact::{self, ArtifactPaths};
use crate::flat::FlatL2Index;

const DEFAULT_BATCH_SIZE: usize = 32;

/// An index built in memory, not yet written anywhere.
#[derive(Debug, Clone)]
pub struct BuiltIndex {
    pub index: FlatL2Index,
    pub mapping: Mapping,
    pub embedder_id: String,
    /// Documents skipped because their text was blank.
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub ingested: usize,
    pub dropped: usize,
    pub dim: usize,
    pub paths: ArtifactPaths,
}

pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    show_progress: bool,
}

impl Indexer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder, batch_size: DEFAULT_BATCH_SIZE, show_progress: false }
    }

    pub fn from_settings(embedder: Arc<dyn Embedder>, settings: &Settings) -> Self {
        Self::new(embedder)
            .with_batch_size(settings.embedding.batch_size)
            .with_progress(settings.ingest.show_progress)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Drops blank documents, embeds the rest in input order and loads them
    /// into a flat L2 index. Position `i` of the index is entry `i` of the mapping.
    pub fn build_index(&self, documents: Vec<Document>) -> Result<BuiltIndex> {
        {
            let mut seen = HashSet::with_capacity(documents.len());
            if let Some(dup) = documents.iter().find(|d| !seen.insert(d.id.as_str())) {
                return Err(Error::InvalidArgument(format!("duplicate document id {:?}", dup.id)));
            }
        }

        let total = documents.len();
        let kept: Vec<Document> = documents.into_iter().filter(|d| !d.is_blank()).collect();
        let dropped = total - kept.len();
        if dropped > 0 {
            warn!(dropped, "skipping documents with blank text");
        }
        if kept.is_empty() {
            return Err(Error::EmptyCorpus);
        }

        let mapping = Mapping::from_documents(&kept);
        let vectors = self.embed_all(&mapping.texts)?;

        let dim = self.embedder.dim();
        if dim == 0 {
            return Err(Error::EmbeddingShape { expected: 1, actual: 0 });
        }
        let index = FlatL2Index::from_vectors(dim, &vectors)?;
        debug!(vectors = index.len(), dim, "flat index built");
        Ok(BuiltIndex { index, mapping, embedder_id: self.embedder.id().to_string(), dropped })
    }

    /// Writes `built` next to `index_path` as one logical unit.
    pub fn persist(&self, built: &BuiltIndex, index_path: &Path) -> Result<ArtifactPaths> {
        let paths = ArtifactPaths::for_index(index_path);
        artifact::write_pair(&paths, &built.index, &built.mapping, &built.embedder_id)?;
        info!(path = %paths.index.display(), vectors = built.index.len(), "index persisted");
        Ok(paths)
    }

    /// Load, build and persist. Any failure leaves the destination untouched.
    pub fn ingest(&self, source: &DirectorySource, index_path: impl Into<PathBuf>) -> Result<IngestReport> {
        let index_path = index_path.into();
        let start = Instant::now();
        let documents = source.load()?;
        let built = self.build_index(documents)?;
        let paths = self.persist(&built, &index_path)?;
        let report =
            IngestReport { ingested: built.index.len(), dropped: built.dropped, dim: built.index.dim(), paths };
        info!(
            documents = report.ingested,
            dropped = report.dropped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "ingestion complete"
        );
        Ok(report)
    }

    fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let pb = self.progress_bar(texts.len());
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let batch = self.embedder.embed_batch(chunk).map_err(|e| Error::backend(&e))?;
            if batch.len() != chunk.len() {
                pb.abandon();
                return Err(Error::EmbeddingBackend(format!(
                    "embedder returned {} vectors for {} texts",
                    batch.len(),
                    chunk.len()
                )));
            }
            vectors.extend(batch);
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();
        Ok(vectors)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} documents ({percent}%)")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

//! Directory-backed document source.
//!
//! Files directly inside the source directory are dispatched on their
//! extension through an [`ExtractorRegistry`]. Only plain text is registered
//! by default; richer formats plug in as further [`TextExtractor`]s.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::Document;

pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<String>;
}

/// Reads the file as UTF-8, decoding invalid sequences lossily.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path).map_err(|e| Error::SourceUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(e) => Ok(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        }
    }
}

#[derive(Default)]
pub struct ExtractorRegistry {
    by_extension: HashMap<String, Box<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain-text extraction for `txt` and `md`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("txt", PlainTextExtractor);
        registry.register("md", PlainTextExtractor);
        registry
    }

    pub fn register(&mut self, extension: &str, extractor: impl TextExtractor + 'static) {
        self.by_extension.insert(extension.to_ascii_lowercase(), Box::new(extractor));
    }

    /// Keeps only the listed extensions.
    pub fn retain(&mut self, extensions: &[String]) {
        let wanted: Vec<String> = extensions.iter().map(|e| e.trim_start_matches('.').to_ascii_lowercase()).collect();
        self.by_extension.retain(|ext, _| wanted.contains(ext));
    }

    pub fn lookup(&self, path: &Path) -> Option<&dyn TextExtractor> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.by_extension.get(&ext).map(|e| e.as_ref())
    }

    pub fn extensions(&self) -> Vec<&str> {
        let mut exts: Vec<&str> = self.by_extension.keys().map(String::as_str).collect();
        exts.sort_unstable();
        exts
    }
}

pub struct DirectorySource {
    root: PathBuf,
    registry: ExtractorRegistry,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), registry: ExtractorRegistry::with_defaults() }
    }

    pub fn with_registry(root: impl Into<PathBuf>, registry: ExtractorRegistry) -> Self {
        Self { root: root.into(), registry }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads every supported file directly under the root, ordered by file name.
    /// The document id is the file name, extension included.
    pub fn load(&self) -> Result<Vec<Document>> {
        let unavailable = |reason: String| Error::SourceUnavailable { path: self.root.clone(), reason };
        if !self.root.is_dir() {
            return Err(unavailable("not a readable directory".to_string()));
        }
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| unavailable(e.to_string()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        let mut docs = Vec::with_capacity(files.len());
        for path in files {
            let Some(extractor) = self.registry.lookup(&path) else {
                debug!(path = %path.display(), "skipping file with unsupported extension");
                continue;
            };
            let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                debug!(path = %path.display(), "skipping file with non UTF-8 name");
                continue;
            };
            let text = extractor.extract(&path)?;
            docs.push(Document::new(id, text));
        }
        info!(
            dir = %self.root.display(),
            documents = docs.len(),
            extensions = ?self.registry.extensions(),
            "loaded documents"
        );
        Ok(docs)
    }
}

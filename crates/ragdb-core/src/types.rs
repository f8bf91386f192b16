//! Domain types shared by the indexer and the retriever.

use serde::{Deserialize, Serialize};

pub type DocumentId = String;

/// A unit of the corpus. `id` is derived from the source file name and is
/// unique within one ingestion run; `text` is the full extracted content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub text: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into() }
    }

    /// Whether the document carries anything worth embedding.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Parallel `ids`/`texts` sidecar. Entry `i` describes vector `i` of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub ids: Vec<DocumentId>,
    pub texts: Vec<String>,
}

impl Mapping {
    pub fn from_documents(docs: &[Document]) -> Self {
        let (ids, texts) = docs.iter().map(|d| (d.id.clone(), d.text.clone())).unzip();
        Self { ids, texts }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `ids` and `texts` agree in length.
    pub fn is_consistent(&self) -> bool {
        self.ids.len() == self.texts.len()
    }

    pub fn get(&self, position: usize) -> Option<(&str, &str)> {
        Some((self.ids.get(position)?.as_str(), self.texts.get(position)?.as_str()))
    }
}

/// A single nearest-neighbor hit as produced by a vector index: the
/// insertion position of the stored vector and its L2 distance to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: DocumentId,
    pub text: String,
    pub distance: f32,
}

/// Ranked retrieval output, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub hits: Vec<RetrievedDocument>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RetrievedDocument> {
        self.hits.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.id.as_str()).collect()
    }

    /// Ranked texts, as consumed by a prompt builder.
    pub fn texts(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.text.as_str()).collect()
    }
}

impl IntoIterator for QueryResult {
    type Item = RetrievedDocument;
    type IntoIter = std::vec::IntoIter<RetrievedDocument>;

    fn into_iter(self) -> Self::IntoIter {
        self.hits.into_iter()
    }
}

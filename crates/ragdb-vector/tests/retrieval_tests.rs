use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use ragdb_core::error::Error;
use ragdb_core::source::DirectorySource;
use ragdb_core::traits::Embedder;
use ragdb_core::types::{Document, Mapping};
use ragdb_embed::HashingEmbedder;
use ragdb_vector::artifact::write_pair;
use ragdb_vector::{read_header, ArtifactPaths, FlatL2Index, Indexer, Retriever, RetrieverSlot};

/// Scores text against a handful of hand-written concepts, so that
/// paraphrases land next to each other.
struct ConceptEmbedder;

const CONCEPTS: [&[&str]; 4] = [
    &["cat", "cats", "feline", "kitten"],
    &["mat", "rug", "carpet", "sat"],
    &["stock", "stocks", "markets", "rose", "shares"],
    &["today", "yesterday", "tomorrow"],
];

impl Embedder for ConceptEmbedder {
    fn id(&self) -> &str {
        "test:concepts"
    }

    fn dim(&self) -> usize {
        CONCEPTS.len()
    }

    fn max_len(&self) -> usize {
        512
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                let mut v: Vec<f32> = CONCEPTS
                    .iter()
                    .map(|words| lower.split_whitespace().filter(|w| words.contains(w)).count() as f32)
                    .collect();
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    v.iter_mut().for_each(|x| *x /= norm);
                }
                v
            })
            .collect())
    }
}

struct FailingEmbedder;

impl Embedder for FailingEmbedder {
    fn id(&self) -> &str {
        "test:failing"
    }

    fn dim(&self) -> usize {
        4
    }

    fn max_len(&self) -> usize {
        512
    }

    fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("model server unreachable")
    }
}

/// Every second text comes back one component short.
struct DriftingEmbedder;

impl Embedder for DriftingEmbedder {
    fn id(&self) -> &str {
        "test:drift"
    }

    fn dim(&self) -> usize {
        3
    }

    fn max_len(&self) -> usize {
        512
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok((0..texts.len()).map(|i| vec![1.0; if i % 2 == 0 { 3 } else { 2 }]).collect())
    }
}

struct LossyEmbedder;

impl Embedder for LossyEmbedder {
    fn id(&self) -> &str {
        "test:lossy"
    }

    fn dim(&self) -> usize {
        2
    }

    fn max_len(&self) -> usize {
        512
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().skip(1).map(|_| vec![0.0, 1.0]).collect())
    }
}

struct SlowEmbedder(Duration);

impl Embedder for SlowEmbedder {
    fn id(&self) -> &str {
        "hash:xx64:d64"
    }

    fn dim(&self) -> usize {
        64
    }

    fn max_len(&self) -> usize {
        512
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        std::thread::sleep(self.0);
        HashingEmbedder::new(64).embed_batch(texts)
    }
}

/// Works in small steps and stops at the first step after cancellation.
struct StepwiseEmbedder {
    steps: usize,
    stopped_early: Arc<AtomicBool>,
}

impl Embedder for StepwiseEmbedder {
    fn id(&self) -> &str {
        "hash:xx64:d64"
    }

    fn dim(&self) -> usize {
        64
    }

    fn max_len(&self) -> usize {
        512
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        HashingEmbedder::new(64).embed_batch(texts)
    }

    fn embed_batch_cancellable(&self, texts: &[String], cancel: &CancellationToken) -> Result<Vec<Vec<f32>>> {
        for _ in 0..self.steps {
            if cancel.is_cancelled() {
                self.stopped_early.store(true, Ordering::SeqCst);
                bail!("cancelled");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.embed_batch(texts)
    }
}

fn write_docs(dir: &Path, docs: &[(&str, &str)]) {
    std::fs::create_dir_all(dir).expect("create doc dir");
    for (name, text) in docs {
        std::fs::write(dir.join(name), text).expect("write doc");
    }
}

fn corpus() -> Vec<Document> {
    vec![
        Document::new("solar.txt", "solar panels convert sunlight into electricity"),
        Document::new("garden.txt", "tomatoes need full sun and regular watering"),
        Document::new("water.txt", "boil water for one minute before drinking"),
        Document::new("radio.txt", "ham radio works when the grid is down"),
    ]
}

fn hashing_indexer() -> Indexer {
    Indexer::new(Arc::new(HashingEmbedder::new(64)))
}

#[test]
fn feline_query_finds_the_cat() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let docs = tmp.path().join("docs");
    write_docs(&docs, &[("a.txt", "the cat sat on the mat"), ("b.txt", "stock markets rose today")]);
    let index_path = tmp.path().join("store/index.bin");

    let embedder: Arc<dyn Embedder> = Arc::new(ConceptEmbedder);
    let report = Indexer::new(embedder.clone()).ingest(&DirectorySource::new(&docs), &index_path).expect("ingest");
    assert_eq!((report.ingested, report.dropped, report.dim), (2, 0, 4));

    let retriever = Retriever::open(&index_path, embedder.as_ref()).expect("open");
    let result = retriever.query_blocking(embedder.as_ref(), "feline on a rug", 1).expect("query");
    assert_eq!(result.ids(), vec!["a.txt"]);
    assert_eq!(result.texts(), vec!["the cat sat on the mat"]);
}

#[test]
fn exact_document_embedding_is_its_own_nearest() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    let built = indexer.build_index(corpus()).expect("build");
    indexer.persist(&built, &index_path).expect("persist");

    let retriever = Retriever::load(&index_path).expect("load");
    assert_eq!(retriever.len(), 4);
    let embedder = HashingEmbedder::new(64);
    for doc in corpus() {
        let v = embedder.embed_one(&doc.text).expect("embed");
        let result = retriever.search_vector(&v, 1).expect("search");
        assert_eq!(result.hits[0].id, doc.id);
        assert!(result.hits[0].distance < 1e-4, "distance {}", result.hits[0].distance);
    }
}

#[test]
fn queries_are_deterministic_and_clamped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    indexer.persist(&indexer.build_index(corpus()).expect("build"), &index_path).expect("persist");

    let embedder = HashingEmbedder::new(64);
    let retriever = Retriever::open(&index_path, &embedder).expect("open");
    let first = retriever.query_blocking(&embedder, "sunlight and electricity", 100).expect("query");
    let second = retriever.query_blocking(&embedder, "sunlight and electricity", 100).expect("query");
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
    assert!(first.hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}

#[test]
fn blank_documents_are_dropped_and_counted() {
    let docs = vec![
        Document::new("a.txt", "first real document"),
        Document::new("empty.txt", "  \n\t "),
        Document::new("b.txt", "second real document"),
    ];
    let built = hashing_indexer().build_index(docs).expect("build");
    assert_eq!(built.dropped, 1);
    assert_eq!(built.mapping.ids, vec!["a.txt", "b.txt"]);
    assert_eq!(built.mapping.len(), 2);
}

#[test]
fn empty_corpus_writes_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let docs = tmp.path().join("docs");
    write_docs(&docs, &[("blank.txt", "   "), ("also_blank.txt", "\n")]);
    let index_path = tmp.path().join("store/index.bin");

    let err = hashing_indexer().ingest(&DirectorySource::new(&docs), &index_path).unwrap_err();
    assert!(matches!(err, Error::EmptyCorpus), "got {err:?}");
    assert!(!index_path.exists());
    assert!(!tmp.path().join("store").exists());
}

#[test]
fn missing_source_directory_is_reported() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = hashing_indexer()
        .ingest(&DirectorySource::new(tmp.path().join("nope")), tmp.path().join("index.bin"))
        .unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable { .. }), "got {err:?}");
}

#[test]
fn duplicate_ids_are_rejected() {
    let docs = vec![Document::new("a.txt", "one"), Document::new("a.txt", "two")];
    let err = hashing_indexer().build_index(docs).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");
}

#[test]
fn embedder_failure_leaves_no_artifact() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let docs = tmp.path().join("docs");
    write_docs(&docs, &[("a.txt", "some text")]);
    let index_path = tmp.path().join("index.bin");

    let err = Indexer::new(Arc::new(FailingEmbedder)).ingest(&DirectorySource::new(&docs), &index_path).unwrap_err();
    assert!(matches!(err, Error::EmbeddingBackend(ref msg) if msg.contains("unreachable")), "got {err:?}");
    assert!(!index_path.exists());
}

#[test]
fn dimension_drift_is_a_shape_error() {
    let err = Indexer::new(Arc::new(DriftingEmbedder)).build_index(corpus()).unwrap_err();
    assert!(matches!(err, Error::EmbeddingShape { expected: 3, actual: 2 }), "got {err:?}");
}

#[test]
fn short_embedding_batch_is_a_backend_error() {
    let err = Indexer::new(Arc::new(LossyEmbedder)).build_index(corpus()).unwrap_err();
    assert!(matches!(err, Error::EmbeddingBackend(_)), "got {err:?}");
}

#[test]
fn open_rejects_embedder_of_other_dimension() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    indexer.persist(&indexer.build_index(corpus()).expect("build"), &index_path).expect("persist");

    let err = Retriever::open(&index_path, &HashingEmbedder::new(16)).unwrap_err();
    assert!(matches!(err, Error::EmbeddingShape { expected: 64, actual: 16 }), "got {err:?}");

    let retriever = Retriever::load(&index_path).expect("load");
    let err = retriever.query_blocking(&HashingEmbedder::new(16), "water", 2).unwrap_err();
    assert!(matches!(err, Error::EmbeddingShape { .. }), "got {err:?}");
}

#[test]
fn missing_artifact_fails_load() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = Retriever::load(tmp.path().join("index.bin")).unwrap_err();
    assert!(matches!(err, Error::CorruptIndex { .. }), "got {err:?}");
}

#[test]
fn zero_top_k_is_a_per_query_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    indexer.persist(&indexer.build_index(corpus()).expect("build"), &index_path).expect("persist");

    let retriever = Retriever::load(&index_path).expect("load");
    let err = retriever.query_blocking(&HashingEmbedder::new(64), "radio", 0).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(err.is_per_query());
}

#[test]
fn header_reports_counts() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    let paths = indexer.persist(&indexer.build_index(corpus()).expect("build"), &index_path).expect("persist");

    let header = read_header(&paths.index).expect("header");
    assert_eq!((header.count, header.dim), (4, 64));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_queries_share_one_handle() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    indexer.persist(&indexer.build_index(corpus()).expect("build"), &index_path).expect("persist");

    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
    let retriever = Retriever::open(&index_path, embedder.as_ref()).expect("open");
    let queries = (0..16).map(|i| {
        let text = if i % 2 == 0 { "boil water before drinking" } else { "radio when the grid is down" };
        retriever.query(embedder.clone(), text, 2, Some(Duration::from_secs(5)))
    });
    let results = join_all(queries).await;

    for (i, result) in results.into_iter().enumerate() {
        let result = result.expect("query");
        let expected = if i % 2 == 0 { "water.txt" } else { "radio.txt" };
        assert_eq!(result.hits[0].id, expected);
        assert_eq!(result.len(), 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_embedder_hits_the_deadline() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    indexer.persist(&indexer.build_index(corpus()).expect("build"), &index_path).expect("persist");
    let retriever = Retriever::load(&index_path).expect("load");

    let slow: Arc<dyn Embedder> = Arc::new(SlowEmbedder(Duration::from_millis(300)));
    let err = retriever.query(slow, "solar", 1, Some(Duration::from_millis(20))).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(20)), "got {err:?}");
    assert!(err.is_per_query());

    // The retriever keeps serving after a timed-out request.
    let fast: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
    let result = retriever.query(fast, "solar panels convert sunlight into electricity", 1, None).await.expect("query");
    assert_eq!(result.ids(), vec!["solar.txt"]);
}

#[tokio::test]
async fn async_query_propagates_backend_errors() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    indexer.persist(&indexer.build_index(corpus()).expect("build"), &index_path).expect("persist");
    let retriever = Retriever::load(&index_path).expect("load");

    let err = retriever.query(Arc::new(FailingEmbedder), "anything", 1, None).await.unwrap_err();
    assert!(matches!(err, Error::EmbeddingBackend(_)), "got {err:?}");
}

#[test]
fn slot_swaps_without_disturbing_snapshots() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let old_path = tmp.path().join("old/index.bin");
    let new_path = tmp.path().join("new/index.bin");
    let indexer = hashing_indexer();
    indexer.persist(&indexer.build_index(corpus()[..1].to_vec()).expect("build"), &old_path).expect("persist");
    indexer.persist(&indexer.build_index(corpus()).expect("build"), &new_path).expect("persist");

    let embedder = HashingEmbedder::new(64);
    let slot = RetrieverSlot::new(Retriever::open(&old_path, &embedder).expect("open"));
    let before = slot.snapshot();

    slot.reload(&new_path, &embedder).expect("reload");
    assert_eq!(before.len(), 1, "in-flight snapshot keeps its state");
    assert_eq!(slot.snapshot().len(), 4);

    let err = slot.reload(tmp.path().join("missing/index.bin"), &embedder).unwrap_err();
    assert!(matches!(err, Error::CorruptIndex { .. }));
    assert_eq!(slot.snapshot().len(), 4, "failed reload keeps the current index");
}

#[test]
fn empty_index_answers_with_no_hits() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let paths = ArtifactPaths::for_index(tmp.path().join("index.bin"));
    write_pair(&paths, &FlatL2Index::new(4), &Mapping::default(), "test:d4").expect("write");

    let embedder = HashingEmbedder::new(64);
    let retriever = Retriever::open(&paths.index, &embedder).expect("open");
    assert!(retriever.is_empty());
    let result = retriever.query_blocking(&embedder, "anything at all", 3).expect("query");
    assert!(result.is_empty());
}

#[test]
fn zero_dimension_embedder_is_rejected() {
    let err = Indexer::new(Arc::new(HashingEmbedder::new(0))).build_index(corpus()).unwrap_err();
    assert!(matches!(err, Error::EmbeddingShape { actual: 0, .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_query_releases_its_embedder() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let index_path = tmp.path().join("index.bin");
    let indexer = hashing_indexer();
    indexer.persist(&indexer.build_index(corpus()).expect("build"), &index_path).expect("persist");
    let retriever = Retriever::load(&index_path).expect("load");

    let stopped_early = Arc::new(AtomicBool::new(false));
    let embedder: Arc<dyn Embedder> = Arc::new(StepwiseEmbedder { steps: 200, stopped_early: stopped_early.clone() });
    let err = retriever.query(embedder, "solar", 1, Some(Duration::from_millis(30))).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");

    for _ in 0..50 {
        if stopped_early.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped_early.load(Ordering::SeqCst), "embedder kept running after the deadline");
}

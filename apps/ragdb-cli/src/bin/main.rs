use std::env;
use std::path::PathBuf;
use std::process::exit;

use tracing_subscriber::EnvFilter;

use ragdb_core::config::Settings;
use ragdb_core::source::{DirectorySource, ExtractorRegistry};
use ragdb_embed::load_embedder;
use ragdb_vector::artifact::read_mapping;
use ragdb_vector::{read_header, ArtifactPaths, Indexer, Retriever};

const USAGE: &str = "Usage: ragdb <ingest [--doc-dir DIR] | query \"<question>\" [--top-k N] | status>";

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{USAGE}");
        exit(1);
    }
    let cmd = args.remove(0);
    (cmd, args)
}

/// Value following `flag`, if present. Exits when the flag has no value.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let pos = args.iter().position(|a| a == flag)?;
    match args.get(pos + 1) {
        Some(v) if !v.starts_with("--") => Some(v.as_str()),
        _ => {
            eprintln!("Error: {flag} requires a value");
            exit(1)
        }
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

fn ingest(settings: &Settings, args: &[String]) -> anyhow::Result<()> {
    let doc_dir = flag_value(args, "--doc-dir").map(PathBuf::from).or_else(|| settings.doc_dir()).unwrap_or_else(|| {
        eprintln!("Error: no document directory (pass --doc-dir or set ingest.doc_dir)");
        exit(1)
    });
    let mut registry = ExtractorRegistry::with_defaults();
    registry.retain(&settings.ingest.extensions);
    let source = DirectorySource::with_registry(&doc_dir, registry);

    let embedder = load_embedder(&settings.embedding)?;
    let report = Indexer::from_settings(embedder, settings).ingest(&source, settings.index_path())?;
    println!("Ingested {} documents from {} ({} blank skipped)", report.ingested, doc_dir.display(), report.dropped);
    println!("Index:   {}", report.paths.index.display());
    println!("Mapping: {}", report.paths.mapping.display());
    Ok(())
}

async fn query(settings: &Settings, args: &[String]) -> anyhow::Result<()> {
    let question = match args.first() {
        Some(q) if !q.starts_with("--") => q.clone(),
        _ => {
            eprintln!("{USAGE}");
            exit(1)
        }
    };
    let top_k = match flag_value(args, "--top-k") {
        Some(raw) => raw.parse::<usize>().unwrap_or_else(|_| {
            eprintln!("Error: --top-k requires a number");
            exit(1)
        }),
        None => settings.retrieval.top_k,
    };

    let embedder = load_embedder(&settings.embedding)?;
    let retriever = Retriever::open(settings.index_path(), embedder.as_ref())?;
    let result = retriever.query(embedder, &question, top_k, settings.retrieval.timeout()).await?;

    println!("Found {} results for: \"{}\"", result.len(), question);
    for (rank, hit) in result.iter().enumerate() {
        println!("\n  {}. {}  distance={:.4}", rank + 1, hit.id, hit.distance);
        println!("     {}", snippet(&hit.text, 160));
    }
    Ok(())
}

fn status(settings: &Settings) -> anyhow::Result<()> {
    let paths = ArtifactPaths::for_index(settings.index_path());
    let header = read_header(&paths.index)?;
    let record = read_mapping(&paths.mapping)?;
    println!("Index:       {}", paths.index.display());
    println!("Vectors:     {}", header.count);
    println!("Dimension:   {}", header.dim);
    println!("Checksum:    {}", header.checksum_hex());
    println!("Embedder:    {}", record.embedder_id);
    println!("Built at:    {}", record.built_at.to_rfc3339());
    if record.index_checksum != header.checksum_hex() {
        println!("Warning: mapping was written by a different build; `ragdb ingest` to rebuild");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load().map_err(|e| {
        eprintln!("Error loading config: {e}");
        e
    })?;
    let (cmd, args) = parse_args();
    match cmd.as_str() {
        "ingest" => ingest(&settings, &args)?,
        "query" => query(&settings, &args).await?,
        "status" => status(&settings)?,
        _ => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            exit(1);
        }
    }
    Ok(())
}

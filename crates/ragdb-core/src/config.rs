//! Layered configuration and path helpers.
//!
//! Uses Figment to merge built-in defaults, `config.toml`, `config.<env>.toml`,
//! the legacy `VECTOR_STORE_PATH` / `APP_USE_FAKE_EMBEDDINGS` variables and
//! `APP_*` env vars (`__` separates nested keys, e.g. `APP_RETRIEVAL__TOP_K`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub index: IndexSettings,
    pub embedding: EmbeddingSettings,
    pub retrieval: RetrievalSettings,
    pub ingest: IngestSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Where the index artifact lives; the mapping sits next to it.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    pub model: String,
    pub model_dir: Option<String>,
    pub use_fake: bool,
    pub fake_dim: usize,
    pub max_len: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            model_dir: None,
            use_fake: false,
            fake_dim: 384,
            max_len: 256,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub timeout_ms: Option<u64>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self { top_k: DEFAULT_TOP_K, timeout_ms: Some(10_000) }
    }
}

impl RetrievalSettings {
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSettings {
    pub doc_dir: Option<String>,
    pub extensions: Vec<String>,
    pub show_progress: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self { doc_dir: None, extensions: vec!["txt".to_string()], show_progress: true }
    }
}

impl Settings {
    /// Loads settings for the environment named by `RUST_ENV` (default `dev`).
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        Self::from_figment(&Self::figment_for_env(&env_name))
    }

    pub fn figment_for_env(env_name: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("config.toml"));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::raw().only(&["VECTOR_STORE_PATH"]).map(|_| "index.path".into()));
        if env_flag("APP_USE_FAKE_EMBEDDINGS") {
            figment = figment.merge(Serialized::default("embedding.use_fake", true));
        }
        figment.merge(Env::prefixed("APP_").split("__"))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let settings: Settings = figment.extract().map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index.path.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "index.path is required (set it in config.toml, APP_INDEX__PATH or VECTOR_STORE_PATH)".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::InvalidConfig("retrieval.top_k must be at least 1".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::InvalidConfig("embedding.batch_size must be at least 1".into()));
        }
        if self.embedding.fake_dim == 0 {
            return Err(Error::InvalidConfig("embedding.fake_dim must be at least 1".into()));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(Error::InvalidConfig("embedding.model must not be empty".into()));
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        expand_path(&self.index.path)
    }

    pub fn doc_dir(&self) -> Option<PathBuf> {
        self.ingest.doc_dir.as_deref().map(expand_path)
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}


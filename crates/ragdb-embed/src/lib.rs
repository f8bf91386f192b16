//! Embedding collaborators for ragdb.
//!
//! [`SentenceEmbedder`] runs a BERT-family sentence-transformer (default
//! `all-MiniLM-L6-v2`) through candle from a local model directory.
//! [`HashingEmbedder`] is the dependency-free deterministic stand-in selected
//! by `embedding.use_fake` / `APP_USE_FAKE_EMBEDDINGS=1`.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use tokenizers::Tokenizer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ragdb_core::config::{expand_path, EmbeddingSettings};
use ragdb_core::traits::Embedder;

pub mod device;
pub mod hashing;
pub mod pool;
pub mod tokenize;

pub use device::select_device;
pub use hashing::HashingEmbedder;
pub use pool::{l2_normalize, masked_mean_l2};
pub use tokenize::{tokenize_batch, TokenizedBatch};

pub struct SentenceEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    id: String,
    dim: usize,
    max_len: usize,
    batch_size: usize,
}

impl SentenceEmbedder {
    pub fn load(settings: &EmbeddingSettings) -> Result<Self> {
        let device = select_device();
        let model_dir = resolve_model_dir(settings)?;
        info!(model = %settings.model, dir = %model_dir.display(), "loading sentence embedder");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;

        let config_path = model_dir.join("config.json");
        let raw_config = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: BertConfig = serde_json::from_str(&raw_config)?;
        let dim = serde_json::from_str::<serde_json::Value>(&raw_config)?
            .get("hidden_size")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| anyhow!("{} has no hidden_size", config_path.display()))? as usize;

        let weights = load_weights(&model_dir, &device)?;
        let vb = VarBuilder::from_tensors(weights, DTYPE, &device);
        let model = BertModel::load(vb, &config)?;

        let id = format!("candle:{}:d{}", settings.model, dim);
        info!(embedder = %id, "sentence embedder ready");
        Ok(Self {
            model,
            tokenizer,
            device,
            id,
            dim,
            max_len: settings.max_len,
            batch_size: settings.batch_size.max(1),
        })
    }

    fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let batch = tokenize_batch(&self.tokenizer, texts, self.max_len, &self.device)?;
        let hidden = self.model.forward(&batch.input_ids, &batch.token_type_ids, Some(&batch.attention_mask))?;
        let pooled = masked_mean_l2(&hidden, &batch.attention_mask)?;
        Ok(pooled.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }
}

impl Embedder for SentenceEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        self.max_len
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_batch_cancellable(texts, &CancellationToken::new())
    }

    fn embed_batch_cancellable(&self, texts: &[String], cancel: &CancellationToken) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                bail!("embedding cancelled after {} of {} texts", out.len(), texts.len());
            }
            out.extend(self.embed_chunk(chunk)?);
        }
        debug!(texts = texts.len(), elapsed_ms = start.elapsed().as_millis() as u64, "embedded batch");
        Ok(out)
    }
}

/// Builds the embedder named by the settings.
pub fn load_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>> {
    if settings.use_fake {
        info!(dim = settings.fake_dim, "using hashing embedder");
        return Ok(Arc::new(HashingEmbedder::new(settings.fake_dim)));
    }
    Ok(Arc::new(SentenceEmbedder::load(settings)?))
}

fn load_weights(model_dir: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        debug!(path = %safetensors.display(), "reading safetensors weights");
        return Ok(candle_core::safetensors::load(&safetensors, device)?);
    }
    let pickle = model_dir.join("pytorch_model.bin");
    if pickle.exists() {
        debug!(path = %pickle.display(), "reading pytorch weights");
        let tensors = candle_core::pickle::read_all(&pickle)?;
        return tensors
            .into_iter()
            .map(|(name, t)| -> Result<(String, Tensor)> { Ok((name, t.to_device(device)?)) })
            .collect();
    }
    Err(anyhow!("No model.safetensors or pytorch_model.bin in {}", model_dir.display()))
}

fn resolve_model_dir(settings: &EmbeddingSettings) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = &settings.model_dir {
        candidates.push(expand_path(dir));
    }
    for var in ["APP_MODEL_DIR", "MODEL_DIR"] {
        if let Ok(dir) = std::env::var(var) {
            candidates.push(expand_path(dir));
        }
    }
    let name = settings.model.rsplit('/').next().unwrap_or(&settings.model);
    candidates.push(PathBuf::from("models").join(name));
    candidates.push(PathBuf::from("../models").join(name));

    candidates
        .iter()
        .find(|p| p.join("config.json").exists())
        .cloned()
        .ok_or_else(|| anyhow!("Could not locate model directory for {} (tried {:?})", settings.model, candidates))
}

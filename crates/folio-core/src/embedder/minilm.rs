//! all-MiniLM-L6-v2 sentence embeddings
//!
//! BERT encoder (6 layers, 384 hidden) with attention-masked mean pooling
//! over token states, followed by L2 normalization.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::api::sync::ApiBuilder;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

use super::TextEncoder;

/// Embedding dimension of MiniLM-L6
pub const MINILM_DIM: usize = 384;

/// HuggingFace model id
pub const MINILM_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Maximum sequence length in tokens
const MAX_SEQ_LEN: usize = 256;

pub struct MiniLmEncoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl MiniLmEncoder {
    /// Load MiniLM from the HuggingFace hub (or the local download cache)
    pub fn new(device: &Device) -> Result<Self> {
        Self::from_pretrained(MINILM_MODEL_ID, device)
    }

    pub fn from_pretrained(model_id: &str, device: &Device) -> Result<Self> {
        let local = Path::new(model_id);
        if local.is_dir() {
            return Self::from_files(
                &local.join("config.json"),
                &local.join("tokenizer.json"),
                &local.join("model.safetensors"),
                device,
            );
        }

        match Self::try_hf_hub(model_id, device) {
            Ok(encoder) => return Ok(encoder),
            Err(e) => {
                tracing::debug!("hf-hub download failed: {}, trying manual download", e);
            }
        }

        Self::try_manual_download(model_id, device)
    }

    fn try_hf_hub(model_id: &str, device: &Device) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_progress(false)
            .build()
            .context("Failed to create HuggingFace API")?;
        let repo = api.model(model_id.to_string());

        tracing::info!("Fetching MiniLM model files from {}", model_id);
        let config_path = repo.get("config.json").context("Failed to get config.json")?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to get tokenizer.json")?;
        let weights_path = repo
            .get("model.safetensors")
            .or_else(|_| repo.get("pytorch_model.bin"))
            .context("Failed to get model weights")?;

        Self::from_files(&config_path, &tokenizer_path, &weights_path, device)
    }

    fn try_manual_download(model_id: &str, device: &Device) -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("folio")
            .join("models")
            .join(model_id.replace('/', "_"));
        std::fs::create_dir_all(&cache_dir)?;

        let base_url = format!("https://huggingface.co/{model_id}/resolve/main");
        let files = ["config.json", "tokenizer.json", "model.safetensors"];
        let mut paths = Vec::new();

        for file in &files {
            let local_path = cache_dir.join(file);
            if !local_path.exists() {
                let url = format!("{base_url}/{file}");
                tracing::info!("Downloading {}...", file);

                let response = ureq::get(&url)
                    .call()
                    .with_context(|| format!("Failed to download {file}"))?;

                let partial = local_path.with_extension("part");
                let mut out = std::fs::File::create(&partial)?;
                std::io::copy(&mut response.into_reader(), &mut out)?;
                std::fs::rename(&partial, &local_path)?;
                tracing::info!("Downloaded {}", file);
            }
            paths.push(local_path);
        }

        Self::from_files(&paths[0], &paths[1], &paths[2], device)
    }

    /// Load from local config, tokenizer and weights
    pub fn from_files(
        config_path: &Path,
        tokenizer_path: &Path,
        weights_path: &Path,
        device: &Device,
    ) -> Result<Self> {
        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams::default()));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to configure truncation: {e}"))?;

        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;
        let config: BertConfig =
            serde_json::from_str(&config_str).context("Failed to parse BERT config")?;

        let vb = if weights_path.extension().is_some_and(|e| e == "safetensors") {
            unsafe {
                VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)
                    .context("Failed to load safetensors weights")?
            }
        } else {
            VarBuilder::from_pth(weights_path, DType::F32, device)
                .context("Failed to load pytorch weights")?
        };

        let model = BertModel::load(vb.clone(), &config)
            .or_else(|_| BertModel::load(vb.pp("bert"), &config))
            .context("Failed to load MiniLM model")?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {e}"))?;

        let ids: Vec<Tensor> = encodings
            .iter()
            .map(|e| Tensor::new(e.get_ids(), &self.device))
            .collect::<candle_core::Result<_>>()?;
        let masks: Vec<Tensor> = encodings
            .iter()
            .map(|e| Tensor::new(e.get_attention_mask(), &self.device))
            .collect::<candle_core::Result<_>>()?;

        let input_ids = Tensor::stack(&ids, 0)?; // [batch, seq]
        let attention_mask = Tensor::stack(&masks, 0)?; // [batch, seq]
        let token_type_ids = input_ids.zeros_like()?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))
            .context("MiniLM forward pass failed")?; // [batch, seq, dim]

        // Mean over real tokens only
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?; // [batch, seq, 1]
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?; // [batch, dim]
        let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?; // [batch, 1]
        let pooled = summed.broadcast_div(&counts)?;

        let norms = pooled.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12, f64::MAX)?;
        let normalized = pooled.broadcast_div(&norms)?;

        Ok(normalized.to_vec2::<f32>()?)
    }
}

impl TextEncoder for MiniLmEncoder {
    fn encode_batch(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.embed(texts)
    }

    fn dimension(&self) -> usize {
        MINILM_DIM
    }

    fn name(&self) -> &'static str {
        "minilm"
    }
}

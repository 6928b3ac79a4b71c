//! Text embeddings for chunks and queries
//!
//! - [`TextEncoder`]: a model turning a batch of texts into vectors
//! - [`minilm`]: sentence-transformers MiniLM on candle (default)
//! - [`hashing`]: deterministic feature hashing, no model download
//! - [`EmbeddingService`]: preprocessing, content-hash cache and sub-batching
//!   around one shared encoder

pub mod cache;
pub mod hashing;
pub mod minilm;
pub mod service;

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

pub use cache::{CacheStats, EmbeddingCache};
pub use hashing::HashingEncoder;
pub use minilm::MiniLmEncoder;
pub use service::{BatchEmbeddings, EmbeddingService, EmbeddingSettings};

/// Environment variable selecting the embedding model
pub const EMBEDDER_MODEL_ENV: &str = "FOLIO_EMBEDDER_MODEL";

/// A model that embeds text. Calls are serialized by the owner; implementations
/// need not be reentrant.
pub trait TextEncoder: Send {
    /// One vector of [`dimension`](Self::dimension) floats per input, in input order
    fn encode_batch(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    /// Model name for logs
    fn name(&self) -> &'static str;
}

/// Available embedding models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingModel {
    /// all-MiniLM-L6-v2, 384 dimensions
    #[default]
    MiniLm,
    /// Feature hashing, any dimension
    Hashing,
}

impl FromStr for EmbeddingModel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minilm" | "all-minilm-l6-v2" => Ok(Self::MiniLm),
            "hashing" | "hash" => Ok(Self::Hashing),
            other => Err(anyhow::anyhow!("Unknown embedding model: {other}")),
        }
    }
}

impl EmbeddingModel {
    /// Model from `FOLIO_EMBEDDER_MODEL`, or `fallback` when unset
    pub fn from_env_or(fallback: Self) -> Result<Self> {
        match env::var(EMBEDDER_MODEL_ENV) {
            Ok(value) => value
                .parse()
                .with_context(|| format!("Failed to parse {EMBEDDER_MODEL_ENV}='{value}'")),
            Err(env::VarError::NotPresent) => Ok(fallback),
            Err(e) => Err(anyhow::anyhow!("Failed to read {EMBEDDER_MODEL_ENV}: {e}")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MiniLm => "minilm",
            Self::Hashing => "hashing",
        }
    }

    /// Dimension the model produces natively, if fixed
    pub fn native_dimension(&self) -> Option<usize> {
        match self {
            Self::MiniLm => Some(minilm::MINILM_DIM),
            Self::Hashing => None,
        }
    }
}

/// Load an encoder; `dimension` sizes the hashing encoder and is checked against fixed-size models
pub fn load_encoder(model: EmbeddingModel, dimension: usize) -> Result<Box<dyn TextEncoder>> {
    if let Some(native) = model.native_dimension() {
        anyhow::ensure!(
            native == dimension,
            "Model {} produces {native}-dimensional vectors but {dimension} were configured",
            model.as_str()
        );
    }
    match model {
        EmbeddingModel::MiniLm => {
            let device = make_device();
            let encoder = MiniLmEncoder::new(&device).context("Failed to load MiniLM model")?;
            Ok(Box::new(encoder))
        }
        EmbeddingModel::Hashing => Ok(Box::new(HashingEncoder::new(dimension))),
    }
}

/// Metal on macOS when available, CPU otherwise
pub fn make_device() -> candle_core::Device {
    #[cfg(all(target_os = "macos", feature = "metal"))]
    {
        candle_core::Device::new_metal(0).unwrap_or(candle_core::Device::Cpu)
    }
    #[cfg(not(all(target_os = "macos", feature = "metal")))]
    {
        candle_core::Device::Cpu
    }
}

/// Trim, collapse whitespace and keep at most `max_words` words
pub fn preprocess(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cosine similarity; 0.0 for empty, mismatched or zero-norm inputs
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scale to unit length in place; zero vectors are left alone
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess() {
        assert_eq!(preprocess("  a \n\t b   c ", 512), "a b c");
        assert_eq!(preprocess("one two three four", 2), "one two");
        assert_eq!(preprocess("   ", 512), "");
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_model_parsing() {
        assert_eq!("MiniLM".parse::<EmbeddingModel>().unwrap(), EmbeddingModel::MiniLm);
        assert_eq!("hashing".parse::<EmbeddingModel>().unwrap(), EmbeddingModel::Hashing);
        assert!("word2vec".parse::<EmbeddingModel>().is_err());
    }

    #[test]
    fn test_fixed_dimension_checked() {
        assert!(load_encoder(EmbeddingModel::MiniLm, 128).is_err());
        let encoder = load_encoder(EmbeddingModel::Hashing, 64).unwrap();
        assert_eq!(encoder.dimension(), 64);
    }
}

//! Shared embedding service
//!
//! One encoder per process, loaded on first use and serialized behind a
//! mutex. The cache sits behind a read-write lock so concurrent lookups do
//! not contend with each other. Large batches are encoded in fixed-size
//! sub-batches; a failing sub-batch degrades to zero vectors so the output
//! stays aligned with the input.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use super::cache::{content_key, CacheStats, EmbeddingCache, DEFAULT_CACHE_CAPACITY};
use super::{load_encoder, preprocess, EmbeddingModel, TextEncoder};
use crate::cancel::CancellationToken;
use crate::error::{FolioError, Result};

/// Default vector dimension (MiniLM)
pub const DEFAULT_DIMENSION: usize = super::minilm::MINILM_DIM;

/// Items per sub-batch for large batches
pub const SUB_BATCH_SIZE: usize = 50;

/// Batches larger than this are split into sub-batches
pub const LARGE_BATCH_THRESHOLD: usize = 100;

/// Words kept per text before encoding
pub const MAX_WORDS: usize = 512;

type EncoderLoader = Box<dyn Fn() -> anyhow::Result<Box<dyn TextEncoder>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub dimension: usize,
    pub cache_capacity: usize,
    pub sub_batch_size: usize,
    pub large_batch_threshold: usize,
    pub max_words: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            sub_batch_size: SUB_BATCH_SIZE,
            large_batch_threshold: LARGE_BATCH_THRESHOLD,
            max_words: MAX_WORDS,
        }
    }
}

/// Vectors for a batch, aligned with the input
#[derive(Debug, Clone)]
pub struct BatchEmbeddings {
    pub vectors: Vec<Arc<[f32]>>,
    /// Input indices that received zero placeholder vectors
    pub failed: Vec<usize>,
}

impl BatchEmbeddings {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

pub struct EmbeddingService {
    encoder: OnceCell<Mutex<Box<dyn TextEncoder>>>,
    loader: EncoderLoader,
    cache: RwLock<EmbeddingCache>,
    settings: EmbeddingSettings,
    zero: Arc<[f32]>,
}

impl EmbeddingService {
    /// Service around an already loaded encoder
    pub fn new(encoder: Box<dyn TextEncoder>, settings: EmbeddingSettings) -> Self {
        let service = Self::lazy(
            Box::new(|| Err(anyhow::anyhow!("encoder already provided"))),
            settings,
        );
        // A fresh cell cannot already be set
        let _ = service.encoder.set(Mutex::new(encoder));
        service
    }

    /// Service that loads its encoder on the first embedding request
    pub fn lazy(loader: EncoderLoader, settings: EmbeddingSettings) -> Self {
        let settings = EmbeddingSettings {
            sub_batch_size: settings.sub_batch_size.max(1),
            ..settings
        };
        Self {
            encoder: OnceCell::new(),
            loader,
            cache: RwLock::new(EmbeddingCache::new(settings.cache_capacity)),
            zero: Arc::from(vec![0.0f32; settings.dimension]),
            settings,
        }
    }

    /// Lazily loading service for a named model
    pub fn for_model(model: EmbeddingModel, settings: EmbeddingSettings) -> Self {
        let dimension = settings.dimension;
        Self::lazy(Box::new(move || load_encoder(model, dimension)), settings)
    }

    pub fn dimension(&self) -> usize {
        self.settings.dimension
    }

    pub fn settings(&self) -> &EmbeddingSettings {
        &self.settings
    }

    /// Load the encoder now instead of on first use
    pub fn warm_up(&self) -> Result<()> {
        self.encoder().map(|_| ())
    }

    pub fn cache_stats(&self) -> CacheStats {
        match self.cache.read() {
            Ok(cache) => cache.stats(),
            Err(poisoned) => poisoned.into_inner().stats(),
        }
    }

    fn encoder(&self) -> Result<&Mutex<Box<dyn TextEncoder>>> {
        self.encoder.get_or_try_init(|| {
            let encoder = (self.loader)().map_err(|e| FolioError::Embedding(format!("{e:#}")))?;
            if encoder.dimension() != self.settings.dimension {
                return Err(FolioError::Embedding(format!(
                    "encoder {} produces {} dimensions, {} configured",
                    encoder.name(),
                    encoder.dimension(),
                    self.settings.dimension
                )));
            }
            debug!("Loaded {} encoder ({} dimensions)", encoder.name(), encoder.dimension());
            Ok(Mutex::new(encoder))
        })
    }

    /// Embed one text; identical text returns the same cached vector
    pub fn embed(&self, text: &str) -> Result<Arc<[f32]>> {
        let text = preprocess(text, self.settings.max_words);
        if text.is_empty() {
            return Ok(Arc::clone(&self.zero));
        }
        let key = content_key(&text);
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }
        let mut encoded = self.encode(&[text.as_str()])?;
        let vector = encoded
            .pop()
            .ok_or_else(|| FolioError::Embedding("encoder returned no vector".to_string()))?;
        Ok(self.store(key, vector))
    }

    pub fn embed_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<BatchEmbeddings> {
        self.embed_batch_cancellable(texts, &CancellationToken::new())
    }

    /// Embed many texts; cancellation is checked between sub-batches
    pub fn embed_batch_cancellable<S: AsRef<str>>(
        &self,
        texts: &[S],
        cancel: &CancellationToken,
    ) -> Result<BatchEmbeddings> {
        let step = if texts.len() > self.settings.large_batch_threshold {
            self.settings.sub_batch_size
        } else {
            texts.len().max(1)
        };

        let mut vectors = Vec::with_capacity(texts.len());
        let mut failed = Vec::new();
        for (batch_idx, batch) in texts.chunks(step).enumerate() {
            cancel.check()?;
            let offset = batch_idx * step;
            match self.embed_sub_batch(batch) {
                Ok(batch_vectors) => vectors.extend(batch_vectors),
                Err(e) => {
                    warn!(
                        "Embedding sub-batch {} ({} texts) failed: {}; using zero vectors",
                        batch_idx,
                        batch.len(),
                        e
                    );
                    failed.extend(offset..offset + batch.len());
                    vectors.extend(std::iter::repeat_with(|| Arc::clone(&self.zero)).take(batch.len()));
                }
            }
        }

        debug!(
            "Embedded {} texts in batches of {} ({} placeholders)",
            texts.len(),
            step,
            failed.len()
        );
        Ok(BatchEmbeddings { vectors, failed })
    }

    fn embed_sub_batch<S: AsRef<str>>(&self, batch: &[S]) -> Result<Vec<Arc<[f32]>>> {
        let prepared: Vec<String> = batch
            .iter()
            .map(|t| preprocess(t.as_ref(), self.settings.max_words))
            .collect();

        let mut out: Vec<Option<Arc<[f32]>>> = vec![None; prepared.len()];
        // Distinct uncached texts, each encoded once
        let mut pending: Vec<(u64, &str)> = Vec::new();
        let mut slots: HashMap<u64, Vec<usize>> = HashMap::new();

        for (i, text) in prepared.iter().enumerate() {
            if text.is_empty() {
                out[i] = Some(Arc::clone(&self.zero));
                continue;
            }
            let key = content_key(text);
            if let Some(hit) = self.cached(key) {
                out[i] = Some(hit);
                continue;
            }
            let slot = slots.entry(key).or_default();
            if slot.is_empty() {
                pending.push((key, text.as_str()));
            }
            slot.push(i);
        }

        if !pending.is_empty() {
            let inputs: Vec<&str> = pending.iter().map(|(_, t)| *t).collect();
            let encoded = self.encode(&inputs)?;
            for ((key, _), vector) in pending.iter().zip(encoded) {
                let shared = self.store(*key, vector);
                for &i in slots.get(key).into_iter().flatten() {
                    out[i] = Some(Arc::clone(&shared));
                }
            }
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| FolioError::Embedding("missing vector in sub-batch".to_string())))
            .collect()
    }

    /// Run the encoder under its lock and validate the output shape
    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let encoder = self.encoder()?;
        let mut guard = encoder
            .lock()
            .map_err(|_| FolioError::Embedding("encoder lock poisoned".to_string()))?;
        let vectors = guard
            .encode_batch(texts)
            .map_err(|e| FolioError::Embedding(format!("{e:#}")))?;
        drop(guard);

        if vectors.len() != texts.len() {
            return Err(FolioError::Embedding(format!(
                "encoder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.settings.dimension) {
            return Err(FolioError::Embedding(format!(
                "encoder returned {} dimensions, expected {}",
                bad.len(),
                self.settings.dimension
            )));
        }
        Ok(vectors)
    }

    fn cached(&self, key: u64) -> Option<Arc<[f32]>> {
        self.cache.read().ok().and_then(|cache| cache.get(key))
    }

    fn store(&self, key: u64, vector: Vec<f32>) -> Arc<[f32]> {
        let vector: Arc<[f32]> = Arc::from(vector);
        match self.cache.write() {
            Ok(mut cache) => cache.insert(key, vector),
            Err(_) => vector,
        }
    }
}

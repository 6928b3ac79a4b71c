//! Feature-hashing encoder
//!
//! Word unigrams and bigrams are hashed into a fixed number of signed buckets
//! and the result is L2-normalized. Deterministic and offline; texts sharing
//! vocabulary get high cosine similarity.

use anyhow::Result;
use unicode_segmentation::UnicodeSegmentation;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::{l2_normalize, TextEncoder};

const UNIGRAM_SEED: u64 = 0x9E37_79B9;
const BIGRAM_SEED: u64 = 0x85EB_CA6B;

/// Weight of a bigram relative to a unigram
const BIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashingEncoder {
    dimension: usize,
}

impl HashingEncoder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed one text; empty text gives a zero vector
    pub fn encode(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let words: Vec<String> = text.unicode_words().map(str::to_lowercase).collect();

        for word in &words {
            self.add(&mut v, word.as_bytes(), UNIGRAM_SEED, 1.0);
        }
        for pair in words.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add(&mut v, bigram.as_bytes(), BIGRAM_SEED, BIGRAM_WEIGHT);
        }

        l2_normalize(&mut v);
        v
    }

    fn add(&self, v: &mut [f32], token: &[u8], seed: u64, weight: f32) {
        let h = xxh3_64_with_seed(token, seed);
        let bucket = (h % self.dimension as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl TextEncoder for HashingEncoder {
    fn encode_batch(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.encode(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

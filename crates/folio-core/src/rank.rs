//! Query-time relevance ranking
//!
//! Vector search returns raw cosine similarity. The ranker adds small boosts
//! for chunk quality, heading chunks, semantic markers, literal query-term
//! overlap and the extraction path, then applies the caller's threshold to the
//! boosted score. Candidates are fetched with a looser threshold so chunks
//! that only clear the bar after boosting are not lost.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::chunker::ExtractionMethod;
use crate::index::{IndexMetadata, Position, SearchHit};

/// Candidate threshold as a fraction of the requested threshold
pub const CANDIDATE_THRESHOLD_SCALE: f32 = 0.4;

/// Lowest candidate threshold
pub const CANDIDATE_THRESHOLD_FLOOR: f32 = 0.1;

/// Candidates fetched per requested result
pub const CANDIDATE_MULTIPLIER: usize = 2;

/// Relevance never exceeds this
pub const MAX_RELEVANCE: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    /// Multiplies `quality - 0.5`
    pub quality: f32,
    pub heading: f32,
    /// Per semantic marker
    pub marker: f32,
    /// Multiplies the fraction of query terms found in the chunk
    pub keyword_overlap: f32,
    pub embedded_toc: f32,
    pub enhanced_pipeline: f32,
    pub candidate_scale: f32,
    pub candidate_floor: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            quality: 0.1,
            heading: 0.05,
            marker: 0.02,
            keyword_overlap: 0.2,
            embedded_toc: 0.1,
            enhanced_pipeline: 0.05,
            candidate_scale: CANDIDATE_THRESHOLD_SCALE,
            candidate_floor: CANDIDATE_THRESHOLD_FLOOR,
        }
    }
}

/// A raw search hit together with the full chunk text when available
#[derive(Debug, Clone)]
pub struct Candidate {
    pub hit: SearchHit,
    pub text: Option<String>,
}

impl Candidate {
    pub fn new(hit: SearchHit, text: Option<String>) -> Self {
        Self { hit, text }
    }

    fn text(&self) -> &str {
        self.text.as_deref().unwrap_or(&self.hit.metadata.preview)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    pub position: Position,
    pub similarity: f32,
    pub relevance: f32,
    pub metadata: IndexMetadata,
    pub text: Option<String>,
}

/// Lowercased distinct words of a query, in order of first appearance
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query.unicode_words() {
        let word = word.to_lowercase();
        if !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

/// Fraction of `terms` occurring in `text` (case-insensitive substring match)
pub fn keyword_overlap(terms: &[String], text: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let found = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    found as f32 / terms.len() as f32
}

#[derive(Debug, Clone, Default)]
pub struct Ranker {
    weights: RankingWeights,
}

impl Ranker {
    pub fn new(weights: RankingWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RankingWeights {
        &self.weights
    }

    /// Threshold used when fetching candidates for a requested threshold
    pub fn candidate_threshold(&self, threshold: f32) -> f32 {
        (threshold * self.weights.candidate_scale).max(self.weights.candidate_floor)
    }

    /// Number of candidates fetched for `top_k` results
    pub fn candidate_count(&self, top_k: usize) -> usize {
        top_k.saturating_mul(CANDIDATE_MULTIPLIER)
    }

    /// Boosted relevance of one hit, capped at `MAX_RELEVANCE`
    pub fn relevance(&self, similarity: f32, metadata: &IndexMetadata, terms: &[String], text: &str) -> f32 {
        let w = &self.weights;
        let mut score = similarity;

        score += (metadata.content_quality_score - 0.5) * w.quality;
        if metadata.chunk_type.is_heading() {
            score += w.heading;
        }
        score += metadata.semantic_markers.len() as f32 * w.marker;
        score += keyword_overlap(terms, text) * w.keyword_overlap;
        score += match metadata.extraction_method {
            ExtractionMethod::EmbeddedToc => w.embedded_toc,
            ExtractionMethod::EnhancedPipeline => w.enhanced_pipeline,
            ExtractionMethod::PageFallback | ExtractionMethod::SimpleFallback => 0.0,
        };

        score.min(MAX_RELEVANCE)
    }

    /// Score, cut at `threshold`, sort by relevance and keep `top_k`
    pub fn rank(&self, query: &str, candidates: Vec<Candidate>, top_k: usize, threshold: f32) -> Vec<RankedChunk> {
        let terms = query_terms(query);
        let mut ranked: Vec<RankedChunk> = candidates
            .into_iter()
            .map(|c| {
                let relevance = self.relevance(c.hit.similarity, &c.hit.metadata, &terms, c.text());
                RankedChunk {
                    position: c.hit.position,
                    similarity: c.hit.similarity,
                    relevance,
                    metadata: c.hit.metadata,
                    text: c.text,
                }
            })
            .filter(|r| r.relevance >= threshold)
            .collect();

        ranked.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });
        ranked.truncate(top_k);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkType, SemanticMarker};
    use crate::index::test_support::metadata;

    fn hit(position: Position, similarity: f32, meta: IndexMetadata) -> Candidate {
        Candidate::new(
            SearchHit {
                position,
                similarity,
                metadata: meta,
            },
            None,
        )
    }

    fn plain_metadata() -> IndexMetadata {
        let mut m = metadata("doc", 0);
        m.extraction_method = ExtractionMethod::PageFallback;
        m.preview = "unrelated words".to_string();
        m
    }

    #[test]
    fn test_candidate_threshold() {
        let ranker = Ranker::default();
        assert!((ranker.candidate_threshold(0.7) - 0.28).abs() < 1e-6);
        assert!((ranker.candidate_threshold(0.1) - 0.1).abs() < 1e-6);
        assert_eq!(ranker.candidate_count(5), 10);
    }

    #[test]
    fn test_neutral_chunk_keeps_similarity() {
        let ranker = Ranker::default();
        let r = ranker.relevance(0.6, &plain_metadata(), &query_terms("solar power"), "unrelated words");
        assert!((r - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_boosts_add_up() {
        let ranker = Ranker::default();
        let mut m = plain_metadata();
        m.content_quality_score = 1.0;
        m.chunk_type = ChunkType::H1;
        m.semantic_markers = vec![SemanticMarker::Introductory, SemanticMarker::Technical];
        m.extraction_method = ExtractionMethod::EmbeddedToc;
        let terms = query_terms("solar power");
        let r = ranker.relevance(0.3, &m, &terms, "Solar energy basics");
        // 0.3 + 0.05 + 0.05 + 0.04 + 0.1 + 0.1
        assert!((r - 0.64).abs() < 1e-5);
    }

    #[test]
    fn test_relevance_capped() {
        let ranker = Ranker::default();
        let mut m = plain_metadata();
        m.extraction_method = ExtractionMethod::EmbeddedToc;
        assert_eq!(ranker.relevance(0.99, &m, &[], ""), MAX_RELEVANCE);
    }

    #[test]
    fn test_query_terms_dedup_lowercase() {
        assert_eq!(query_terms("Solar, solar POWER!"), vec!["solar", "power"]);
        assert_eq!(keyword_overlap(&query_terms("solar wind"), "SOLAR panels"), 0.5);
        assert_eq!(keyword_overlap(&[], "anything"), 0.0);
    }

    #[test]
    fn test_rank_cuts_sorts_truncates() {
        let ranker = Ranker::default();
        let candidates = vec![
            hit(0, 0.5, plain_metadata()),
            hit(1, 0.8, plain_metadata()),
            hit(2, 0.2, plain_metadata()),
            hit(3, 0.7, plain_metadata()),
        ];
        let ranked = ranker.rank("query", candidates, 2, 0.45);
        let positions: Vec<Position> = ranked.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 3]);
    }

    #[test]
    fn test_boost_lifts_chunk_over_threshold() {
        let ranker = Ranker::default();
        let mut boosted = plain_metadata();
        boosted.extraction_method = ExtractionMethod::EmbeddedToc;
        let ranked = ranker.rank(
            "query",
            vec![hit(0, 0.45, boosted), hit(1, 0.45, plain_metadata())],
            5,
            0.5,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].position, 0);
    }

    #[test]
    fn test_full_text_preferred_over_preview() {
        let ranker = Ranker::default();
        let mut c = hit(0, 0.5, plain_metadata());
        c.text = Some("the quantum chapter".to_string());
        let ranked = ranker.rank("quantum", vec![c], 1, 0.0);
        assert!((ranked[0].relevance - 0.7).abs() < 1e-5);
    }
}

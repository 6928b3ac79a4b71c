//! Thematic structure of a document from its chunk embeddings
//!
//! Chunks are grouped with k-means (seeded k-means++ initialisation, several
//! restarts, lowest inertia wins). Sections are ordered by the mean position
//! of their members so the result follows the document roughly front to back.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Fewest clusters formed
pub const MIN_CLUSTERS: usize = 2;

/// Most clusters formed
pub const MAX_CLUSTERS: usize = 8;

/// Roughly one cluster per this many chunks
pub const CHUNKS_PER_CLUSTER: usize = 5;

pub const KMEANS_SEED: u64 = 42;

/// Independent k-means runs; the lowest inertia is kept
pub const KMEANS_RESTARTS: usize = 10;

const MAX_ITERATIONS: usize = 100;

/// Relative inertia change below which a run has converged
const CONVERGENCE_THRESHOLD: f32 = 1e-4;

/// Words of the longest member used as a section title
pub const TITLE_WORDS: usize = 8;

/// Section titles longer than this are cut with an ellipsis
pub const TITLE_MAX_CHARS: usize = 60;

/// Sections named in the summary sentence
const SUMMARY_TITLES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub cluster_id: usize,
    pub title: String,
    /// Indices into the analyzed chunk list, ascending
    pub members: Vec<usize>,
}

impl Section {
    fn mean_index(&self) -> f64 {
        if self.members.is_empty() {
            return f64::MAX;
        }
        self.members.iter().sum::<usize>() as f64 / self.members.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructureAnalysis {
    pub sections: Vec<Section>,
    pub summary: String,
    pub total_chunks: usize,
    pub embedding_dimension: usize,
}

/// `N / 5` clamped to `2..=8`
pub fn cluster_count(n: usize) -> usize {
    (n / CHUNKS_PER_CLUSTER).clamp(MIN_CLUSTERS, MAX_CLUSTERS)
}

/// First words of the longest text, cut to `TITLE_MAX_CHARS`
pub fn section_title<S: AsRef<str>>(texts: &[S]) -> String {
    // First longest wins ties
    let longest = texts
        .iter()
        .map(AsRef::as_ref)
        .fold("", |best, t| if t.chars().count() > best.chars().count() { t } else { best });
    let title = longest
        .split_whitespace()
        .take(TITLE_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    if title.chars().count() > TITLE_MAX_CHARS {
        format!("{}...", title.chars().take(TITLE_MAX_CHARS).collect::<String>())
    } else {
        title
    }
}

/// One-sentence overview of the section layout
pub fn summarize(sections: &[Section], total_chunks: usize) -> String {
    if sections.is_empty() {
        return "Document structure could not be analyzed.".to_string();
    }
    let count = sections.len();
    let average = total_chunks as f64 / count as f64;
    let titles: Vec<&str> = sections
        .iter()
        .take(SUMMARY_TITLES)
        .map(|s| s.title.as_str())
        .collect();

    let mut summary = format!(
        "Document contains {count} main sections with {total_chunks} total content chunks. \
         Average section size: {average:.1} chunks. Main sections include: {}",
        titles.join(", ")
    );
    if count > SUMMARY_TITLES {
        summary.push_str(&format!(" and {} other sections.", count - SUMMARY_TITLES));
    } else {
        summary.push('.');
    }
    summary
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(point, c)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        .unwrap_or((0, 0.0))
}

/// k-means++ seeding: each next centroid drawn with probability proportional to distance²
fn initialize_centroids<V: AsRef<[f32]>>(data: &[V], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(data[rng.random_range(0..data.len())].as_ref().to_vec());

    while centroids.len() < k {
        let distances: Vec<f32> = data
            .iter()
            .map(|p| nearest(p.as_ref(), &centroids).1)
            .collect();
        let total: f32 = distances.iter().sum();

        let idx = if total <= 0.0 {
            rng.random_range(0..data.len())
        } else {
            let target = rng.random::<f32>() * total;
            let mut cumsum = 0.0;
            distances
                .iter()
                .position(|&d| {
                    cumsum += d;
                    cumsum >= target
                })
                .unwrap_or(data.len() - 1)
        };
        centroids.push(data[idx].as_ref().to_vec());
    }
    centroids
}

/// One Lloyd run; returns assignments and inertia
fn kmeans_run<V: AsRef<[f32]>>(data: &[V], k: usize, rng: &mut StdRng) -> (Vec<usize>, f32) {
    let dim = data[0].as_ref().len();
    let mut centroids = initialize_centroids(data, k, rng);
    let mut assignments = vec![0usize; data.len()];
    let mut prev_inertia = f32::INFINITY;

    for _ in 0..MAX_ITERATIONS {
        for (slot, point) in assignments.iter_mut().zip(data) {
            *slot = nearest(point.as_ref(), &centroids).0;
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, &cluster) in data.iter().zip(&assignments) {
            for (s, v) in sums[cluster].iter_mut().zip(point.as_ref()) {
                *s += v;
            }
            counts[cluster] += 1;
        }
        for ((centroid, sum), &count) in centroids.iter_mut().zip(sums).zip(&counts) {
            // Empty clusters keep their previous centroid
            if count > 0 {
                *centroid = sum.into_iter().map(|s| s / count as f32).collect();
            }
        }

        let inertia: f32 = data
            .iter()
            .zip(&assignments)
            .map(|(p, &c)| squared_distance(p.as_ref(), &centroids[c]))
            .sum();
        if prev_inertia.is_finite()
            && (prev_inertia - inertia).abs() <= CONVERGENCE_THRESHOLD * prev_inertia.max(f32::MIN_POSITIVE)
        {
            prev_inertia = inertia;
            break;
        }
        prev_inertia = inertia;
    }

    (assignments, prev_inertia)
}

/// Cluster assignment per vector; deterministic for a given seed
pub fn kmeans<V: AsRef<[f32]>>(data: &[V], k: usize, seed: u64, restarts: usize) -> Vec<usize> {
    if data.is_empty() {
        return Vec::new();
    }
    let k = k.clamp(1, data.len());
    let mut rng = StdRng::seed_from_u64(seed);

    let mut best: Option<(Vec<usize>, f32)> = None;
    for _ in 0..restarts.max(1) {
        let (assignments, inertia) = kmeans_run(data, k, &mut rng);
        if best.as_ref().map_or(true, |(_, b)| inertia < *b) {
            best = Some((assignments, inertia));
        }
    }
    best.map(|(a, _)| a).unwrap_or_default()
}

/// Groups chunks into titled sections and summarizes them
#[derive(Debug, Clone)]
pub struct StructureAnalyzer {
    seed: u64,
    restarts: usize,
}

impl Default for StructureAnalyzer {
    fn default() -> Self {
        Self {
            seed: KMEANS_SEED,
            restarts: KMEANS_RESTARTS,
        }
    }
}

impl StructureAnalyzer {
    pub fn new(seed: u64, restarts: usize) -> Self {
        Self { seed, restarts }
    }

    /// `texts` and `vectors` are parallel, in document order
    pub fn analyze<S, V>(&self, texts: &[S], vectors: &[V]) -> StructureAnalysis
    where
        S: AsRef<str>,
        V: AsRef<[f32]>,
    {
        let n = texts.len().min(vectors.len());
        if n == 0 {
            return StructureAnalysis {
                sections: Vec::new(),
                summary: "No content available".to_string(),
                total_chunks: 0,
                embedding_dimension: 0,
            };
        }

        let sections = if n < MIN_CLUSTERS {
            sequential_sections(n)
        } else {
            self.clustered_sections(&texts[..n], &vectors[..n])
        };

        tracing::debug!("Grouped {} chunks into {} sections", n, sections.len());
        StructureAnalysis {
            summary: summarize(&sections, n),
            sections,
            total_chunks: n,
            embedding_dimension: vectors[0].as_ref().len(),
        }
    }

    fn clustered_sections<S: AsRef<str>, V: AsRef<[f32]>>(&self, texts: &[S], vectors: &[V]) -> Vec<Section> {
        let k = cluster_count(texts.len());
        let assignments = kmeans(vectors, k, self.seed, self.restarts);

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); k];
        for (i, &cluster) in assignments.iter().enumerate() {
            members[cluster].push(i);
        }

        let mut sections: Vec<Section> = members
            .into_iter()
            .enumerate()
            .filter(|(_, m)| !m.is_empty())
            .map(|(cluster_id, members)| {
                let member_texts: Vec<&str> = members.iter().map(|&i| texts[i].as_ref()).collect();
                Section {
                    cluster_id,
                    title: section_title(&member_texts),
                    members,
                }
            })
            .collect();

        sections.sort_by(|a, b| {
            a.mean_index()
                .partial_cmp(&b.mean_index())
                .unwrap_or(Ordering::Equal)
                .then(a.cluster_id.cmp(&b.cluster_id))
        });
        sections
    }
}

/// Consecutive runs of `max(1, n / 3)` chunks
fn sequential_sections(n: usize) -> Vec<Section> {
    let per_section = (n / 3).max(1);
    (0..n)
        .step_by(per_section)
        .enumerate()
        .map(|(id, start)| Section {
            cluster_id: id,
            title: format!("Section {}", id + 1),
            members: (start..(start + per_section).min(n)).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_count_bounds() {
        assert_eq!(cluster_count(2), 2);
        assert_eq!(cluster_count(14), 2);
        assert_eq!(cluster_count(15), 3);
        assert_eq!(cluster_count(41), 8);
        assert_eq!(cluster_count(500), 8);
    }

    #[test]
    fn test_section_title() {
        let texts = ["short one", "this is the longest text of all with many more words than needed"];
        assert_eq!(section_title(&texts), "this is the longest text of all with");

        let long_words = ["Pneumonoultramicroscopicsilicovolcanoconiosis is an extraordinarily lengthy word"];
        let title = section_title(&long_words);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn test_summary_sentence() {
        let sections: Vec<Section> = (0..5)
            .map(|i| Section {
                cluster_id: i,
                title: format!("T{i}"),
                members: vec![i, i + 5],
            })
            .collect();
        assert_eq!(
            summarize(&sections, 10),
            "Document contains 5 main sections with 10 total content chunks. \
             Average section size: 2.0 chunks. Main sections include: T0, T1, T2 and 2 other sections."
        );
        assert!(summarize(&sections[..2], 4).ends_with("Main sections include: T0, T1."));
    }

    #[test]
    fn test_kmeans_separates_groups() {
        let mut data = Vec::new();
        for i in 0..6 {
            data.push(vec![1.0 + i as f32 * 0.01, 0.0]);
        }
        for i in 0..6 {
            data.push(vec![0.0, 1.0 + i as f32 * 0.01]);
        }
        let labels = kmeans(&data, 2, KMEANS_SEED, KMEANS_RESTARTS);
        assert!(labels[..6].iter().all(|&l| l == labels[0]));
        assert!(labels[6..].iter().all(|&l| l == labels[6]));
        assert_ne!(labels[0], labels[6]);
    }

    #[test]
    fn test_kmeans_deterministic() {
        let data: Vec<Vec<f32>> = (0..30)
            .map(|i| vec![(i as f32 * 0.7).sin(), (i as f32 * 1.3).cos(), i as f32 / 30.0])
            .collect();
        assert_eq!(
            kmeans(&data, 4, KMEANS_SEED, KMEANS_RESTARTS),
            kmeans(&data, 4, KMEANS_SEED, KMEANS_RESTARTS)
        );
    }

    #[test]
    fn test_sections_in_document_order() {
        // Late chunks cluster together, early chunks together
        let texts: Vec<String> = (0..10).map(|i| format!("chunk {i} text")).collect();
        let vectors: Vec<Vec<f32>> = (0..10)
            .map(|i| if i < 5 { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
            .rev()
            .collect();
        let analysis = StructureAnalyzer::default().analyze(&texts, &vectors);
        assert_eq!(analysis.sections.len(), 2);
        assert_eq!(analysis.sections[0].members, vec![0, 1, 2, 3, 4]);
        assert_eq!(analysis.sections[1].members, vec![5, 6, 7, 8, 9]);
        assert_eq!(analysis.total_chunks, 10);
        assert_eq!(analysis.embedding_dimension, 2);
    }

    #[test]
    fn test_single_chunk_sequential() {
        let analysis = StructureAnalyzer::default().analyze(&["only chunk"], &[vec![1.0, 0.0]]);
        assert_eq!(analysis.sections.len(), 1);
        assert_eq!(analysis.sections[0].title, "Section 1");
        assert!(analysis.summary.starts_with("Document contains 1 main sections with 1 total"));
    }

    #[test]
    fn test_sequential_sections_cover_all() {
        let sections = sequential_sections(7);
        let covered: Vec<usize> = sections.iter().flat_map(|s| s.members.clone()).collect();
        assert_eq!(covered, (0..7).collect::<Vec<_>>());
        assert_eq!(sections[0].members.len(), 2);
    }

    #[test]
    fn test_empty_input() {
        let texts: [&str; 0] = [];
        let vectors: [Vec<f32>; 0] = [];
        let analysis = StructureAnalyzer::default().analyze(&texts, &vectors);
        assert!(analysis.sections.is_empty());
        assert_eq!(analysis.summary, "No content available");
    }
}

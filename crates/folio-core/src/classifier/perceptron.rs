//! Averaged structured perceptron for line sequence labeling
//!
//! Each page is one sequence. Lines are described by discrete indicator
//! features (binned typography plus neighbour context), labels interact
//! through first-order transition weights, and decoding is Viterbi.
//!
//! The model is trained per document on the rule labels and then re-predicts
//! the same lines. Weight averaging uses the running-sum trick: alongside the
//! weights `w` we keep `u = Σ c·Δ`, and the averaged weights are `w - u / c`.

use std::collections::HashMap;

use tracing::debug;

use super::rules::RuleLabeler;
use super::{HeadingLabel, LineLabeler, NUM_LABELS};
use crate::error::{FolioError, Result};
use crate::features::LineFeatures;

/// Training passes over the document
pub const DEFAULT_EPOCHS: usize = 10;

/// Font rank feature values are capped here
const MAX_RANK_FEATURE: usize = 5;

/// Row of the transition table used for the sequence start
const START: usize = NUM_LABELS;

pub fn font_size_bin(size: f32) -> &'static str {
    match size {
        s if s <= 8.0 => "very_small",
        s if s <= 10.0 => "small",
        s if s <= 12.0 => "normal",
        s if s <= 14.0 => "medium",
        s if s <= 18.0 => "large",
        _ => "very_large",
    }
}

pub fn relative_size_bin(ratio: f32) -> &'static str {
    match ratio {
        r if r < 0.9 => "smaller",
        r if r < 1.1 => "normal",
        r if r < 1.3 => "larger",
        r if r < 1.6 => "much_larger",
        _ => "very_large",
    }
}

pub fn space_bin(ratio: f32) -> &'static str {
    match ratio {
        r if r < 0.5 => "tight",
        r if r < 1.0 => "normal",
        r if r < 2.0 => "loose",
        _ => "very_loose",
    }
}

pub fn length_bin(chars: usize) -> &'static str {
    match chars {
        0..=10 => "very_short",
        11..=30 => "short",
        31..=80 => "medium",
        81..=150 => "long",
        _ => "very_long",
    }
}

/// Indicator features of `page[i]`; boolean features appear only when true
pub fn line_features(page: &[LineFeatures], i: usize) -> Vec<String> {
    let f = &page[i];
    let mut out = vec![
        "bias".to_string(),
        format!("font_size_bin={}", font_size_bin(f.font_size)),
        format!("relative_font_size_bin={}", relative_size_bin(f.relative_font_size)),
        format!("font_size_rank={}", f.font_size_rank.min(MAX_RANK_FEATURE)),
        format!("char_count_bin={}", length_bin(f.char_count)),
        format!("space_before_bin={}", space_bin(f.space_before_ratio)),
    ];
    let flags = [
        ("is_bold", f.is_bold),
        ("is_italic", f.is_italic),
        ("is_centered", f.is_centered),
        ("has_numeric_prefix", f.has_numeric_prefix),
        ("is_chapter_heading", f.is_chapter_heading),
    ];
    out.extend(flags.iter().filter(|(_, on)| *on).map(|(name, _)| name.to_string()));

    match i.checked_sub(1).map(|p| &page[p]) {
        Some(prev) => {
            out.push(format!("-1:font_size_bin={}", font_size_bin(prev.font_size)));
            if prev.is_bold {
                out.push("-1:is_bold".to_string());
            }
            if prev.ends_with_punct {
                out.push("-1:ends_with_punct".to_string());
            }
        }
        None => out.push("BOS".to_string()),
    }
    match page.get(i + 1) {
        Some(next) => {
            out.push(format!("+1:font_size_bin={}", font_size_bin(next.font_size)));
            if next.is_bold {
                out.push("+1:is_bold".to_string());
            }
        }
        None => out.push("EOS".to_string()),
    }
    out
}

fn sequence_features(page: &[LineFeatures]) -> Vec<Vec<String>> {
    (0..page.len()).map(|i| line_features(page, i)).collect()
}

type Row = [f32; NUM_LABELS];

/// Averaged perceptron with first-order label transitions
#[derive(Debug, Clone, Default)]
pub struct AveragedPerceptron {
    feature_ids: HashMap<String, usize>,
    emission: Vec<Row>,
    emission_sum: Vec<Row>,
    transition: [Row; NUM_LABELS + 1],
    transition_sum: [Row; NUM_LABELS + 1],
    counter: f32,
    trained: bool,
}

impl AveragedPerceptron {
    pub fn new() -> Self {
        Self {
            counter: 1.0,
            ..Self::default()
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    fn feature_id(&mut self, name: &str) -> usize {
        if let Some(id) = self.feature_ids.get(name) {
            return *id;
        }
        let id = self.emission.len();
        self.feature_ids.insert(name.to_string(), id);
        self.emission.push([0.0; NUM_LABELS]);
        self.emission_sum.push([0.0; NUM_LABELS]);
        id
    }

    fn emission_scores(&self, features: &[Vec<String>]) -> Vec<Row> {
        features
            .iter()
            .map(|line| {
                let mut row = [0.0; NUM_LABELS];
                for id in line.iter().filter_map(|f| self.feature_ids.get(f)) {
                    for (label, score) in row.iter_mut().enumerate() {
                        *score += self.emission[*id][label];
                    }
                }
                row
            })
            .collect()
    }

    /// Best label sequence; ties go to the lower label index
    fn viterbi(&self, features: &[Vec<String>]) -> Vec<usize> {
        let n = features.len();
        if n == 0 {
            return Vec::new();
        }
        let emissions = self.emission_scores(features);
        let mut score = vec![[0.0f32; NUM_LABELS]; n];
        let mut back = vec![[0usize; NUM_LABELS]; n];

        for y in 0..NUM_LABELS {
            score[0][y] = self.transition[START][y] + emissions[0][y];
        }
        for i in 1..n {
            for y in 0..NUM_LABELS {
                let mut best = f32::NEG_INFINITY;
                let mut arg = 0;
                for prev in 0..NUM_LABELS {
                    let s = score[i - 1][prev] + self.transition[prev][y];
                    if s > best {
                        best = s;
                        arg = prev;
                    }
                }
                score[i][y] = best + emissions[i][y];
                back[i][y] = arg;
            }
        }

        let mut last = 0;
        for y in 1..NUM_LABELS {
            if score[n - 1][y] > score[n - 1][last] {
                last = y;
            }
        }
        let mut path = vec![0; n];
        path[n - 1] = last;
        for i in (1..n).rev() {
            path[i - 1] = back[i][path[i]];
        }
        path
    }

    fn update(&mut self, features: &[Vec<String>], labels: &[usize], delta: f32) {
        let c = self.counter;
        let mut prev = START;
        for (line, &y) in features.iter().zip(labels) {
            for name in line {
                let id = self.feature_id(name);
                self.emission[id][y] += delta;
                self.emission_sum[id][y] += c * delta;
            }
            self.transition[prev][y] += delta;
            self.transition_sum[prev][y] += c * delta;
            prev = y;
        }
    }

    /// Train on label sequences, one per page; pages without lines are ignored
    pub fn train(&mut self, pages: &[Vec<LineFeatures>], labels: &[Vec<HeadingLabel>], epochs: usize) -> Result<()> {
        if pages.len() != labels.len() {
            return Err(FolioError::Classifier(format!(
                "{} pages but {} label sequences",
                pages.len(),
                labels.len()
            )));
        }

        let mut data = Vec::new();
        for (page, page_labels) in pages.iter().zip(labels) {
            if page.len() != page_labels.len() {
                return Err(FolioError::Classifier(format!(
                    "page has {} lines but {} labels",
                    page.len(),
                    page_labels.len()
                )));
            }
            if page.is_empty() {
                continue;
            }
            let gold: Vec<usize> = page_labels.iter().map(|l| l.index()).collect();
            data.push((sequence_features(page), gold));
        }
        if data.is_empty() {
            return Err(FolioError::Classifier("no lines to train on".to_string()));
        }

        for epoch in 0..epochs {
            let mut mistakes = 0;
            for (features, gold) in &data {
                let predicted = self.viterbi(features);
                if predicted != *gold {
                    mistakes += 1;
                    self.update(features, gold, 1.0);
                    self.update(features, &predicted, -1.0);
                }
                self.counter += 1.0;
            }
            debug!("Perceptron epoch {}: {} sequence mistakes", epoch + 1, mistakes);
            if mistakes == 0 {
                break;
            }
        }

        self.average();
        self.trained = true;
        Ok(())
    }

    fn average(&mut self) {
        let c = self.counter;
        for (w, u) in self.emission.iter_mut().zip(&self.emission_sum) {
            for y in 0..NUM_LABELS {
                w[y] -= u[y] / c;
            }
        }
        for (w, u) in self.transition.iter_mut().zip(&self.transition_sum) {
            for y in 0..NUM_LABELS {
                w[y] -= u[y] / c;
            }
        }
    }

    pub fn predict(&self, pages: &[Vec<LineFeatures>]) -> Result<Vec<Vec<HeadingLabel>>> {
        if !self.trained {
            return Err(FolioError::Classifier("model has not been trained".to_string()));
        }
        Ok(pages
            .iter()
            .map(|page| {
                self.viterbi(&sequence_features(page))
                    .into_iter()
                    .map(HeadingLabel::from_index)
                    .collect()
            })
            .collect())
    }
}

/// Trains a fresh perceptron on the document's own rule labels, then re-predicts
#[derive(Debug, Clone, Copy)]
pub struct BootstrapLabeler {
    epochs: usize,
}

impl BootstrapLabeler {
    pub fn new(epochs: usize) -> Self {
        Self { epochs: epochs.max(1) }
    }
}

impl Default for BootstrapLabeler {
    fn default() -> Self {
        Self::new(DEFAULT_EPOCHS)
    }
}

impl LineLabeler for BootstrapLabeler {
    fn label(&self, pages: &[Vec<LineFeatures>]) -> Result<Vec<Vec<HeadingLabel>>> {
        let rule_labels = RuleLabeler::label_pages(pages);
        let mut model = AveragedPerceptron::new();
        model.train(pages, &rule_labels, self.epochs)?;
        model.predict(pages)
    }

    fn name(&self) -> &'static str {
        "bootstrap"
    }
}

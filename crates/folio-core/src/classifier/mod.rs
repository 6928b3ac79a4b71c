//! Line structure classification (paragraph vs heading level)
//!
//! Two interchangeable [`LineLabeler`] strategies:
//! - [`RuleLabeler`]: weighted heading-score rules, a pure function per line
//! - [`BootstrapLabeler`]: an averaged structured perceptron trained on the
//!   document's own rule labels, then used to re-predict them with
//!   neighbouring-line context
//!
//! [`StructureClassifier`] runs the configured strategy and falls back to the
//! rules whenever it fails.

pub mod perceptron;
pub mod rules;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::features::{DocumentFeatures, LineFeatures};

pub use perceptron::{AveragedPerceptron, BootstrapLabeler};
pub use rules::RuleLabeler;

/// Number of distinct line labels
pub const NUM_LABELS: usize = 4;

/// Structural label of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeadingLabel {
    Paragraph,
    H1,
    H2,
    H3,
}

impl HeadingLabel {
    pub fn index(self) -> usize {
        match self {
            HeadingLabel::Paragraph => 0,
            HeadingLabel::H1 => 1,
            HeadingLabel::H2 => 2,
            HeadingLabel::H3 => 3,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            1 => HeadingLabel::H1,
            2 => HeadingLabel::H2,
            3 => HeadingLabel::H3,
            _ => HeadingLabel::Paragraph,
        }
    }

    pub fn is_heading(self) -> bool {
        self != HeadingLabel::Paragraph
    }

    /// Heading depth (1..=3), `None` for paragraphs
    pub fn level(self) -> Option<u8> {
        match self {
            HeadingLabel::Paragraph => None,
            HeadingLabel::H1 => Some(1),
            HeadingLabel::H2 => Some(2),
            HeadingLabel::H3 => Some(3),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HeadingLabel::Paragraph => "P",
            HeadingLabel::H1 => "H1",
            HeadingLabel::H2 => "H2",
            HeadingLabel::H3 => "H3",
        }
    }
}

/// A line with its assigned label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedLine {
    pub features: LineFeatures,
    pub label: HeadingLabel,
}

/// Labels every line of a document, one sequence per page
pub trait LineLabeler: Send + Sync {
    /// One label per line, same shape as `pages`
    fn label(&self, pages: &[Vec<LineFeatures>]) -> Result<Vec<Vec<HeadingLabel>>>;

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

/// Which labeler drives classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierStrategy {
    /// Perceptron bootstrapped from rule labels
    #[default]
    Bootstrap,
    /// Rules only
    Rules,
}

/// Labeled pages plus whether the configured strategy had to be abandoned
#[derive(Debug, Clone)]
pub struct Classification {
    pub pages: Vec<Vec<ClassifiedLine>>,
    pub strategy: &'static str,
    /// Set when the configured strategy failed and rules were used instead
    pub fallback_reason: Option<String>,
}

impl Classification {
    pub fn heading_count(&self) -> usize {
        self.pages
            .iter()
            .flatten()
            .filter(|l| l.label.is_heading())
            .count()
    }
}

/// Runs the configured labeler, falling back to rules on failure
pub struct StructureClassifier {
    labeler: Box<dyn LineLabeler>,
}

impl Default for StructureClassifier {
    fn default() -> Self {
        Self::new(ClassifierStrategy::default(), perceptron::DEFAULT_EPOCHS)
    }
}

impl StructureClassifier {
    pub fn new(strategy: ClassifierStrategy, epochs: usize) -> Self {
        let labeler: Box<dyn LineLabeler> = match strategy {
            ClassifierStrategy::Bootstrap => Box::new(BootstrapLabeler::new(epochs)),
            ClassifierStrategy::Rules => Box::new(RuleLabeler),
        };
        Self { labeler }
    }

    pub fn with_labeler(labeler: Box<dyn LineLabeler>) -> Self {
        Self { labeler }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.labeler.name()
    }

    pub fn classify(&self, doc: &DocumentFeatures) -> Classification {
        let (labels, strategy, fallback_reason) = match self.labeler.label(&doc.pages) {
            Ok(labels) if same_shape(&labels, &doc.pages) => (labels, self.labeler.name(), None),
            Ok(_) => {
                let reason = format!("{} labeler returned mismatched label shape", self.labeler.name());
                warn!("{reason}, using rules");
                (RuleLabeler::label_pages(&doc.pages), "rules", Some(reason))
            }
            Err(e) => {
                warn!("{} labeler failed: {e}, using rules", self.labeler.name());
                (RuleLabeler::label_pages(&doc.pages), "rules", Some(e.to_string()))
            }
        };

        let pages: Vec<Vec<ClassifiedLine>> = doc
            .pages
            .iter()
            .zip(labels)
            .map(|(lines, labels)| {
                lines
                    .iter()
                    .zip(labels)
                    .map(|(features, label)| ClassifiedLine {
                        features: features.clone(),
                        label,
                    })
                    .collect()
            })
            .collect();

        let classification = Classification {
            pages,
            strategy,
            fallback_reason,
        };
        debug!(
            "Classified {} lines with {} ({} headings)",
            doc.line_count(),
            strategy,
            classification.heading_count()
        );
        classification
    }
}

fn same_shape(labels: &[Vec<HeadingLabel>], pages: &[Vec<LineFeatures>]) -> bool {
    labels.len() == pages.len() && labels.iter().zip(pages).all(|(l, p)| l.len() == p.len())
}


#[cfg(test)]
mod tests {
    use super::test_support::features;
    use super::*;
    use crate::error::FolioError;

    struct FailingLabeler;

    impl LineLabeler for FailingLabeler {
        fn label(&self, _pages: &[Vec<LineFeatures>]) -> Result<Vec<Vec<HeadingLabel>>> {
            Err(FolioError::Classifier("model unavailable".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn doc() -> DocumentFeatures {
        let mut heading = features("Overview", 18.0, 12.0, 1);
        heading.is_bold = true;
        DocumentFeatures {
            language: "english".to_string(),
            pages: vec![vec![
                heading,
                features("Plain body text that runs on for a while.", 12.0, 12.0, 2),
            ]],
        }
    }

    #[test]
    fn test_failing_labeler_falls_back_to_rules() {
        let classifier = StructureClassifier::with_labeler(Box::new(FailingLabeler));
        let result = classifier.classify(&doc());
        assert_eq!(result.strategy, "rules");
        assert!(result.fallback_reason.unwrap().contains("model unavailable"));
        assert_eq!(result.pages[0][0].label, HeadingLabel::H1);
        assert_eq!(result.pages[0][1].label, HeadingLabel::Paragraph);
    }

    #[test]
    fn test_empty_document_falls_back_without_panicking() {
        let classifier = StructureClassifier::default();
        let empty = DocumentFeatures {
            language: "unknown".to_string(),
            pages: vec![vec![], vec![]],
        };
        let result = classifier.classify(&empty);
        assert_eq!(result.pages.len(), 2);
        assert!(result.fallback_reason.is_some());
    }

    #[test]
    fn test_rules_strategy() {
        let classifier = StructureClassifier::new(ClassifierStrategy::Rules, 10);
        assert_eq!(classifier.strategy_name(), "rules");
        let result = classifier.classify(&doc());
        assert!(result.fallback_reason.is_none());
        assert_eq!(result.heading_count(), 1);
    }

    #[test]
    fn test_label_index_round_trip() {
        for label in [HeadingLabel::Paragraph, HeadingLabel::H1, HeadingLabel::H2, HeadingLabel::H3] {
            assert_eq!(HeadingLabel::from_index(label.index()), label);
        }
        assert_eq!(HeadingLabel::H2.level(), Some(2));
        assert_eq!(HeadingLabel::Paragraph.as_str(), "P");
    }
}

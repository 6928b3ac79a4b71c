//! Document parsing pipeline: bytes to post-processed chunks
//!
//! Stages run in order: layout extraction (with the text-stream fallback),
//! line features, structure classification, chunk building and
//! post-processing. Documents with an embedded outline skip classification.
//! Absorbed problems are reported as [`Degradation`]s on the outcome.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::chunker::post::finish_outline_chunks;
use crate::chunker::{
    chunks_from_outline, refine_chunk, sort_chunks, ChunkBuilder, ChunkSettings, SemanticChunk,
};
use crate::classifier::{ClassifierStrategy, StructureClassifier};
use crate::error::{FolioError, Result};
use crate::features::{language, DocumentFeatures, FeatureExtractor, ScriptDetector};
use crate::layout::{
    fallback, DocumentMetadata, ExtractedDocument, ExtractionSource, LayoutExtractor, LayoutSettings,
};

/// Chunks post-processed between cancellation checks
pub const CHUNK_BATCH_SIZE: usize = 50;

/// A stage-local problem that was absorbed rather than surfaced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// Pages that could not be decoded
    PagesSkipped { pages: Vec<usize> },
    /// Positioned extraction failed; pages were rebuilt from a text stream
    TextFallbackUsed,
    /// The configured classifier failed and rules were used
    ClassifierFallback { reason: String },
    /// No sections were found; the document was chunked per page
    PageChunking,
    /// The structured pipeline produced nothing; one chunk per text-stream page
    SimpleFallback,
    /// Only the first `kept` of `total` pages were processed
    PagesTruncated { kept: usize, total: usize },
    /// Outline entries that pointed past the document or covered no text
    OutlineEntriesSkipped { skipped: usize, entries: usize },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::PagesSkipped { pages } => write!(f, "{} unreadable page(s) skipped", pages.len()),
            Degradation::TextFallbackUsed => f.write_str("layout unavailable, plain text extraction used"),
            Degradation::ClassifierFallback { reason } => write!(f, "rule-based headings used ({reason})"),
            Degradation::PageChunking => f.write_str("no headings detected, chunked by page"),
            Degradation::SimpleFallback => f.write_str("structured chunking failed, simple page chunks used"),
            Degradation::PagesTruncated { kept, total } => write!(f, "only {kept} of {total} pages processed"),
            Degradation::OutlineEntriesSkipped { skipped, entries } => {
                write!(f, "{skipped} of {entries} outline entries had no text")
            }
        }
    }
}

/// Result of parsing one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub chunks: Vec<SemanticChunk>,
    pub degradations: Vec<Degradation>,
    pub page_count: usize,
    pub language: String,
    pub metadata: DocumentMetadata,
    pub source: ExtractionSource,
}

impl ParseOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

/// Tunables for every parsing stage
#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub layout: LayoutSettings,
    pub chunks: ChunkSettings,
    pub strategy: ClassifierStrategy,
    pub epochs: usize,
    pub default_language: String,
    pub batch_size: usize,
    /// Upper bound on pages processed per call
    pub max_pages: Option<usize>,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            layout: LayoutSettings::default(),
            chunks: ChunkSettings::default(),
            strategy: ClassifierStrategy::default(),
            epochs: crate::classifier::perceptron::DEFAULT_EPOCHS,
            default_language: language::DEFAULT_LANGUAGE.to_string(),
            batch_size: CHUNK_BATCH_SIZE,
            max_pages: None,
        }
    }
}

/// Stateless across documents; one instance can parse many documents
pub struct DocumentParser {
    layout: LayoutExtractor,
    features: FeatureExtractor,
    classifier: StructureClassifier,
    builder: ChunkBuilder,
    min_chunk_chars: usize,
    batch_size: usize,
    max_pages: Option<usize>,
}

impl Default for DocumentParser {
    fn default() -> Self {
        Self::new(ParserSettings::default())
    }
}

impl DocumentParser {
    pub fn new(settings: ParserSettings) -> Self {
        Self {
            layout: LayoutExtractor::new(settings.layout),
            features: FeatureExtractor::new(Some(Box::new(ScriptDetector)), settings.default_language),
            classifier: StructureClassifier::new(settings.strategy, settings.epochs),
            min_chunk_chars: settings.chunks.min_chunk_chars,
            builder: ChunkBuilder::new(settings.chunks),
            batch_size: settings.batch_size.max(1),
            max_pages: settings.max_pages,
        }
    }

    /// Replace the classifier (custom labelers, tests)
    pub fn with_classifier(mut self, classifier: StructureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Parse raw document bytes into chunks
    pub fn parse(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<ParseOutcome> {
        cancel.check()?;
        let doc = self.layout.extract(bytes)?;
        let source = doc.source;

        match self.process(doc, cancel) {
            Err(FolioError::EmptyContent) if source == ExtractionSource::Structured => {
                warn!("Structured pipeline produced no chunks, trying simple fallback");
                self.simple_fallback(bytes, cancel)
            }
            other => other,
        }
    }

    /// Parse pages extracted elsewhere; header removal and reading order are applied first
    pub fn parse_document(&self, doc: ExtractedDocument, cancel: &CancellationToken) -> Result<ParseOutcome> {
        self.process(self.layout.arrange(doc), cancel)
    }

    fn process(&self, mut doc: ExtractedDocument, cancel: &CancellationToken) -> Result<ParseOutcome> {
        cancel.check()?;
        let mut degradations = Vec::new();

        if !doc.skipped_pages.is_empty() {
            warn!("Skipped {} unreadable pages", doc.skipped_pages.len());
            degradations.push(Degradation::PagesSkipped {
                pages: doc.skipped_pages.clone(),
            });
        }
        if doc.source == ExtractionSource::TextFallback {
            degradations.push(Degradation::TextFallbackUsed);
        }
        if let Some(max) = self.max_pages.filter(|&max| doc.pages.len() > max) {
            let total = doc.pages.len();
            warn!("Document has {total} pages, processing the first {max}");
            doc.pages.truncate(max);
            doc.outline.retain(|e| e.page <= max);
            degradations.push(Degradation::PagesTruncated { kept: max, total });
        }
        if !doc.has_text() {
            return Err(FolioError::EmptyContent);
        }

        let language = self.features.detect_language(&doc.pages);

        let mut chunks = Vec::new();
        if !doc.outline.is_empty() {
            chunks = finish_outline_chunks(chunks_from_outline(&doc.outline, &doc.pages));
            if chunks.is_empty() {
                debug!("Outline with {} entries yielded no text, using the full pipeline", doc.outline.len());
            } else {
                info!("Built {} chunks from embedded outline", chunks.len());
                let skipped = doc.outline.len().saturating_sub(chunks.len());
                if skipped > 0 {
                    warn!("{} of {} outline entries produced no chunk", skipped, doc.outline.len());
                    degradations.push(Degradation::OutlineEntriesSkipped {
                        skipped,
                        entries: doc.outline.len(),
                    });
                }
                sort_chunks(&mut chunks);
            }
        }

        if chunks.is_empty() {
            let raw = self.structured_chunks(&doc, &language, cancel, &mut degradations)?;
            chunks = self.refine_in_batches(raw, cancel)?;
        }

        if chunks.is_empty() {
            return Err(FolioError::EmptyContent);
        }

        info!(
            "Parsed {} pages into {} chunks (language: {}, {} degradations)",
            doc.page_count(),
            chunks.len(),
            language,
            degradations.len()
        );
        Ok(ParseOutcome {
            chunks,
            degradations,
            page_count: doc.page_count(),
            language,
            metadata: doc.metadata,
            source: doc.source,
        })
    }

    fn structured_chunks(
        &self,
        doc: &ExtractedDocument,
        language: &str,
        cancel: &CancellationToken,
        degradations: &mut Vec<Degradation>,
    ) -> Result<Vec<SemanticChunk>> {
        let mut pages = Vec::with_capacity(doc.pages.len());
        for page in &doc.pages {
            cancel.check()?;
            pages.push(self.features.page_features(page, language));
        }
        let features = DocumentFeatures {
            language: language.to_string(),
            pages,
        };
        debug!("Extracted features for {} lines", features.line_count());

        let classification = self.classifier.classify(&features);
        if let Some(reason) = &classification.fallback_reason {
            degradations.push(Degradation::ClassifierFallback { reason: reason.clone() });
        }
        cancel.check()?;

        let sections = self.builder.build_sections(&classification);
        if !sections.is_empty() {
            return Ok(sections);
        }
        debug!("No sections found, chunking by page");
        degradations.push(Degradation::PageChunking);
        Ok(self.builder.page_chunks(&doc.pages))
    }

    fn refine_in_batches(&self, raw: Vec<SemanticChunk>, cancel: &CancellationToken) -> Result<Vec<SemanticChunk>> {
        let mut refined = Vec::with_capacity(raw.len());
        let mut raw = raw.into_iter();
        loop {
            cancel.check()?;
            let batch: Vec<SemanticChunk> = raw.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            refined.extend(batch.into_iter().filter_map(|c| refine_chunk(c, self.min_chunk_chars)));
        }
        sort_chunks(&mut refined);
        Ok(refined)
    }

    fn simple_fallback(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<ParseOutcome> {
        let doc = match fallback::extract_document(bytes) {
            Ok(doc) => doc,
            Err(e) => {
                debug!("Simple fallback extraction failed: {e:#}");
                return Err(FolioError::EmptyContent);
            }
        };
        let raw = self.builder.simple_fallback(&doc.pages);
        let chunks = self.refine_in_batches(raw, cancel)?;
        if chunks.is_empty() {
            return Err(FolioError::EmptyContent);
        }
        info!("Simple fallback produced {} chunks", chunks.len());
        Ok(ParseOutcome {
            chunks,
            degradations: vec![Degradation::TextFallbackUsed, Degradation::SimpleFallback],
            page_count: doc.page_count(),
            language: self.features.default_language().to_string(),
            metadata: doc.metadata,
            source: doc.source,
        })
    }
}

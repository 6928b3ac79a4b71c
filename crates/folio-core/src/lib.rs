//! folio-core: layout-aware document parsing and semantic retrieval
//!
//! This crate provides:
//! - Positioned text extraction from PDFs with column reflow and
//!   header/footer removal, plus a plain-text fallback extractor
//! - Per-line layout features and heading classification (rules, or a
//!   perceptron bootstrapped from the rules)
//! - Section-aware chunking with an embedded-outline fast path
//! - Sentence embeddings (MiniLM via candle, or feature hashing) behind a
//!   shared cached service
//! - A persistent vector index with stable positions
//! - Relevance ranking and k-means structure analysis
//! - SQLite storage for chunk text and metadata
//!
//! [`Engine`] wires the pieces together.

pub mod analysis;
pub mod cancel;
pub mod chunker;
pub mod classifier;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod features;
pub mod index;
pub mod layout;
pub mod parser;
pub mod rank;
pub mod store;

// Re-exports
pub use analysis::{Section, StructureAnalysis, StructureAnalyzer};
pub use cancel::CancellationToken;
pub use chunker::{ChunkType, ExtractionMethod, SemanticChunk, SemanticMarker};
pub use classifier::{ClassifierStrategy, HeadingLabel, StructureClassifier};
pub use config::{default_config_path, default_data_dir, load_config, FolioConfig};
pub use embedder::{EmbeddingModel, EmbeddingService, EmbeddingSettings, HashingEncoder, TextEncoder};
pub use engine::{EmbedOutcome, Engine, IngestReport, PartialCoverage, PipelineSettings, Reconciliation};
pub use error::{FolioError, IndexErrorKind, Result};
pub use index::{IndexInfo, IndexMetadata, Position, SearchHit, VectorIndex};
pub use layout::{ExtractedDocument, LayoutExtractor, PageLayout, TextRun};
pub use parser::{Degradation, DocumentParser, ParseOutcome, ParserSettings};
pub use rank::{RankedChunk, Ranker, RankingWeights};
pub use store::{ChunkStore, SqliteChunkStore, StoredChunk};

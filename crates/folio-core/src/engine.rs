//! Composition root
//!
//! The engine owns one parser, the injected embedding service, the shared
//! vector index and the chunk store, and exposes the pipeline operations on
//! top of them. Searches take the index read lock and run concurrently;
//! adds and removals take the write lock.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analysis::{StructureAnalysis, StructureAnalyzer};
use crate::cancel::CancellationToken;
use crate::chunker::SemanticChunk;
use crate::config::{self, FolioConfig};
use crate::embedder::EmbeddingService;
use crate::error::{FolioError, IndexErrorKind, Result};
use crate::index::{preview, IndexInfo, IndexMetadata, Position, VectorIndex};
use crate::parser::{DocumentParser, ParseOutcome};
use crate::rank::{Candidate, RankedChunk, Ranker};
use crate::store::{ChunkStore, SqliteChunkStore, StoredChunk, METADATA_BATCH_SIZE};

/// Chunks embedded per call into the embedding service
pub const EMBEDDING_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub embedding_batch_size: usize,
    pub metadata_batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            embedding_batch_size: EMBEDDING_BATCH_SIZE,
            metadata_batch_size: METADATA_BATCH_SIZE,
        }
    }
}

/// Chunks that were indexed with placeholder vectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialCoverage {
    /// Indices into the submitted chunk list
    pub failed_chunks: Vec<usize>,
    pub total_chunks: usize,
}

impl PartialCoverage {
    pub fn embedded(&self) -> usize {
        self.total_chunks - self.failed_chunks.len()
    }
}

impl fmt::Display for PartialCoverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "embedded {} of {} chunks ({} placeholder vectors)",
            self.embedded(),
            self.total_chunks,
            self.failed_chunks.len()
        )
    }
}

/// Positions assigned to submitted chunks, in submission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedOutcome {
    pub positions: Vec<Position>,
    pub partial: Option<PartialCoverage>,
}

impl EmbedOutcome {
    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }
}

/// What [`Engine::reconcile_store`] had to discard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Stored chunks whose position was unknown to the index
    pub orphaned_rows: usize,
    /// Index entries that had no stored chunk
    pub unbacked_entries: usize,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.orphaned_rows == 0 && self.unbacked_entries == 0
    }
}

/// Parse plus index result for one document
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub parse: ParseOutcome,
    pub embed: EmbedOutcome,
}

pub struct Engine {
    parser: DocumentParser,
    embedder: Arc<EmbeddingService>,
    index: Arc<RwLock<VectorIndex>>,
    ranker: Ranker,
    analyzer: StructureAnalyzer,
    store: Arc<dyn ChunkStore>,
    index_path: Option<PathBuf>,
    settings: PipelineSettings,
}

impl Engine {
    /// Engine with an empty in-memory index sized for `embedder`
    pub fn new(parser: DocumentParser, embedder: Arc<EmbeddingService>, store: Arc<dyn ChunkStore>) -> Self {
        let index = VectorIndex::new(embedder.dimension());
        Self {
            parser,
            embedder,
            index: Arc::new(RwLock::new(index)),
            ranker: Ranker::default(),
            analyzer: StructureAnalyzer::default(),
            store,
            index_path: None,
            settings: PipelineSettings::default(),
        }
    }

    /// Build everything from configuration, persisting under `data_dir`
    pub fn open(config: &FolioConfig, data_dir: &Path) -> Result<Self> {
        let settings = config.embedding_settings();
        let model = config.embedding_model()?;
        let embedder = Arc::new(EmbeddingService::for_model(model, settings));
        let store = SqliteChunkStore::open(&data_dir.join(config::STORE_FILE))?;
        let index_path = config.index_path(data_dir);
        let index = VectorIndex::load_or_new(&index_path, embedder.dimension())?;
        info!(
            "Opened index at {} ({} entries, model {})",
            index_path.display(),
            index.len(),
            model.as_str()
        );

        let engine = Self::new(DocumentParser::new(config.parser_settings()), embedder, Arc::new(store))
            .with_index(index)
            .with_index_path(index_path)
            .with_ranker(Ranker::new(config.ranking_weights()))
            .with_settings(config.pipeline_settings());
        engine.reconcile_store()?;
        Ok(engine)
    }

    /// Bring the index and the chunk store back into agreement
    ///
    /// Store rows without a matching live index entry (same position and
    /// document) are deleted, index entries without a store row are removed,
    /// and the index never hands out a position the store has already used.
    /// Needed when the index snapshot is older than the store, e.g. after a
    /// run that wrote chunks but never saved the index.
    pub fn reconcile_store(&self) -> Result<Reconciliation> {
        let stored = self.store.positions()?;
        let mut index = self.write_index()?;

        let mut orphaned_rows = Vec::new();
        let mut known = HashSet::with_capacity(stored.len());
        for (position, document_id) in &stored {
            match index.get(*position) {
                Ok(entry) if entry.metadata.document_id == *document_id => {
                    known.insert(*position);
                }
                _ => orphaned_rows.push(*position),
            }
        }
        let unbacked: Vec<Position> = index
            .entries()
            .map(|(position, _)| position)
            .filter(|position| !known.contains(position))
            .collect();

        if let Some(max) = stored.iter().map(|(position, _)| *position).max() {
            index.advance_to(max + 1);
        }
        if !orphaned_rows.is_empty() {
            self.store.remove_positions(&orphaned_rows)?;
        }
        index.remove(&unbacked);

        let report = Reconciliation {
            orphaned_rows: orphaned_rows.len(),
            unbacked_entries: unbacked.len(),
        };
        if !report.is_clean() {
            warn!(
                "Index and chunk store disagreed: dropped {} stored chunks missing from the index and {} index entries missing from the store",
                report.orphaned_rows, report.unbacked_entries
            );
        }
        Ok(report)
    }

    pub fn with_index(self, index: VectorIndex) -> Self {
        Self {
            index: Arc::new(RwLock::new(index)),
            ..self
        }
    }

    pub fn with_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_path = Some(path.into());
        self
    }

    pub fn with_ranker(mut self, ranker: Ranker) -> Self {
        self.ranker = ranker;
        self
    }

    pub fn with_analyzer(mut self, analyzer: StructureAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = PipelineSettings {
            embedding_batch_size: settings.embedding_batch_size.max(1),
            metadata_batch_size: settings.metadata_batch_size.max(1),
        };
        self
    }

    pub fn embedder(&self) -> &Arc<EmbeddingService> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Shared handle to the index for callers that search from other threads
    pub fn index(&self) -> Arc<RwLock<VectorIndex>> {
        Arc::clone(&self.index)
    }

    fn read_index(&self) -> Result<RwLockReadGuard<'_, VectorIndex>> {
        self.index
            .read()
            .map_err(|_| IndexErrorKind::Corrupt("index lock poisoned".to_string()).into())
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, VectorIndex>> {
        self.index
            .write()
            .map_err(|_| IndexErrorKind::Corrupt("index lock poisoned".to_string()).into())
    }

    pub fn parse(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<ParseOutcome> {
        self.parser.parse(bytes, cancel)
    }

    /// Parse a document and index its chunks under `document_id`
    pub fn ingest(&self, document_id: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<IngestReport> {
        let parse = self.parse(bytes, cancel)?;
        for degradation in &parse.degradations {
            warn!("{}: {}", document_id, degradation);
        }
        let embed = self.embed_and_index(document_id, &parse.chunks, cancel)?;
        Ok(IngestReport {
            document_id: document_id.to_string(),
            parse,
            embed,
        })
    }

    /// Embed chunks, add them to the index and the chunk store
    ///
    /// Chunks previously indexed under the same document id are replaced.
    /// Chunks whose embedding batch failed are indexed with zero vectors and
    /// reported in [`EmbedOutcome::partial`]; if no chunk could be embedded
    /// nothing is indexed and `Embedding` is returned.
    pub fn embed_and_index(
        &self,
        document_id: &str,
        chunks: &[SemanticChunk],
        cancel: &CancellationToken,
    ) -> Result<EmbedOutcome> {
        if chunks.is_empty() {
            return Ok(EmbedOutcome {
                positions: Vec::new(),
                partial: None,
            });
        }

        let mut vectors = Vec::with_capacity(chunks.len());
        let mut failed = Vec::new();
        for (batch_idx, batch) in chunks.chunks(self.settings.embedding_batch_size).enumerate() {
            cancel.check()?;
            let offset = batch_idx * self.settings.embedding_batch_size;
            let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
            let embedded = self.embedder.embed_batch_cancellable(&texts, cancel)?;
            failed.extend(embedded.failed.iter().map(|i| offset + i));
            vectors.extend(embedded.vectors);
        }

        if failed.len() == chunks.len() {
            return Err(FolioError::Embedding(format!(
                "none of the {} chunks of {} could be embedded",
                chunks.len(),
                document_id
            )));
        }
        cancel.check()?;

        let metadata: Vec<IndexMetadata> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| index_metadata(document_id, i, chunk))
            .collect();

        // The write lock is held until the store agrees, so searches see
        // either the previous version of the document or the new one
        let (positions, stale) = {
            let mut index = self.write_index()?;
            let stale = index.positions_for_document(document_id);
            let positions = index.add(&vectors, metadata)?;
            if let Err(e) = self.write_chunks(document_id, chunks, &positions, &stale) {
                index.remove(&positions);
                return Err(e);
            }
            index.remove(&stale);
            (positions, stale)
        };

        if !stale.is_empty() {
            info!("Replaced {} previously indexed chunks of {}", stale.len(), document_id);
        }
        let partial = if failed.is_empty() {
            None
        } else {
            let coverage = PartialCoverage {
                failed_chunks: failed,
                total_chunks: chunks.len(),
            };
            warn!("{}: {}", document_id, coverage);
            Some(coverage)
        };
        info!("Indexed {} chunks of {}", positions.len(), document_id);

        Ok(EmbedOutcome { positions, partial })
    }

    fn write_chunks(
        &self,
        document_id: &str,
        chunks: &[SemanticChunk],
        positions: &[Position],
        stale: &[Position],
    ) -> Result<()> {
        let rows: Vec<StoredChunk> = chunks
            .iter()
            .zip(positions)
            .enumerate()
            .map(|(chunk_index, (chunk, &position))| StoredChunk {
                position,
                document_id: document_id.to_string(),
                chunk_index,
                chunk: chunk.clone(),
            })
            .collect();
        self.store
            .replace_chunks(stale, &rows, self.settings.metadata_batch_size)?;
        debug!("Stored {} chunks via {}", rows.len(), self.store.name());
        Ok(())
    }

    /// Semantic search with relevance boosting
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        threshold: f32,
        document_filter: Option<&str>,
    ) -> Result<Vec<RankedChunk>> {
        if top_k == 0 || self.read_index()?.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query)?;
        let hits = self.read_index()?.search_where(
            &query_vector,
            self.ranker.candidate_count(top_k),
            self.ranker.candidate_threshold(threshold),
            |_, meta| document_filter.map_or(true, |doc| meta.document_id == doc),
        )?;
        debug!("{} candidates for '{}'", hits.len(), query);

        let candidates = hits
            .into_iter()
            .map(|hit| {
                let text = self.store.chunk_at(hit.position)?.map(|s| s.chunk.text);
                Ok(Candidate::new(hit, text))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(self.ranker.rank(query, candidates, top_k, threshold))
    }

    /// Plain-text search over stored chunks, for when embeddings are unavailable
    pub fn text_search(&self, query: &str, limit: usize, document_filter: Option<&str>) -> Result<Vec<StoredChunk>> {
        self.store.text_search(query, limit, document_filter)
    }

    /// Nearest neighbours of an indexed chunk, excluding the chunk itself
    pub fn find_similar(&self, position: Position, top_k: usize, threshold: f32) -> Result<Vec<RankedChunk>> {
        let hits = {
            let index = self.read_index()?;
            let vector = index.get(position)?.vector.clone();
            index.search_where(&vector, top_k, threshold, |p, _| p != position)?
        };

        hits.into_iter()
            .map(|hit| {
                let text = self.store.chunk_at(hit.position)?.map(|s| s.chunk.text);
                Ok(RankedChunk {
                    position: hit.position,
                    similarity: hit.similarity,
                    relevance: hit.similarity,
                    metadata: hit.metadata,
                    text,
                })
            })
            .collect()
    }

    /// Sections and summary for a list of chunks, embedding them as needed
    pub fn analyze_structure(&self, chunks: &[SemanticChunk]) -> Result<StructureAnalysis> {
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embedded = self.embedder.embed_batch(&texts)?;
        if embedded.is_partial() {
            warn!(
                "Structure analysis uses {} placeholder vectors",
                embedded.failed.len()
            );
        }
        Ok(self.analyzer.analyze(&texts, &embedded.vectors))
    }

    /// Sections and summary of an indexed document, from its stored vectors
    pub fn analyze_document(&self, document_id: &str) -> Result<StructureAnalysis> {
        let stored = self.store.chunks_for_document(document_id)?;
        let index = self.read_index()?;

        let mut texts = Vec::with_capacity(stored.len());
        let mut vectors = Vec::with_capacity(stored.len());
        for s in &stored {
            match index.get(s.position) {
                Ok(entry) => {
                    texts.push(s.chunk.text.as_str());
                    vectors.push(entry.vector.as_slice());
                }
                Err(_) => debug!("Stored chunk at {} is not in the index", s.position),
            }
        }
        Ok(self.analyzer.analyze(&texts, &vectors))
    }

    /// Remove positions from the index and the store; returns how many were live
    pub fn remove_from_index(&self, positions: &[Position]) -> Result<usize> {
        let removed = self.write_index()?.remove(positions);
        self.store.remove_positions(positions)?;
        info!("Removed {} of {} requested positions", removed, positions.len());
        Ok(removed)
    }

    /// Remove every chunk of a document
    pub fn remove_document(&self, document_id: &str) -> Result<usize> {
        let positions = self.read_index()?.positions_for_document(document_id);
        self.remove_from_index(&positions)
    }

    fn require_index_path(&self) -> Result<&Path> {
        self.index_path
            .as_deref()
            .ok_or_else(|| FolioError::Config("no index path configured".to_string()))
    }

    pub fn persist_index(&self) -> Result<()> {
        let path = self.require_index_path()?;
        self.read_index()?.save(path)?;
        debug!("Persisted index to {}", path.display());
        Ok(())
    }

    /// Replace the in-memory index with the persisted one
    pub fn reload_index(&self) -> Result<()> {
        let path = self.require_index_path()?;
        let loaded = VectorIndex::load(path, Some(self.embedder.dimension()))?;
        *self.write_index()? = loaded;
        Ok(())
    }

    pub fn index_info(&self) -> Result<IndexInfo> {
        Ok(self.read_index()?.info())
    }
}

fn index_metadata(document_id: &str, chunk_index: usize, chunk: &SemanticChunk) -> IndexMetadata {
    IndexMetadata {
        chunk_id: format!("{document_id}-{chunk_index}"),
        document_id: document_id.to_string(),
        page_number: chunk.page_number,
        chunk_index,
        chunk_type: chunk.chunk_type,
        heading_level: chunk.heading_level(),
        section_title: chunk.section_title.clone(),
        extraction_method: chunk.extraction_method,
        content_quality_score: chunk.content_quality_score,
        semantic_markers: chunk.semantic_markers.clone(),
        preview: preview(&chunk.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkType, ExtractionMethod};
    use crate::embedder::service::test_support::hashing_service;
    use crate::embedder::{EmbeddingSettings, TextEncoder};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use tempfile::TempDir;

    fn chunk(page: usize, text: &str) -> SemanticChunk {
        let mut c = SemanticChunk::new(
            page,
            text,
            Some(format!("Page {page}")),
            ChunkType::Content,
            ExtractionMethod::PageFallback,
        );
        c.content_quality_score = 0.5;
        c
    }

    fn engine() -> Engine {
        Engine::new(
            DocumentParser::default(),
            Arc::new(hashing_service(256)),
            Arc::new(SqliteChunkStore::in_memory().unwrap()),
        )
    }

    fn corpus() -> Vec<SemanticChunk> {
        vec![
            chunk(0, "Solar panels convert sunlight into electricity using photovoltaic cells"),
            chunk(1, "Medieval poetry often celebrated chivalry and courtly love"),
            chunk(2, "Wind turbines generate electricity from moving air"),
        ]
    }

    /// Maps known texts to fixed vectors; anything containing "poison" fails
    struct FixedEncoder;

    impl TextEncoder for FixedEncoder {
        fn encode_batch(&mut self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
            texts
                .iter()
                .map(|t| {
                    anyhow::ensure!(!t.contains("poison"), "cannot encode");
                    Ok(match *t {
                        "query" => vec![1.0, 0.0],
                        "close" => vec![0.85, (1.0f32 - 0.85 * 0.85).sqrt()],
                        _ => vec![0.0, 1.0],
                    })
                })
                .collect()
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn fixed_engine() -> Engine {
        let service = EmbeddingService::new(
            Box::new(FixedEncoder),
            EmbeddingSettings {
                dimension: 2,
                ..Default::default()
            },
        );
        Engine::new(
            DocumentParser::default(),
            Arc::new(service),
            Arc::new(SqliteChunkStore::in_memory().unwrap()),
        )
    }

    #[test]
    fn test_embed_and_index_aligned() {
        let engine = engine();
        let outcome = engine
            .embed_and_index("doc", &corpus(), &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.positions, vec![0, 1, 2]);
        assert!(!outcome.is_partial());

        let stored = engine.store().chunk_at(1).unwrap().unwrap();
        assert!(stored.chunk.text.starts_with("Medieval"));
        assert_eq!(stored.chunk_index, 1);
        assert_eq!(engine.index_info().unwrap().live_entries, 3);
    }

    #[test]
    fn test_search_ranks_relevant_first() {
        let engine = engine();
        engine
            .embed_and_index("doc", &corpus(), &CancellationToken::new())
            .unwrap();
        let results = engine.search("solar panels sunlight", 3, 0.1, None).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].position, 0);
        assert!(results[0].text.as_deref().unwrap().contains("photovoltaic"));
        assert!(results.windows(2).all(|w| w[0].relevance >= w[1].relevance));
    }

    #[test]
    fn test_search_document_filter() {
        let engine = engine();
        let cancel = CancellationToken::new();
        engine.embed_and_index("energy", &corpus()[..1], &cancel).unwrap();
        engine.embed_and_index("other", &corpus()[2..], &cancel).unwrap();
        let results = engine.search("electricity", 5, 0.1, Some("other")).unwrap();
        assert!(results.iter().all(|r| r.metadata.document_id == "other"));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_threshold_above_best_match_is_empty() {
        let engine = fixed_engine();
        engine
            .embed_and_index("doc", &[chunk(0, "close")], &CancellationToken::new())
            .unwrap();
        let results = engine.search("query", 5, 0.9, None).unwrap();
        assert!(results.is_empty());
        let looser = engine.search("query", 5, 0.8, None).unwrap();
        assert_eq!(looser.len(), 1);
        assert!((looser[0].similarity - 0.85).abs() < 1e-4);
    }

    #[test]
    fn test_partial_embedding_reported() {
        let engine = fixed_engine();
        let mut chunks: Vec<SemanticChunk> = (0..40).map(|i| chunk(i, &format!("text {i}"))).collect();
        chunks[35].text = "poison pill".to_string();
        let outcome = engine
            .embed_and_index("doc", &chunks, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.positions.len(), 40);
        let partial = outcome.partial.unwrap();
        assert_eq!(partial.failed_chunks, (32..40).collect::<Vec<_>>());
        assert_eq!(partial.embedded(), 32);
    }

    #[test]
    fn test_total_embedding_failure_is_error() {
        let engine = fixed_engine();
        let result = engine.embed_and_index("doc", &[chunk(0, "poison")], &CancellationToken::new());
        assert!(matches!(result, Err(FolioError::Embedding(_))));
        assert!(engine.index_info().unwrap().live_entries == 0);
    }

    #[test]
    fn test_cancelled_before_indexing() {
        let engine = engine();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.embed_and_index("doc", &corpus(), &cancel);
        assert!(matches!(result, Err(FolioError::Cancelled)));
        assert!(engine.index_info().unwrap().live_entries == 0);
    }

    #[test]
    fn test_reindex_replaces_document() {
        let engine = engine();
        let cancel = CancellationToken::new();
        engine.embed_and_index("doc", &corpus(), &cancel).unwrap();
        let second = engine.embed_and_index("doc", &corpus()[..2], &cancel).unwrap();
        assert_eq!(second.positions, vec![3, 4]);
        assert_eq!(engine.index_info().unwrap().live_entries, 2);
        assert_eq!(engine.store().chunks_for_document("doc").unwrap().len(), 2);
    }

    #[test]
    fn test_find_similar_excludes_self() {
        let engine = engine();
        engine
            .embed_and_index("doc", &corpus(), &CancellationToken::new())
            .unwrap();
        let similar = engine.find_similar(0, 5, -1.0).unwrap();
        assert!(similar.iter().all(|r| r.position != 0));
        assert_eq!(similar.len(), 2);
        assert!(matches!(
            engine.find_similar(42, 5, 0.0),
            Err(FolioError::Index(IndexErrorKind::UnknownPosition(42)))
        ));
    }

    #[test]
    fn test_remove_hides_position() {
        let engine = engine();
        engine
            .embed_and_index("doc", &corpus(), &CancellationToken::new())
            .unwrap();
        assert_eq!(engine.remove_from_index(&[0]).unwrap(), 1);
        let results = engine.search("solar panels sunlight", 5, 0.0, None).unwrap();
        assert!(results.iter().all(|r| r.position != 0));
        assert!(engine.find_similar(0, 5, 0.0).is_err());
        assert!(engine.store().chunk_at(0).unwrap().is_none());
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let engine = engine().with_index_path(dir.path().join("index.bin"));
        engine
            .embed_and_index("doc", &corpus(), &CancellationToken::new())
            .unwrap();
        let before = engine.search("wind electricity", 3, 0.1, None).unwrap();
        engine.persist_index().unwrap();

        engine.index().write().unwrap().remove(&[0, 1, 2]);
        assert_eq!(engine.index_info().unwrap().live_entries, 0);
        engine.reload_index().unwrap();
        assert_eq!(engine.index_info().unwrap().live_entries, 3);
        let positions: Vec<Position> = engine
            .search("wind electricity", 3, 0.1, None)
            .unwrap()
            .iter()
            .map(|r| r.position)
            .collect();
        assert_eq!(positions, before.iter().map(|r| r.position).collect::<Vec<_>>());
    }

    #[test]
    fn test_persist_without_path_is_config_error() {
        assert!(matches!(engine().persist_index(), Err(FolioError::Config(_))));
    }

    #[test]
    fn test_analyze_document_uses_stored_vectors() {
        let engine = engine();
        let chunks: Vec<SemanticChunk> = (0..12)
            .map(|i| chunk(i, &format!("chunk number {i} about topic {}", i % 3)))
            .collect();
        engine
            .embed_and_index("doc", &chunks, &CancellationToken::new())
            .unwrap();
        let analysis = engine.analyze_document("doc").unwrap();
        assert_eq!(analysis.total_chunks, 12);
        assert_eq!(analysis.embedding_dimension, 256);
        let members: usize = analysis.sections.iter().map(|s| s.members.len()).sum();
        assert_eq!(members, 12);

        let direct = engine.analyze_structure(&chunks).unwrap();
        assert_eq!(direct.sections, analysis.sections);
    }

    #[test]
    fn test_analyze_unknown_document() {
        let analysis = engine().analyze_document("missing").unwrap();
        assert!(analysis.sections.is_empty());
        assert_eq!(analysis.summary, "No content available");
    }

    /// SQLite store whose writes can be switched off
    struct FlakyStore {
        inner: SqliteChunkStore,
        failing: AtomicBool,
    }

    impl ChunkStore for FlakyStore {
        fn put_chunks(&self, chunks: &[StoredChunk]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(FolioError::Store("disk full".to_string()));
            }
            self.inner.put_chunks(chunks)
        }

        fn chunk_at(&self, position: Position) -> Result<Option<StoredChunk>> {
            self.inner.chunk_at(position)
        }

        fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>> {
            self.inner.chunks_for_document(document_id)
        }

        fn remove_positions(&self, positions: &[Position]) -> Result<usize> {
            self.inner.remove_positions(positions)
        }

        fn text_search(&self, query: &str, limit: usize, document_id: Option<&str>) -> Result<Vec<StoredChunk>> {
            self.inner.text_search(query, limit, document_id)
        }

        fn document_ids(&self) -> Result<Vec<String>> {
            self.inner.document_ids()
        }

        fn positions(&self) -> Result<Vec<(Position, String)>> {
            self.inner.positions()
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn test_failed_reindex_keeps_previous_copy() {
        let store = Arc::new(FlakyStore {
            inner: SqliteChunkStore::in_memory().unwrap(),
            failing: AtomicBool::new(false),
        });
        let engine = Engine::new(DocumentParser::default(), Arc::new(hashing_service(256)), Arc::clone(&store) as Arc<dyn ChunkStore>);
        let cancel = CancellationToken::new();
        engine.embed_and_index("doc", &corpus(), &cancel).unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let result = engine.embed_and_index("doc", &corpus()[..2], &cancel);
        assert!(matches!(result, Err(FolioError::Store(_))));

        assert_eq!(engine.index().read().unwrap().positions_for_document("doc"), vec![0, 1, 2]);
        assert_eq!(engine.store().chunks_for_document("doc").unwrap().len(), 3);
        let results = engine.search("solar panels sunlight", 3, 0.1, None).unwrap();
        assert_eq!(results[0].position, 0);
        assert!(results[0].text.is_some());
    }

    fn disk_engine(dir: &Path) -> Engine {
        let index_path = dir.join(config::INDEX_FILE);
        let index = VectorIndex::load_or_new(&index_path, 256).unwrap();
        let store = SqliteChunkStore::open(&dir.join(config::STORE_FILE)).unwrap();
        Engine::new(DocumentParser::default(), Arc::new(hashing_service(256)), Arc::new(store))
            .with_index(index)
            .with_index_path(index_path)
    }

    #[test]
    fn test_unsaved_index_does_not_reuse_stored_positions() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        {
            let engine = disk_engine(dir.path());
            engine.embed_and_index("first", &corpus(), &cancel).unwrap();
            // Index never persisted
        }

        let engine = disk_engine(dir.path());
        let report = engine.reconcile_store().unwrap();
        assert_eq!(
            report,
            Reconciliation {
                orphaned_rows: 3,
                unbacked_entries: 0
            }
        );
        assert!(engine.store().document_ids().unwrap().is_empty());

        let second = engine.embed_and_index("second", &corpus()[..2], &cancel).unwrap();
        assert_eq!(second.positions, vec![3, 4]);
        engine.persist_index().unwrap();
        drop(engine);

        let engine = disk_engine(dir.path());
        assert!(engine.reconcile_store().unwrap().is_clean());
        assert_eq!(engine.store().document_ids().unwrap(), vec!["second"]);
        assert_eq!(engine.analyze_document("second").unwrap().total_chunks, 2);
    }

    #[test]
    fn test_reconcile_drops_mismatched_entries() {
        let engine = engine();
        engine
            .embed_and_index("doc", &corpus(), &CancellationToken::new())
            .unwrap();
        assert!(engine.reconcile_store().unwrap().is_clean());

        // Row 1 lost from the store, row 2 now claims another document
        engine.store().remove_positions(&[1]).unwrap();
        let mut intruder = engine.store().chunk_at(2).unwrap().unwrap();
        intruder.document_id = "intruder".to_string();
        engine.store().put_chunks(&[intruder]).unwrap();

        let report = engine.reconcile_store().unwrap();
        assert_eq!(
            report,
            Reconciliation {
                orphaned_rows: 1,
                unbacked_entries: 2
            }
        );
        assert_eq!(engine.index().read().unwrap().positions_for_document("doc"), vec![0]);
        assert!(engine.store().chunk_at(2).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_searches_see_whole_documents() {
        let engine = engine();
        let cancel = CancellationToken::new();
        let chunks = corpus();
        engine.embed_and_index("stable", &chunks, &cancel).unwrap();
        let query = engine.embedder().embed("electricity from sunlight").unwrap();
        let index = engine.index();
        let done = AtomicBool::new(false);

        thread::scope(|scope| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut searches = 0;
                        loop {
                            let finished = done.load(Ordering::SeqCst);
                            let hits = index.read().unwrap().search(&query, 100, -1.0).unwrap();
                            let count = |doc: &str| hits.iter().filter(|h| h.metadata.document_id == doc).count();
                            assert_eq!(count("stable"), 3);
                            assert!(matches!(count("growing"), 0 | 3));
                            searches += 1;
                            if finished {
                                return searches;
                            }
                        }
                    })
                })
                .collect();

            for _ in 0..20 {
                engine.embed_and_index("stable", &chunks, &cancel).unwrap();
                engine.embed_and_index("growing", &chunks, &cancel).unwrap();
                engine.remove_document("growing").unwrap();
            }
            done.store(true, Ordering::SeqCst);
            for reader in readers {
                assert!(reader.join().unwrap() > 0);
            }
        });
    }
}

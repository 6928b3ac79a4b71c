//! Persistent vector index with stable positions
//!
//! Exact cosine search over all live entries (parallel with rayon). Every
//! added vector gets the next integer position; removal leaves a tombstone so
//! positions are never reused or shifted. The whole index is persisted as one
//! bincode snapshot that records its format version and dimension, and
//! reloading refuses snapshots that do not match.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::chunker::{ChunkType, ExtractionMethod, SemanticMarker};
use crate::embedder::cosine_similarity;
use crate::error::{FolioError, IndexErrorKind, Result};

/// Identifies folio index snapshots
const INDEX_MAGIC: &str = "FOLIO-VECTOR-INDEX";

/// Snapshot format version for compatibility checking
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Characters of chunk text kept as a preview
pub const PREVIEW_CHARS: usize = 100;

/// Stable integer address of an index entry
pub type Position = u64;

/// Chunk metadata stored alongside each vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub chunk_id: String,
    pub document_id: String,
    pub page_number: usize,
    pub chunk_index: usize,
    pub chunk_type: ChunkType,
    pub heading_level: Option<u8>,
    pub section_title: Option<String>,
    pub extraction_method: ExtractionMethod,
    pub content_quality_score: f32,
    pub semantic_markers: Vec<SemanticMarker>,
    pub preview: String,
}

/// First `PREVIEW_CHARS` characters, with an ellipsis when cut
pub fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub vector: Vec<f32>,
    pub metadata: IndexMetadata,
}

/// One search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub position: Position,
    pub similarity: f32,
    pub metadata: IndexMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub dimension: usize,
    pub live_entries: usize,
    pub tombstones: usize,
    pub next_position: Position,
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    magic: String,
    version: u32,
    dimension: usize,
    next_position: Position,
    tombstones: Vec<Position>,
    entries: Vec<(Position, IndexEntry)>,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    /// Slot per position; `None` is a tombstone
    slots: Vec<Option<IndexEntry>>,
    live: usize,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            slots: Vec::new(),
            live: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn info(&self) -> IndexInfo {
        IndexInfo {
            dimension: self.dimension,
            live_entries: self.live,
            tombstones: self.slots.len() - self.live,
            next_position: self.slots.len() as Position,
        }
    }

    /// Append vectors with their metadata; all-or-nothing
    pub fn add<V: AsRef<[f32]>>(&mut self, vectors: &[V], metadata: Vec<IndexMetadata>) -> Result<Vec<Position>> {
        if vectors.len() != metadata.len() {
            return Err(IndexErrorKind::LengthMismatch {
                vectors: vectors.len(),
                metadata: metadata.len(),
            }
            .into());
        }
        if let Some(bad) = vectors.iter().find(|v| v.as_ref().len() != self.dimension) {
            return Err(IndexErrorKind::DimensionMismatch {
                expected: self.dimension,
                found: bad.as_ref().len(),
            }
            .into());
        }

        let start = self.slots.len() as Position;
        self.slots.reserve(vectors.len());
        for (vector, metadata) in vectors.iter().zip(metadata) {
            self.slots.push(Some(IndexEntry {
                vector: vector.as_ref().to_vec(),
                metadata,
            }));
        }
        self.live += vectors.len();
        Ok((start..start + vectors.len() as Position).collect())
    }

    /// Up to `top_k` live entries with similarity ≥ `threshold`, best first
    pub fn search(&self, query: &[f32], top_k: usize, threshold: f32) -> Result<Vec<SearchHit>> {
        self.search_where(query, top_k, threshold, |_, _| true)
    }

    /// [`search`](Self::search) restricted to entries accepted by `filter`
    pub fn search_where<F>(&self, query: &[f32], top_k: usize, threshold: f32, filter: F) -> Result<Vec<SearchHit>>
    where
        F: Fn(Position, &IndexMetadata) -> bool + Sync,
    {
        if query.len() != self.dimension {
            return Err(IndexErrorKind::DimensionMismatch {
                expected: self.dimension,
                found: query.len(),
            }
            .into());
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(Position, f32)> = self
            .slots
            .par_iter()
            .enumerate()
            .filter_map(|(pos, slot)| {
                let entry = slot.as_ref()?;
                let pos = pos as Position;
                if !filter(pos, &entry.metadata) {
                    return None;
                }
                let similarity = cosine_similarity(query, &entry.vector);
                (similarity >= threshold).then_some((pos, similarity))
            })
            .collect();

        // Similarity descending, earliest position first on ties
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .filter_map(|(position, similarity)| {
                self.slot(position).map(|entry| SearchHit {
                    position,
                    similarity,
                    metadata: entry.metadata.clone(),
                })
            })
            .collect())
    }

    /// Tombstone positions; returns how many were live
    pub fn remove(&mut self, positions: &[Position]) -> usize {
        let mut removed = 0;
        for &pos in positions {
            if let Some(slot) = usize::try_from(pos).ok().and_then(|i| self.slots.get_mut(i)) {
                if slot.take().is_some() {
                    removed += 1;
                }
            }
        }
        self.live -= removed;
        removed
    }

    /// Tombstone every position below `next_position` that was never assigned
    ///
    /// The next `add` then starts at `next_position` or later.
    pub fn advance_to(&mut self, next_position: Position) {
        let target = usize::try_from(next_position).unwrap_or(usize::MAX);
        if target > self.slots.len() {
            self.slots.resize(target, None);
        }
    }

    pub fn get(&self, position: Position) -> Result<&IndexEntry> {
        self.slot(position)
            .ok_or_else(|| IndexErrorKind::UnknownPosition(position).into())
    }

    fn slot(&self, position: Position) -> Option<&IndexEntry> {
        usize::try_from(position)
            .ok()
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
    }

    /// Live entries in position order
    pub fn entries(&self) -> impl Iterator<Item = (Position, &IndexEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(pos, slot)| slot.as_ref().map(|e| (pos as Position, e)))
    }

    pub fn positions_for_document(&self, document_id: &str) -> Vec<Position> {
        self.entries()
            .filter(|(_, e)| e.metadata.document_id == document_id)
            .map(|(pos, _)| pos)
            .collect()
    }

    /// Write a snapshot atomically (temporary file, then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = IndexSnapshot {
            magic: INDEX_MAGIC.to_string(),
            version: INDEX_FORMAT_VERSION,
            dimension: self.dimension,
            next_position: self.slots.len() as Position,
            tombstones: self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_none())
                .map(|(pos, _)| pos as Position)
                .collect(),
            entries: self.entries().map(|(pos, e)| (pos, e.clone())).collect(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, &snapshot)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;

        tracing::info!(
            "Saved vector index to {:?} ({} entries, {} tombstones, dim {})",
            path,
            snapshot.entries.len(),
            snapshot.tombstones.len(),
            self.dimension
        );
        Ok(())
    }

    /// Load a snapshot, verifying format, version and (when given) dimension
    pub fn load(path: &Path, expected_dimension: Option<usize>) -> Result<Self> {
        // Slice decoding bounds every length prefix by the bytes actually present
        let bytes = std::fs::read(path)?;
        let snapshot: IndexSnapshot = bincode::deserialize(&bytes)?;

        if snapshot.magic != INDEX_MAGIC {
            return Err(IndexErrorKind::Corrupt(format!("{} is not a folio index", path.display())).into());
        }
        if snapshot.version != INDEX_FORMAT_VERSION {
            return Err(IndexErrorKind::VersionMismatch {
                expected: INDEX_FORMAT_VERSION,
                found: snapshot.version,
            }
            .into());
        }
        if let Some(expected) = expected_dimension.filter(|&d| d != snapshot.dimension) {
            return Err(IndexErrorKind::DimensionMismatch {
                expected,
                found: snapshot.dimension,
            }
            .into());
        }

        let index = Self::from_snapshot(snapshot)?;
        tracing::info!(
            "Loaded vector index from {:?} ({} entries, dim {})",
            path,
            index.live,
            index.dimension
        );
        Ok(index)
    }

    /// Load when the file exists, otherwise start empty
    pub fn load_or_new(path: &Path, dimension: usize) -> Result<Self> {
        if path.exists() {
            Self::load(path, Some(dimension))
        } else {
            Ok(Self::new(dimension))
        }
    }

    fn from_snapshot(snapshot: IndexSnapshot) -> Result<Self> {
        let corrupt = |msg: String| -> FolioError { IndexErrorKind::Corrupt(msg).into() };

        let len = usize::try_from(snapshot.next_position)
            .map_err(|_| corrupt(format!("next position {} out of range", snapshot.next_position)))?;
        if snapshot.entries.len() + snapshot.tombstones.len() != len {
            return Err(corrupt(format!(
                "{} entries and {} tombstones do not cover {} positions",
                snapshot.entries.len(),
                snapshot.tombstones.len(),
                len
            )));
        }

        let mut slots: Vec<Option<IndexEntry>> = vec![None; len];
        let live = snapshot.entries.len();
        for (pos, entry) in snapshot.entries {
            if entry.vector.len() != snapshot.dimension {
                return Err(IndexErrorKind::DimensionMismatch {
                    expected: snapshot.dimension,
                    found: entry.vector.len(),
                }
                .into());
            }
            let slot = usize::try_from(pos)
                .ok()
                .and_then(|i| slots.get_mut(i))
                .ok_or_else(|| corrupt(format!("entry position {pos} beyond next position {len}")))?;
            if slot.replace(entry).is_some() {
                return Err(corrupt(format!("duplicate entry at position {pos}")));
            }
        }

        Ok(Self {
            dimension: snapshot.dimension,
            slots,
            live,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::metadata;
    use super::*;
    use tempfile::TempDir;

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin(), 0.0]
    }

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new(3);
        let vectors = vec![unit(0.0), unit(0.3), unit(0.6), unit(1.2), unit(0.3)];
        let meta = (0..vectors.len()).map(|i| metadata("doc", i)).collect();
        index.add(&vectors, meta).unwrap();
        index
    }

    #[test]
    fn test_add_returns_sequential_positions() {
        let mut index = sample_index();
        let more = index.add(&[unit(0.1)], vec![metadata("other", 0)]).unwrap();
        assert_eq!(more, vec![5]);
        assert_eq!(index.len(), 6);
    }

    #[test]
    fn test_add_length_mismatch_is_atomic() {
        let mut index = sample_index();
        let err = index.add(&[unit(0.1), unit(0.2)], vec![metadata("x", 0)]).unwrap_err();
        assert!(matches!(
            err,
            FolioError::Index(IndexErrorKind::LengthMismatch { vectors: 2, metadata: 1 })
        ));
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn test_add_wrong_dimension_is_atomic() {
        let mut index = sample_index();
        let err = index
            .add(&[unit(0.1), vec![1.0, 0.0]], vec![metadata("x", 0), metadata("x", 1)])
            .unwrap_err();
        assert!(matches!(err, FolioError::Index(IndexErrorKind::DimensionMismatch { .. })));
        assert_eq!(index.info().next_position, 5);
    }

    #[test]
    fn test_search_order_threshold_and_ties() {
        let index = sample_index();
        let hits = index.search(&unit(0.3), 10, 0.5).unwrap();
        let positions: Vec<Position> = hits.iter().map(|h| h.position).collect();
        // Exact matches at 1 and 4 tie; earlier position first
        assert_eq!(positions[..2], [1, 4]);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert!(hits.iter().all(|h| h.similarity >= 0.5));
        assert_eq!(positions.len(), 5);
        assert_eq!(positions[4], 3);
    }

    #[test]
    fn test_search_top_k() {
        let index = sample_index();
        assert_eq!(index.search(&unit(0.0), 2, -1.0).unwrap().len(), 2);
        assert!(index.search(&unit(0.0), 0, -1.0).unwrap().is_empty());
    }

    #[test]
    fn test_high_threshold_returns_empty() {
        let mut index = VectorIndex::new(2);
        // cos(angle) = 0.85 against the query
        let angle = 0.85f32.acos();
        index
            .add(&[vec![angle.cos(), angle.sin()]], vec![metadata("doc", 0)])
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 5, 0.9).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_query_dimension_checked() {
        let index = sample_index();
        assert!(index.search(&[1.0, 0.0], 5, 0.0).is_err());
    }

    #[test]
    fn test_remove_hides_positions() {
        let mut index = sample_index();
        assert_eq!(index.remove(&[1, 1, 99]), 1);
        assert!(matches!(
            index.get(1),
            Err(FolioError::Index(IndexErrorKind::UnknownPosition(1)))
        ));
        let hits = index.search(&unit(0.3), 10, -1.0).unwrap();
        assert!(hits.iter().all(|h| h.position != 1));
        // Positions are not reused
        let next = index.add(&[unit(0.3)], vec![metadata("doc", 9)]).unwrap();
        assert_eq!(next, vec![5]);
        assert_eq!(index.info().tombstones, 1);
    }

    #[test]
    fn test_advance_skips_positions() {
        let mut index = sample_index();
        index.advance_to(9);
        index.advance_to(2);
        let positions = index.add(&[unit(0.1)], vec![metadata("late", 0)]).unwrap();
        assert_eq!(positions, vec![9]);
        assert_eq!(index.info().tombstones, 4);
        assert_eq!(index.info().next_position, 10);
        assert!(index.get(7).is_err());
    }

    #[test]
    fn test_search_where_filters_before_top_k() {
        let mut index = sample_index();
        index.add(&[unit(2.0)], vec![metadata("other", 0)]).unwrap();
        let hits = index
            .search_where(&unit(0.0), 1, -1.0, |_, m| m.document_id == "other")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].position, 5);
    }

    #[test]
    fn test_persist_reload_equivalent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("index.bin");
        let mut index = sample_index();
        index.remove(&[2]);
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, Some(3)).unwrap();
        assert_eq!(loaded.info(), index.info());
        for probe in [unit(0.0), unit(0.5), unit(1.0)] {
            assert_eq!(
                loaded.search(&probe, 3, 0.0).unwrap(),
                index.search(&probe, 3, 0.0).unwrap()
            );
        }
        assert!(loaded.get(2).is_err());
        assert_eq!(loaded.get(3).unwrap(), index.get(3).unwrap());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_reload_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");
        sample_index().save(&path).unwrap();
        let err = VectorIndex::load(&path, Some(384)).unwrap_err();
        assert!(matches!(
            err,
            FolioError::Index(IndexErrorKind::DimensionMismatch { expected: 384, found: 3 })
        ));
    }

    #[test]
    fn test_reload_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");
        let snapshot = IndexSnapshot {
            magic: INDEX_MAGIC.to_string(),
            version: INDEX_FORMAT_VERSION + 1,
            dimension: 3,
            next_position: 0,
            tombstones: Vec::new(),
            entries: Vec::new(),
        };
        std::fs::write(&path, bincode::serialize(&snapshot).unwrap()).unwrap();
        assert!(matches!(
            VectorIndex::load(&path, None),
            Err(FolioError::Index(IndexErrorKind::VersionMismatch { .. }))
        ));
    }

    #[test]
    fn test_reload_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");
        std::fs::write(&path, b"not an index at all").unwrap();
        assert!(matches!(
            VectorIndex::load(&path, None),
            Err(FolioError::Index(IndexErrorKind::Corrupt(_)))
        ));
    }

    #[test]
    fn test_load_or_new_missing_file() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::load_or_new(&dir.path().join("absent.bin"), 8).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.dimension(), 8);
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(150);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
    }
}

//! Persisted chunk store
//!
//! The engine writes every indexed chunk here (full text plus metadata) and
//! reads it back for structure analysis, result text and the plain-text
//! fallback search. [`SqliteChunkStore`] is the bundled implementation.
//!
//! Schema:
//! - chunks: position (index address), document_id, chunk_index, page and
//!   structure metadata, full text

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};

use crate::chunker::{ChunkType, ExtractionMethod, SemanticChunk, SemanticMarker};
use crate::error::{FolioError, Result};
use crate::index::Position;

/// Metadata rows written per transaction
pub const METADATA_BATCH_SIZE: usize = 100;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS chunks (
    position INTEGER PRIMARY KEY,
    document_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    page_number INTEGER NOT NULL,
    section_title TEXT,
    chunk_type TEXT NOT NULL,
    extraction_method TEXT NOT NULL,
    quality REAL NOT NULL,
    markers TEXT NOT NULL DEFAULT '[]',
    content TEXT NOT NULL,
    stored_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE(document_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
";

/// A chunk as persisted, addressed by its index position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub position: Position,
    pub document_id: String,
    pub chunk_index: usize,
    pub chunk: SemanticChunk,
}

/// Collaborator that keeps chunk text and metadata alongside the vector index
pub trait ChunkStore: Send + Sync {
    /// Insert or replace chunks; all-or-nothing per call
    fn put_chunks(&self, chunks: &[StoredChunk]) -> Result<()>;

    fn chunk_at(&self, position: Position) -> Result<Option<StoredChunk>>;

    /// Chunks of one document in chunk order
    fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>>;

    /// Delete chunks at the given positions; returns how many existed
    fn remove_positions(&self, positions: &[Position]) -> Result<usize>;

    /// Write `chunks` in batches of `batch_size`, then delete the rows at `stale`
    ///
    /// The default implementation commits each batch separately. Stores that
    /// can should override it to apply the whole replacement at once.
    fn replace_chunks(&self, stale: &[Position], chunks: &[StoredChunk], batch_size: usize) -> Result<()> {
        for batch in chunks.chunks(batch_size.max(1)) {
            self.put_chunks(batch)?;
        }
        if !stale.is_empty() {
            self.remove_positions(stale)?;
        }
        Ok(())
    }

    /// Every stored position with its document id, in position order
    fn positions(&self) -> Result<Vec<(Position, String)>>;

    /// Case-insensitive substring search over chunk text
    fn text_search(&self, query: &str, limit: usize, document_id: Option<&str>) -> Result<Vec<StoredChunk>>;

    fn document_ids(&self) -> Result<Vec<String>>;

    /// Name of this store for logging
    fn name(&self) -> &str;
}

/// SQLite-backed chunk store
pub struct SqliteChunkStore {
    conn: Mutex<Connection>,
}

impl SqliteChunkStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store (tests, one-shot runs)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| FolioError::Store("connection lock poisoned".to_string()))?;
        f(&mut conn)
    }
}

const SELECT_COLUMNS: &str = "SELECT position, document_id, chunk_index, page_number, section_title, \
     chunk_type, extraction_method, quality, markers, content FROM chunks";

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<(StoredChunk, String, String, String)> {
    let chunk = StoredChunk {
        position: row.get::<_, i64>(0)? as Position,
        document_id: row.get(1)?,
        chunk_index: row.get::<_, i64>(2)? as usize,
        chunk: SemanticChunk {
            page_number: row.get::<_, i64>(3)? as usize,
            section_title: row.get(4)?,
            // Filled in by `decode` from the raw columns below
            chunk_type: ChunkType::Content,
            extraction_method: ExtractionMethod::EnhancedPipeline,
            content_quality_score: row.get::<_, f64>(7)? as f32,
            semantic_markers: Vec::new(),
            text: row.get(9)?,
        },
    };
    Ok((chunk, row.get(5)?, row.get(6)?, row.get(8)?))
}

fn decode((mut stored, chunk_type, method, markers): (StoredChunk, String, String, String)) -> Result<StoredChunk> {
    stored.chunk.chunk_type = ChunkType::parse(&chunk_type)
        .ok_or_else(|| FolioError::Store(format!("unknown chunk type: {chunk_type}")))?;
    stored.chunk.extraction_method = ExtractionMethod::parse(&method)
        .ok_or_else(|| FolioError::Store(format!("unknown extraction method: {method}")))?;
    let names: Vec<String> =
        serde_json::from_str(&markers).map_err(|e| FolioError::Store(format!("bad marker list: {e}")))?;
    stored.chunk.semantic_markers = names.iter().filter_map(|n| SemanticMarker::parse(n)).collect();
    Ok(stored)
}

fn collect(rows: impl Iterator<Item = rusqlite::Result<(StoredChunk, String, String, String)>>) -> Result<Vec<StoredChunk>> {
    rows.map(|r| decode(r?)).collect()
}

/// `%`, `_` and `\` are literal in the search text
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn insert_rows(tx: &Transaction<'_>, chunks: &[StoredChunk]) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO chunks
         (position, document_id, chunk_index, page_number, section_title,
          chunk_type, extraction_method, quality, markers, content)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for stored in chunks {
        let chunk = &stored.chunk;
        let markers: Vec<&str> = chunk.semantic_markers.iter().map(|m| m.as_str()).collect();
        let markers =
            serde_json::to_string(&markers).map_err(|e| FolioError::Store(format!("encode markers: {e}")))?;
        stmt.execute(params![
            stored.position as i64,
            stored.document_id,
            stored.chunk_index as i64,
            chunk.page_number as i64,
            chunk.section_title,
            chunk.chunk_type.as_str(),
            chunk.extraction_method.as_str(),
            f64::from(chunk.content_quality_score),
            markers,
            chunk.text,
        ])?;
    }
    Ok(())
}

impl ChunkStore for SqliteChunkStore {
    fn put_chunks(&self, chunks: &[StoredChunk]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            insert_rows(&tx, chunks)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// One transaction: either every row lands and the stale rows are gone, or nothing changes
    fn replace_chunks(&self, stale: &[Position], chunks: &[StoredChunk], batch_size: usize) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for batch in chunks.chunks(batch_size.max(1)) {
                insert_rows(&tx, batch)?;
            }
            for &position in stale {
                tx.execute("DELETE FROM chunks WHERE position = ?", params![position as i64])?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn positions(&self) -> Result<Vec<(Position, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT position, document_id FROM chunks ORDER BY position")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)? as Position, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn chunk_at(&self, position: Position) -> Result<Option<StoredChunk>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE position = ?"),
                    params![position as i64],
                    row_to_chunk,
                )
                .optional()?;
            raw.map(decode).transpose()
        })
    }

    fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE document_id = ? ORDER BY chunk_index"
            ))?;
            let rows = stmt.query_map(params![document_id], row_to_chunk)?;
            collect(rows)
        })
    }

    fn remove_positions(&self, positions: &[Position]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            for &position in positions {
                removed += tx.execute("DELETE FROM chunks WHERE position = ?", params![position as i64])?;
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    fn text_search(&self, query: &str, limit: usize, document_id: Option<&str>) -> Result<Vec<StoredChunk>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = like_pattern(query);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS}
                 WHERE content LIKE ?1 ESCAPE '\\'
                   AND (?2 IS NULL OR document_id = ?2)
                 ORDER BY position
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![pattern, document_id, limit as i64], row_to_chunk)?;
            collect(rows)
        })
    }

    fn document_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT document_id FROM chunks ORDER BY document_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

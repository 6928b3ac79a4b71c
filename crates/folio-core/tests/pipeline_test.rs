//! End-to-end tests over synthetic PDFs built with lopdf

use std::sync::{Arc, Mutex};

use folio_core::config::parse_config;
use folio_core::embedder::TextEncoder;
use folio_core::{
    CancellationToken, ChunkType, ClassifierStrategy, DocumentParser, EmbeddingService, EmbeddingSettings,
    Engine, ExtractionMethod, FolioError, HashingEncoder, LayoutExtractor, ParserSettings, SqliteChunkStore,
};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use tempfile::TempDir;

const PAGE_WIDTH: i64 = 612;
const PAGE_HEIGHT: f32 = 792.0;

/// One line of text, positioned by its top edge in top-left coordinates
struct Line {
    text: String,
    x: f32,
    top: f32,
    size: f32,
}

impl Line {
    fn new(text: impl Into<String>, x: f32, top: f32, size: f32) -> Self {
        Self {
            text: text.into(),
            x,
            top,
            size,
        }
    }
}

#[derive(Default)]
struct PdfBuilder {
    pages: Vec<Vec<Line>>,
    /// (title, zero-based page)
    outline: Vec<(String, usize)>,
    title: Option<String>,
}

impl PdfBuilder {
    fn page(mut self, lines: Vec<Line>) -> Self {
        self.pages.push(lines);
        self
    }

    fn bookmark(mut self, title: &str, page: usize) -> Self {
        self.outline.push((title.to_string(), page));
        self
    }

    fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    fn build(self) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut page_ids: Vec<ObjectId> = Vec::new();
        for lines in &self.pages {
            let mut operations = Vec::new();
            for line in lines {
                // PDF space has a bottom-left origin; glyph tops sit 0.8 em above the baseline
                let baseline = PAGE_HEIGHT - (line.top + line.size * 0.8);
                operations.push(Operation::new("BT", vec![]));
                operations.push(Operation::new("Tf", vec!["F1".into(), line.size.into()]));
                operations.push(Operation::new("Td", vec![line.x.into(), baseline.into()]));
                operations.push(Operation::new("Tj", vec![Object::string_literal(line.text.as_str())]));
                operations.push(Operation::new("ET", vec![]));
            }
            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            page_ids.push(page_id);
        }

        let kids: Vec<Object> = page_ids.iter().map(|id| Object::Reference(*id)).collect();
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_ids.len() as i64,
                "Resources" => resources_id,
                "MediaBox" => vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(PAGE_WIDTH),
                    Object::Integer(PAGE_HEIGHT as i64),
                ],
            }),
        );

        let mut catalog = dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        };
        if !self.outline.is_empty() {
            let outlines_id = doc.new_object_id();
            let item_ids: Vec<ObjectId> = self.outline.iter().map(|_| doc.new_object_id()).collect();
            for (i, (title, page)) in self.outline.iter().enumerate() {
                let mut item = dictionary! {
                    "Title" => Object::string_literal(title.as_str()),
                    "Parent" => outlines_id,
                    "Dest" => vec![Object::Reference(page_ids[*page]), Object::Name(b"Fit".to_vec())],
                };
                if i > 0 {
                    item.set("Prev", item_ids[i - 1]);
                }
                if let Some(next) = item_ids.get(i + 1) {
                    item.set("Next", *next);
                }
                doc.objects.insert(item_ids[i], Object::Dictionary(item));
            }
            doc.objects.insert(
                outlines_id,
                Object::Dictionary(dictionary! {
                    "Type" => "Outlines",
                    "First" => item_ids[0],
                    "Last" => item_ids[item_ids.len() - 1],
                    "Count" => item_ids.len() as i64,
                }),
            );
            catalog.set("Outlines", outlines_id);
        }
        let catalog_id = doc.add_object(catalog);
        doc.trailer.set("Root", catalog_id);

        if let Some(title) = &self.title {
            let info_id = doc.add_object(dictionary! {
                "Title" => Object::string_literal(title.as_str()),
            });
            doc.trailer.set("Info", info_id);
        }

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }
}

/// Heading followed by body lines of eight words each
fn section_page(heading: &str, stem: &str, words: usize) -> Vec<Line> {
    let mut lines = vec![Line::new(heading, 72.0, 72.0, 18.0)];
    let all: Vec<String> = (0..words).map(|i| format!("{stem}{i}")).collect();
    let groups: Vec<&[String]> = all.chunks(8).collect();
    for (i, group) in groups.iter().enumerate() {
        let mut text = group.join(" ");
        if i + 1 == groups.len() {
            text.push('.');
        }
        lines.push(Line::new(text, 72.0, 100.0 + i as f32 * 16.0, 12.0));
    }
    lines
}

fn report_pdf() -> PdfBuilder {
    PdfBuilder::default()
        .page(section_page("Introduction", "alpha", 40))
        .page(Vec::new())
        .page(section_page("Conclusion", "omega", 30))
}

fn rules_parser() -> DocumentParser {
    DocumentParser::new(ParserSettings {
        strategy: ClassifierStrategy::Rules,
        ..Default::default()
    })
}

fn hashing_service(dimension: usize) -> Arc<EmbeddingService> {
    Arc::new(EmbeddingService::new(
        Box::new(HashingEncoder::new(dimension)),
        EmbeddingSettings {
            dimension,
            ..Default::default()
        },
    ))
}

#[test]
fn test_pdf_headings_become_chunks() {
    let bytes = report_pdf().title("Annual Report").build();
    let outcome = rules_parser().parse(&bytes, &CancellationToken::new()).unwrap();

    assert_eq!(outcome.page_count, 3);
    assert_eq!(outcome.metadata.title.as_deref(), Some("Annual Report"));
    assert_eq!(outcome.chunks.len(), 2);

    let intro = &outcome.chunks[0];
    assert_eq!(intro.section_title.as_deref(), Some("Introduction"));
    assert_eq!(intro.page_number, 0);
    assert_eq!(intro.chunk_type, ChunkType::H1);
    assert!(intro.text.contains("alpha0") && intro.text.contains("alpha39"));

    let conclusion = &outcome.chunks[1];
    assert_eq!(conclusion.section_title.as_deref(), Some("Conclusion"));
    assert_eq!(conclusion.page_number, 2);
    assert!(!conclusion.text.contains("alpha"));
}

#[test]
fn test_pdf_outline_fast_path() {
    let bytes = report_pdf()
        .bookmark("Opening remarks", 0)
        .bookmark("Closing remarks", 2)
        .build();
    let outcome = rules_parser().parse(&bytes, &CancellationToken::new()).unwrap();

    assert_eq!(outcome.chunks.len(), 2);
    assert!(outcome
        .chunks
        .iter()
        .all(|c| c.extraction_method == ExtractionMethod::EmbeddedToc));
    assert_eq!(outcome.chunks[0].section_title.as_deref(), Some("Opening remarks"));
    // First entry spans pages 0..=1, second starts on page 2
    assert!(outcome.chunks[0].page_number <= 1);
    assert_eq!(outcome.chunks[1].page_number, 2);
    assert!(outcome.chunks[1].text.contains("omega"));
}

#[test]
fn test_two_column_page_reads_left_column_first() {
    let mut lines = Vec::new();
    for i in 0..6 {
        let top = 150.0 + i as f32 * 20.0;
        lines.push(Line::new(format!("Left column sentence {i} continues"), 50.0, top, 10.0));
        lines.push(Line::new(format!("Right column sentence {i} continues"), 330.0, top, 10.0));
    }
    let bytes = PdfBuilder::default().page(lines).build();
    let doc = LayoutExtractor::default().extract(&bytes).unwrap();

    let texts: Vec<&str> = doc.pages[0].runs.iter().map(|r| r.text.as_str()).collect();
    let last_left = texts.iter().position(|t| t.starts_with("Left column sentence 5")).unwrap();
    let first_right = texts.iter().position(|t| t.starts_with("Right column sentence 0")).unwrap();
    assert!(last_left < first_right, "columns interleaved: {texts:?}");
}

#[test]
fn test_empty_pdf_is_empty_content() {
    let bytes = PdfBuilder::default().page(Vec::new()).page(Vec::new()).build();
    let result = rules_parser().parse(&bytes, &CancellationToken::new());
    assert!(matches!(result, Err(FolioError::EmptyContent)));
}

#[test]
fn test_ingest_search_persist_reload() {
    let dir = TempDir::new().unwrap();
    let index_path = dir.path().join("index.bin");
    let store_path = dir.path().join("chunks.db");
    let cancel = CancellationToken::new();

    let engine = Engine::new(
        rules_parser(),
        hashing_service(1024),
        Arc::new(SqliteChunkStore::open(&store_path).unwrap()),
    )
    .with_index_path(&index_path);

    let report = engine.ingest("report", &report_pdf().build(), &cancel).unwrap();
    assert_eq!(report.embed.positions, vec![0, 1]);
    assert!(!report.embed.is_partial());

    let query = "alpha1 alpha2 alpha3";
    let before = engine.search(query, 2, 0.1, None).unwrap();
    assert_eq!(before[0].position, 0);
    assert_eq!(before[0].metadata.section_title.as_deref(), Some("Introduction"));
    engine.persist_index().unwrap();

    // A fresh engine over the same files sees the same index
    let reopened = Engine::new(
        rules_parser(),
        hashing_service(1024),
        Arc::new(SqliteChunkStore::open(&store_path).unwrap()),
    )
    .with_index_path(&index_path);
    reopened.reload_index().unwrap();
    let after = reopened.search(query, 2, 0.1, None).unwrap();
    assert_eq!(
        before.iter().map(|r| (r.position, r.similarity)).collect::<Vec<_>>(),
        after.iter().map(|r| (r.position, r.similarity)).collect::<Vec<_>>()
    );
    assert!(after[0].text.as_deref().unwrap().contains("alpha39"));

    reopened.remove_from_index(&[0]).unwrap();
    assert!(reopened
        .search(query, 5, 0.0, None)
        .unwrap()
        .iter()
        .all(|r| r.position != 0));
    assert_eq!(reopened.index_info().unwrap().tombstones, 1);
}

#[test]
fn test_reload_with_other_dimension_fails() {
    let dir = TempDir::new().unwrap();
    let index_path = dir.path().join("index.bin");
    let cancel = CancellationToken::new();

    let engine = Engine::new(
        rules_parser(),
        hashing_service(64),
        Arc::new(SqliteChunkStore::in_memory().unwrap()),
    )
    .with_index_path(&index_path);
    engine.ingest("report", &report_pdf().build(), &cancel).unwrap();
    engine.persist_index().unwrap();

    let other = Engine::new(
        rules_parser(),
        hashing_service(128),
        Arc::new(SqliteChunkStore::in_memory().unwrap()),
    )
    .with_index_path(&index_path);
    assert!(matches!(
        other.reload_index(),
        Err(FolioError::Index(folio_core::IndexErrorKind::DimensionMismatch {
            expected: 128,
            found: 64
        }))
    ));
}

#[test]
fn test_engine_from_config() {
    let dir = TempDir::new().unwrap();
    let config = parse_config(
        r#"
        [classifier]
        strategy = "rules"

        [embedding]
        model = "hashing"
        dimension = 64
        "#,
    )
    .unwrap();
    if std::env::var(folio_core::embedder::EMBEDDER_MODEL_ENV).is_ok() {
        return;
    }

    let engine = Engine::open(&config, dir.path()).unwrap();
    engine
        .ingest("report", &report_pdf().build(), &CancellationToken::new())
        .unwrap();
    engine.persist_index().unwrap();

    let reopened = Engine::open(&config, dir.path()).unwrap();
    let info = reopened.index_info().unwrap();
    assert_eq!(info.dimension, 64);
    assert_eq!(info.live_entries, 2);
    assert_eq!(reopened.store().document_ids().unwrap(), vec!["report"]);

    let analysis = reopened.analyze_document("report").unwrap();
    assert_eq!(analysis.total_chunks, 2);
    assert_eq!(analysis.sections.iter().map(|s| s.members.len()).sum::<usize>(), 2);
}

/// Hashing encoder that records the size of every call
struct CountingEncoder {
    inner: HashingEncoder,
    calls: Arc<Mutex<Vec<usize>>>,
}

impl TextEncoder for CountingEncoder {
    fn encode_batch(&mut self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.lock().unwrap().push(texts.len());
        self.inner.encode_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

#[test]
fn test_large_batch_is_sub_batched_in_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let service = EmbeddingService::new(
        Box::new(CountingEncoder {
            inner: HashingEncoder::new(32),
            calls: Arc::clone(&calls),
        }),
        EmbeddingSettings {
            dimension: 32,
            ..Default::default()
        },
    );
    let texts: Vec<String> = (0..120).map(|i| format!("chunk number {i}")).collect();
    let embedded = service.embed_batch(&texts).unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![50, 50, 20]);
    assert_eq!(embedded.len(), 120);
    assert!(!embedded.is_partial());
    let reference = HashingEncoder::new(32);
    for (text, vector) in texts.iter().zip(&embedded.vectors) {
        assert_eq!(&**vector, reference.encode(text).as_slice());
    }
}

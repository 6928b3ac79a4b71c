//! folio - parse, index and search paginated documents
//!
//! Usage:
//!   folio parse <file> \[--json\]         Show the chunks of a document
//!   folio ingest <file>...              Parse and index documents
//!   folio search "query"                Semantic search over indexed chunks
//!   folio similar <position>            Chunks similar to an indexed chunk
//!   folio analyze <document-id>         Thematic sections of a document
//!   folio remove <position>...          Remove chunks from the index
//!   folio info                          Show index status

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use folio_core::{
    default_config_path, default_data_dir, load_config, CancellationToken, DocumentParser, Engine, FolioConfig,
    FolioError, IngestReport, Position, RankedChunk, StructureAnalysis,
};

/// Characters of chunk text shown per search result
const SNIPPET_CHARS: usize = 240;

#[derive(Parser)]
#[command(name = "folio", version, about = "Layout-aware document parsing and semantic search")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Directory holding the index and chunk store
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a document and print its chunks
    Parse {
        file: PathBuf,
        /// Output the full parse outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse, embed and index documents
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Document id (single file only; defaults to the file stem)
        #[arg(long)]
        document_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Search indexed chunks
    Search {
        query: String,
        /// Number of results
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
        /// Minimum relevance
        #[arg(long, default_value = "0.3")]
        threshold: f32,
        /// Only search this document
        #[arg(long)]
        document: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Find chunks similar to an indexed chunk
    Similar {
        position: Position,
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
        #[arg(long, default_value = "0.3")]
        threshold: f32,
        #[arg(long)]
        json: bool,
    },
    /// Group a document's chunks into thematic sections
    Analyze {
        document_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Remove chunks from the index
    Remove {
        #[arg(required = true)]
        positions: Vec<Position>,
    },
    /// Show index status
    Info {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();
}

fn load_settings(cli: &Cli) -> Result<(FolioConfig, PathBuf)> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    Ok((config, data_dir))
}

fn spinner(message: &str) -> ProgressBar {
    let sp = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]")
        .map(|s| s.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"))
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    sp.set_style(style);
    sp.set_message(message.to_string());
    sp.enable_steady_tick(Duration::from_millis(80));
    sp
}

/// Open the engine and load the embedding model with spinner feedback
fn open_engine(config: &FolioConfig, data_dir: &Path, load_model: bool) -> Result<Engine> {
    let engine = Engine::open(config, data_dir).context("Failed to open index")?;
    if load_model {
        let sp = spinner("Loading embedding model...");
        let loaded = engine.embedder().warm_up();
        match loaded {
            Ok(()) => sp.finish_with_message(format!(
                "Model loaded ({} dimensions)",
                engine.embedder().dimension()
            )),
            Err(e) => {
                sp.finish_and_clear();
                return Err(e).context("Failed to load embedding model");
            }
        }
    }
    Ok(engine)
}

fn document_id_for(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .with_context(|| format!("Cannot derive a document id from {}", path.display()))
}

/// Document id and raw bytes for one input file
fn read_document(file: &Path, document_id: Option<&str>) -> Result<(String, Vec<u8>)> {
    let id = match document_id {
        Some(id) => id.to_string(),
        None => document_id_for(file)?,
    };
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    Ok((id, bytes))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = flat.chars();
    let head: String = chars.by_ref().take(SNIPPET_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn cmd_parse(file: &Path, json: bool, config: &FolioConfig) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let parser = DocumentParser::new(config.parser_settings());
    let outcome = match parser.parse(&bytes, &CancellationToken::new()) {
        Err(FolioError::EmptyContent) => bail!("{} contains no extractable text", file.display()),
        other => other?,
    };

    if json {
        return print_json(&outcome);
    }

    println!(
        "{} {} pages, {} chunks, language {}",
        file.display().to_string().cyan().bold(),
        outcome.page_count,
        outcome.chunks.len(),
        outcome.language
    );
    for degradation in &outcome.degradations {
        println!("{} {}", "Degraded:".yellow().bold(), degradation);
    }
    for (i, chunk) in outcome.chunks.iter().enumerate() {
        println!(
            "\n{} {} {} (page {}, {}, quality {:.2})",
            format!("[{i}]").dimmed(),
            chunk.chunk_type.to_string().green(),
            chunk.title_or_default().white().bold(),
            chunk.page_number + 1,
            chunk.extraction_method,
            chunk.content_quality_score
        );
        println!("    {}", snippet(&chunk.text));
    }
    Ok(())
}

fn cmd_ingest(
    files: &[PathBuf],
    document_id: Option<String>,
    json: bool,
    config: &FolioConfig,
    data_dir: &Path,
) -> Result<()> {
    if document_id.is_some() && files.len() > 1 {
        bail!("--document-id can only be used with a single file");
    }
    let engine = open_engine(config, data_dir, true)?;
    let cancel = CancellationToken::new();

    let mut reports: Vec<IngestReport> = Vec::with_capacity(files.len());
    let mut failures = 0;
    for file in files {
        let (id, bytes) = match read_document(file, document_id.as_deref()) {
            Ok(loaded) => loaded,
            Err(e) => {
                failures += 1;
                eprintln!("{} {:#}", "Failed:".red().bold(), e);
                continue;
            }
        };

        let sp = spinner(&format!("Indexing {}...", file.display()));
        let result = engine.ingest(&id, &bytes, &cancel);
        sp.finish_and_clear();

        match result {
            Ok(report) => {
                if !json {
                    print_ingest(&report);
                }
                reports.push(report);
            }
            Err(FolioError::EmptyContent) => {
                failures += 1;
                eprintln!("{} {} contains no extractable text", "Skipped:".yellow().bold(), file.display());
            }
            Err(e) => {
                failures += 1;
                eprintln!("{} {}: {}", "Failed:".red().bold(), file.display(), e);
            }
        }
    }

    engine.persist_index().context("Failed to save index")?;
    if json {
        print_json(&reports)?;
    }
    if failures > 0 {
        bail!("{failures} of {} documents could not be indexed", files.len());
    }
    Ok(())
}

fn print_ingest(report: &IngestReport) {
    let status = if report.embed.is_partial() || report.parse.is_degraded() {
        "Indexed (partial)".yellow().bold()
    } else {
        "Indexed".green().bold()
    };
    println!(
        "{} {}: {} chunks from {} pages",
        status,
        report.document_id.cyan(),
        report.embed.positions.len(),
        report.parse.page_count
    );
    for degradation in &report.parse.degradations {
        println!("    {degradation}");
    }
    if let Some(partial) = &report.embed.partial {
        println!("    {partial}");
    }
}

fn print_ranked(results: &[RankedChunk]) {
    if results.is_empty() {
        println!("{}", "No results".dimmed());
        return;
    }
    for (rank, r) in results.iter().enumerate() {
        let meta = &r.metadata;
        println!(
            "{}. {} {} {} page {} [{}] relevance {:.3} (similarity {:.3})",
            rank + 1,
            format!("#{}", r.position).dimmed(),
            meta.document_id.cyan(),
            meta.section_title.as_deref().unwrap_or("Untitled Section").white().bold(),
            meta.page_number + 1,
            meta.chunk_type,
            r.relevance,
            r.similarity
        );
        let text = r.text.as_deref().unwrap_or(&meta.preview);
        println!("    {}", snippet(text));
    }
}

fn cmd_search(
    query: &str,
    limit: usize,
    threshold: f32,
    document: Option<&str>,
    json: bool,
    config: &FolioConfig,
    data_dir: &Path,
) -> Result<()> {
    let engine = open_engine(config, data_dir, false)?;
    let sp = spinner("Searching...");
    let result = engine.search(query, limit, threshold, document);
    sp.finish_and_clear();

    match result {
        Ok(results) => {
            if json {
                return print_json(&results);
            }
            print_ranked(&results);
        }
        Err(FolioError::Embedding(reason)) => {
            eprintln!(
                "{} embedding unavailable ({reason}); falling back to text search",
                "Warning:".yellow().bold()
            );
            let hits = engine.text_search(query, limit, document)?;
            if json {
                return print_json(&hits);
            }
            if hits.is_empty() {
                println!("{}", "No results".dimmed());
            }
            for (rank, hit) in hits.iter().enumerate() {
                println!(
                    "{}. {} {} page {}",
                    rank + 1,
                    format!("#{}", hit.position).dimmed(),
                    hit.document_id.cyan(),
                    hit.chunk.page_number + 1
                );
                println!("    {}", snippet(&hit.chunk.text));
            }
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn cmd_similar(position: Position, limit: usize, threshold: f32, json: bool, engine: &Engine) -> Result<()> {
    let results = engine.find_similar(position, limit, threshold)?;
    if json {
        return print_json(&results);
    }
    print_ranked(&results);
    Ok(())
}

fn cmd_analyze(document_id: &str, json: bool, engine: &Engine) -> Result<()> {
    let analysis: StructureAnalysis = engine.analyze_document(document_id)?;
    if json {
        return print_json(&analysis);
    }
    println!("{}", document_id.cyan().bold());
    println!("{}\n", analysis.summary);
    for (i, section) in analysis.sections.iter().enumerate() {
        println!(
            "{}. {} ({} chunks)",
            i + 1,
            section.title.white().bold(),
            section.members.len()
        );
    }
    Ok(())
}

fn cmd_remove(positions: &[Position], engine: &Engine) -> Result<()> {
    let removed = engine.remove_from_index(positions)?;
    engine.persist_index().context("Failed to save index")?;
    println!("Removed {} of {} positions", removed, positions.len());
    Ok(())
}

fn cmd_info(json: bool, engine: &Engine) -> Result<()> {
    let info = engine.index_info()?;
    let documents = engine.store().document_ids()?;
    if json {
        #[derive(Serialize)]
        struct Info {
            #[serde(flatten)]
            index: folio_core::IndexInfo,
            documents: Vec<String>,
        }
        return print_json(&Info { index: info, documents });
    }
    println!("{}", "Index".cyan().bold());
    println!("  Dimension:  {}", info.dimension);
    println!("  Chunks:     {}", info.live_entries);
    println!("  Removed:    {}", info.tombstones);
    println!("  Documents:  {}", documents.len());
    for doc in &documents {
        println!("    {doc}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let (config, data_dir) = load_settings(&cli)?;

    match &cli.command {
        Commands::Parse { file, json } => cmd_parse(file, *json, &config),
        Commands::Ingest {
            files,
            document_id,
            json,
        } => cmd_ingest(files, document_id.clone(), *json, &config, &data_dir),
        Commands::Search {
            query,
            limit,
            threshold,
            document,
            json,
        } => cmd_search(query, *limit, *threshold, document.as_deref(), *json, &config, &data_dir),
        Commands::Similar {
            position,
            limit,
            threshold,
            json,
        } => cmd_similar(*position, *limit, *threshold, *json, &open_engine(&config, &data_dir, false)?),
        Commands::Analyze { document_id, json } => {
            cmd_analyze(document_id, *json, &open_engine(&config, &data_dir, false)?)
        }
        Commands::Remove { positions } => cmd_remove(positions, &open_engine(&config, &data_dir, false)?),
        Commands::Info { json } => cmd_info(*json, &open_engine(&config, &data_dir, false)?),
    }
}

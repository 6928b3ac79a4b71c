//! Configuration loading
//!
//! Every section and key is optional; anything left out takes the named
//! default of the stage it configures. A missing file is not an error.

use std::env;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::chunker::ChunkSettings;
use crate::classifier::ClassifierStrategy;
use crate::embedder::{EmbeddingModel, EmbeddingSettings};
use crate::engine::PipelineSettings;
use crate::error::{FolioError, Result};
use crate::layout::LayoutSettings;
use crate::parser::ParserSettings;
use crate::rank::RankingWeights;

/// Overrides `[parser] default_language`
pub const DEFAULT_LANGUAGE_ENV: &str = "FOLIO_DEFAULT_LANGUAGE";

/// Index file name inside the data directory
pub const INDEX_FILE: &str = "index.bin";

/// Chunk store file name inside the data directory
pub const STORE_FILE: &str = "chunks.db";

#[derive(Debug, Deserialize, Default, Clone)]
pub struct FolioConfig {
    pub parser: Option<ParserConfig>,
    pub classifier: Option<ClassifierConfig>,
    pub embedding: Option<EmbeddingConfig>,
    pub index: Option<IndexConfig>,
    pub ranking: Option<RankingWeights>,
    pub pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ParserConfig {
    pub min_chunk_length: Option<usize>,
    pub max_chunk_length: Option<usize>,
    pub page_section_lines: Option<usize>,
    pub header_band: Option<f32>,
    pub footer_band: Option<f32>,
    pub recurrence_ratio: Option<f32>,
    pub column_margin: Option<f32>,
    pub column_ratio: Option<f32>,
    pub default_language: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ClassifierConfig {
    pub strategy: Option<ClassifierStrategy>,
    pub epochs: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EmbeddingConfig {
    pub model: Option<String>,
    pub dimension: Option<usize>,
    pub cache_capacity: Option<usize>,
    pub sub_batch_size: Option<usize>,
    pub large_batch_threshold: Option<usize>,
    pub max_words: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct IndexConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct PipelineConfig {
    pub chunk_batch_size: Option<usize>,
    pub embedding_batch_size: Option<usize>,
    pub metadata_batch_size: Option<usize>,
    pub max_pages: Option<usize>,
}

impl FolioConfig {
    pub fn parser_settings(&self) -> ParserSettings {
        let defaults = ParserSettings::default();
        let parser = self.parser.clone().unwrap_or_default();
        let classifier = self.classifier.clone().unwrap_or_default();
        let pipeline = self.pipeline.clone().unwrap_or_default();

        let layout_defaults = LayoutSettings::default();
        let layout = LayoutSettings {
            header_band_ratio: parser.header_band.unwrap_or(layout_defaults.header_band_ratio),
            footer_band_ratio: parser.footer_band.unwrap_or(layout_defaults.footer_band_ratio),
            recurrence_ratio: parser.recurrence_ratio.unwrap_or(layout_defaults.recurrence_ratio),
            column_margin: parser.column_margin.unwrap_or(layout_defaults.column_margin),
            column_min_ratio: parser.column_ratio.unwrap_or(layout_defaults.column_min_ratio),
            ..layout_defaults
        };

        let chunk_defaults = ChunkSettings::default();
        let chunks = ChunkSettings {
            min_chunk_chars: parser.min_chunk_length.unwrap_or(chunk_defaults.min_chunk_chars),
            max_chunk_chars: parser.max_chunk_length.unwrap_or(chunk_defaults.max_chunk_chars),
            page_section_lines: parser.page_section_lines.unwrap_or(chunk_defaults.page_section_lines),
            ..chunk_defaults
        };

        ParserSettings {
            layout,
            chunks,
            strategy: classifier.strategy.unwrap_or(defaults.strategy),
            epochs: classifier.epochs.unwrap_or(defaults.epochs),
            default_language: self.default_language(),
            batch_size: pipeline.chunk_batch_size.unwrap_or(defaults.batch_size),
            max_pages: pipeline.max_pages.or(defaults.max_pages),
        }
    }

    /// `FOLIO_DEFAULT_LANGUAGE`, then the config file, then "unknown"
    pub fn default_language(&self) -> String {
        env::var(DEFAULT_LANGUAGE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.parser.as_ref().and_then(|p| p.default_language.clone()))
            .unwrap_or_else(|| crate::features::language::DEFAULT_LANGUAGE.to_string())
    }

    /// `FOLIO_EMBEDDER_MODEL` wins over the config file
    pub fn embedding_model(&self) -> Result<EmbeddingModel> {
        let configured = match self.embedding.as_ref().and_then(|e| e.model.as_deref()) {
            Some(name) => name
                .parse()
                .map_err(|e: anyhow::Error| FolioError::Config(e.to_string()))?,
            None => EmbeddingModel::default(),
        };
        EmbeddingModel::from_env_or(configured).map_err(|e| FolioError::Config(format!("{e:#}")))
    }

    pub fn embedding_settings(&self) -> EmbeddingSettings {
        let defaults = EmbeddingSettings::default();
        let Some(e) = self.embedding.as_ref() else {
            return defaults;
        };
        EmbeddingSettings {
            dimension: e.dimension.unwrap_or(defaults.dimension),
            cache_capacity: e.cache_capacity.unwrap_or(defaults.cache_capacity),
            sub_batch_size: e.sub_batch_size.unwrap_or(defaults.sub_batch_size),
            large_batch_threshold: e.large_batch_threshold.unwrap_or(defaults.large_batch_threshold),
            max_words: e.max_words.unwrap_or(defaults.max_words),
        }
    }

    pub fn ranking_weights(&self) -> RankingWeights {
        self.ranking.clone().unwrap_or_default()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let defaults = PipelineSettings::default();
        let Some(p) = self.pipeline.as_ref() else {
            return defaults;
        };
        PipelineSettings {
            embedding_batch_size: p.embedding_batch_size.unwrap_or(defaults.embedding_batch_size),
            metadata_batch_size: p.metadata_batch_size.unwrap_or(defaults.metadata_batch_size),
        }
    }

    /// Configured index path, else `<data_dir>/index.bin`
    pub fn index_path(&self, data_dir: &Path) -> PathBuf {
        self.index
            .as_ref()
            .and_then(|i| i.path.clone())
            .unwrap_or_else(|| data_dir.join(INDEX_FILE))
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "folio")
        .ok_or_else(|| FolioError::Config("Could not determine home directory".to_string()))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Where the index and chunk store live by default
pub fn default_data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn load_config(path: &Path) -> Result<FolioConfig> {
    if !path.exists() {
        return Ok(FolioConfig::default());
    }

    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
        .map_err(|e| FolioError::Config(format!("{}: {e}", path.display())))
}

pub fn parse_config(contents: &str) -> std::result::Result<FolioConfig, toml::de::Error> {
    toml::from_str(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let config = FolioConfig::default();
        let parser = config.parser_settings();
        assert_eq!(parser.chunks.max_chunk_chars, crate::chunker::MAX_CHUNK_CHARS);
        assert_eq!(parser.strategy, ClassifierStrategy::Bootstrap);
        assert_eq!(config.embedding_settings().dimension, 384);
        assert_eq!(config.pipeline_settings(), PipelineSettings::default());
        assert_eq!(config.ranking_weights(), RankingWeights::default());
    }

    #[test]
    fn test_parse_sections() {
        let config = parse_config(
            r#"
            [parser]
            min_chunk_length = 20
            recurrence_ratio = 0.5

            [classifier]
            strategy = "rules"
            epochs = 3

            [embedding]
            model = "hashing"
            dimension = 64

            [index]
            path = "/tmp/folio/index.bin"

            [ranking]
            heading = 0.1

            [pipeline]
            embedding_batch_size = 16
            max_pages = 200
            "#,
        )
        .unwrap();

        let parser = config.parser_settings();
        assert_eq!(parser.chunks.min_chunk_chars, 20);
        assert!((parser.layout.recurrence_ratio - 0.5).abs() < 1e-6);
        assert_eq!(parser.strategy, ClassifierStrategy::Rules);
        assert_eq!(parser.epochs, 3);
        assert_eq!(parser.max_pages, Some(200));
        assert_eq!(config.embedding_settings().dimension, 64);
        assert_eq!(config.pipeline_settings().embedding_batch_size, 16);
        assert_eq!(config.pipeline_settings().metadata_batch_size, 100);

        let weights = config.ranking_weights();
        assert!((weights.heading - 0.1).abs() < 1e-6);
        assert!((weights.keyword_overlap - 0.2).abs() < 1e-6);

        assert_eq!(
            config.index_path(Path::new("/data")),
            PathBuf::from("/tmp/folio/index.bin")
        );
    }

    #[test]
    fn test_index_path_default() {
        let config = FolioConfig::default();
        assert_eq!(config.index_path(Path::new("/data")), PathBuf::from("/data/index.bin"));
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        let config = parse_config("[embedding]\nmodel = \"gpt\"\n").unwrap();
        // Only meaningful when the override is unset
        if env::var(crate::embedder::EMBEDDER_MODEL_ENV).is_err() {
            assert!(matches!(config.embedding_model(), Err(FolioError::Config(_))));
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.parser.is_none());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[parser\nbroken").unwrap();
        assert!(matches!(load_config(&path), Err(FolioError::Config(_))));
    }
}

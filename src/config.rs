use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
            initial_capacity: default_initial_capacity(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/vector_index")
}
fn default_initial_capacity() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Texts longer than this are rejected locally, before any network call.
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            dimension: default_dimension(),
            timeout_secs: default_timeout_secs(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dimension() -> usize {
    768
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_text_chars() -> usize {
    // Roughly 8192 tokens at 4 chars/token.
    8192 * 4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_preserve_words")]
    pub preserve_words: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            preserve_words: default_preserve_words(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_preserve_words() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    /// Quiet period per file path before a coalesced event fires.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// A file must stay unmodified for this long before it is reported.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Maximum directory depth below the watch root.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            settle_ms: default_settle_ms(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    1000
}
fn default_settle_ms() -> u64 {
    500
}
fn default_max_depth() -> usize {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::Configuration(format!("failed to parse config file: {}", e)))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        return Err(Error::Configuration(
            "chunking.chunk_size must be > 0".to_string(),
        ));
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        return Err(Error::Configuration(
            "chunking.chunk_overlap must be in [0, chunk_size)".to_string(),
        ));
    }
    if config.embedding.dimension == 0 {
        return Err(Error::Configuration(
            "embedding.dimension must be > 0".to_string(),
        ));
    }
    if config.index.initial_capacity == 0 {
        return Err(Error::Configuration(
            "index.initial_capacity must be > 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("docdex.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "[db]\npath = \"./data/docdex.sqlite\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.embedding.dimension, 768);
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.watcher.debounce_ms, 1000);
        assert_eq!(config.index.initial_capacity, 10_000);
    }

    #[test]
    fn overlap_not_below_chunk_size_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            "[db]\npath = \"x.sqlite\"\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n",
        );
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            "[db]\npath = \"x.sqlite\"\n[chunking]\nchunk_size = 0\n",
        );
        assert!(load_config(&path).is_err());
    }
}

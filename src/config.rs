//! YAML configuration.
//!
//! The file is read from `--config <path>` when given, otherwise from
//! `$APP_PATH/config/config.yaml`. Every key has a default, so an empty file (or
//! no file at all) yields a usable configuration. Secrets can be supplied through
//! `QDRANT_API_KEY`, `OPENAI_API_KEY` and `SENDGRID_API_KEY`, which take precedence
//! over the file.

use crate::error::EtlError;
use crate::scrapers::Source;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreKind {
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Separator the text splitter cuts on before merging pieces into chunks.
    pub separator: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub vector_store: VectorStoreKind,
    pub top_k_results: usize,
    /// Drop documents whose `identificador` is already in the collection.
    pub skip_existing: bool,
    /// Collection name per source key (`boe`, `bocm`, ...).
    pub collections: HashMap<String, String>,
    pub http: HttpConfig,
    pub load: LoadConfig,
    pub qdrant: QdrantConfig,
    pub embeddings: EmbeddingsConfig,
    pub email: EmailConfig,
    pub bopgr: BopgrConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub retries: usize,
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub retries: usize,
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub admin_email: Option<String>,
    pub sendgrid_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BopgrConfig {
    /// Emit the record still open when the bulletin text ends.
    pub flush_on_eof: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            separator: "\n".to_string(),
            chunk_size: 1200,
            chunk_overlap: 100,
            vector_store: VectorStoreKind::Qdrant,
            top_k_results: 10,
            skip_existing: false,
            collections: HashMap::new(),
            http: HttpConfig::default(),
            load: LoadConfig::default(),
            qdrant: QdrantConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            email: EmailConfig::default(),
            bopgr: BopgrConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            timeout_secs: 10,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            delay_secs: 2,
        }
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
        }
    }
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: None,
        }
    }
}

impl Config {
    /// Parse a YAML document. An empty document gives the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, EtlError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| EtlError::Config(e.to_string()))
    }

    /// Fill secrets from environment variables, which win over file values.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("QDRANT_API_KEY") {
            self.qdrant.api_key = Some(key);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.embeddings.api_key = Some(key);
        }
        if let Some(key) = lookup("SENDGRID_API_KEY") {
            self.email.sendgrid_api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), EtlError> {
        if self.chunk_size == 0 {
            return Err(EtlError::Config("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(EtlError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k_results == 0 {
            return Err(EtlError::Config("top_k_results must be positive".into()));
        }
        if let Some(key) = self
            .collections
            .keys()
            .find(|key| !Source::ALL.iter().any(|s| s.key() == key.as_str()))
        {
            return Err(EtlError::Config(format!("collections: unknown source `{key}`")));
        }
        Ok(())
    }

    /// Collection the given source loads into.
    pub fn collection_for(&self, source: Source) -> String {
        self.collections
            .get(source.key())
            .cloned()
            .unwrap_or_else(|| source.default_collection().to_string())
    }
}

/// Where the configuration file is expected when `--config` is not given.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("APP_PATH").map(|root| PathBuf::from(root).join("config").join("config.yaml"))
}

/// Load, complete from the environment, and validate the configuration.
///
/// # Arguments
///
/// * `explicit` - Path passed on the command line, if any
///
/// # Errors
///
/// Returns [`EtlError::Config`] when an explicitly requested file is missing or
/// the YAML is malformed, and [`EtlError::Io`] on read failures.
#[instrument(level = "info")]
pub async fn load_config(explicit: Option<&Path>) -> Result<Config, EtlError> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(EtlError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            Some(path.to_path_buf())
        }
        None => default_config_path().filter(|p| p.exists()),
    };

    let mut config = match &path {
        Some(path) => {
            let yaml = tokio::fs::read_to_string(path).await?;
            let config = Config::from_yaml(&yaml)?;
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        None => {
            warn!("No configuration file found; using defaults");
            Config::default()
        }
    };

    config.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    config.validate()?;
    Ok(config)
}

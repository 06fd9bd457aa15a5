//! Layered configuration for ctxd.
//!
//! Values are resolved from, in increasing priority:
//! 1. the defaults compiled into the binary (`default.toml`)
//! 2. `<project>/.ctxd/config.toml`, when present
//! 3. `CTXD__<SECTION>__<KEY>` environment variables

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// The default configuration, also written by `init`.
pub const DEFAULT_CONFIG_TOML: &str = include_str!("default.toml");

/// Per-project state directory.
pub const STATE_DIR: &str = ".ctxd";

/// Config file name inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Index directory inside [`STATE_DIR`].
pub const INDEX_SUBDIR: &str = "index";

const ENV_PREFIX: &str = "CTXD";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Environment variable not set: {0}")]
    MissingVariable(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Glob patterns excluded in addition to `.gitignore` rules
    pub exclude: Vec<String>,
    /// Reserved; not applied yet
    pub include: Vec<String>,
    pub max_file_size: u64,
    pub max_chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_depth: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            exclude: [
                "node_modules",
                "*.min.js",
                "dist",
                "build",
                ".venv",
                "venv",
                "__pycache__",
                "*.pyc",
                ".git",
                ".ctxd",
                ".ctxcache",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            include: Vec::new(),
            max_file_size: 1_048_576,
            max_chunk_size: 500,
            chunk_overlap: 50,
            max_depth: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// "fastembed", "http" or "hash"
    pub provider: String,
    pub model: String,
    pub batch_size: usize,
    pub dimensions: usize,
    pub endpoint: String,
    /// May reference environment variables as `${NAME}`
    pub api_key: Option<String>,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: "fastembed".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            batch_size: 32,
            dimensions: 384,
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            api_key: None,
            max_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

impl EmbeddingsConfig {
    /// The API key with `${VAR}` references expanded.
    pub fn resolved_api_key(&self) -> Result<Option<String>, ConfigError> {
        let Some(raw) = &self.api_key else {
            return Ok(None);
        };
        let expanded = shellexpand::env(raw).map_err(|e| ConfigError::MissingVariable(e.var_name))?;
        let key = expanded.trim();
        Ok((!key.is_empty()).then(|| key.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub min_score: f32,
    /// Overrides `min_score` in keyword mode
    pub fts_min_score: Option<f32>,
    /// "vector", "fts" or "hybrid"
    pub mode: String,
    pub fts_weight: f32,
    pub deduplicate: bool,
    pub overlap_threshold: f32,
    pub expand_context: bool,
    pub context_lines_before: usize,
    pub context_lines_after: usize,
    pub recency_weight: f32,
    /// 0 disables the query cache
    pub cache_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            min_score: 0.3,
            fts_min_score: Some(0.0),
            mode: "hybrid".to_string(),
            fts_weight: 0.5,
            deduplicate: true,
            overlap_threshold: 0.5,
            expand_context: false,
            context_lines_before: 3,
            context_lines_after: 3,
            recency_weight: 0.1,
            cache_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub enabled: bool,
    pub cleanup_deleted: bool,
    pub nested_gitignore: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_deleted: true,
            nested_gitignore: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub parallel_enabled: bool,
    /// Unset means min(8, available CPUs)
    pub max_workers: Option<usize>,
    pub batch_embedding: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            parallel_enabled: true,
            max_workers: None,
            batch_embedding: true,
        }
    }
}

impl PerformanceConfig {
    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(8)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    /// Extra log file, relative paths resolve against the project root
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub indexer: IndexerConfig,
    pub embeddings: EmbeddingsConfig,
    pub search: SearchConfig,
    pub git: GitConfig,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load the configuration for `project_root` from all layers.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        ConfigLoader::new().load(project_root)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.indexer.max_chunk_size == 0 {
            return Err(ConfigError::Invalid("indexer.max_chunk_size must be positive".into()));
        }
        if self.indexer.chunk_overlap >= self.indexer.max_chunk_size {
            return Err(ConfigError::Invalid(
                "indexer.chunk_overlap must be smaller than indexer.max_chunk_size".into(),
            ));
        }
        if self.embeddings.batch_size == 0 {
            return Err(ConfigError::Invalid("embeddings.batch_size must be positive".into()));
        }
        if !matches!(self.embeddings.provider.as_str(), "fastembed" | "http" | "hash") {
            return Err(ConfigError::Invalid(format!(
                "embeddings.provider must be 'fastembed', 'http' or 'hash', got '{}'",
                self.embeddings.provider
            )));
        }
        if !matches!(self.search.mode.as_str(), "vector" | "fts" | "hybrid") {
            return Err(ConfigError::Invalid(format!(
                "search.mode must be 'vector', 'fts' or 'hybrid', got '{}'",
                self.search.mode
            )));
        }
        for (name, value) in [
            ("search.fts_weight", self.search.fts_weight),
            ("search.overlap_threshold", self.search.overlap_threshold),
            ("search.recency_weight", self.search.recency_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{} must be within 0.0-1.0, got {}", name, value)));
            }
        }
        if self.performance.max_workers == Some(0) {
            return Err(ConfigError::Invalid("performance.max_workers must be positive".into()));
        }
        Ok(())
    }
}

/// `<root>/.ctxd`
pub fn state_dir(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR)
}

/// `<root>/.ctxd/config.toml`
pub fn config_path(project_root: &Path) -> PathBuf {
    state_dir(project_root).join(CONFIG_FILE)
}

/// `<root>/.ctxd/index`
pub fn index_dir(project_root: &Path) -> PathBuf {
    state_dir(project_root).join(INDEX_SUBDIR)
}

/// Builds a [`Config`] from the embedded defaults, an optional file and the
/// environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read variables from `env` instead of the process environment.
    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self { env: Some(env) }
    }

    /// Load for a project. A malformed project config is reported and
    /// ignored; defaults and environment still apply.
    pub fn load(&self, project_root: &Path) -> Result<Config, ConfigError> {
        let path = config_path(project_root);
        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return self.load_file(None);
        }

        match self.load_file(Some(&path)) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Failed to load config from {:?}: {}", path, e);
                warn!("Using default configuration");
                self.load_file(None)
            }
        }
    }

    /// Load the layers, with `path` as the file layer when given.
    pub fn load_file(&self, path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(File::from_str(DEFAULT_CONFIG_TOML, FileFormat::Toml));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        builder = builder.add_source(self.environment());

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn environment(&self) -> Environment {
        let env = Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true);
        match &self.env {
            Some(vars) => env.source(Some(vars.clone())),
            None => env,
        }
    }
}

/// Result of [`init_project`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// Config written to this path
    Created(PathBuf),
    /// The state directory already existed; nothing was written
    AlreadyInitialized(PathBuf),
}

/// Create `<root>/.ctxd/` with the default config file.
pub fn init_project(project_root: &Path) -> Result<InitOutcome, ConfigError> {
    let dir = state_dir(project_root);
    if dir.exists() {
        return Ok(InitOutcome::AlreadyInitialized(dir));
    }

    fs::create_dir_all(&dir).map_err(|source| ConfigError::Io {
        path: dir.clone(),
        source,
    })?;
    let path = config_path(project_root);
    fs::write(&path, DEFAULT_CONFIG_TOML).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(InitOutcome::Created(path))
}

//! Configuration for the audit ledger

use crate::index::IndexStrategy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name (used in logs)
    pub service_name: String,

    /// Record store backend
    pub backend: Backend,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Secondary index configuration
    pub index: IndexConfig,

    /// Query configuration
    pub query: QueryConfig,

    /// Payload limits
    pub payload: PayloadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/audit-ledger"),
            service_name: "audit-ledger".to_string(),
            backend: Backend::default(),
            rocksdb: RocksDBConfig::default(),
            index: IndexConfig::default(),
            query: QueryConfig::default(),
            payload: PayloadConfig::default(),
        }
    }
}

/// Record store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process, non-durable
    Memory,
    /// RocksDB under `data_dir`
    #[default]
    RocksDb,
}

impl std::str::FromStr for Backend {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "rocksdb" => Ok(Backend::RocksDb),
            other => Err(crate::Error::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            target_file_size_mb: 64,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Secondary index configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// How history queries are answered
    pub strategy: IndexStrategy,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Page size when the caller passes 0
    pub default_page_size: usize,

    /// Upper bound on any page
    pub max_page_size: usize,

    /// Records fetched per round trip during full scans
    pub scan_chunk_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 1000,
            scan_chunk_size: 256,
        }
    }
}

/// Payload limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Maximum nesting depth of a payload
    pub max_depth: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self { max_depth: 64 }
    }
}

impl Config {
    /// In-memory configuration, for tests and tooling
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory,
            ..Self::default()
        }
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `AUDIT_LEDGER_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("AUDIT_LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = std::env::var("AUDIT_LEDGER_BACKEND") {
            self.backend = backend.parse()?;
        }

        if let Ok(strategy) = std::env::var("AUDIT_LEDGER_INDEX_STRATEGY") {
            self.index.strategy = strategy.parse()?;
        }

        self.validate()
    }

    /// Reject settings no store could honour
    pub fn validate(&self) -> crate::Result<()> {
        if self.query.max_page_size == 0 {
            return Err(crate::Error::Config("query.max_page_size must be positive".into()));
        }
        if self.query.scan_chunk_size == 0 {
            return Err(crate::Error::Config("query.scan_chunk_size must be positive".into()));
        }
        if self.payload.max_depth == 0 {
            return Err(crate::Error::Config("payload.max_depth must be positive".into()));
        }
        Ok(())
    }
}

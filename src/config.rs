use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::EngineOptions,
    error::{IndexError, Result},
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CACHE_MAX_SIZE: usize = 100_000;
pub const DEFAULT_SCHEMA: &str = "e4s_index";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Server configuration, persisted as TOML.
///
/// Connection settings for a remote fast store are host-provided: a
/// deployment embedding a remote KV client wires it through the `KvStore`
/// trait; the bundled server runs on the in-process store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub cache: CacheConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of partition bitmaps held hot.
    pub max_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// PostgreSQL schema holding the partition table.
    pub schema: String,
    /// Batch size for bulk admin paths.
    pub batch_size: usize,
    /// Whether durable writes happen off the caller's path.
    pub async_write: bool,
    /// Write-behind period in milliseconds; `0` disables write-behind.
    pub flush_interval_ms: u64,
    /// libpq-style connection string, e.g.
    /// `host=localhost user=e4s dbname=e4s`.
    pub connection: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            cache: CacheConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schema: DEFAULT_SCHEMA.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            async_write: true,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            connection: None,
        }
    }
}

impl Config {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_cache_size: self.cache.max_size,
            flush_interval_ms: self.persistence.flush_interval_ms,
            async_write: self.persistence.async_write,
        }
    }

    pub fn connection_string(&self) -> Result<&str> {
        self.persistence
            .connection
            .as_deref()
            .ok_or_else(|| {
                IndexError::Config(
                    "persistence.connection is required when persistence is enabled".into(),
                )
            })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| IndexError::Config(err.to_string()))?;
    path.push(".e4s-index");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok((config, config_path))
    } else {
        let config = Config::default();
        config.save(&config_path)?;
        Ok((config, config_path))
    }
}

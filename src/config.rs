//! Configuration for fold-engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fold-engine")
}

fn default_chunk_count() -> u32 {
    10
}

fn default_lease_duration_ms() -> u64 {
    30_000
}

fn default_db_cache_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for the engine database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Number of parameter chunks published upstream
    #[serde(default = "default_chunk_count")]
    pub chunk_count: u32,

    /// How long a folding lease stays valid without renewal
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Sled cache size in bytes
    #[serde(default = "default_db_cache_bytes")]
    pub db_cache_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            chunk_count: default_chunk_count(),
            lease_duration_ms: default_lease_duration_ms(),
            db_cache_bytes: default_db_cache_bytes(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get engine database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("engine.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunk_count, 10);
        assert_eq!(config.lease_duration_ms, 30_000);
    }

    #[test]
    fn test_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.chunk_count = 4;
        config.lease_duration_ms = 1_000;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.chunk_count, 4);
        assert_eq!(loaded.lease_duration_ms, 1_000);
    }
}

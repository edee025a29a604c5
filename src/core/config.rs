//! Deployment configuration
//!
//! Loaded from TOML; every key is optional.

use crate::core::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Task worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// On-disk unit cache; in-memory when unset
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Decoded records kept in front of the disk cache
    #[serde(default = "default_cache_memory_entries")]
    pub cache_memory_entries: usize,

    /// Remote directory receiving pushed archives and containers
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    /// Extra package-manager flags
    #[serde(default)]
    pub install_options: Vec<String>,

    /// Entries with this suffix are code containers
    #[serde(default = "default_code_entry_suffix")]
    pub code_entry_suffix: String,

    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,

    /// Allow live swap; reinstall only when false
    #[serde(default = "default_live_swap")]
    pub live_swap: bool,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

fn default_cache_memory_entries() -> usize {
    256
}

fn default_staging_dir() -> String {
    "/data/local/tmp/.deltadeploy".to_string()
}

fn default_code_entry_suffix() -> String {
    ".units".to_string()
}

fn default_attach_timeout_ms() -> u64 {
    10_000
}

fn default_live_swap() -> bool {
    true
}

impl Default for DeployConfig {
    fn default() -> Self {
        DeployConfig {
            workers: default_workers(),
            cache_dir: None,
            cache_memory_entries: default_cache_memory_entries(),
            staging_dir: default_staging_dir(),
            install_options: Vec::new(),
            code_entry_suffix: default_code_entry_suffix(),
            attach_timeout_ms: default_attach_timeout_ms(),
            live_swap: default_live_swap(),
        }
    }
}

impl DeployConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: DeployConfig =
            toml::from_str(text).map_err(|e| DeployError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DeployError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DeployError::Config("workers must be at least 1".to_string()));
        }
        if self.code_entry_suffix.is_empty() {
            return Err(DeployError::Config(
                "code_entry_suffix must not be empty".to_string(),
            ));
        }
        if !self.staging_dir.starts_with('/') {
            return Err(DeployError::Config(format!(
                "staging_dir must be absolute: {}",
                self.staging_dir
            )));
        }
        Ok(())
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = DeployConfig::from_toml_str("").unwrap();
        assert_eq!(config, DeployConfig::default());
        assert!(config.workers >= 2);
        assert_eq!(config.cache_memory_entries, 256);
        assert_eq!(config.staging_dir, "/data/local/tmp/.deltadeploy");
        assert_eq!(config.code_entry_suffix, ".units");
        assert_eq!(config.attach_timeout(), Duration::from_secs(10));
        assert!(config.live_swap);
    }

    #[test]
    fn test_overrides() {
        let config = DeployConfig::from_toml_str(
            r#"
            workers = 3
            cache_dir = "/tmp/cache"
            install_options = ["-t", "-g"]
            live_swap = false
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(config.install_options, vec!["-t", "-g"]);
        assert!(!config.live_swap);
    }

    #[test]
    fn test_validation() {
        assert!(DeployConfig::from_toml_str("workers = 0").is_err());
        assert!(DeployConfig::from_toml_str("code_entry_suffix = \"\"").is_err());
        assert!(DeployConfig::from_toml_str("staging_dir = \"tmp\"").is_err());
        assert!(DeployConfig::from_toml_str("workers = \"many\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("deploy.toml");
        std::fs::write(&path, "workers = 5\n").unwrap();
        assert_eq!(DeployConfig::from_file(&path).unwrap().workers, 5);
        assert!(DeployConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}

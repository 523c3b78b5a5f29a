//! Persisted client settings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_URL: &str = "http://127.0.0.1:8000";

/// Environment variable consulted when no config file exists.
pub const URL_ENV: &str = "KVM_ORCH_URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_URL.to_string(),
        }
    }
}

impl ClientConfig {
    /// `~/.kvm_orchestrator/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".kvm_orchestrator").join("config.json"))
    }

    /// Settings for this invocation.
    ///
    /// A readable config file wins; otherwise `KVM_ORCH_URL`, otherwise
    /// the local default.
    pub fn load() -> Self {
        let env_url = std::env::var(URL_ENV).ok();
        match Self::default_path() {
            Some(path) => Self::load_from(&path, env_url),
            None => Self::fallback(env_url),
        }
    }

    pub fn load_from(path: &Path, env_url: Option<String>) -> Self {
        let parsed = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str::<Self>(&content).ok());

        match parsed {
            Some(config) => {
                debug!(path = %path.display(), base_url = %config.base_url, "Loaded client config");
                config
            }
            None => Self::fallback(env_url),
        }
    }

    fn fallback(env_url: Option<String>) -> Self {
        Self {
            base_url: env_url
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
        }
    }

    /// Write the config, creating the parent directory.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_env_then_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = ClientConfig::load_from(&path, Some("http://10.0.0.2:8000".into()));
        assert_eq!(config.base_url, "http://10.0.0.2:8000");

        let config = ClientConfig::load_from(&path, None);
        assert_eq!(config.base_url, DEFAULT_URL);
    }

    #[test]
    fn test_saved_file_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        ClientConfig {
            base_url: "http://host:9000/".into(),
        }
        .save_to(&path)
        .unwrap();

        let config = ClientConfig::load_from(&path, Some("http://other:1".into()));
        assert_eq!(config.base_url, "http://host:9000/");
        assert_eq!(config.base(), "http://host:9000");
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert_eq!(ClientConfig::load_from(&path, None), ClientConfig::default());
    }
}

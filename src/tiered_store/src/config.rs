use crate::DEFAULT_LOCK_WAIT_SECS;
use cache_lib::{CacheError, CacheResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Env var consulted for the shared store mount when the config leaves it
/// unset.
pub const SHARED_ROOT_ENV: &str = "TIERED_STORE_SHARED_ROOT";

const DEFAULT_EXPIRY_SWEEP_MILLIS: u64 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredStoreConfig {
    /// Mount point of the shared store. Falls back to `TIERED_STORE_SHARED_ROOT`.
    pub shared_root: Option<PathBuf>,
    /// Overrides node ip discovery; useful when the node has no site-local
    /// address of its own.
    pub node_ip: Option<String>,
    pub lock_wait_secs: Option<u64>,
    pub expiry_sweep_millis: Option<u64>,
}

impl Default for TieredStoreConfig {
    fn default() -> Self {
        Self {
            shared_root: None,
            node_ip: None,
            lock_wait_secs: None,
            expiry_sweep_millis: None,
        }
    }
}

impl TieredStoreConfig {
    /// Reads the config file, writing out a default one on first use.
    pub fn load_or_init(path: &std::path::Path) -> CacheResult<Self> {
        if !path.exists() {
            let config = Self::default();
            let text = serde_json::to_string_pretty(&config)
                .map_err(|e| CacheError::InvalidParam(format!("encode config failed: {}", e)))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CacheError::Io(format!("create config dir failed: {}", e)))?;
            }
            std::fs::write(path, text)
                .map_err(|e| CacheError::Io(format!("write config failed: {}", e)))?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            warn!("read config {} failed: {}", path.display(), e);
            CacheError::Io(format!("read config failed: {}", e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            warn!("parse config {} failed: {}", path.display(), e);
            CacheError::InvalidParam(format!("parse config failed: {}", e))
        })
    }

    /// Resolves and canonicalizes the shared store root, creating it when
    /// missing. An unset root in both the config and the environment is a
    /// construction error.
    pub fn resolve_shared_root(&self) -> CacheResult<PathBuf> {
        let configured = self
            .shared_root
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| {
                std::env::var(SHARED_ROOT_ENV)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
            });

        let Some(root) = configured else {
            warn!("no shared store root configured");
            return Err(CacheError::InvalidParam(format!(
                "a shared store directory is required; set it in the config or via {}",
                SHARED_ROOT_ENV
            )));
        };

        std::fs::create_dir_all(&root)
            .map_err(|e| CacheError::Io(format!("create shared root failed: {}", e)))?;
        root.canonicalize()
            .map_err(|e| CacheError::Io(format!("canonicalize shared root failed: {}", e)))
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs.unwrap_or(DEFAULT_LOCK_WAIT_SECS))
    }

    pub fn expiry_sweep(&self) -> Duration {
        Duration::from_millis(
            self.expiry_sweep_millis
                .unwrap_or(DEFAULT_EXPIRY_SWEEP_MILLIS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_root_is_an_error() {
        let config = TieredStoreConfig::default();
        // Only meaningful when the env var is not set in the test env.
        if std::env::var(SHARED_ROOT_ENV).is_err() {
            assert!(matches!(
                config.resolve_shared_root(),
                Err(CacheError::InvalidParam(_))
            ));
        }
    }

    #[test]
    fn test_configured_root_is_created_and_canonical() {
        let dir = tempdir().unwrap();
        let config = TieredStoreConfig {
            shared_root: Some(dir.path().join("shared")),
            ..Default::default()
        };
        let root = config.resolve_shared_root().unwrap();
        assert!(root.is_dir());
        assert!(root.is_absolute());
    }

    #[test]
    fn test_defaults() {
        let config = TieredStoreConfig::default();
        assert_eq!(config.lock_wait(), Duration::from_secs(600));
        assert_eq!(config.expiry_sweep(), Duration::from_millis(5000));
    }

    #[test]
    fn test_load_or_init_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiered_store.json");

        // First use writes the default file.
        let config = TieredStoreConfig::load_or_init(&path).unwrap();
        assert!(path.is_file());
        assert!(config.shared_root.is_none());

        let edited = TieredStoreConfig {
            shared_root: Some(dir.path().join("shared")),
            lock_wait_secs: Some(42),
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&edited).unwrap()).unwrap();
        let reloaded = TieredStoreConfig::load_or_init(&path).unwrap();
        assert_eq!(reloaded.lock_wait(), Duration::from_secs(42));
    }
}

//! Configuration for the build engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EsmdError, Result};
use crate::registry::DEFAULT_REGISTRY;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Domain baked into `__filename`/`__dirname` defines
    pub cdn_domain: String,

    /// Upstream registry URL
    pub registry: String,

    /// The external install command used to materialise packages
    pub install_command: String,

    /// Parent directory for per-build scratch directories; the system
    /// temp directory when unset
    pub work_root: Option<PathBuf>,

    /// Root of the filesystem stores; a data directory when unset
    pub storage_root: Option<PathBuf>,

    /// `std/node` version used for deno-target builtin rewrites
    pub deno_std_version: String,

    /// Packages whose exports register as oracle services
    pub node_services: Vec<String>,

    /// Oracle call timeout in seconds
    pub oracle_timeout: u64,

    /// Capacity of the background build queue
    pub queue_capacity: usize,

    /// Builder worker count
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cdn_domain: "esm.sh".to_string(),
            registry: DEFAULT_REGISTRY.to_string(),
            install_command: "yarn".to_string(),
            work_root: None,
            storage_root: None,
            deno_std_version: "0.128.0".to_string(),
            node_services: vec!["esm-node-services".to_string()],
            oracle_timeout: 30,
            queue_capacity: 1000,
            workers: num_cpus::get(),
        }
    }
}

impl Config {
    /// Load configuration, merging `esmd.json` from the user config
    /// directory and then the working directory over the defaults.
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(dir) = dirs::config_dir() {
            let path = dir.join("esmd").join("esmd.json");
            if path.exists() {
                config.merge_from_file(&path)?;
            }
        }

        let local = PathBuf::from("esmd.json");
        if local.exists() {
            config.merge_from_file(&local)?;
        }

        Ok(config)
    }

    /// Apply one config file over the current values, field by field:
    /// keys absent from the file keep whatever an earlier layer set.
    fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let overlay: ConfigOverlay = serde_json::from_str(&content)
            .map_err(|e| EsmdError::Config(format!("{}: {}", path.display(), e)))?;
        self.apply(overlay);
        Ok(())
    }

    fn apply(&mut self, overlay: ConfigOverlay) {
        if let Some(v) = overlay.cdn_domain {
            self.cdn_domain = v;
        }
        if let Some(v) = overlay.registry {
            self.registry = v;
        }
        if let Some(v) = overlay.install_command {
            self.install_command = v;
        }
        if let Some(v) = overlay.work_root {
            self.work_root = Some(v);
        }
        if let Some(v) = overlay.storage_root {
            self.storage_root = Some(v);
        }
        if let Some(v) = overlay.deno_std_version {
            self.deno_std_version = v;
        }
        if let Some(v) = overlay.node_services {
            self.node_services = v;
        }
        if let Some(v) = overlay.oracle_timeout {
            self.oracle_timeout = v;
        }
        if let Some(v) = overlay.queue_capacity {
            self.queue_capacity = v;
        }
        if let Some(v) = overlay.workers {
            self.workers = v;
        }
    }

    /// Scratch parent directory.
    pub fn work_dir(&self) -> PathBuf {
        self.work_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Root for the filesystem-backed stores.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_root.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("esmd")
        })
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout)
    }
}

/// Partial view of a config file: only keys actually present are applied
/// over the current layer.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    cdn_domain: Option<String>,
    registry: Option<String>,
    install_command: Option<String>,
    work_root: Option<PathBuf>,
    storage_root: Option<PathBuf>,
    deno_std_version: Option<String>,
    node_services: Option<Vec<String>>,
    oracle_timeout: Option<u64>,
    queue_capacity: Option<usize>,
    workers: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.registry, DEFAULT_REGISTRY);
        assert_eq!(config.install_command, "yarn");
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.cdn_domain, config.cdn_domain);
        assert_eq!(parsed.queue_capacity, config.queue_capacity);
    }

    #[test]
    fn test_partial_files_layer() {
        let dir = std::env::temp_dir().join(format!("esmd-config-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let global = dir.join("global.json");
        std::fs::write(
            &global,
            r#"{"cdn_domain":"cdn.example.com","queue_capacity":50}"#,
        )
        .unwrap();
        let local = dir.join("local.json");
        std::fs::write(&local, r#"{"queue_capacity":10}"#).unwrap();

        let mut config = Config::default();
        config.merge_from_file(&global).unwrap();
        config.merge_from_file(&local).unwrap();

        // the later file wins only for the keys it actually sets
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.cdn_domain, "cdn.example.com");
        // untouched keys keep their defaults
        assert_eq!(config.registry, DEFAULT_REGISTRY);
        assert_eq!(config.install_command, "yarn");

        let _ = std::fs::remove_dir_all(&dir);
    }
}

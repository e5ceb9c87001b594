use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::ConfigSettings;

/// A source of configuration files.
pub trait ConfigRepository: Send + Sync {
    /// The current set of config paths this repository provides.
    fn list(&self, settings: &ConfigSettings) -> Vec<PathBuf>;

    fn exists(&self, path: &Path) -> bool;

    fn last_modification_time(&self, path: &Path) -> anyhow::Result<SystemTime>;

    /// Load and parse one file.
    fn load(&self, path: &Path) -> anyhow::Result<serde_yaml::Value>;
}

/// Repository scanning one directory for YAML config files.
pub struct FilesystemRepository {
    root: PathBuf,
}

impl FilesystemRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ConfigRepository for FilesystemRepository {
    fn list(&self, _settings: &ConfigSettings) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            tracing::warn!("config directory '{}' is not readable", self.root.display());
            return Vec::new();
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        paths.sort();
        paths
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn last_modification_time(&self, path: &Path) -> anyhow::Result<SystemTime> {
        Ok(std::fs::metadata(path)?.modified()?)
    }

    fn load(&self, path: &Path) -> anyhow::Result<serde_yaml::Value> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

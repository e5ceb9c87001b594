use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use kestrel_events::Event;
use parking_lot::Mutex;

use crate::{ConfigRepository, ConfigSettings, ObjectConfig, ObjectConfigs};

/// Reads configuration files and parses their object declarations.
///
/// Parsed contents are cached together with the file's last modification
/// time, so repeated reads only re-parse files that actually changed. When
/// nothing changed at all, `read` returns the previous snapshot unchanged so
/// downstream consumers can skip work by pointer comparison.
pub struct ConfigFilesReader {
    type_name: String,
    state: Mutex<ReaderState>,
}

struct ReaderState {
    repositories: Vec<(Box<dyn ConfigRepository>, ConfigSettings)>,
    configs: Option<ObjectConfigs>,
    file_infos: BTreeMap<PathBuf, FileInfo>,
}

#[derive(Default)]
struct FileInfo {
    last_modification_time: Option<SystemTime>,
    /// Parsed declarations of the file, in declaration order.
    configs: Vec<(String, ObjectConfig)>,
    /// Sweep mark: cleared before each scan, set when the file is still
    /// listed by some repository.
    in_use: bool,
}

impl ConfigFilesReader {
    /// `type_name` names the kind of objects being configured ("dictionary",
    /// "model", ...), used in log messages only.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            state: Mutex::new(ReaderState {
                repositories: Vec::new(),
                configs: None,
                file_infos: BTreeMap::new(),
            }),
        }
    }

    pub fn add_config_repository(
        &self,
        repository: Box<dyn ConfigRepository>,
        settings: ConfigSettings,
    ) {
        self.state.lock().repositories.push((repository, settings));
    }

    /// Read the configuration files, re-parsing changed ones, and return the
    /// snapshot of all declared objects.
    pub fn read(&self, ignore_modification_times: bool) -> ObjectConfigs {
        let mut state = self.state.lock();

        if !self.read_file_infos(&mut state, ignore_modification_times) {
            if let Some(configs) = &state.configs {
                // Nothing changed; the previous snapshot stays valid.
                return Arc::clone(configs);
            }
        }

        let mut new_configs = BTreeMap::new();
        for (path, file_info) in &state.file_infos {
            for (name, config) in &file_info.configs {
                match new_configs.get(name) {
                    Some(ObjectConfig { config_path, .. }) => {
                        let earlier: &PathBuf = config_path;
                        if earlier == path {
                            tracing::warn!(
                                "{}: {} '{name}' is found twice in the same file",
                                path.display(),
                                self.type_name,
                            );
                        } else {
                            tracing::warn!(
                                "{}: {} '{name}' is found both in file '{}' and '{}'",
                                path.display(),
                                self.type_name,
                                earlier.display(),
                                path.display(),
                            );
                        }
                    }
                    None => {
                        new_configs.insert(name.clone(), config.clone());
                    }
                }
            }
        }

        let new_configs: ObjectConfigs = Arc::new(new_configs);
        state.configs = Some(Arc::clone(&new_configs));
        new_configs
    }

    /// Scan all repositories, refreshing the file info cache. Returns whether
    /// anything changed.
    fn read_file_infos(&self, state: &mut ReaderState, ignore_modification_times: bool) -> bool {
        let mut changed = false;

        for file_info in state.file_infos.values_mut() {
            file_info.in_use = false;
        }

        let ReaderState {
            repositories,
            file_infos,
            ..
        } = state;

        for (repository, settings) in repositories.iter() {
            for path in repository.list(settings) {
                match file_infos.get_mut(&path) {
                    Some(file_info) => {
                        if self.read_file_info(
                            repository.as_ref(),
                            &path,
                            settings,
                            ignore_modification_times,
                            file_info,
                        ) {
                            changed = true;
                        }
                    }
                    None => {
                        let mut file_info = FileInfo::default();
                        if self.read_file_info(
                            repository.as_ref(),
                            &path,
                            settings,
                            true,
                            &mut file_info,
                        ) {
                            file_infos.insert(path, file_info);
                            changed = true;
                        }
                    }
                }
            }
        }

        let deleted: Vec<PathBuf> = file_infos
            .iter()
            .filter(|(_, file_info)| !file_info.in_use)
            .map(|(path, _)| path.clone())
            .collect();
        for path in deleted {
            file_infos.remove(&path);
            changed = true;
        }

        changed
    }

    /// Re-read one file if it changed. Returns whether the cached contents
    /// were replaced; on failure the previous contents are retained.
    fn read_file_info(
        &self,
        repository: &dyn ConfigRepository,
        path: &Path,
        settings: &ConfigSettings,
        ignore_modification_time: bool,
        file_info: &mut FileInfo,
    ) -> bool {
        match self.try_read_file_info(
            repository,
            path,
            settings,
            ignore_modification_time,
            file_info,
        ) {
            Ok(changed) => changed,
            Err(error) => {
                kestrel_events::increment(Event::ConfigFileParseFailures);
                tracing::warn!("failed to read config file '{}': {error:#}", path.display());
                false
            }
        }
    }

    fn try_read_file_info(
        &self,
        repository: &dyn ConfigRepository,
        path: &Path,
        settings: &ConfigSettings,
        ignore_modification_time: bool,
        file_info: &mut FileInfo,
    ) -> anyhow::Result<bool> {
        if !repository.exists(path) {
            tracing::warn!("config file '{}' does not exist", path.display());
            return Ok(false);
        }

        let last_modification_time = repository.last_modification_time(path)?;
        if !ignore_modification_time
            && file_info
                .last_modification_time
                .map_or(false, |cached| last_modification_time <= cached)
        {
            file_info.in_use = true;
            return Ok(false);
        }

        let contents = repository.load(path)?;
        let mapping = contents
            .as_mapping()
            .ok_or_else(|| anyhow::anyhow!("top level of the file is not a mapping"))?;

        let mut configs_from_file = Vec::new();
        for (key, declaration) in mapping {
            let Some(key) = key.as_str() else {
                continue;
            };
            if !key.starts_with(settings.external_config.as_str()) {
                if !key.starts_with("comment") && !key.starts_with("include_from") {
                    tracing::warn!(
                        "{}: file contains unknown node '{key}', expected '{}'",
                        path.display(),
                        settings.external_config,
                    );
                }
                continue;
            }

            let name = declaration
                .get(settings.external_name.as_str())
                .and_then(|value| value.as_str())
                .unwrap_or_default();
            if name.is_empty() {
                tracing::warn!(
                    "{}: node '{key}' defines {} with an empty name. It's not allowed",
                    path.display(),
                    self.type_name,
                );
                continue;
            }

            configs_from_file.push((
                name.to_string(),
                ObjectConfig {
                    config_path: path.to_path_buf(),
                    config: Arc::new(declaration.clone()),
                    key_in_config: key.to_string(),
                },
            ));
        }

        file_info.configs = configs_from_file;
        file_info.last_modification_time = Some(last_modification_time);
        file_info.in_use = true;
        kestrel_events::increment(Event::ConfigFilesParsed);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// In-memory repository with controllable contents and timestamps.
    #[derive(Default)]
    struct FakeRepository {
        files: Mutex<HashMap<PathBuf, (SystemTime, String)>>,
    }

    impl FakeRepository {
        fn put(&self, path: &str, mtime: SystemTime, contents: &str) {
            self.files
                .lock()
                .insert(PathBuf::from(path), (mtime, contents.to_string()));
        }
    }

    impl ConfigRepository for Arc<FakeRepository> {
        fn list(&self, _settings: &ConfigSettings) -> Vec<PathBuf> {
            let mut paths: Vec<_> = self.files.lock().keys().cloned().collect();
            paths.sort();
            paths
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.lock().contains_key(path)
        }

        fn last_modification_time(&self, path: &Path) -> anyhow::Result<SystemTime> {
            self.files
                .lock()
                .get(path)
                .map(|(mtime, _)| *mtime)
                .ok_or_else(|| anyhow::anyhow!("no such file"))
        }

        fn load(&self, path: &Path) -> anyhow::Result<serde_yaml::Value> {
            let files = self.files.lock();
            let (_, contents) = files
                .get(path)
                .ok_or_else(|| anyhow::anyhow!("no such file"))?;
            Ok(serde_yaml::from_str(contents)?)
        }
    }

    fn settings() -> ConfigSettings {
        ConfigSettings {
            external_config: "dictionary".to_string(),
            external_name: "name".to_string(),
            path_setting: "dictionaries_config".to_string(),
        }
    }

    fn reader_with(repository: Arc<FakeRepository>) -> ConfigFilesReader {
        let reader = ConfigFilesReader::new("dictionary");
        reader.add_config_repository(Box::new(repository), settings());
        reader
    }

    #[test]
    fn test_reads_declarations() {
        kestrel_testing::init_test_logging();
        let repository = Arc::new(FakeRepository::default());
        repository.put(
            "a.yaml",
            SystemTime::now(),
            "dictionary_hits:\n  name: hits\n  layout: flat\ncomment: ignored\n",
        );
        let reader = reader_with(repository);

        let configs = reader.read(false);
        assert_eq!(configs.len(), 1);
        let config = configs.get("hits").unwrap();
        assert_eq!(config.key_in_config, "dictionary_hits");
        assert_eq!(config.config_path, PathBuf::from("a.yaml"));
    }

    #[test]
    fn test_unchanged_read_returns_same_snapshot() {
        kestrel_testing::init_test_logging();
        let repository = Arc::new(FakeRepository::default());
        repository.put(
            "a.yaml",
            SystemTime::UNIX_EPOCH,
            "dictionary_a:\n  name: a\n",
        );
        let reader = reader_with(repository);

        let first = reader.read(false);
        let second = reader.read(false);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_changed_file_is_reparsed() {
        kestrel_testing::init_test_logging();
        let repository = Arc::new(FakeRepository::default());
        let start = SystemTime::UNIX_EPOCH;
        repository.put("a.yaml", start, "dictionary_a:\n  name: a\n");
        let reader = reader_with(Arc::clone(&repository));

        let first = reader.read(false);
        repository.put(
            "a.yaml",
            start + std::time::Duration::from_secs(5),
            "dictionary_b:\n  name: b\n",
        );
        let second = reader.read(false);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.contains_key("b"));
        assert!(!second.contains_key("a"));
    }

    #[test]
    fn test_deleted_file_is_purged() {
        kestrel_testing::init_test_logging();
        let repository = Arc::new(FakeRepository::default());
        repository.put("a.yaml", SystemTime::now(), "dictionary_a:\n  name: a\n");
        let reader = reader_with(Arc::clone(&repository));
        assert!(reader.read(false).contains_key("a"));

        repository.files.lock().clear();
        assert!(reader.read(false).is_empty());
    }

    #[test]
    fn test_duplicate_name_prefers_earlier_file() {
        kestrel_testing::init_test_logging();
        let repository = Arc::new(FakeRepository::default());
        let now = SystemTime::now();
        repository.put("a.yaml", now, "dictionary_x:\n  name: x\n  from: a\n");
        repository.put("b.yaml", now, "dictionary_x:\n  name: x\n  from: b\n");
        let reader = reader_with(repository);

        let configs = reader.read(false);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs.get("x").unwrap().config_path, PathBuf::from("a.yaml"));
    }

    #[test]
    fn test_parse_failure_retains_previous_contents() {
        kestrel_testing::init_test_logging();
        let repository = Arc::new(FakeRepository::default());
        let start = SystemTime::UNIX_EPOCH;
        repository.put("a.yaml", start, "dictionary_a:\n  name: a\n");
        let reader = reader_with(Arc::clone(&repository));
        assert!(reader.read(false).contains_key("a"));

        repository.put(
            "a.yaml",
            start + std::time::Duration::from_secs(5),
            ": not : valid : yaml : [",
        );
        let configs = reader.read(false);
        assert!(configs.contains_key("a"));
    }

    #[test]
    fn test_empty_name_is_skipped() {
        kestrel_testing::init_test_logging();
        let repository = Arc::new(FakeRepository::default());
        repository.put(
            "a.yaml",
            SystemTime::now(),
            "dictionary_a:\n  layout: flat\n",
        );
        let reader = reader_with(repository);
        assert!(reader.read(false).is_empty());
    }
}

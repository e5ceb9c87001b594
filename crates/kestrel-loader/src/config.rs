use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings describing how object declarations are found in config files.
#[derive(Clone, Debug)]
pub struct ConfigSettings {
    /// Prefix of top-level keys that declare an object (e.g. `dictionary`).
    pub external_config: String,
    /// Child field holding the object's unique name.
    pub external_name: String,
    /// Repository setting naming the paths to scan.
    pub path_setting: String,
}

/// Configuration of a single declared object.
#[derive(Clone, Debug)]
pub struct ObjectConfig {
    /// The file the declaration came from.
    pub config_path: PathBuf,
    /// The declaration subtree.
    pub config: Arc<serde_yaml::Value>,
    /// The top-level key the declaration lives under.
    pub key_in_config: String,
}

impl ObjectConfig {
    /// Whether two configs declare the same content. The origin path is not
    /// part of the comparison: moving a file does not reconfigure objects.
    pub fn same_as(&self, other: &ObjectConfig) -> bool {
        self.key_in_config == other.key_in_config && self.config == other.config
    }
}

/// Immutable snapshot of every declared object, shared by pointer.
///
/// Downstream consumers compare snapshots with `Arc::ptr_eq` to skip work
/// when nothing changed.
pub type ObjectConfigs = Arc<BTreeMap<String, ObjectConfig>>;

use std::sync::Arc;
use std::time::Duration;

use crate::{
    CalculateNextUpdateTimeFn, ConfigFilesReader, ConfigRepository, ConfigSettings, CreateObjectFn,
    Error, IsObjectModifiedFn, LoadResult, LoadablePtr, LoadingDispatcher, ObjectConfig,
    PeriodicUpdater, Status, UpdateSettings, UpdateTimePolicy,
};

/// Constructs loadable objects from their configuration.
pub trait ObjectFactory: Send + Sync {
    fn create(&self, name: &str, config: &ObjectConfig) -> anyhow::Result<LoadablePtr>;
}

impl<F> ObjectFactory for F
where
    F: Fn(&str, &ObjectConfig) -> anyhow::Result<LoadablePtr> + Send + Sync,
{
    fn create(&self, name: &str, config: &ObjectConfig) -> anyhow::Result<LoadablePtr> {
        self(name, config)
    }
}

/// Manages user-defined objects declared in external configuration: reads the
/// declarations, loads the objects through the supplied factory, and keeps
/// them fresh in the background.
pub struct ExternalLoader {
    // Dropped first: its thread uses the dispatcher and the reader.
    periodic_updater: PeriodicUpdater,
    loading_dispatcher: Arc<LoadingDispatcher>,
    config_files_reader: Arc<ConfigFilesReader>,
}

impl ExternalLoader {
    /// `type_name` names the kind of managed objects ("dictionary", "model",
    /// ...) for log and error messages.
    pub fn new(type_name: impl Into<String>, factory: Arc<dyn ObjectFactory>) -> Self {
        let type_name = type_name.into();
        let config_files_reader = Arc::new(ConfigFilesReader::new(type_name.clone()));
        let policy = Arc::new(UpdateTimePolicy::default());

        let create_object: CreateObjectFn = {
            let factory = Arc::clone(&factory);
            Arc::new(
                move |name: &str,
                      config: &ObjectConfig,
                      config_changed: bool,
                      previous: Option<&LoadablePtr>| {
                    if let Some(previous) = previous {
                        if !config_changed {
                            return previous.clone_object();
                        }
                    }
                    factory.create(name, config)
                },
            )
        };
        let calculate_next_update_time: CalculateNextUpdateTimeFn = {
            let policy = Arc::clone(&policy);
            Arc::new(move |object: Option<&LoadablePtr>, error_count: usize| {
                policy.calculate_next_update_time(object, error_count)
            })
        };
        let is_object_modified: IsObjectModifiedFn =
            Arc::new(|object: &LoadablePtr| object.is_modified());

        let loading_dispatcher = Arc::new(LoadingDispatcher::new(
            create_object,
            calculate_next_update_time,
            is_object_modified,
            type_name,
        ));

        let periodic_updater = PeriodicUpdater::new(
            Arc::clone(&config_files_reader),
            Arc::clone(&loading_dispatcher),
            policy,
        );

        Self {
            periodic_updater,
            loading_dispatcher,
            config_files_reader,
        }
    }

    /// Register a repository of config files and apply its current contents.
    pub fn add_config_repository(
        &self,
        repository: Box<dyn ConfigRepository>,
        settings: ConfigSettings,
    ) {
        self.config_files_reader
            .add_config_repository(repository, settings);
        self.loading_dispatcher
            .set_configuration(self.config_files_reader.read(false));
    }

    pub fn enable_always_load_everything(&self, enable: bool) {
        self.loading_dispatcher.enable_always_load_everything(enable);
    }

    pub fn enable_async_loading(&self, enable: bool) {
        self.loading_dispatcher.enable_async_loading(enable);
    }

    pub fn enable_periodic_updates(&self, enable: bool, settings: UpdateSettings) {
        self.periodic_updater.enable(enable, settings);
    }

    pub fn get_current_status(&self, name: &str) -> Status {
        self.loading_dispatcher.get_current_status(name)
    }

    pub fn get_current_load_result(&self, name: &str) -> LoadResult {
        self.loading_dispatcher.get_current_load_result(name)
    }

    pub fn get_current_load_results(&self) -> Vec<(String, LoadResult)> {
        self.loading_dispatcher.get_current_load_results(|_| true)
    }

    pub fn get_current_load_results_matching(
        &self,
        filter_by_name: impl Fn(&str) -> bool,
    ) -> Vec<(String, LoadResult)> {
        self.loading_dispatcher.get_current_load_results(filter_by_name)
    }

    pub fn get_currently_loaded_objects(&self) -> Vec<LoadablePtr> {
        self.loading_dispatcher.get_currently_loaded_objects(|_| true)
    }

    pub fn get_number_of_currently_loaded_objects(&self) -> usize {
        self.loading_dispatcher.get_number_of_currently_loaded_objects()
    }

    pub fn has_currently_loaded_objects(&self) -> bool {
        self.loading_dispatcher.has_currently_loaded_objects()
    }

    /// Block until `name` is ready or the timeout elapses.
    pub fn load(&self, name: &str, timeout: Option<Duration>) -> LoadResult {
        self.loading_dispatcher.load(name, timeout)
    }

    /// Load with no timeout; unknown names and stored failures are errors.
    pub fn load_strict(&self, name: &str) -> error_stack::Result<LoadablePtr, Error> {
        self.loading_dispatcher.load_strict(name)
    }

    pub fn load_matching(
        &self,
        filter_by_name: impl Fn(&str) -> bool,
        timeout: Option<Duration>,
    ) -> Vec<(String, LoadResult)> {
        self.loading_dispatcher.load_matching(filter_by_name, timeout)
    }

    pub fn load_all(&self, timeout: Option<Duration>) -> Vec<(String, LoadResult)> {
        self.loading_dispatcher.load_all(timeout)
    }

    /// Re-read configs, then force a reload of `name`.
    pub fn reload(&self, name: &str, load_never_loading: bool) {
        self.loading_dispatcher
            .set_configuration(self.config_files_reader.read(false));
        self.loading_dispatcher.reload(name, load_never_loading);
    }

    pub fn reload_matching(
        &self,
        filter_by_name: impl Fn(&str) -> bool,
        load_never_loading: bool,
    ) {
        self.loading_dispatcher
            .set_configuration(self.config_files_reader.read(false));
        self.loading_dispatcher
            .reload_matching(filter_by_name, load_never_loading);
    }

    pub fn reload_all(&self, load_never_loading: bool) {
        self.loading_dispatcher
            .set_configuration(self.config_files_reader.read(false));
        self.loading_dispatcher.reload_all(load_never_loading);
    }

    /// One tick of the periodic update loop, for callers driving it manually.
    pub fn reload_outdated(&self) {
        self.loading_dispatcher.reload_outdated();
    }
}

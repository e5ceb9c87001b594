use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use kestrel_events::Event;
use parking_lot::{Condvar, Mutex, MutexGuard};
use strum::IntoEnumIterator as _;

use crate::{Error, LoadablePtr, ObjectConfig, ObjectConfigs};

/// Status of a declared object.
///
/// The ordinals are stable and exposed by introspection queries.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i8)]
pub enum Status {
    /// The object was never tried to load.
    NotLoaded = 0,
    /// The object is loaded and usable.
    Loaded = 1,
    /// Every load so far failed; the last error is stored.
    Failed = 2,
    /// The first load is in progress.
    Loading = 3,
    /// A reload is in progress; the previous version stays usable.
    LoadedAndReloading = 4,
    /// A retry is in progress after failed loads.
    FailedAndReloading = 5,
    /// The name is not declared in the configuration.
    NotExist = 6,
}

impl Status {
    /// All statuses with their ordinals, for introspection surfaces.
    pub fn all_possible_values() -> Vec<(&'static str, i8)> {
        Status::iter().map(|status| (status.into(), status as i8)).collect()
    }
}

/// Outcome of the most recent (possibly still running) load of one object.
#[derive(Clone)]
pub struct LoadResult {
    pub status: Status,
    pub object: Option<LoadablePtr>,
    pub exception: Option<Arc<anyhow::Error>>,
    /// Consecutive errors since the last successful load.
    pub error_count: usize,
    pub loading_start_time: Option<SystemTime>,
    pub loading_duration: Duration,
    pub origin: PathBuf,
}

impl LoadResult {
    fn not_exist() -> Self {
        Self {
            status: Status::NotExist,
            object: None,
            exception: None,
            error_count: 0,
            loading_start_time: None,
            loading_duration: Duration::ZERO,
            origin: PathBuf::new(),
        }
    }
}

/// Creates (or re-creates) an object from its config.
///
/// Arguments: name, config, whether the config changed since the last
/// successful load, and the previous version if any.
pub type CreateObjectFn =
    Arc<dyn Fn(&str, &ObjectConfig, bool, Option<&LoadablePtr>) -> anyhow::Result<LoadablePtr> + Send + Sync>;

/// Computes the next update time from the load outcome and the consecutive
/// error count. `None` means "never".
pub type CalculateNextUpdateTimeFn =
    Arc<dyn Fn(Option<&LoadablePtr>, usize) -> Option<SystemTime> + Send + Sync>;

/// Decides whether a loaded object's backing source changed.
pub type IsObjectModifiedFn = Arc<dyn Fn(&LoadablePtr) -> anyhow::Result<bool> + Send + Sync>;

thread_local! {
    /// Names whose create callback is running on this thread. Used to detect
    /// an object whose factory (transitively) requires the object itself.
    static LOADING_NAMES: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

struct LoadingNameFrame;

impl LoadingNameFrame {
    fn push(name: &str) -> Self {
        LOADING_NAMES.with(|names| names.borrow_mut().push(name.to_string()));
        LoadingNameFrame
    }
}

impl Drop for LoadingNameFrame {
    fn drop(&mut self) {
        LOADING_NAMES.with(|names| {
            names.borrow_mut().pop();
        });
    }
}

fn is_loading_on_this_thread(name: &str) -> bool {
    LOADING_NAMES.with(|names| names.borrow().iter().any(|loading| loading == name))
}

/// Per-object record owned by the dispatcher.
struct Info {
    config: ObjectConfig,
    object: Option<LoadablePtr>,
    exception: Option<Arc<anyhow::Error>>,
    /// Non-zero while a load is in flight; each scheduling gets a fresh id.
    loading_id: u64,
    loading_start_time: Option<SystemTime>,
    loading_end_time: Option<SystemTime>,
    /// Consecutive errors since the last successful load.
    error_count: usize,
    config_changed: bool,
    forced_to_reload: bool,
    /// `None` means "never".
    next_update_time: Option<SystemTime>,
}

impl Info {
    fn new(config: ObjectConfig) -> Self {
        Self {
            config,
            object: None,
            exception: None,
            loading_id: 0,
            loading_start_time: None,
            loading_end_time: None,
            error_count: 0,
            config_changed: false,
            forced_to_reload: false,
            next_update_time: None,
        }
    }

    /// Usable and healthy. A retained previous version with a stored reload
    /// error does not count as loaded.
    fn loaded(&self) -> bool {
        self.object.is_some() && self.exception.is_none()
    }

    fn failed(&self) -> bool {
        self.exception.is_some()
    }

    fn loading(&self) -> bool {
        self.loading_id != 0
    }

    fn was_loading(&self) -> bool {
        self.loaded() || self.failed() || self.loading()
    }

    fn ready(&self) -> bool {
        (self.loaded() || self.failed()) && !self.forced_to_reload
    }

    fn update_due(&self, now: SystemTime) -> bool {
        self.next_update_time.map_or(false, |at| now >= at)
    }

    fn cancel(&mut self) {
        if !self.loading() {
            return;
        }
        // The in-flight create callback cannot be interrupted, but resetting
        // the id makes the worker discard its result on completion.
        self.loading_id = 0;
        self.loading_end_time = Some(SystemTime::now());
    }

    fn status(&self) -> Status {
        if self.loaded() {
            if self.loading() {
                Status::LoadedAndReloading
            } else {
                Status::Loaded
            }
        } else if self.failed() {
            if self.loading() {
                Status::FailedAndReloading
            } else {
                Status::Failed
            }
        } else if self.loading() {
            Status::Loading
        } else {
            Status::NotLoaded
        }
    }

    fn loading_duration(&self) -> Duration {
        let Some(start) = self.loading_start_time else {
            return Duration::ZERO;
        };
        let until = if self.loading() {
            SystemTime::now()
        } else {
            match self.loading_end_time {
                Some(end) => end,
                None => return Duration::ZERO,
            }
        };
        until.duration_since(start).unwrap_or(Duration::ZERO)
    }

    fn load_result(&self) -> LoadResult {
        LoadResult {
            status: self.status(),
            object: self.object.clone(),
            exception: self.exception.clone(),
            error_count: self.error_count,
            loading_start_time: self.loading_start_time,
            loading_duration: self.loading_duration(),
            origin: self.config.config_path.clone(),
        }
    }
}

struct DispatcherState {
    configs: Option<ObjectConfigs>,
    infos: hashbrown::HashMap<String, Info>,
    always_load_everything: bool,
    enable_async_loading: bool,
    /// Worker threads by loading id. A worker removes its own entry on exit;
    /// the dispatcher's drop joins whatever is left.
    loading_threads: hashbrown::HashMap<u64, JoinHandle<()>>,
    /// Always > 0, so id 0 can mean "idle".
    next_loading_id: u64,
}

struct DispatcherInner {
    create_object: CreateObjectFn,
    calculate_next_update_time: CalculateNextUpdateTimeFn,
    is_object_modified: IsObjectModifiedFn,
    type_name: String,
    state: Mutex<DispatcherState>,
    event: Condvar,
}

/// Runs the worker's must-do exit work: reacquire the dispatcher lock, erase
/// the thread record, and wake every waiter. Being a drop guard, it runs on
/// every exit path, panics from the create callback included.
struct LoadingThreadGuard<'a> {
    inner: &'a DispatcherInner,
    loading_id: u64,
}

impl Drop for LoadingThreadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.loading_threads.remove(&self.loading_id);
        drop(state);
        self.inner.event.notify_all();
    }
}

/// Manages loading and reloading of the declared objects.
///
/// Loads run either inline on the calling thread or on dedicated worker
/// threads, toggled with [`enable_async_loading`](Self::enable_async_loading).
/// Either way the user callbacks run with no dispatcher lock held, so a
/// factory may consult the loader for sibling objects.
pub struct LoadingDispatcher {
    inner: Arc<DispatcherInner>,
}

impl LoadingDispatcher {
    pub fn new(
        create_object: CreateObjectFn,
        calculate_next_update_time: CalculateNextUpdateTimeFn,
        is_object_modified: IsObjectModifiedFn,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                create_object,
                calculate_next_update_time,
                is_object_modified,
                type_name: type_name.into(),
                state: Mutex::new(DispatcherState {
                    configs: None,
                    infos: hashbrown::HashMap::new(),
                    always_load_everything: false,
                    enable_async_loading: false,
                    loading_threads: hashbrown::HashMap::new(),
                    next_loading_id: 1,
                }),
                event: Condvar::new(),
            }),
        }
    }

    /// Apply a new configuration snapshot, diffing it against the current
    /// registry. Waiters are notified so blocked loads recheck their names.
    pub fn set_configuration(&self, new_configs: ObjectConfigs) {
        let mut guard = self.inner.state.lock();
        if guard
            .configs
            .as_ref()
            .map_or(false, |configs| Arc::ptr_eq(configs, &new_configs))
        {
            return;
        }
        guard.configs = Some(Arc::clone(&new_configs));

        let mut removed = Vec::new();
        let mut restart = Vec::new();
        for (name, info) in guard.infos.iter_mut() {
            match new_configs.get(name) {
                None => removed.push(name.clone()),
                Some(new_config) => {
                    if !info.config.same_as(new_config) {
                        info.config = new_config.clone();
                        info.config_changed = true;
                        if info.was_loading() {
                            // The object is (or was) in use; pick up the new
                            // config right away.
                            info.cancel();
                            restart.push(name.clone());
                        }
                    }
                }
            }
        }

        let mut added = Vec::new();
        for (name, config) in new_configs.iter() {
            if !guard.infos.contains_key(name) {
                guard.infos.insert(name.clone(), Info::new(config.clone()));
                if guard.always_load_everything {
                    added.push(name.clone());
                }
            }
        }

        for name in removed {
            guard.infos.remove(&name);
        }

        for name in restart.into_iter().chain(added) {
            self.inner.start_loading_locked(&mut guard, &name);
        }

        drop(guard);
        self.inner.event.notify_all();
    }

    /// Whether every declared object should be loaded even if nobody asked
    /// for it yet.
    pub fn enable_always_load_everything(&self, enable: bool) {
        let mut guard = self.inner.state.lock();
        if guard.always_load_everything == enable {
            return;
        }
        guard.always_load_everything = enable;

        if enable {
            let to_start: Vec<String> = guard
                .infos
                .iter()
                .filter(|(_, info)| !info.was_loading())
                .map(|(name, _)| name.clone())
                .collect();
            for name in to_start {
                self.inner.start_loading_locked(&mut guard, &name);
            }
        }
    }

    /// Toggle between inline and worker-thread dispatch.
    pub fn enable_async_loading(&self, enable: bool) {
        self.inner.state.lock().enable_async_loading = enable;
    }

    pub fn get_current_status(&self, name: &str) -> Status {
        let guard = self.inner.state.lock();
        guard.infos.get(name).map_or(Status::NotExist, Info::status)
    }

    pub fn get_current_load_result(&self, name: &str) -> LoadResult {
        let guard = self.inner.state.lock();
        guard
            .infos
            .get(name)
            .map_or_else(LoadResult::not_exist, Info::load_result)
    }

    pub fn get_current_load_results(
        &self,
        filter_by_name: impl Fn(&str) -> bool,
    ) -> Vec<(String, LoadResult)> {
        let guard = self.inner.state.lock();
        guard
            .infos
            .iter()
            .filter(|(name, _)| filter_by_name(name))
            .map(|(name, info)| (name.clone(), info.load_result()))
            .collect()
    }

    pub fn get_currently_loaded_objects(
        &self,
        filter_by_name: impl Fn(&str) -> bool,
    ) -> Vec<LoadablePtr> {
        let guard = self.inner.state.lock();
        guard
            .infos
            .iter()
            .filter(|(name, info)| info.loaded() && filter_by_name(name))
            .filter_map(|(_, info)| info.object.clone())
            .collect()
    }

    pub fn get_number_of_currently_loaded_objects(&self) -> usize {
        let guard = self.inner.state.lock();
        guard.infos.values().filter(|info| info.loaded()).count()
    }

    pub fn has_currently_loaded_objects(&self) -> bool {
        let guard = self.inner.state.lock();
        guard.infos.values().any(Info::loaded)
    }

    /// Start loading `name` without waiting for the outcome.
    pub fn start_loading(&self, name: &str) {
        let mut guard = self.inner.state.lock();
        self.inner.start_loading_locked(&mut guard, name);
    }

    /// Load `name`, blocking until it is ready (loaded or failed) or the
    /// timeout elapses. `None` timeout waits forever.
    pub fn load(&self, name: &str, timeout: Option<Duration>) -> LoadResult {
        self.load_impl(name, timeout)
            .unwrap_or_else(LoadResult::not_exist)
    }

    /// Load `name` with no timeout; re-raise the stored error if the final
    /// state is failed.
    pub fn load_strict(&self, name: &str) -> error_stack::Result<LoadablePtr, Error> {
        if is_loading_on_this_thread(name) {
            return Err(error_stack::report!(Error::CyclicLoad {
                type_name: self.inner.type_name.clone(),
                name: name.to_string(),
            }));
        }

        let Some(result) = self.load_impl(name, None) else {
            return Err(error_stack::report!(Error::NoSuchObject {
                type_name: self.inner.type_name.clone(),
                name: name.to_string(),
            }));
        };

        if let Some(object) = result.object {
            return Ok(object);
        }
        match result.exception {
            Some(exception) => Err(error_stack::report!(Error::LoadFailed {
                type_name: self.inner.type_name.clone(),
                name: name.to_string(),
            })
            .attach_printable(format!("{exception:#}"))),
            None => Err(error_stack::report!(Error::StillLoading {
                type_name: self.inner.type_name.clone(),
                name: name.to_string(),
            })),
        }
    }

    /// Load every object `filter_by_name` accepts, blocking until all are
    /// ready or the timeout elapses.
    pub fn load_matching(
        &self,
        filter_by_name: impl Fn(&str) -> bool,
        timeout: Option<Duration>,
    ) -> Vec<(String, LoadResult)> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut guard = self.inner.state.lock();
        loop {
            let to_start: Vec<String> = guard
                .infos
                .iter()
                .filter(|(name, info)| filter_by_name(name) && !info.ready() && !info.loading())
                .map(|(name, _)| name.clone())
                .collect();
            for name in to_start {
                self.inner.start_loading_locked(&mut guard, &name);
            }

            let all_ready = guard
                .infos
                .iter()
                .all(|(name, info)| !filter_by_name(name) || info.ready());
            if all_ready {
                break;
            }

            match deadline {
                None => self.inner.event.wait(&mut guard),
                Some(deadline) => {
                    if self.inner.event.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
            }
        }

        guard
            .infos
            .iter()
            .filter(|(name, _)| filter_by_name(name))
            .map(|(name, info)| (name.clone(), info.load_result()))
            .collect()
    }

    pub fn load_all(&self, timeout: Option<Duration>) -> Vec<(String, LoadResult)> {
        self.load_matching(|_| true, timeout)
    }

    /// Cancel any in-flight load of `name` and start over. An object that was
    /// never loading is only touched when `load_never_loading` is set.
    pub fn reload(&self, name: &str, load_never_loading: bool) {
        let mut guard = self.inner.state.lock();
        let Some(info) = guard.infos.get_mut(name) else {
            return;
        };
        if info.was_loading() || load_never_loading {
            info.cancel();
            info.forced_to_reload = true;
            self.inner.start_loading_locked(&mut guard, name);
        }
    }

    pub fn reload_matching(
        &self,
        filter_by_name: impl Fn(&str) -> bool,
        load_never_loading: bool,
    ) {
        let mut guard = self.inner.state.lock();
        let to_reload: Vec<String> = guard
            .infos
            .iter()
            .filter(|(name, info)| {
                (info.was_loading() || load_never_loading) && filter_by_name(name)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in to_reload {
            if let Some(info) = guard.infos.get_mut(&name) {
                info.cancel();
                info.forced_to_reload = true;
            }
            self.inner.start_loading_locked(&mut guard, &name);
        }
    }

    pub fn reload_all(&self, load_never_loading: bool) {
        self.reload_matching(|_| true, load_never_loading);
    }

    /// Reload every loaded object whose update time has come and whose
    /// backing source reports a modification; failed objects get a retry.
    ///
    /// The modification checks run with no lock held, so the registry is
    /// re-validated afterwards: an object replaced in the meantime is left
    /// alone.
    pub fn reload_outdated(&self) {
        let mut checks: Vec<(String, LoadablePtr, bool)> = {
            let guard = self.inner.state.lock();
            let now = SystemTime::now();
            guard
                .infos
                .iter()
                .filter(|(_, info)| info.update_due(now) && !info.loading() && info.loaded())
                .filter_map(|(name, info)| {
                    info.object
                        .clone()
                        .map(|object| (name.clone(), object, true))
                })
                .collect()
        };

        for (name, object, modified) in checks.iter_mut() {
            match (self.inner.is_object_modified)(object) {
                Ok(is_modified) => *modified = is_modified,
                Err(error) => {
                    // Unknown counts as modified; a spurious reload is better
                    // than a stale object.
                    tracing::warn!(
                        "could not check if {} '{name}' was modified: {error:#}",
                        self.inner.type_name,
                    );
                }
            }
        }

        let mut guard = self.inner.state.lock();
        let now = SystemTime::now();
        let mut refresh = Vec::new();
        let mut start = Vec::new();
        for (name, info) in guard.infos.iter() {
            if !info.update_due(now) || info.loading() {
                continue;
            }
            if info.loaded() {
                let Some((_, object, modified)) =
                    checks.iter().find(|(check_name, _, _)| check_name == name)
                else {
                    // Loaded after the check set was built; its update time
                    // is fresh.
                    continue;
                };
                let same_object = info
                    .object
                    .as_ref()
                    .map_or(false, |current| Arc::ptr_eq(current, object));
                if !same_object {
                    continue;
                }
                if *modified {
                    start.push(name.clone());
                } else {
                    let next = (self.inner.calculate_next_update_time)(
                        info.object.as_ref(),
                        info.error_count,
                    );
                    refresh.push((name.clone(), next));
                }
            } else if info.failed() {
                start.push(name.clone());
            }
        }

        for (name, next_update_time) in refresh {
            if let Some(info) = guard.infos.get_mut(&name) {
                info.next_update_time = next_update_time;
            }
        }
        for name in start {
            self.inner.start_loading_locked(&mut guard, &name);
        }
    }

    fn load_impl(&self, name: &str, timeout: Option<Duration>) -> Option<LoadResult> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut guard = self.inner.state.lock();
        loop {
            {
                let Some(info) = guard.infos.get(name) else {
                    return None;
                };
                if info.ready() {
                    return Some(info.load_result());
                }
            }

            let loading = guard.infos.get(name).map_or(false, Info::loading);
            if !loading {
                self.inner.start_loading_locked(&mut guard, name);
                // Inline dispatch finished the load on this thread; the next
                // iteration observes the outcome either way.
                continue;
            }

            match deadline {
                None => self.inner.event.wait(&mut guard),
                Some(deadline) => {
                    if self.inner.event.wait_until(&mut guard, deadline).timed_out() {
                        return guard.infos.get(name).map(Info::load_result);
                    }
                }
            }
        }
    }
}

impl Drop for LoadingDispatcher {
    fn drop(&mut self) {
        // Clearing the registry tells in-flight workers their results are
        // unwanted; then wait for every recorded thread.
        let mut guard = self.inner.state.lock();
        guard.infos.clear();
        loop {
            let Some(&loading_id) = guard.loading_threads.keys().next() else {
                break;
            };
            let handle = guard
                .loading_threads
                .remove(&loading_id)
                .expect("key taken from the map");
            drop(guard);
            self.inner.event.notify_all();
            let _ = handle.join();
            guard = self.inner.state.lock();
        }
    }
}

impl DispatcherInner {
    /// Assign a fresh loading id to `name`. Returns `None` when the object is
    /// unknown or already loading.
    fn begin_loading(state: &mut DispatcherState, name: &str) -> Option<u64> {
        let loading_id = state.next_loading_id;
        {
            let info = state.infos.get_mut(name)?;
            if info.loading() {
                return None;
            }
            info.loading_id = loading_id;
            info.loading_start_time = Some(SystemTime::now());
            info.loading_end_time = None;
        }
        state.next_loading_id += 1;
        kestrel_events::increment(Event::ObjectLoads);
        Some(loading_id)
    }

    /// Start loading `name`: on a worker thread when async dispatch is
    /// enabled, otherwise inline (the lock is released around the callback).
    fn start_loading_locked(
        self: &Arc<Self>,
        guard: &mut MutexGuard<'_, DispatcherState>,
        name: &str,
    ) {
        let Some(loading_id) = Self::begin_loading(guard, name) else {
            return;
        };

        if guard.enable_async_loading {
            let inner = Arc::clone(self);
            let owned_name = name.to_string();
            let spawned = std::thread::Builder::new()
                .name("kestrel-load".to_string())
                .spawn(move || DispatcherInner::loading_thread(inner, owned_name, loading_id));
            match spawned {
                Ok(handle) => {
                    guard.loading_threads.insert(loading_id, handle);
                }
                Err(error) => {
                    tracing::warn!(
                        "failed to spawn loading thread for {} '{name}': {error}; loading inline",
                        self.type_name,
                    );
                    self.do_loading(guard, name, loading_id);
                    self.event.notify_all();
                }
            }
        } else {
            self.do_loading(guard, name, loading_id);
            self.event.notify_all();
        }
    }

    fn loading_thread(inner: Arc<DispatcherInner>, name: String, loading_id: u64) {
        let cleanup = LoadingThreadGuard {
            inner: &inner,
            loading_id,
        };
        let mut guard = cleanup.inner.state.lock();
        cleanup.inner.do_loading(&mut guard, &name, loading_id);
    }

    /// Perform one load: call the create callback with the lock released,
    /// then commit the outcome if this loading is still the current one.
    fn do_loading(&self, guard: &mut MutexGuard<'_, DispatcherState>, name: &str, loading_id: u64) {
        // The object may have been removed or rescheduled since this loading
        // was planned.
        let Some(info) = guard.infos.get(name) else {
            return;
        };
        if info.loading_id != loading_id {
            return;
        }

        let config = info.config.clone();
        let config_changed = info.config_changed;
        let previous = info.object.clone();
        let mut error_count = info.error_count;

        let (new_object, new_exception, next_update_time) = MutexGuard::unlocked(guard, || {
            let _frame = LoadingNameFrame::push(name);
            let (new_object, new_exception) =
                match (self.create_object)(name, &config, config_changed, previous.as_ref()) {
                    Ok(object) => (Some(object), None),
                    Err(error) => (None, Some(Arc::new(error))),
                };
            match &new_exception {
                Some(_) => error_count += 1,
                None => error_count = 0,
            }
            let next_update_time =
                (self.calculate_next_update_time)(new_object.as_ref(), error_count);
            (new_object, new_exception, next_update_time)
        });

        // While the lock was released the object could have been removed or
        // loaded with another config; a stale id means the result is dropped.
        let type_name = &self.type_name;
        let Some(info) = guard.infos.get_mut(name) else {
            kestrel_events::increment(Event::ObjectLoadsDiscarded);
            return;
        };
        if info.loading_id != loading_id {
            kestrel_events::increment(Event::ObjectLoadsDiscarded);
            return;
        }

        if let Some(exception) = &new_exception {
            kestrel_events::increment(Event::ObjectLoadFailures);
            if previous.is_some() {
                tracing::warn!(
                    "could not update {type_name} '{name}', leaving the previous version: {exception:#}"
                );
            } else {
                tracing::warn!("could not load {type_name} '{name}': {exception:#}");
            }
        }

        if let Some(object) = new_object {
            info.object = Some(object);
            info.config_changed = false;
        }
        info.exception = new_exception;
        info.error_count = error_count;
        info.loading_end_time = Some(SystemTime::now());
        info.loading_id = 0;
        info.next_update_time = next_update_time;
        info.forced_to_reload = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Weak};

    use super::*;
    use crate::{Lifetime, Loadable};

    struct Marker {
        name: String,
        version: usize,
    }

    impl Loadable for Marker {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_modified(&self) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn supports_updates(&self) -> bool {
            true
        }

        fn lifetime(&self) -> Lifetime {
            Lifetime {
                min_sec: 1,
                max_sec: 1,
            }
        }

        fn clone_object(&self) -> anyhow::Result<LoadablePtr> {
            Ok(Arc::new(Marker {
                name: self.name.clone(),
                version: self.version,
            }))
        }
    }

    fn object_config(name: &str, version: u64) -> ObjectConfig {
        let yaml = format!("name: {name}\nversion: {version}\n");
        ObjectConfig {
            config_path: PathBuf::from(format!("{name}.yaml")),
            config: Arc::new(serde_yaml::from_str(&yaml).unwrap()),
            key_in_config: format!("dictionary_{name}"),
        }
    }

    fn snapshot(entries: &[(&str, u64)]) -> ObjectConfigs {
        Arc::new(
            entries
                .iter()
                .map(|(name, version)| (name.to_string(), object_config(name, *version)))
                .collect(),
        )
    }

    fn never_update(_object: Option<&LoadablePtr>, _error_count: usize) -> Option<SystemTime> {
        None
    }

    fn always_due(_object: Option<&LoadablePtr>, _error_count: usize) -> Option<SystemTime> {
        Some(SystemTime::now())
    }

    fn ask_object(object: &LoadablePtr) -> anyhow::Result<bool> {
        object.is_modified()
    }

    fn dispatcher(create: CreateObjectFn, calculate: CalculateNextUpdateTimeFn) -> LoadingDispatcher {
        LoadingDispatcher::new(create, calculate, Arc::new(ask_object), "dictionary")
    }

    fn counting_factory(counter: Arc<AtomicUsize>) -> CreateObjectFn {
        Arc::new(
            move |name: &str,
                  _config: &ObjectConfig,
                  _config_changed: bool,
                  _previous: Option<&LoadablePtr>| {
                let version = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Arc::new(Marker {
                    name: name.to_string(),
                    version,
                }) as LoadablePtr)
            },
        )
    }

    #[test]
    fn test_load_happy_path() {
        kestrel_testing::init_test_logging();
        let created = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counting_factory(Arc::clone(&created)), Arc::new(never_update));
        dispatcher.set_configuration(snapshot(&[("foo", 1)]));
        assert_eq!(dispatcher.get_current_status("foo"), Status::NotLoaded);

        let result = dispatcher.load("foo", None);
        assert_eq!(result.status, Status::Loaded);
        assert!(result.object.is_some());
        assert!(result.exception.is_none());
        assert_eq!(dispatcher.get_current_status("foo"), Status::Loaded);
        assert_eq!(dispatcher.get_number_of_currently_loaded_objects(), 1);

        // Reloading replaces the object pointer.
        let before = result.object.unwrap();
        dispatcher.reload("foo", false);
        let after = dispatcher.get_current_load_result("foo").object.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_name() {
        kestrel_testing::init_test_logging();
        let dispatcher = dispatcher(
            counting_factory(Arc::new(AtomicUsize::new(0))),
            Arc::new(never_update),
        );
        dispatcher.set_configuration(snapshot(&[]));

        assert_eq!(dispatcher.get_current_status("nope"), Status::NotExist);
        assert_eq!(dispatcher.load("nope", None).status, Status::NotExist);

        let error = dispatcher.load_strict("nope").unwrap_err();
        assert!(matches!(
            error.current_context(),
            Error::NoSuchObject { .. }
        ));
    }

    #[test]
    fn test_transient_reloading_status() {
        kestrel_testing::init_test_logging();
        let (unblock, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let factory: CreateObjectFn = Arc::new(
            move |name: &str,
                  _config: &ObjectConfig,
                  _config_changed: bool,
                  _previous: Option<&LoadablePtr>| {
                gate.lock().recv().ok();
                Ok(Arc::new(Marker {
                    name: name.to_string(),
                    version: 0,
                }) as LoadablePtr)
            },
        );
        let dispatcher = dispatcher(factory, Arc::new(never_update));
        dispatcher.enable_async_loading(true);
        dispatcher.set_configuration(snapshot(&[("foo", 1)]));

        dispatcher.start_loading("foo");
        assert_eq!(dispatcher.get_current_status("foo"), Status::Loading);

        unblock.send(()).unwrap();
        let result = dispatcher.load("foo", None);
        assert_eq!(result.status, Status::Loaded);
        let before = result.object.unwrap();

        dispatcher.reload("foo", false);
        assert_eq!(
            dispatcher.get_current_status("foo"),
            Status::LoadedAndReloading
        );

        unblock.send(()).unwrap();
        let result = dispatcher.load("foo", None);
        assert_eq!(result.status, Status::Loaded);
        assert!(!Arc::ptr_eq(&before, &result.object.unwrap()));
    }

    #[test]
    fn test_failed_reload_retains_previous_version() {
        kestrel_testing::init_test_logging();
        let failing = Arc::new(AtomicBool::new(false));
        let factory: CreateObjectFn = {
            let failing = Arc::clone(&failing);
            Arc::new(
                move |name: &str,
                      _config: &ObjectConfig,
                      _config_changed: bool,
                      _previous: Option<&LoadablePtr>| {
                    if failing.load(Ordering::SeqCst) {
                        anyhow::bail!("backing source is gone");
                    }
                    Ok(Arc::new(Marker {
                        name: name.to_string(),
                        version: 1,
                    }) as LoadablePtr)
                },
            )
        };
        let dispatcher = dispatcher(factory, Arc::new(always_due));
        dispatcher.set_configuration(snapshot(&[("foo", 1)]));

        let v1 = dispatcher.load("foo", None).object.unwrap();

        failing.store(true, Ordering::SeqCst);
        dispatcher.reload_outdated();

        let result = dispatcher.get_current_load_result("foo");
        assert_eq!(result.status, Status::Failed);
        assert!(Arc::ptr_eq(&result.object.unwrap(), &v1));
        assert!(result.exception.is_some());
        assert_eq!(result.error_count, 1);
    }

    #[test]
    fn test_reload_outdated_converges() {
        kestrel_testing::init_test_logging();
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory: CreateObjectFn = {
            let attempts = Arc::clone(&attempts);
            Arc::new(
                move |name: &str,
                      _config: &ObjectConfig,
                      _config_changed: bool,
                      _previous: Option<&LoadablePtr>| {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt <= 3 {
                        anyhow::bail!("attempt {attempt} failed");
                    }
                    Ok(Arc::new(Marker {
                        name: name.to_string(),
                        version: attempt,
                    }) as LoadablePtr)
                },
            )
        };
        let dispatcher = dispatcher(factory, Arc::new(always_due));
        dispatcher.set_configuration(snapshot(&[("foo", 1)]));

        assert_eq!(dispatcher.load("foo", None).status, Status::Failed);
        for _ in 0..10 {
            if dispatcher.get_current_status("foo") == Status::Loaded {
                break;
            }
            dispatcher.reload_outdated();
        }
        assert_eq!(dispatcher.get_current_status("foo"), Status::Loaded);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_configuration_hot_swap() {
        kestrel_testing::init_test_logging();
        let created = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counting_factory(Arc::clone(&created)), Arc::new(never_update));
        dispatcher.enable_always_load_everything(true);

        dispatcher.set_configuration(snapshot(&[("a", 1), ("b", 1)]));
        assert_eq!(dispatcher.get_current_status("a"), Status::Loaded);
        assert_eq!(dispatcher.get_current_status("b"), Status::Loaded);
        let b_before = dispatcher.get_current_load_result("b").object.unwrap();
        let created_before = created.load(Ordering::SeqCst);

        dispatcher.set_configuration(snapshot(&[("b", 1), ("c", 1)]));
        assert_eq!(dispatcher.get_current_status("a"), Status::NotExist);
        assert_eq!(dispatcher.get_current_status("c"), Status::Loaded);

        // Unchanged config leaves `b` untouched.
        let b_after = dispatcher.get_current_load_result("b").object.unwrap();
        assert!(Arc::ptr_eq(&b_before, &b_after));
        assert_eq!(created.load(Ordering::SeqCst), created_before + 1);

        let mut names: Vec<String> = dispatcher
            .get_current_load_results(|_| true)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_changed_config_triggers_reload() {
        kestrel_testing::init_test_logging();
        let created = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counting_factory(Arc::clone(&created)), Arc::new(never_update));
        dispatcher.set_configuration(snapshot(&[("a", 1)]));
        let before = dispatcher.load("a", None).object.unwrap();

        dispatcher.set_configuration(snapshot(&[("a", 2)]));
        let result = dispatcher.load("a", None);
        assert_eq!(result.status, Status::Loaded);
        assert!(!Arc::ptr_eq(&before, &result.object.unwrap()));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_load_timeout() {
        kestrel_testing::init_test_logging();
        let (unblock, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let factory: CreateObjectFn = Arc::new(
            move |name: &str,
                  _config: &ObjectConfig,
                  _config_changed: bool,
                  _previous: Option<&LoadablePtr>| {
                gate.lock().recv().ok();
                Ok(Arc::new(Marker {
                    name: name.to_string(),
                    version: 0,
                }) as LoadablePtr)
            },
        );
        let dispatcher = dispatcher(factory, Arc::new(never_update));
        dispatcher.enable_async_loading(true);
        dispatcher.set_configuration(snapshot(&[("slow", 1)]));

        let result = dispatcher.load("slow", Some(Duration::from_millis(50)));
        assert_eq!(result.status, Status::Loading);
        assert!(result.object.is_none());

        unblock.send(()).unwrap();
        assert_eq!(dispatcher.load("slow", None).status, Status::Loaded);
    }

    #[test]
    fn test_factory_may_load_sibling() {
        kestrel_testing::init_test_logging();
        let dispatcher: Arc<LoadingDispatcher> = Arc::new_cyclic(|weak: &Weak<LoadingDispatcher>| {
            let weak = weak.clone();
            let factory: CreateObjectFn = Arc::new(
                move |name: &str,
                      _config: &ObjectConfig,
                      _config_changed: bool,
                      _previous: Option<&LoadablePtr>| {
                    if name == "parent" {
                        let dispatcher = weak.upgrade().expect("dispatcher is alive");
                        let child = dispatcher
                            .load_strict("child")
                            .map_err(|error| anyhow::anyhow!("{error}"))?;
                        assert_eq!(child.name(), "child");
                    }
                    Ok(Arc::new(Marker {
                        name: name.to_string(),
                        version: 0,
                    }) as LoadablePtr)
                },
            );
            LoadingDispatcher::new(
                factory,
                Arc::new(never_update),
                Arc::new(ask_object),
                "dictionary",
            )
        });
        dispatcher.set_configuration(snapshot(&[("parent", 1), ("child", 1)]));

        let parent = dispatcher.load_strict("parent").unwrap();
        assert_eq!(parent.name(), "parent");
        assert_eq!(dispatcher.get_current_status("child"), Status::Loaded);
    }

    #[test]
    fn test_self_cycle_is_detected() {
        kestrel_testing::init_test_logging();
        let dispatcher: Arc<LoadingDispatcher> = Arc::new_cyclic(|weak: &Weak<LoadingDispatcher>| {
            let weak = weak.clone();
            let factory: CreateObjectFn = Arc::new(
                move |name: &str,
                      _config: &ObjectConfig,
                      _config_changed: bool,
                      _previous: Option<&LoadablePtr>| {
                    let dispatcher = weak.upgrade().expect("dispatcher is alive");
                    let _self_ref = dispatcher
                        .load_strict(name)
                        .map_err(|error| anyhow::anyhow!("{error}"))?;
                    unreachable!("the self load must fail");
                },
            );
            LoadingDispatcher::new(
                factory,
                Arc::new(never_update),
                Arc::new(ask_object),
                "dictionary",
            )
        });
        dispatcher.set_configuration(snapshot(&[("selfish", 1)]));

        let error = dispatcher.load_strict("selfish").unwrap_err();
        assert!(matches!(error.current_context(), Error::LoadFailed { .. }));
        assert!(format!("{error:?}").contains("cyclic load"));
    }

    #[test]
    fn test_load_strict_reraises_stored_error() {
        kestrel_testing::init_test_logging();
        let factory: CreateObjectFn = Arc::new(
            |_name: &str,
             _config: &ObjectConfig,
             _config_changed: bool,
             _previous: Option<&LoadablePtr>| {
                anyhow::bail!("the source never answers")
            },
        );
        let dispatcher = dispatcher(factory, Arc::new(never_update));
        dispatcher.set_configuration(snapshot(&[("broken", 1)]));

        let error = dispatcher.load_strict("broken").unwrap_err();
        assert!(matches!(error.current_context(), Error::LoadFailed { .. }));
        assert!(format!("{error:?}").contains("the source never answers"));
    }

    #[test]
    fn test_load_matching_filters() {
        kestrel_testing::init_test_logging();
        let dispatcher = dispatcher(
            counting_factory(Arc::new(AtomicUsize::new(0))),
            Arc::new(never_update),
        );
        dispatcher.set_configuration(snapshot(&[("one", 1), ("two", 1), ("other", 1)]));

        let results = dispatcher.load_matching(|name| name.starts_with("o"), None);
        let mut names: Vec<String> = results.into_iter().map(|(name, _)| name).collect();
        names.sort();
        assert_eq!(names, vec!["one".to_string(), "other".to_string()]);
        assert_eq!(dispatcher.get_current_status("one"), Status::Loaded);
        assert_eq!(dispatcher.get_current_status("two"), Status::NotLoaded);
    }

    #[test]
    fn test_status_ordinals() {
        let values = Status::all_possible_values();
        assert_eq!(values[0], ("NOT_LOADED", 0));
        assert_eq!(values[6], ("NOT_EXIST", 6));
        assert_eq!(Status::LoadedAndReloading.to_string(), "LOADED_AND_RELOADING");
    }
}

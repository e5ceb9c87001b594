use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};

use crate::{ConfigFilesReader, LoadablePtr, LoadingDispatcher};

/// Settings of the periodic update loop.
#[derive(Clone, Copy, Debug)]
pub struct UpdateSettings {
    /// How often configs are re-read and outdated objects re-checked.
    pub check_period: Duration,
    /// Base delay before retrying a failed load.
    pub backoff_initial: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            check_period: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(10 * 60),
        }
    }
}

/// The update-time policy, shared between the updater thread and the
/// dispatcher's next-update-time callback.
///
/// Both locks here are leaves: the policy never takes the reader or
/// dispatcher locks, so it is safe to consult from under either.
pub struct UpdateTimePolicy {
    settings: Mutex<UpdateSettings>,
    rng: Mutex<StdRng>,
}

impl Default for UpdateTimePolicy {
    fn default() -> Self {
        Self {
            settings: Mutex::new(UpdateSettings::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl UpdateTimePolicy {
    pub fn set_settings(&self, settings: UpdateSettings) {
        *self.settings.lock() = settings;
    }

    pub fn settings(&self) -> UpdateSettings {
        *self.settings.lock()
    }

    /// When the object should next be checked. `None` means "never".
    ///
    /// Healthy objects sample uniformly from their declared lifetime so that
    /// objects configured alike do not reload in unison. Failing objects back
    /// off exponentially in the error count, with random jitter, capped at
    /// `backoff_max`.
    pub fn calculate_next_update_time(
        &self,
        loaded_object: Option<&LoadablePtr>,
        error_count: usize,
    ) -> Option<SystemTime> {
        let settings = self.settings();

        if error_count == 0 {
            let object = loaded_object?;
            if !object.supports_updates() {
                return None;
            }
            let lifetime = object.lifetime();
            if lifetime.min_sec == 0 || lifetime.max_sec == 0 {
                return None;
            }
            let seconds = self.rng.lock().gen_range(lifetime.min_sec..=lifetime.max_sec);
            return Some(SystemTime::now() + Duration::from_secs(seconds));
        }

        let spread = 1u64 << (error_count - 1).min(63);
        let jitter = self.rng.lock().gen_range(0..spread.max(1));
        let delay = settings
            .backoff_max
            .min(settings.backoff_initial + Duration::from_secs(jitter));
        Some(SystemTime::now() + delay)
    }
}

struct UpdaterState {
    enabled: bool,
    thread: Option<JoinHandle<()>>,
}

struct UpdaterInner {
    config_files_reader: Arc<ConfigFilesReader>,
    loading_dispatcher: Arc<LoadingDispatcher>,
    policy: Arc<UpdateTimePolicy>,
    state: Mutex<UpdaterState>,
    event: Condvar,
}

/// Background thread that keeps the dispatcher's registry in sync with the
/// configuration files and reloads outdated objects.
pub struct PeriodicUpdater {
    inner: Arc<UpdaterInner>,
}

impl PeriodicUpdater {
    pub fn new(
        config_files_reader: Arc<ConfigFilesReader>,
        loading_dispatcher: Arc<LoadingDispatcher>,
        policy: Arc<UpdateTimePolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(UpdaterInner {
                config_files_reader,
                loading_dispatcher,
                policy,
                state: Mutex::new(UpdaterState {
                    enabled: false,
                    thread: None,
                }),
                event: Condvar::new(),
            }),
        }
    }

    /// Start or stop the update thread. Settings take effect immediately.
    pub fn enable(&self, enable: bool, settings: UpdateSettings) {
        self.inner.policy.set_settings(settings);

        let mut state = self.inner.state.lock();
        state.enabled = enable;

        if enable {
            if state.thread.is_none() {
                let inner = Arc::clone(&self.inner);
                let spawned = std::thread::Builder::new()
                    .name("kestrel-reload".to_string())
                    .spawn(move || UpdaterInner::run(inner));
                match spawned {
                    Ok(thread) => state.thread = Some(thread),
                    Err(error) => {
                        tracing::warn!("failed to spawn the periodic update thread: {error}");
                        state.enabled = false;
                    }
                }
            }
        } else if let Some(thread) = state.thread.take() {
            drop(state);
            self.inner.event.notify_all();
            let _ = thread.join();
        }
    }
}

impl Drop for PeriodicUpdater {
    fn drop(&mut self) {
        self.enable(false, self.inner.policy.settings());
    }
}

impl UpdaterInner {
    fn run(inner: Arc<UpdaterInner>) {
        let mut state = inner.state.lock();
        loop {
            if !state.enabled {
                break;
            }
            let period = inner.policy.settings().check_period;
            let timed_out = inner.event.wait_for(&mut state, period).timed_out();
            if !state.enabled {
                break;
            }
            if !timed_out {
                // Woken without being disabled; go back to waiting.
                continue;
            }

            MutexGuard::unlocked(&mut state, || {
                let configs = inner.config_files_reader.read(false);
                inner.loading_dispatcher.set_configuration(configs);
                inner.loading_dispatcher.reload_outdated();
            });
        }
    }
}

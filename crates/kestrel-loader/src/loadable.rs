use std::fmt;
use std::sync::Arc;

/// How long a loaded object stays fresh, in seconds.
///
/// The updater samples the actual refresh moment uniformly from
/// `[min_sec, max_sec]` so that many objects configured alike do not all
/// reload in the same instant. A zero bound disables periodic updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifetime {
    pub min_sec: u64,
    pub max_sec: u64,
}

/// An object the dispatcher can construct from a config and periodically
/// refresh.
pub trait Loadable: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backing source changed since this object was created.
    /// Consulted by the updater to decide if a reload is worthwhile.
    fn is_modified(&self) -> anyhow::Result<bool>;

    /// Whether the object supports periodic updates at all.
    fn supports_updates(&self) -> bool;

    fn lifetime(&self) -> Lifetime;

    /// A fresh copy of this object, used when a reload finds the
    /// configuration unchanged.
    fn clone_object(&self) -> anyhow::Result<LoadablePtr>;
}

pub type LoadablePtr = Arc<dyn Loadable>;

impl fmt::Debug for dyn Loadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loadable").field("name", &self.name()).finish()
    }
}

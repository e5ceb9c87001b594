#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Process-wide event counters for high-level profiling.
//!
//! Counters are indexed by the [`Event`] enumeration and incremented with
//! relaxed atomic adds. They are initialized at process start and never torn
//! down; readers see best-effort consistent values.

use std::sync::atomic::{AtomicU64, Ordering};

use strum::{EnumCount as _, IntoEnumIterator as _};

/// The countable events.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum_macros::EnumCount,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
pub enum Event {
    /// An object load (or reload) was started by the loading dispatcher.
    ObjectLoads,
    /// An object load completed with an error from the create callback.
    ObjectLoadFailures,
    /// A completed load was discarded because its loading id went stale.
    ObjectLoadsDiscarded,
    /// A configuration file was parsed (first read or re-read after change).
    ConfigFilesParsed,
    /// A configuration file failed to parse; previous contents retained.
    ConfigFileParseFailures,
    /// A hash table grew its buffer.
    HashTableResizes,
    /// Cells moved to a new slot while re-inserting during a resize.
    HashTableResizeMoves,
    /// A mutation command sequence was compiled into a plan.
    MutationPlansCompiled,
}

const ZERO: AtomicU64 = AtomicU64::new(0);
static COUNTERS: [AtomicU64; Event::COUNT] = [ZERO; Event::COUNT];

/// Increment the counter for `event` by one.
#[inline]
pub fn increment(event: Event) {
    increment_by(event, 1)
}

/// Increment the counter for `event` by `amount`.
#[inline]
pub fn increment_by(event: Event, amount: u64) {
    COUNTERS[event as usize].fetch_add(amount, Ordering::Relaxed);
}

/// Current value of the counter for `event`.
pub fn value(event: Event) -> u64 {
    COUNTERS[event as usize].load(Ordering::Relaxed)
}

/// All counters with their names, for introspection surfaces.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    Event::iter().map(|event| (event.into(), value(event))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_read() {
        let before = value(Event::MutationPlansCompiled);
        increment(Event::MutationPlansCompiled);
        increment_by(Event::MutationPlansCompiled, 2);
        assert_eq!(value(Event::MutationPlansCompiled), before + 3);
    }

    #[test]
    fn test_snapshot_names() {
        let snapshot = snapshot();
        assert_eq!(snapshot.len(), Event::COUNT);
        assert!(snapshot.iter().any(|(name, _)| *name == "HashTableResizes"));
    }
}

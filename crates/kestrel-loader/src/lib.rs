#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Dynamic loader for long-lived, externally-configured objects such as
//! lookup dictionaries and models.
//!
//! Three cooperating pieces:
//!
//! - [`ConfigFilesReader`] scans configuration repositories and produces
//!   immutable snapshots of `name → config`.
//! - [`LoadingDispatcher`] owns the state of every declared object,
//!   schedules loads inline or on worker threads, and answers blocking
//!   queries with timeout.
//! - [`PeriodicUpdater`] re-reads configs on a timer and asks the dispatcher
//!   to reload objects whose update interval has elapsed, with randomized
//!   backoff after failures.
//!
//! [`ExternalLoader`] ties them together behind one facade.

mod config;
mod dispatcher;
mod error;
mod loadable;
mod loader;
mod reader;
mod repository;
mod updater;

pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use loadable::*;
pub use loader::*;
pub use reader::*;
pub use repository::*;
pub use updater::*;

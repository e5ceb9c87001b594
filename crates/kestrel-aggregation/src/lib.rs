#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Aggregate function state used during query execution.
//!
//! The weighted-quantile family here demonstrates the contract the
//! open-addressed hash table must satisfy: accumulate `value → weight`
//! pairs, merge two states, serialize, and finalize to one or more
//! quantiles.

mod weighted_quantile;

pub use weighted_quantile::*;

#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Compiles a sequence of row-level mutation commands (DELETE, UPDATE,
//! MATERIALIZE INDEX) into a staged, pipelined execution plan over a
//! storage's column stream.
//!
//! Commands are first broken into stages: a stage carries either filters
//! (negated DELETE predicates) or a map of column to replacement
//! expression, with updates of materialized columns and index
//! recomputation appended as follow-up stages. Stages are then compiled
//! backwards so each stage's required inputs become the previous stage's
//! outputs, and finally assembled into a [`MutationPlan`]: a source SELECT
//! plus filter/expression steps and a terminal materialization.

mod command;
mod error;
mod expr;
mod plan;
mod planner;
mod schema;

pub use command::*;
pub use error::*;
pub use expr::*;
pub use plan::*;
pub use planner::*;
pub use schema::*;

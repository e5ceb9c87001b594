use std::collections::BTreeMap;

use crate::Expr;

/// One row-level mutation command.
///
/// Update assignments are kept ordered by column name so that planning is
/// deterministic for a fixed command list.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MutationCommand {
    /// `DELETE WHERE predicate`.
    Delete { predicate: Expr },
    /// `UPDATE col = expr, ... WHERE predicate`.
    Update {
        assignments: BTreeMap<String, Expr>,
        predicate: Expr,
    },
    /// `MATERIALIZE INDEX name`: recompute one secondary index.
    MaterializeIndex { name: String },
    /// A command kind the planner does not understand. Carried through from
    /// parsing so the planner can report it instead of silently dropping it.
    Unknown { kind: String },
}

impl MutationCommand {
    /// The rows the command touches; `None` means every row.
    pub fn predicate(&self) -> Option<&Expr> {
        match self {
            MutationCommand::Delete { predicate } => Some(predicate),
            MutationCommand::Update { predicate, .. } => Some(predicate),
            MutationCommand::MaterializeIndex { .. } | MutationCommand::Unknown { .. } => None,
        }
    }
}

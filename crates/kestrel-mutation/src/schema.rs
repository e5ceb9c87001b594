use std::collections::BTreeSet;

use crate::{Error, Expr};

/// How a column's default value is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ColumnDefaultKind {
    /// Used when the column is omitted on insert; the column is ordinary.
    Default,
    /// Computed from other columns on insert and stored.
    Materialized,
    /// Computed on read, never stored.
    Alias,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ColumnDefault {
    pub kind: ColumnDefaultKind,
    pub expression: Expr,
}

/// A column of the storage's schema.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub data_type: String,
    pub default: Option<ColumnDefault>,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            default: None,
        }
    }

    pub fn materialized(
        name: impl Into<String>,
        data_type: impl Into<String>,
        expression: Expr,
    ) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            default: Some(ColumnDefault {
                kind: ColumnDefaultKind::Materialized,
                expression,
            }),
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.default
            .as_ref()
            .map_or(false, |default| default.kind == ColumnDefaultKind::Materialized)
    }

    /// Whether the column is physically stored (ordinary or materialized).
    pub fn is_physical(&self) -> bool {
        self.default
            .as_ref()
            .map_or(true, |default| default.kind != ColumnDefaultKind::Alias)
    }

    pub fn is_ordinary(&self) -> bool {
        self.is_physical() && !self.is_materialized()
    }
}

/// A secondary (data skipping) index over an expression.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexDescription {
    pub name: String,
    pub expression: Expr,
}

/// Settings of a storage scan.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScanOptions {
    /// 0 picks the number of threads automatically.
    pub max_threads: usize,
    pub uniform_read_distribution: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_threads: 0,
            uniform_read_distribution: true,
        }
    }
}

/// The slice of a storage's surface the mutation planner consumes: column
/// metadata, key declarations, secondary indices, and a counting scan.
pub trait Storage: Send + Sync {
    fn columns(&self) -> &[TableColumn];

    fn indices(&self) -> &[IndexDescription];

    fn partition_key(&self) -> Option<&Expr>;

    fn sorting_key(&self) -> Option<&Expr>;

    fn sign_column(&self) -> Option<&str>;

    fn version_column(&self) -> Option<&str>;

    /// `SELECT count() WHERE predicate` over the storage; `None` counts all
    /// rows.
    fn count_rows_matching(
        &self,
        predicate: Option<&Expr>,
        options: &ScanOptions,
    ) -> error_stack::Result<u64, Error>;
}

/// Columns that no mutation may rewrite: everything the partition and
/// sorting keys read, plus the sign and version columns of the merging
/// parameters.
pub fn key_columns(storage: &dyn Storage) -> BTreeSet<String> {
    let mut columns = BTreeSet::new();
    if let Some(expr) = storage.partition_key() {
        columns.extend(expr.required_source_columns());
    }
    if let Some(expr) = storage.sorting_key() {
        columns.extend(expr.required_source_columns());
    }
    if let Some(sign) = storage.sign_column() {
        columns.insert(sign.to_string());
    }
    if let Some(version) = storage.version_column() {
        columns.insert(version.to_string());
    }
    columns
}

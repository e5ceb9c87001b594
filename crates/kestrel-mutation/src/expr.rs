use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools as _;

/// A scalar literal.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ScalarValue {
    Bool(bool),
    UInt64(u64),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(value) => write!(f, "{value}"),
            ScalarValue::UInt64(value) => write!(f, "{value}"),
            ScalarValue::Int64(value) => write!(f, "{value}"),
            ScalarValue::Float64(value) => write!(f, "{value}"),
            ScalarValue::String(value) => write!(f, "'{value}'"),
        }
    }
}

/// A resolved scalar expression over a storage's columns.
///
/// The SQL parser lives elsewhere; mutation commands arrive with their
/// predicates and assignments already in this form. Function calls are kept
/// by name, so the planner can synthesize wrappers (`not`, `if`, `CAST`)
/// without a function registry.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    /// Reference to a column.
    Column(String),
    Literal(ScalarValue),
    /// A call to a named function.
    Call { name: String, args: Vec<Expr> },
    /// Conversion to a named type.
    Cast { expr: Box<Expr>, to_type: String },
    /// `if(condition, then, otherwise)`, evaluated per row.
    If {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Membership in a set that a subquery computes before the pipeline
    /// runs; `set_id` names the uncomputed set.
    InSet { expr: Box<Expr>, set_id: String },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn not(self) -> Self {
        Expr::call("not", vec![self])
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::call("and", vec![self, other])
    }

    pub fn or(self, other: Expr) -> Self {
        Expr::call("or", vec![self, other])
    }

    pub fn cast(self, to_type: impl Into<String>) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            to_type: to_type.into(),
        }
    }

    pub fn if_then_else(condition: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::If {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    /// The canonical column name this expression produces in a block.
    pub fn column_name(&self) -> String {
        self.to_string()
    }

    /// The source columns this expression reads, resolved transitively.
    ///
    /// This is the dependency-resolution half of the external analyzer's
    /// contract; the planner uses it to wire stage outputs to stage inputs.
    pub fn required_source_columns(&self) -> BTreeSet<String> {
        let mut columns = BTreeSet::new();
        self.collect_source_columns(&mut columns);
        columns
    }

    fn collect_source_columns(&self, columns: &mut BTreeSet<String>) {
        match self {
            Expr::Column(name) => {
                columns.insert(name.clone());
            }
            Expr::Literal(_) => {}
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_source_columns(columns);
                }
            }
            Expr::Cast { expr, .. } => expr.collect_source_columns(columns),
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_source_columns(columns);
                then.collect_source_columns(columns);
                otherwise.collect_source_columns(columns);
            }
            Expr::InSet { expr, .. } => expr.collect_source_columns(columns),
        }
    }

    /// Names of the uncomputed sets this expression references.
    pub fn referenced_sets(&self) -> BTreeSet<String> {
        let mut sets = BTreeSet::new();
        self.collect_sets(&mut sets);
        sets
    }

    fn collect_sets(&self, sets: &mut BTreeSet<String>) {
        match self {
            Expr::Column(_) | Expr::Literal(_) => {}
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_sets(sets);
                }
            }
            Expr::Cast { expr, .. } => expr.collect_sets(sets),
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_sets(sets);
                then.collect_sets(sets);
                otherwise.collect_sets(sets);
            }
            Expr::InSet { expr, set_id } => {
                expr.collect_sets(sets);
                sets.insert(set_id.clone());
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{name}"),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Call { name, args } => {
                write!(f, "{name}({})", args.iter().join(", "))
            }
            Expr::Cast { expr, to_type } => write!(f, "CAST({expr}, '{to_type}')"),
            Expr::If {
                condition,
                then,
                otherwise,
            } => write!(f, "if({condition}, {then}, {otherwise})"),
            Expr::InSet { expr, set_id } => write!(f, "in({expr}, {set_id})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_name_rendering() {
        let predicate = Expr::call(
            "greater",
            vec![Expr::column("k"), Expr::Literal(ScalarValue::UInt64(10))],
        );
        assert_eq!(predicate.column_name(), "greater(k, 10)");
        assert_eq!(predicate.clone().not().column_name(), "not(greater(k, 10))");

        let updated = Expr::if_then_else(
            predicate,
            Expr::call(
                "plus",
                vec![Expr::column("v"), Expr::Literal(ScalarValue::UInt64(1))],
            ),
            Expr::column("v"),
        )
        .cast("UInt32");
        assert_eq!(
            updated.column_name(),
            "CAST(if(greater(k, 10), plus(v, 1), v), 'UInt32')"
        );
    }

    #[test]
    fn test_required_source_columns() {
        let expr = Expr::if_then_else(
            Expr::call(
                "greater",
                vec![Expr::column("k"), Expr::Literal(ScalarValue::UInt64(10))],
            ),
            Expr::call("plus", vec![Expr::column("v"), Expr::column("w")]),
            Expr::column("v"),
        );
        let columns: Vec<String> = expr.required_source_columns().into_iter().collect();
        assert_eq!(columns, vec!["k".to_string(), "v".to_string(), "w".to_string()]);
    }

    #[test]
    fn test_referenced_sets() {
        let expr = Expr::InSet {
            expr: Box::new(Expr::column("user")),
            set_id: "__set_0".to_string(),
        }
        .and(Expr::column("flag"));
        let sets: Vec<String> = expr.referenced_sets().into_iter().collect();
        assert_eq!(sets, vec!["__set_0".to_string()]);
    }
}

use index_vec::IndexVec;

use crate::Expr;

index_vec::define_index_type! {
    /// The identifier (index) of a pipeline step.
    pub struct StepId = u32;

    DISPLAY_FORMAT = "{}";
}

/// One action inside an expression block.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ExpressionAction {
    /// Evaluate `expr` into a column named `output`.
    Compute { expr: Expr, output: String },
    /// Replace column `target` with the contents of column `source`.
    CopyColumn { source: String, target: String },
    /// Restrict the block to exactly these columns.
    Project { columns: Vec<String> },
}

/// An ordered list of expression actions applied to each block.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExpressionActions {
    pub actions: Vec<ExpressionAction>,
}

/// One step of the compiled mutation pipeline.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PipelineStep {
    /// Evaluate subqueries into the named sets before later steps run.
    CreatingSets { set_ids: Vec<String> },
    /// Compute the filter column and drop rows where it is false.
    Filter {
        actions: ExpressionActions,
        filter_column: String,
    },
    /// Compute or replace columns.
    Expression { actions: ExpressionActions },
    /// Materialize the stream to stabilize column values.
    Materialize,
}

/// The source SELECT the first stage compiles into.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SelectDescription {
    /// Projected columns, sorted by name.
    pub columns: Vec<String>,
    /// Conjunction of the first stage's filters, if any.
    pub where_predicate: Option<Expr>,
}

/// The compiled mutation pipeline: a SELECT over the storage followed by
/// filter and expression steps, closed by a materializing step.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MutationPlan {
    pub select: SelectDescription,
    pub steps: IndexVec<StepId, PipelineStep>,
}

impl MutationPlan {
    pub fn yaml(&self) -> impl std::fmt::Display + '_ {
        PlanYaml(self)
    }
}

/// Prints a plan as Yaml.
struct PlanYaml<'a>(&'a MutationPlan);

impl<'a> std::fmt::Display for PlanYaml<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let yaml = serde_yaml::to_string(self.0).map_err(|e| {
            tracing::error!("Failed to write plan YAML: {e:?}");
            std::fmt::Error
        })?;
        write!(f, "{yaml}")
    }
}

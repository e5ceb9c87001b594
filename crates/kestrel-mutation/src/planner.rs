use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use index_vec::IndexVec;
use kestrel_events::Event;

use crate::{
    key_columns, Error, Expr, ExpressionAction, ExpressionActions, MutationCommand, MutationPlan,
    PipelineStep, ScanOptions, SelectDescription, Storage, StepId, TableColumn,
};

/// One step of the staged decomposition.
///
/// A stage carries either filters (negations of DELETE predicates) or a map
/// of column to replacement expression; filters may only appear on a stage
/// whose update map is empty.
#[derive(Default)]
struct Stage {
    filters: Vec<Expr>,
    column_to_updated: BTreeMap<String, Expr>,
    output_columns: BTreeSet<String>,
}

/// Compiles a sequence of mutation commands against one storage into a
/// [`MutationPlan`].
pub struct MutationPlanner {
    storage: Arc<dyn Storage>,
    commands: Vec<MutationCommand>,
}

impl MutationPlanner {
    pub fn new(storage: Arc<dyn Storage>, commands: Vec<MutationCommand>) -> Self {
        Self { storage, commands }
    }

    /// Validate the commands, break them into stages, and assemble the
    /// pipeline. Deterministic for a fixed schema and command list.
    pub fn plan(&self) -> error_stack::Result<MutationPlan, Error> {
        let mut stages = self.prepare()?;
        let plan = self.compile(&mut stages);
        kestrel_events::increment(Event::MutationPlansCompiled);
        Ok(plan)
    }

    fn physical_columns(&self) -> impl Iterator<Item = &TableColumn> {
        self.storage
            .columns()
            .iter()
            .filter(|column| column.is_physical())
    }

    fn physical_column(&self, name: &str) -> Option<&TableColumn> {
        self.physical_columns().find(|column| column.name == name)
    }

    /// Break the command sequence into stages.
    fn prepare(&self) -> error_stack::Result<Vec<Stage>, Error> {
        if self.commands.is_empty() {
            return Err(error_stack::report!(Error::Internal(
                "empty mutation commands list".to_string()
            )));
        }

        let mut updated_columns = BTreeSet::new();
        for command in &self.commands {
            if let MutationCommand::Update { assignments, .. } = command {
                updated_columns.extend(assignments.keys().cloned());
            }
        }

        // Which updated columns feed which materialized columns and data
        // skipping indices; those must be recalculated after the update.
        let mut column_to_affected_materialized: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut affected_indices_columns = BTreeSet::new();
        if !updated_columns.is_empty() {
            for column in self.physical_columns() {
                let Some(default) = &column.default else {
                    continue;
                };
                if !column.is_materialized() {
                    continue;
                }
                for dependency in default.expression.required_source_columns() {
                    if updated_columns.contains(&dependency) {
                        column_to_affected_materialized
                            .entry(dependency)
                            .or_default()
                            .push(column.name.clone());
                    }
                }
            }
            for index in self.storage.indices() {
                let required = index.expression.required_source_columns();
                if required
                    .iter()
                    .any(|column| updated_columns.contains(column))
                {
                    affected_indices_columns.extend(required);
                }
            }

            self.validate_update_columns(&updated_columns, &column_to_affected_materialized)?;
        }

        let mut stages: Vec<Stage> = Vec::new();
        for command in &self.commands {
            match command {
                MutationCommand::Delete { predicate } => {
                    if stages
                        .last()
                        .map_or(true, |stage| !stage.column_to_updated.is_empty())
                    {
                        stages.push(Stage::default());
                    }
                    stages
                        .last_mut()
                        .expect("a stage was just ensured")
                        .filters
                        .push(predicate.clone().not());
                }
                MutationCommand::Update {
                    assignments,
                    predicate,
                } => {
                    if stages
                        .last()
                        .map_or(true, |stage| !stage.column_to_updated.is_empty())
                    {
                        stages.push(Stage::default());
                    }
                    // The first stage only supports filtering; updates start
                    // from the second.
                    if stages.len() == 1 {
                        stages.push(Stage::default());
                    }

                    let mut affected_materialized = BTreeSet::new();
                    for (column, update_expr) in assignments {
                        if let Some(materialized) = column_to_affected_materialized.get(column) {
                            affected_materialized.extend(materialized.iter().cloned());
                        }

                        let data_type = self
                            .physical_column(column)
                            .map(|column| column.data_type.clone())
                            .ok_or_else(|| {
                                error_stack::report!(Error::NoSuchColumn {
                                    column: column.clone(),
                                })
                            })?;

                        // The replacement expression's type may narrow or
                        // widen the column, so the result is cast back.
                        let updated = Expr::if_then_else(
                            predicate.clone(),
                            update_expr.clone(),
                            Expr::column(column.clone()),
                        )
                        .cast(data_type);
                        stages
                            .last_mut()
                            .expect("a stage was just ensured")
                            .column_to_updated
                            .insert(column.clone(), updated);
                    }

                    if !affected_materialized.is_empty() {
                        let mut stage = Stage::default();
                        for column in self.physical_columns() {
                            if !column.is_materialized()
                                || !affected_materialized.contains(&column.name)
                            {
                                continue;
                            }
                            let expression = column
                                .default
                                .as_ref()
                                .expect("materialized columns have a default")
                                .expression
                                .clone();
                            stage
                                .column_to_updated
                                .insert(column.name.clone(), expression);
                        }
                        stages.push(stage);
                    }
                }
                MutationCommand::MaterializeIndex { name } => {
                    let index = self
                        .storage
                        .indices()
                        .iter()
                        .find(|index| index.name == *name)
                        .ok_or_else(|| {
                            error_stack::report!(Error::UnknownIndex { name: name.clone() })
                        })?;
                    affected_indices_columns.extend(index.expression.required_source_columns());
                }
                MutationCommand::Unknown { kind } => {
                    return Err(error_stack::report!(Error::UnknownMutationCommand {
                        kind: kind.clone(),
                    }));
                }
            }
        }

        if !affected_indices_columns.is_empty() {
            // A no-op projection per column, forcing the new column stream
            // through index recomputation.
            let mut stage = Stage::default();
            for column in &affected_indices_columns {
                stage
                    .column_to_updated
                    .insert(column.clone(), Expr::column(column.clone()));
            }
            stages.push(stage);
        }

        if stages.is_empty() {
            return Err(error_stack::report!(Error::Internal(
                "mutation commands produced no stages".to_string()
            )));
        }
        Ok(stages)
    }

    fn validate_update_columns(
        &self,
        updated_columns: &BTreeSet<String>,
        column_to_affected_materialized: &BTreeMap<String, Vec<String>>,
    ) -> error_stack::Result<(), Error> {
        let key_columns = key_columns(self.storage.as_ref());

        for column_name in updated_columns {
            match self.physical_column(column_name) {
                Some(column) if column.is_materialized() => {
                    return Err(error_stack::report!(Error::CannotUpdateColumn {
                        column: column_name.clone(),
                        reason: "the column is MATERIALIZED".to_string(),
                    }));
                }
                Some(_) => {}
                None => {
                    return Err(error_stack::report!(Error::NoSuchColumn {
                        column: column_name.clone(),
                    }));
                }
            }

            if key_columns.contains(column_name) {
                return Err(error_stack::report!(Error::CannotUpdateColumn {
                    column: column_name.clone(),
                    reason: "the column is a key column".to_string(),
                }));
            }

            if let Some(materialized) = column_to_affected_materialized.get(column_name) {
                for materialized in materialized {
                    if key_columns.contains(materialized) {
                        return Err(error_stack::report!(Error::CannotUpdateColumn {
                            column: column_name.clone(),
                            reason: format!(
                                "it affects MATERIALIZED column '{materialized}', \
                                 which is a key column"
                            ),
                        }));
                    }
                }
            }
        }
        Ok(())
    }

    /// Compute stage inputs/outputs and assemble the pipeline.
    fn compile(&self, stages: &mut [Stage]) -> MutationPlan {
        let all_columns: BTreeSet<String> = self
            .physical_columns()
            .map(|column| column.name.clone())
            .collect();

        // Forward: which columns each stage outputs. A filtering stage must
        // pass everything through; an updating stage passes its inputs plus
        // the columns it rewrites.
        for i in 0..stages.len() {
            if !stages[i].filters.is_empty() {
                stages[i].output_columns = all_columns.clone();
                continue;
            }
            if i > 0 {
                let previous = stages[i - 1].output_columns.clone();
                stages[i].output_columns = previous;
            }
            if stages[i].output_columns.len() < all_columns.len() {
                let updated: Vec<String> = stages[i].column_to_updated.keys().cloned().collect();
                stages[i].output_columns.extend(updated);
            }
        }

        // Backward: propagate each stage's required inputs into the previous
        // stage's outputs. Columns a stage rewrites are produced inside it
        // and need not flow in.
        for i in (1..stages.len()).rev() {
            let mut required = BTreeSet::new();
            for filter in &stages[i].filters {
                required.extend(filter.required_source_columns());
            }
            for expr in stages[i].column_to_updated.values() {
                required.extend(expr.required_source_columns());
            }
            for column in &stages[i].output_columns {
                if !stages[i].column_to_updated.contains_key(column) {
                    required.insert(column.clone());
                }
            }
            stages[i - 1].output_columns.extend(required);
        }

        // Stage 0 becomes a SELECT over the storage.
        let where_predicate = stages[0].filters.iter().cloned().reduce(Expr::and);
        let select = SelectDescription {
            columns: stages[0].output_columns.iter().cloned().collect(),
            where_predicate,
        };

        // Later stages become filter and expression steps.
        let mut steps: IndexVec<StepId, PipelineStep> = IndexVec::new();
        for stage in stages[1..].iter() {
            let set_ids: BTreeSet<String> = stage
                .filters
                .iter()
                .chain(stage.column_to_updated.values())
                .flat_map(Expr::referenced_sets)
                .collect();
            if !set_ids.is_empty() {
                steps.push(PipelineStep::CreatingSets {
                    set_ids: set_ids.into_iter().collect(),
                });
            }

            for filter in &stage.filters {
                let filter_column = filter.column_name();
                steps.push(PipelineStep::Filter {
                    actions: ExpressionActions {
                        actions: vec![ExpressionAction::Compute {
                            expr: filter.clone(),
                            output: filter_column.clone(),
                        }],
                    },
                    filter_column,
                });
            }

            if !stage.column_to_updated.is_empty() {
                let mut actions = Vec::new();
                for (column, expr) in &stage.column_to_updated {
                    let output = expr.column_name();
                    actions.push(ExpressionAction::Compute {
                        expr: expr.clone(),
                        output: output.clone(),
                    });
                    if output != *column {
                        actions.push(ExpressionAction::CopyColumn {
                            source: output,
                            target: column.clone(),
                        });
                    }
                }
                steps.push(PipelineStep::Expression {
                    actions: ExpressionActions { actions },
                });
            }

            steps.push(PipelineStep::Expression {
                actions: ExpressionActions {
                    actions: vec![ExpressionAction::Project {
                        columns: stage.output_columns.iter().cloned().collect(),
                    }],
                },
            });
        }

        steps.push(PipelineStep::Materialize);

        MutationPlan { select, steps }
    }
}

/// Whether the commands would touch any row at all.
///
/// A command without a predicate touches everything. Otherwise the
/// predicates are OR-ed into one counting scan, forced single-threaded and
/// non-uniform: the count can overestimate the affected rows (an earlier
/// UPDATE can change what later predicates match), but zero is definitive.
pub fn is_storage_touched_by_mutations(
    storage: &dyn Storage,
    commands: &[MutationCommand],
) -> error_stack::Result<bool, Error> {
    if commands.is_empty() {
        return Ok(false);
    }

    let mut predicates = Vec::new();
    for command in commands {
        match command.predicate() {
            None => return Ok(true),
            Some(predicate) => predicates.push(predicate.clone()),
        }
    }

    let Some(predicate) = predicates.into_iter().reduce(Expr::or) else {
        return Ok(false);
    };
    let options = ScanOptions {
        max_threads: 1,
        uniform_read_distribution: false,
    };
    let count = storage.count_rows_matching(Some(&predicate), &options)?;
    Ok(count != 0)
}

//! Final ordering of execute commands.
//!
//! Static data loads are split off first and run last, ordered by their `order` attribute. The
//! remaining commands run as drops, then adds ordered by the dependency graph.

use std::sync::Arc;

use tracing::debug;

use crate::change::Change;
use crate::command::ExecuteCommand;
use crate::error::DeployResult;
use crate::graph::{GraphEnricher, GraphSorter, SortableDependencyGroup, VertexLabel};
use crate::platform::Platform;

impl SortableDependencyGroup for ExecuteCommand {
    fn components(&self) -> &[Change] {
        self.changes()
    }
}

impl VertexLabel for ExecuteCommand {
    fn vertex_label(&self) -> String {
        self.description()
    }
}

/// Orders execute commands for deployment.
#[derive(Debug, Clone)]
pub struct ChangeCommandSorter {
    enricher: GraphEnricher,
    drop_order_required: bool,
}

impl ChangeCommandSorter {
    /// Sorter using the platform's name conversion and drop ordering rules.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        let drop_order_required = platform.is_drop_order_required();
        let enricher = GraphEnricher::new(Arc::new(move |name: &str| platform.convert_db_object_name(name)));
        Self {
            enricher,
            drop_order_required,
        }
    }

    /// Order the commands: drops, then adds, then data loads.
    pub fn sort(&self, commands: Vec<ExecuteCommand>, rollback: bool) -> DeployResult<Vec<ExecuteCommand>> {
        let (data, others): (Vec<_>, Vec<_>) = commands.into_iter().partition(ExecuteCommand::is_static_data);
        let (drops, adds): (Vec<_>, Vec<_>) = others.into_iter().partition(|c| c.drop);
        debug!(
            drops = drops.len(),
            adds = adds.len(),
            data = data.len(),
            rollback,
            "Sorting execute commands"
        );

        let mut sorted = self.sort_drops(drops)?;
        sorted.extend(self.sort_adds(adds, rollback)?);
        sorted.extend(sort_data(data));
        Ok(sorted)
    }

    /// Drops run in reverse of the order their objects would be created in.
    fn sort_drops(&self, drops: Vec<ExecuteCommand>) -> DeployResult<Vec<ExecuteCommand>> {
        let (rerunnable, mut incremental): (Vec<_>, Vec<_>) = drops
            .into_iter()
            .partition(|c| c.changes().first().is_some_and(Change::is_rerunnable));

        let mut rerunnable = if self.drop_order_required && !rerunnable.is_empty() {
            let graph = self.enricher.build_graph(rerunnable, false)?;
            let order = GraphSorter::sort_indices_by(&graph, None, compare_drop_keys)?;
            let mut slots: Vec<Option<ExecuteCommand>> = graph.into_vertices().into_iter().map(Some).collect();
            order
                .into_iter()
                .filter_map(|index| slots.get_mut(index.index()).and_then(Option::take))
                .collect()
        } else {
            let mut rerunnable = rerunnable;
            rerunnable.sort_by(compare_drop_keys);
            rerunnable
        };
        incremental.sort_by(|a, b| object_name(a).cmp(object_name(b)));

        // Both lists are merged on their position, incremental drops first at equal positions.
        let mut positioned: Vec<(usize, ExecuteCommand)> = Vec::with_capacity(rerunnable.len() + incremental.len());
        positioned.extend(incremental.drain(..).enumerate());
        positioned.extend(rerunnable.drain(..).enumerate());
        positioned.sort_by_key(|(position, _)| *position);
        Ok(positioned.into_iter().rev().map(|(_, command)| command).collect())
    }

    /// Adds follow the dependency graph over their changes; implicit same-object edges are
    /// reversed on rollback so later changes of an object are undone first.
    fn sort_adds(&self, adds: Vec<ExecuteCommand>, rollback: bool) -> DeployResult<Vec<ExecuteCommand>> {
        if adds.is_empty() {
            return Ok(adds);
        }

        let graph = self.enricher.build_graph(adds, rollback)?;
        let order = GraphSorter::sort_indices_by(&graph, None, |a, b| first_sort_key(a).cmp(&first_sort_key(b)))?;

        let mut slots: Vec<Option<ExecuteCommand>> = graph.into_vertices().into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .filter_map(|index| slots.get_mut(index.index()).and_then(Option::take))
            .collect())
    }
}

/// Data loads keep their relative order apart from the `order` attribute.
fn sort_data(mut data: Vec<ExecuteCommand>) -> Vec<ExecuteCommand> {
    data.sort_by_key(ExecuteCommand::order);
    data
}

fn compare_drop_keys(a: &ExecuteCommand, b: &ExecuteCommand) -> std::cmp::Ordering {
    drop_priority(a)
        .cmp(&drop_priority(b))
        .then_with(|| object_name(a).cmp(object_name(b)))
}

fn drop_priority(command: &ExecuteCommand) -> i32 {
    command
        .changes()
        .first()
        .map_or(0, |c| c.change_type().deploy_order_priority)
}

fn object_name(command: &ExecuteCommand) -> &str {
    command.changes().first().map_or("", Change::object_name)
}

fn first_sort_key(command: &ExecuteCommand) -> Option<(i32, &str, &str, &str, i32, &str)> {
    command.changes().first().map(Change::sort_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeType, CodeDependency};
    use crate::platform::GenericPlatform;
    use pretty_assertions::assert_eq;

    fn sorter(drop_order_required: bool) -> ChangeCommandSorter {
        ChangeCommandSorter::new(Arc::new(
            GenericPlatform::default().with_drop_order_required(drop_order_required),
        ))
    }

    fn table_change(object: &str, change: &str, order_within_object: i32) -> Change {
        Change::incremental(ChangeType::table(), "s1", object, change, order_within_object, format!("{object}.{change}"))
    }


    fn labels(commands: &[ExecuteCommand]) -> Vec<String> {
        commands
            .iter()
            .flat_map(|c| c.changes().iter().map(|ch| format!("{}.{}", ch.object_name(), ch.change_name())))
            .collect()
    }

    #[test]
    fn test_adds_follow_dependency_graph() {
        let a1 = table_change("aTab", "1", 1);
        let a2 = table_change("aTab", "2", 2);
        let a3 = table_change("aTab", "3", 3);
        let b1 = table_change("bTab", "1", 1);
        let b2 = table_change("bTab", "2", 2).with_dependencies([CodeDependency::explicit("aTab.3")]);

        let commands = vec![b2, a3, b1, a2, a1].into_iter().map(ExecuteCommand::deploy).collect();
        let sorted = sorter(false).sort(commands, false).unwrap();

        let order = labels(&sorted);
        let pos = |label: &str| order.iter().position(|l| l == label).unwrap();
        assert!(pos("aTab.1") < pos("aTab.2"));
        assert!(pos("aTab.2") < pos("aTab.3"));
        assert!(pos("aTab.3") < pos("bTab.2"));
        assert!(pos("bTab.1") < pos("bTab.2"));
    }

    #[test]
    fn test_rollback_undeploys_later_changes_first() {
        let undeploy = |change: &str, order: i32| {
            ExecuteCommand::undeploy(table_change("aTab", change, order).with_rollback(format!("undo {change}")), "rollback")
        };
        let commands = vec![undeploy("2", 2), undeploy("3", 3), undeploy("4", 4)];

        let sorted = sorter(false).sort(commands.clone(), true).unwrap();
        assert_eq!(labels(&sorted), vec!["aTab.4", "aTab.3", "aTab.2"]);

        let forward = sorter(false).sort(commands, false).unwrap();
        assert_eq!(labels(&forward), vec!["aTab.2", "aTab.3", "aTab.4"]);
    }

    #[test]
    fn test_dropped_static_data_runs_with_data_loads() {
        let add = table_change("t", "1", 1);
        let dropped_data = ExecuteCommand::drop_object(Change::rerunnable(ChangeType::static_data(), "s1", "lookup", "rows"));
        let dropped_view = ExecuteCommand::drop_object(Change::rerunnable(ChangeType::view(), "s1", "v", "select 1"));

        let sorted = sorter(false)
            .sort(vec![dropped_data, ExecuteCommand::deploy(add), dropped_view], false)
            .unwrap();
        assert_eq!(labels(&sorted), vec!["v.n/a", "t.1", "lookup.n/a"]);
    }

    #[test]
    fn test_phases_are_drops_adds_data() {
        let data = Change::rerunnable(ChangeType::static_data(), "s1", "lookup", "rows");
        let add = table_change("t", "1", 1);
        let dropped_view = Change::rerunnable(ChangeType::view(), "s1", "v", "select 1");

        let commands = vec![
            ExecuteCommand::deploy(data),
            ExecuteCommand::deploy(add),
            ExecuteCommand::drop_object(dropped_view),
        ];
        let sorted = sorter(false).sort(commands, false).unwrap();
        assert_eq!(labels(&sorted), vec!["v.n/a", "t.1", "lookup.n/a"]);
    }

    #[test]
    fn test_drops_are_reversed() {
        let view = |name: &str| ExecuteCommand::drop_object(Change::rerunnable(ChangeType::view(), "s1", name, "x"));
        let sp = ExecuteCommand::drop_object(Change::rerunnable(ChangeType::sp(), "s1", "proc", "x"));
        let sorted = sorter(false).sort(vec![view("a"), sp, view("b")], false).unwrap();
        // Ascending (priority, name) is [a, b, proc]; drops run in reverse.
        assert_eq!(labels(&sorted), vec!["proc.n/a", "b.n/a", "a.n/a"]);
    }

    #[test]
    fn test_drop_order_follows_dependencies_when_required() {
        let base = Change::rerunnable(ChangeType::view(), "s1", "zbase", "select 1");
        let top = Change::rerunnable(ChangeType::view(), "s1", "atop", "select from zbase")
            .with_dependencies([CodeDependency::discovered("zbase")]);
        let commands = vec![ExecuteCommand::drop_object(base), ExecuteCommand::drop_object(top)];

        let sorted = sorter(true).sort(commands.clone(), false).unwrap();
        assert_eq!(labels(&sorted), vec!["atop.n/a", "zbase.n/a"]);

        let unordered = sorter(false).sort(commands, false).unwrap();
        assert_eq!(labels(&unordered), vec!["zbase.n/a", "atop.n/a"]);
    }

    #[test]
    fn test_data_sorted_by_order() {
        let data = |name: &str, order: i32| {
            ExecuteCommand::deploy(Change::rerunnable(ChangeType::static_data(), "s1", name, "rows").with_order(order))
        };
        let sorted = sorter(false)
            .sort(vec![data("late", 900), data("default", 500), data("early", 1)], false)
            .unwrap();
        assert_eq!(labels(&sorted), vec!["early.n/a", "default.n/a", "late.n/a"]);
    }

    #[test]
    fn test_sort_is_deterministic() {
        let build = || {
            (0..8)
                .rev()
                .map(|i| ExecuteCommand::deploy(table_change(&format!("t{i}"), "1", 1)))
                .collect::<Vec<_>>()
        };
        let first = labels(&sorter(false).sort(build(), false).unwrap());
        for _ in 0..5 {
            assert_eq!(labels(&sorter(false).sort(build(), false).unwrap()), first);
        }
        assert_eq!(first[0], "t0.1");
    }
}

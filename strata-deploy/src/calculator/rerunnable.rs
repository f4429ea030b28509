//! Calculators for rerunnable change types.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, trace};

use crate::change::{Change, ChangeType, ObjectKey};
use crate::command::{AuditCommand, ChangeCommand, ExecuteCommand};
use crate::error::DeployResult;
use crate::graph::{GraphEnricher, GraphSorter};
use crate::pair::{ChangePair, PairState};

/// Pairs split into removed and changed objects.
#[derive(Debug, Default)]
struct RerunnableObjects {
    dropped: Vec<Change>,
    changed: Vec<Change>,
}

impl RerunnableObjects {
    fn classify(pairs: Vec<ChangePair>) -> Self {
        let mut objects = Self::default();
        for pair in pairs {
            match pair.into_state() {
                PairState::DeployedOnly(deployed) => objects.dropped.push(deployed),
                PairState::SourceOnly(source) => objects.changed.push(source),
                PairState::Both { source, deployed } => {
                    if source.accepts_hash(&deployed.content_hash) {
                        trace!(change = %source.key, "Source and deployed hashes match");
                    } else {
                        objects.changed.push(source);
                    }
                }
            }
        }
        objects
    }
}

/// Deploys changed rerunnable objects one by one, dropping objects removed from source.
#[derive(Debug, Clone)]
pub struct RerunnableCalculator {
    enricher: GraphEnricher,
}

impl RerunnableCalculator {
    /// Calculator resolving dependencies through `enricher`.
    pub fn new(enricher: GraphEnricher) -> Self {
        Self { enricher }
    }

    /// Calculate the commands for every pair of one rerunnable change type.
    pub fn calculate(
        &self,
        change_type: &ChangeType,
        pairs: Vec<ChangePair>,
        all_sources: &[Change],
    ) -> DeployResult<Vec<ChangeCommand>> {
        let objects = RerunnableObjects::classify(pairs);
        let mut commands: Vec<ChangeCommand> = objects
            .dropped
            .into_iter()
            .map(|dropped| ExecuteCommand::drop_object(dropped).into())
            .collect();

        if change_type.dependent_object_recalculation {
            commands.extend(self.recalculated_dependents(change_type, all_sources, &objects.changed)?);
        }

        commands.extend(
            objects
                .changed
                .into_iter()
                .map(|changed| ExecuteCommand::deploy(changed).into()),
        );
        Ok(commands)
    }

    /// Unchanged objects of the same type that depend on a changed object and must be redeployed.
    fn recalculated_dependents(
        &self,
        change_type: &ChangeType,
        all_sources: &[Change],
        changed: &[Change],
    ) -> DeployResult<Vec<ChangeCommand>> {
        let same_type: Vec<Change> = all_sources
            .iter()
            .filter(|c| c.change_type().name == change_type.name)
            .cloned()
            .collect();
        if same_type.is_empty() {
            return Ok(Vec::new());
        }

        let graph = self.enricher.build_graph(same_type, false)?;
        let by_key: HashMap<&ObjectKey, _> = graph
            .indices()
            .map(|index| (graph.vertex(index).object_key(), index))
            .collect();

        let changed_keys: BTreeSet<&ObjectKey> = changed
            .iter()
            .filter(|c| c.change_type().name == change_type.name)
            .map(Change::object_key)
            .collect();

        let mut added: BTreeSet<ObjectKey> = BTreeSet::new();
        let mut commands = Vec::new();
        for trigger in changed
            .iter()
            .filter(|c| c.change_type().name == change_type.name && !c.create_or_replace)
        {
            let Some(start) = by_key.get(trigger.object_key()) else {
                continue;
            };
            for index in graph.reachable_dependents(&[*start]) {
                let dependent = graph.vertex(index);
                if changed_keys.contains(dependent.object_key()) || !added.insert(dependent.object_key().clone()) {
                    continue;
                }
                debug!(object = %dependent.object_key(), trigger = %trigger.object_key(), "Redeploying dependent object");
                commands.push(
                    ExecuteCommand::deploy_with_reason(
                        dependent.clone(),
                        format!(
                            "Re-deploying this object due to change in dependent object [{}]",
                            trigger.object_name()
                        ),
                    )
                    .into(),
                );
            }
        }
        Ok(commands)
    }
}

/// Deploys changed objects of a type together, one command per connected component.
#[derive(Debug, Clone)]
pub struct GroupedCalculator {
    enricher: GraphEnricher,
}

impl GroupedCalculator {
    /// Calculator resolving dependencies through `enricher`.
    pub fn new(enricher: GraphEnricher) -> Self {
        Self { enricher }
    }

    /// Calculate the commands for every pair of one grouped change type.
    pub fn calculate(&self, pairs: Vec<ChangePair>) -> DeployResult<Vec<ChangeCommand>> {
        let mut objects = RerunnableObjects::classify(pairs);

        objects
            .dropped
            .sort_by(|a, b| a.object_name().cmp(b.object_name()));
        let mut commands: Vec<ChangeCommand> = objects
            .dropped
            .into_iter()
            .map(|dropped| AuditCommand::unmanage(dropped, "object removed from source; no longer managed").into())
            .collect();

        if objects.changed.is_empty() {
            return Ok(commands);
        }

        let graph = self.enricher.build_graph(objects.changed, false)?;
        for component in graph.connected_components() {
            let sorted = GraphSorter::sort_subset_by(&graph, &component, |a, b| a.sort_key().cmp(&b.sort_key()))?;
            let changes: Vec<Change> = sorted.into_iter().cloned().collect();
            commands.push(ExecuteCommand::deploy_group(changes).into());
        }
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::CodeDependency;
    use crate::command::ExecuteAction;
    use crate::pair::ChangePairs;
    use std::sync::Arc;

    fn enricher() -> GraphEnricher {
        GraphEnricher::new(Arc::new(|n: &str| n.to_uppercase()))
    }

    fn view(name: &str, content: &str, deps: &[&str]) -> Change {
        Change::rerunnable(ChangeType::view(), "s1", name, content)
            .with_dependencies(deps.iter().map(|d| CodeDependency::discovered(*d)))
    }

    fn deploy_names(commands: &[ChangeCommand]) -> Vec<String> {
        commands
            .iter()
            .filter_map(|c| match c {
                ChangeCommand::Execute(ExecuteCommand {
                    action: ExecuteAction::Deploy { change, .. },
                    ..
                }) => Some(change.object_name().to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_changed_view_is_redeployed_not_warned() {
        let deployed = view("v", "select 1", &[]);
        let source = view("v", "select 2", &[]);
        assert_ne!(deployed.content_hash, source.content_hash);

        let pairs = ChangePairs::build(vec![deployed], vec![source.clone()]).unwrap();
        let commands = RerunnableCalculator::new(enricher())
            .calculate(&ChangeType::view(), pairs, &[source])
            .unwrap();

        assert_eq!(deploy_names(&commands), vec!["v"]);
        assert!(commands.iter().all(|c| matches!(c, ChangeCommand::Execute(_))));
    }

    #[test]
    fn test_removed_view_is_dropped() {
        let pairs = ChangePairs::build(vec![view("v", "select 1", &[])], vec![]).unwrap();
        let commands = RerunnableCalculator::new(enricher())
            .calculate(&ChangeType::view(), pairs, &[])
            .unwrap();

        match &commands[..] {
            [ChangeCommand::Execute(cmd)] => {
                assert!(matches!(cmd.action, ExecuteAction::DropObject { .. }));
                assert!(cmd.drop);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dependent_objects_are_recalculated() {
        let view_type = ChangeType::view().with_dependent_object_recalculation(true);
        let v1 = Change::rerunnable(view_type.clone(), "s1", "v1", "select 1");
        let v2 = Change::rerunnable(view_type.clone(), "s1", "v2", "select from v1")
            .with_dependencies([CodeDependency::discovered("v1")]);
        let v3 = Change::rerunnable(view_type.clone(), "s1", "v3", "select from v2")
            .with_dependencies([CodeDependency::discovered("v2")]);
        let sources = vec![v1.clone(), v2.clone(), v3.clone()];

        let deployed_v1 = Change::rerunnable(view_type.clone(), "s1", "v1", "select 0");
        let pairs = ChangePairs::build(vec![deployed_v1, v2.clone(), v3.clone()], sources.clone()).unwrap();

        let commands = RerunnableCalculator::new(enricher())
            .calculate(&view_type, pairs, &sources)
            .unwrap();

        assert_eq!(deploy_names(&commands), vec!["v2", "v3", "v1"]);
        match &commands[0] {
            ChangeCommand::Execute(ExecuteCommand {
                action: ExecuteAction::Deploy { reason: Some(reason), .. },
                ..
            }) => assert!(reason.contains("[v1]")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_create_or_replace_does_not_trigger_recalculation() {
        let view_type = ChangeType::view().with_dependent_object_recalculation(true);
        let v1 = Change::rerunnable(view_type.clone(), "s1", "v1", "select 1").with_create_or_replace(true);
        let v2 = Change::rerunnable(view_type.clone(), "s1", "v2", "select from v1")
            .with_dependencies([CodeDependency::discovered("v1")]);
        let sources = vec![v1.clone(), v2.clone()];

        let pairs = ChangePairs::build(vec![v2.clone()], sources.clone()).unwrap();
        let commands = RerunnableCalculator::new(enricher())
            .calculate(&view_type, pairs, &sources)
            .unwrap();

        assert_eq!(deploy_names(&commands), vec!["v1"]);
    }

    #[test]
    fn test_grouped_components() {
        let data = |name: &str, deps: &[&str]| {
            Change::rerunnable(ChangeType::static_data(), "s1", name, format!("rows of {name}"))
                .with_dependencies(deps.iter().map(|d| CodeDependency::explicit(*d)))
        };
        let source = vec![data("child", &["parent"]), data("parent", &[]), data("other", &[])];
        let removed = data("gone", &[]);

        let pairs = ChangePairs::build(vec![removed], source).unwrap();
        let commands = GroupedCalculator::new(enricher()).calculate(pairs).unwrap();

        assert!(matches!(&commands[0], ChangeCommand::Audit(AuditCommand::Unmanage { change, .. }) if change.object_name() == "gone"));
        let groups: Vec<Vec<&str>> = commands[1..]
            .iter()
            .map(|c| match c {
                ChangeCommand::Execute(ExecuteCommand {
                    action: ExecuteAction::DeployGroup { changes },
                    ..
                }) => changes.iter().map(Change::object_name).collect(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(groups, vec![vec!["parent", "child"], vec!["other"]]);
    }

    #[test]
    fn test_grouped_unchanged_is_noop() {
        let data = Change::rerunnable(ChangeType::static_data(), "s1", "d", "rows");
        let pairs = ChangePairs::build(vec![data.clone()], vec![data]).unwrap();
        assert!(GroupedCalculator::new(enricher()).calculate(pairs).unwrap().is_empty());
    }
}

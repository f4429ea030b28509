//! Calculator for incremental change types.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use indexmap::IndexMap;
use tracing::debug;

use crate::change::{Change, ChangeKey, ObjectKey, has_rollback_content, normalize_whitespace};
use crate::command::{AuditCommand, ChangeCommand, ChangeWarning, ExecuteCommand};
use crate::error::{DeployError, DeployResult};
use crate::pair::{ChangePair, PairState};

const INIT_ONLY_CONTENT: &str = "INIT-only content. sql should not actually be invoked";
const INIT_ONLY_ROLLBACK: &str = "INIT-only. sql should not actually be invoked";
const MIGRATION_ONLY_CONTENT: &str = "migration-only content. sql should not actually be invoked";
const MIGRATION_ONLY_ROLLBACK: &str = "migration-only. sql should not actually be invoked";

/// Classifies incremental change pairs into commands.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalCalculator {
    threads: usize,
}

/// Intermediate lists filled while walking the pairs.
#[derive(Default)]
struct Pending {
    deploys: Vec<Change>,
    new_baselines: Vec<Change>,
    baselined_drops: Vec<Change>,
}

impl IncrementalCalculator {
    /// Create a calculator; `threads` is the hint given to parallel deploys.
    pub fn new(threads: usize) -> Self {
        Self { threads }
    }

    /// Calculate the commands for every pair of one incremental change type.
    pub fn calculate(
        &self,
        pairs: Vec<ChangePair>,
        rollback: bool,
        init_allowed: bool,
    ) -> DeployResult<Vec<ChangeCommand>> {
        let mut commands = Vec::new();
        let dropped = already_dropped_objects(&pairs);
        let mut pending = Pending::default();

        for pair in pairs {
            if dropped.contains(pair.object_key()) {
                if let Some(source) = pair.source() {
                    commands.push(ChangeWarning::AlreadyDropped { change: source.clone() }.into());
                }
                continue;
            }

            match pair.into_state() {
                PairState::DeployedOnly(deployed) => {
                    removed_from_source(deployed, rollback, init_allowed, &mut commands, &mut pending)
                }
                PairState::SourceOnly(source) => new_in_source(source, &mut commands, &mut pending),
                PairState::Both { source, deployed } => {
                    in_both(source, deployed, init_allowed, &mut commands)
                }
            }
        }

        commands.extend(handle_baselines(pending.new_baselines, pending.baselined_drops));
        commands.extend(self.group_deploys(pending.deploys)?);
        Ok(commands)
    }

    /// Deploys sharing a parallel group become one composite command.
    fn group_deploys(&self, deploys: Vec<Change>) -> DeployResult<Vec<ChangeCommand>> {
        let mut commands = Vec::new();
        let mut groups: IndexMap<String, Vec<Change>> = IndexMap::new();

        for change in deploys {
            match change.parallel_group().map(str::to_string) {
                Some(group) => groups.entry(group).or_default().push(change),
                None => commands.push(ExecuteCommand::deploy(change).into()),
            }
        }

        for (group, mut changes) in groups {
            if changes.len() == 1 {
                if let Some(change) = changes.pop() {
                    commands.push(ExecuteCommand::deploy(change).into());
                }
                continue;
            }
            validate_parallel_group(&group, &changes)?;
            let schema = changes[0].schema().to_string();
            commands.push(ExecuteCommand::parallel_deploy(schema, changes, self.threads).into());
        }
        Ok(commands)
    }
}

/// Objects whose changes are all new and whose last change drops them.
fn already_dropped_objects(pairs: &[ChangePair]) -> HashSet<ObjectKey> {
    let mut by_object: BTreeMap<&ObjectKey, Vec<&ChangePair>> = BTreeMap::new();
    for pair in pairs {
        by_object.entry(pair.object_key()).or_default().push(pair);
    }

    by_object
        .into_iter()
        .filter(|(_, pairs)| pairs.iter().all(|p| p.source().is_some() && p.deployed().is_none()))
        .filter(|(_, pairs)| {
            pairs
                .iter()
                .filter_map(|p| p.source())
                .max_by_key(|c| c.order_within_object)
                .and_then(Change::incremental_attrs)
                .is_some_and(|last| last.drop && !last.force_drop_for_env_cleaning)
        })
        .map(|(key, _)| key.clone())
        .collect()
}

fn removed_from_source(
    mut deployed: Change,
    rollback: bool,
    init_allowed: bool,
    commands: &mut Vec<ChangeCommand>,
    pending: &mut Pending,
) {
    if init_allowed {
        neutralize(&mut deployed, INIT_ONLY_CONTENT, INIT_ONLY_ROLLBACK);
        commands.push(AuditCommand::unmanage(deployed, "INIT-only").into());
    } else if rollback {
        if has_rollback_content(deployed.rollback_content.as_deref()) {
            if let Some(inc) = deployed.incremental_attrs_mut() {
                inc.rollback_activated = true;
            }
            commands.push(ExecuteCommand::undeploy(deployed, "Running Rollback").into());
        } else {
            commands.push(ChangeWarning::Unrolledback { change: deployed }.into());
        }
    } else if deployed.change_type().is_migration() {
        neutralize(&mut deployed, MIGRATION_ONLY_CONTENT, MIGRATION_ONLY_ROLLBACK);
        commands.push(AuditCommand::unmanage(deployed, "migration-only").into());
    } else {
        pending.baselined_drops.push(deployed);
    }
}

fn neutralize(change: &mut Change, content: &str, rollback: &str) {
    change.content = content.to_string();
    if let Some(inc) = change.incremental_attrs_mut() {
        inc.rollback_if_already_deployed = Some(rollback.to_string());
    }
}

fn new_in_source(source: Change, commands: &mut Vec<ChangeCommand>, pending: &mut Pending) {
    let Some(inc) = source.incremental_attrs() else {
        pending.deploys.push(source);
        return;
    };

    if inc.rollback_if_already_deployed.is_some() || !inc.active {
        debug!(
            change = %source.key,
            "Not deploying change marked rollback-if-already-deployed or inactive"
        );
    } else if !inc.baselined_changes.is_empty() {
        pending.new_baselines.push(source);
    } else if inc.drop {
        if inc.manually_coded_drop {
            commands.push(ExecuteCommand::deploy(source).with_drop(true).into());
        } else {
            let drop_ordered = !inc.keep_incremental_order;
            commands.push(ExecuteCommand::drop_object(source).with_drop(drop_ordered).into());
        }
    } else {
        pending.deploys.push(source);
    }
}

fn normalized_rollback(change: &Change) -> Option<String> {
    change
        .rollback_content
        .as_deref()
        .map(normalize_whitespace)
        .filter(|r| !r.is_empty())
}

fn in_both(source: Change, mut deployed: Change, init_allowed: bool, commands: &mut Vec<ChangeCommand>) {
    if !source.accepts_hash(&deployed.content_hash) {
        if init_allowed {
            commands.push(AuditCommand::update_audit_only(source, "initOnly").into());
        } else {
            commands.push(ChangeWarning::HashMismatch { source, deployed }.into());
        }
        return;
    }

    let mut reasons = Vec::new();
    match (source.is_active(), deployed.is_active()) {
        (true, false) => {
            set_active(&mut deployed, true);
            reasons.push("Activating change");
        }
        (false, true) => {
            set_active(&mut deployed, false);
            reasons.push("Deactivating change");
        }
        (false, false) => {
            commands.push(ChangeWarning::CurrentDeactivation { change: deployed.clone() }.into());
        }
        (true, true) => {}
    }

    if normalized_rollback(&source) != normalized_rollback(&deployed) {
        deployed.rollback_content = source.rollback_content.clone();
        reasons.push("Updating rollback script");
    }

    for reason in reasons {
        commands.push(AuditCommand::update_audit_only(deployed.clone(), reason).into());
    }

    let rollback_requested = source
        .incremental_attrs()
        .is_some_and(|inc| inc.rollback_if_already_deployed.is_some());
    if rollback_requested && source.is_active() {
        commands.push(
            ExecuteCommand::undeploy(source, "Rolling back due to ROLLBACK-IF-ALREADY-DEPLOYED flag.").into(),
        );
    }
}

fn set_active(change: &mut Change, active: bool) {
    if let Some(inc) = change.incremental_attrs_mut() {
        inc.active = active;
    }
}

/// Resolve new baselines against the deployed changes removed from source.
fn handle_baselines(new_baselines: Vec<Change>, baselined_drops: Vec<Change>) -> Vec<ChangeCommand> {
    let mut deployed_by_object: BTreeMap<ObjectKey, BTreeMap<String, Change>> = BTreeMap::new();
    for deployed in &baselined_drops {
        deployed_by_object
            .entry(deployed.object_key().clone())
            .or_default()
            .insert(deployed.change_name().to_string(), deployed.clone());
    }

    let mut commands = Vec::new();
    let mut claimed: HashSet<ChangeKey> = HashSet::new();

    for baseline in new_baselines {
        let Some(related) = deployed_by_object.get(baseline.object_key()) else {
            commands.push(ExecuteCommand::deploy(baseline).into());
            continue;
        };
        claimed.extend(related.values().map(|c| c.key.clone()));

        let missing: BTreeSet<String> = baseline
            .incremental_attrs()
            .map(|inc| {
                inc.baselined_changes
                    .iter()
                    .filter(|name| !related.contains_key(*name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if missing.is_empty() {
            commands.push(
                AuditCommand::Baseline {
                    baseline,
                    replaced: related.values().cloned().collect(),
                }
                .into(),
            );
        } else {
            commands.push(ChangeWarning::IncompleteBaseline { baseline, missing }.into());
        }
    }

    for deployed in baselined_drops {
        if !claimed.contains(&deployed.key) {
            commands.push(ChangeWarning::ImproperlyRemoved { change: deployed }.into());
        }
    }
    commands
}

fn validate_parallel_group(group: &str, changes: &[Change]) -> DeployResult<()> {
    let members: HashSet<&ChangeKey> = changes.iter().map(|c| &c.key).collect();
    for change in changes {
        if let Some(dependency) = change.dependent_changes.iter().find(|dep| members.contains(dep)) {
            return Err(DeployError::ParallelGroupDependency {
                group: group.to_string(),
                dependent: change.label(),
                dependency: dependency.label(),
            });
        }
    }
    Ok(())
}

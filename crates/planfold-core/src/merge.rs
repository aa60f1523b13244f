//! Merge accumulator: folds one iteration's partial results into the
//! running state of a resolve call.
//!
//! [`merge`] takes the accumulator by value and returns the next one. It
//! runs on the driver task after the join, so nothing here is shared.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use planfold_types::models::{
    ContextStore, Dependency, DependencySet, GraphLayoutInfo, NodeId, PartialResult, PlanGraph,
    PlanNode, YamlPath,
};

use crate::error::ResolveError;
use crate::yaml;

/// Running state of one resolve call.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    /// Pending work and the current document.
    pub deps: DependencySet,
    pub nodes: BTreeMap<NodeId, PlanNode>,
    pub starting_node_id: Option<NodeId>,
    pub layout: GraphLayoutInfo,
    pub context: ContextStore,
    pub execution_input_templates: BTreeMap<NodeId, String>,
    pub preserved_nodes_in_rollback: BTreeSet<NodeId>,
    /// Every node id ever sent to a service. Discovery never re-queues these.
    pub claimed: BTreeSet<NodeId>,
}

impl Accumulator {
    pub fn new(deps: DependencySet, context: ContextStore) -> Self {
        Self {
            deps,
            nodes: BTreeMap::new(),
            starting_node_id: None,
            layout: GraphLayoutInfo::default(),
            context,
            execution_input_templates: BTreeMap::new(),
            preserved_nodes_in_rollback: BTreeSet::new(),
            claimed: BTreeSet::new(),
        }
    }

    /// Whether dependencies remain to be resolved.
    pub fn has_pending(&self) -> bool {
        !self.deps.is_empty()
    }

    /// Finish the run, dropping the dependency bookkeeping.
    pub fn into_graph(self) -> PlanGraph {
        PlanGraph {
            nodes: self.nodes,
            starting_node_id: self.starting_node_id,
            layout: self.layout,
            execution_input_templates: self.execution_input_templates,
            preserved_nodes_in_rollback: self.preserved_nodes_in_rollback,
            context: self.context,
        }
    }
}

/// Fold `results` into `acc`.
///
/// `dispatched` are the node ids sent to services this iteration. One
/// leaves the pending set only when some answer resolves it, either with a
/// node keyed by the id or by listing it in `resolved_dependencies`; the
/// rest stay pending for the driver's progress check. Dispatched ids are
/// claimed for the rest of the run, so a later answer cannot re-queue them.
/// A node id produced twice fails with [`ResolveError::MergeConflict`].
/// Yaml updates are applied last, so the next iteration routes against the
/// rewritten document.
pub fn merge(
    mut acc: Accumulator,
    dispatched: &BTreeSet<NodeId>,
    results: Vec<PartialResult>,
) -> Result<Accumulator, ResolveError> {
    acc.claimed.extend(dispatched.iter().cloned());

    let mut resolved: BTreeSet<NodeId> = BTreeSet::new();
    let mut discovered: Vec<(Dependency, Option<serde_json::Value>)> = Vec::new();
    let mut yaml_updates: BTreeMap<YamlPath, String> = BTreeMap::new();

    for result in results {
        resolved.extend(
            dispatched
                .iter()
                .filter(|id| result.resolves(id))
                .cloned(),
        );

        let PartialResult {
            nodes,
            dependencies,
            mut dependency_metadata,
            layout,
            starting_node_id,
            execution_input_templates,
            context,
            service_affinity,
            preserved_nodes_in_rollback,
            yaml_updates: updates,
            resolved_dependencies: _,
        } = result;

        for (node_id, node) in nodes {
            if acc.nodes.contains_key(&node_id) {
                tracing::error!(node_id = %node_id, "plan node produced twice");
                return Err(ResolveError::MergeConflict { node_id });
            }
            acc.nodes.insert(node_id, node);
        }

        if acc.starting_node_id.is_none() {
            acc.starting_node_id = starting_node_id;
        }

        if acc.layout.starting_node_id.is_none() {
            acc.layout.starting_node_id = layout.starting_node_id;
        }
        for (id, node) in layout.layout_nodes {
            acc.layout.layout_nodes.entry(id).or_insert(node);
        }

        acc.preserved_nodes_in_rollback
            .extend(preserved_nodes_in_rollback);
        acc.deps.service_affinity.extend(service_affinity);
        acc.context.extend(context);
        acc.execution_input_templates
            .extend(execution_input_templates);
        yaml_updates.extend(updates);

        for (node_id, path) in dependencies {
            let meta = dependency_metadata.remove(&node_id);
            discovered.push((Dependency::new(node_id, path), meta));
        }
    }

    for node_id in &resolved {
        acc.deps.remove(node_id);
    }
    let unresolved = dispatched.len() - resolved.len();
    if unresolved > 0 {
        tracing::warn!(unresolved, "dispatched dependencies came back unresolved");
    }

    for (dependency, meta) in discovered {
        if acc.nodes.contains_key(&dependency.node_id)
            || acc.claimed.contains(&dependency.node_id)
        {
            continue;
        }
        let node_id = dependency.node_id.clone();
        if acc.deps.insert(dependency) {
            if let Some(meta) = meta {
                acc.deps.metadata.insert(node_id, meta);
            }
        }
    }

    if !yaml_updates.is_empty() {
        tracing::debug!(updates = yaml_updates.len(), "applying yaml updates");
        let updated = yaml::apply_updates(&acc.deps.yaml, &yaml_updates)?;
        acc.deps.yaml = Arc::from(updated);
    }

    Ok(acc)
}

#[cfg(test)]
mod tests {
    use planfold_types::models::{ContextValue, GraphLayoutNode};

    use super::*;

    const DOC: &str = "pipeline:\n  __uuid: root\n  stages:\n    - stage:\n        __uuid: s1\n        type: CI\n";

    fn node(id: &str) -> PlanNode {
        PlanNode {
            uuid: id.to_string(),
            identifier: id.to_string(),
            ..PlanNode::default()
        }
    }

    fn start() -> Accumulator {
        let deps = DependencySet::with_root(DOC, Dependency::new("root", "pipeline"));
        Accumulator::new(deps, ContextStore::new())
    }

    fn dispatched(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolved_ids_leave_pending_and_new_deps_arrive() {
        let result = PartialResult {
            nodes: BTreeMap::from([("root".to_string(), node("root"))]),
            dependencies: BTreeMap::from([
                ("s1".to_string(), "pipeline/stages/[0]/stage".to_string()),
                ("s2".to_string(), "pipeline/stages/[1]/stage".to_string()),
            ]),
            dependency_metadata: BTreeMap::from([(
                "s1".to_string(),
                serde_json::json!({"parent": "root"}),
            )]),
            starting_node_id: Some("root".to_string()),
            ..PartialResult::default()
        };

        let acc = merge(start(), &dispatched(&["root"]), vec![result]).unwrap();
        assert!(acc.nodes.contains_key("root"));
        assert_eq!(
            acc.deps.pending_ids(),
            BTreeSet::from(["s1".to_string(), "s2".to_string()])
        );
        assert_eq!(acc.deps.metadata["s1"]["parent"], "root");
        assert_eq!(acc.starting_node_id.as_deref(), Some("root"));
    }

    #[test]
    fn duplicate_node_is_a_merge_conflict() {
        let a = PartialResult {
            nodes: BTreeMap::from([("s1".to_string(), node("s1"))]),
            ..PartialResult::default()
        };
        let b = a.clone();

        let err = merge(start(), &dispatched(&["root"]), vec![a, b]).unwrap_err();
        assert!(
            matches!(err, ResolveError::MergeConflict { ref node_id } if node_id == "s1"),
            "expected MergeConflict, got: {err}"
        );
    }

    #[test]
    fn node_already_accumulated_conflicts_too() {
        let mut acc = start();
        acc.nodes.insert("root".to_string(), node("root"));
        let again = PartialResult {
            nodes: BTreeMap::from([("root".to_string(), node("root"))]),
            ..PartialResult::default()
        };
        assert!(merge(acc, &BTreeSet::new(), vec![again]).is_err());
    }

    #[test]
    fn starting_node_is_set_once() {
        let first = PartialResult {
            starting_node_id: Some("root".to_string()),
            layout: GraphLayoutInfo {
                starting_node_id: Some("root".to_string()),
                layout_nodes: BTreeMap::from([("root".to_string(), GraphLayoutNode::default())]),
            },
            ..PartialResult::default()
        };
        let second = PartialResult {
            starting_node_id: Some("other".to_string()),
            layout: GraphLayoutInfo {
                starting_node_id: Some("other".to_string()),
                layout_nodes: BTreeMap::from([("s1".to_string(), GraphLayoutNode::default())]),
            },
            ..PartialResult::default()
        };

        let acc = merge(start(), &dispatched(&["root"]), vec![first]).unwrap();
        let acc = merge(acc, &BTreeSet::new(), vec![second]).unwrap();
        assert_eq!(acc.starting_node_id.as_deref(), Some("root"));
        assert_eq!(acc.layout.starting_node_id.as_deref(), Some("root"));
        assert_eq!(acc.layout.layout_nodes.len(), 2);
    }

    #[test]
    fn discovered_dependency_already_produced_is_skipped() {
        let producer = PartialResult {
            nodes: BTreeMap::from([
                ("root".to_string(), node("root")),
                ("s1".to_string(), node("s1")),
            ]),
            ..PartialResult::default()
        };
        let discoverer = PartialResult {
            dependencies: BTreeMap::from([(
                "s1".to_string(),
                "pipeline/stages/[0]/stage".to_string(),
            )]),
            ..PartialResult::default()
        };

        let acc = merge(start(), &dispatched(&["root"]), vec![discoverer, producer]).unwrap();
        assert!(acc.deps.is_empty());
    }

    #[test]
    fn empty_answer_leaves_dispatched_id_pending() {
        let acc = merge(start(), &dispatched(&["root"]), vec![PartialResult::default()]).unwrap();
        assert_eq!(acc.deps.pending_ids(), BTreeSet::from(["root".to_string()]));
        assert_eq!(acc.deps.pending["root"], "pipeline");
        assert!(acc.claimed.contains("root"));
    }

    #[test]
    fn listed_resolved_dependency_leaves_pending_without_a_node() {
        let result = PartialResult {
            nodes: BTreeMap::from([("root-plan".to_string(), node("root-plan"))]),
            resolved_dependencies: vec!["root".to_string()],
            ..PartialResult::default()
        };

        let acc = merge(start(), &dispatched(&["root"]), vec![result]).unwrap();
        assert!(acc.deps.is_empty());
        assert!(acc.nodes.contains_key("root-plan"));
    }

    #[test]
    fn claimed_id_is_not_requeued_by_a_later_answer() {
        let first = PartialResult {
            nodes: BTreeMap::from([("root-plan".to_string(), node("root-plan"))]),
            dependencies: BTreeMap::from([(
                "s1".to_string(),
                "pipeline/stages/[0]/stage".to_string(),
            )]),
            resolved_dependencies: vec!["root".to_string()],
            ..PartialResult::default()
        };
        let acc = merge(start(), &dispatched(&["root"]), vec![first]).unwrap();
        assert_eq!(acc.deps.pending_ids(), BTreeSet::from(["s1".to_string()]));

        let second = PartialResult {
            nodes: BTreeMap::from([("s1".to_string(), node("s1"))]),
            dependencies: BTreeMap::from([("root".to_string(), "pipeline".to_string())]),
            ..PartialResult::default()
        };
        let acc = merge(acc, &dispatched(&["s1"]), vec![second]).unwrap();
        assert!(acc.deps.is_empty(), "pending: {:?}", acc.deps.pending_ids());
    }

    #[test]
    fn pending_id_keeps_first_path() {
        let mut acc = start();
        acc.deps
            .insert(Dependency::new("s1", "pipeline/stages/[0]/stage"));
        let result = PartialResult {
            dependencies: BTreeMap::from([("s1".to_string(), "pipeline/elsewhere".to_string())]),
            ..PartialResult::default()
        };

        let acc = merge(acc, &dispatched(&["root"]), vec![result]).unwrap();
        assert_eq!(acc.deps.pending["s1"], "pipeline/stages/[0]/stage");
    }

    #[test]
    fn side_maps_are_unioned() {
        let result = PartialResult {
            context: ContextStore::from([(
                "cd".to_string(),
                ContextValue {
                    account_id: "acct".to_string(),
                    ..ContextValue::default()
                },
            )]),
            service_affinity: BTreeMap::from([("s1".to_string(), "cd".to_string())]),
            execution_input_templates: BTreeMap::from([(
                "s1".to_string(),
                "type: <+input>".to_string(),
            )]),
            preserved_nodes_in_rollback: vec!["s1".to_string()],
            ..PartialResult::default()
        };

        let acc = merge(start(), &dispatched(&["root"]), vec![result]).unwrap();
        assert_eq!(acc.context["cd"].account_id, "acct");
        assert_eq!(acc.deps.service_affinity["s1"], "cd");
        assert!(acc.execution_input_templates.contains_key("s1"));
        assert!(acc.preserved_nodes_in_rollback.contains("s1"));

        let graph = acc.into_graph();
        assert!(graph.requires_execution_input("s1"));
    }

    #[test]
    fn yaml_updates_rewrite_the_document() {
        let result = PartialResult {
            yaml_updates: BTreeMap::from([(
                "pipeline/stages/[0]/stage".to_string(),
                "__uuid: s1\ntype: Custom\n".to_string(),
            )]),
            ..PartialResult::default()
        };

        let acc = merge(start(), &dispatched(&["root"]), vec![result]).unwrap();
        let tree = yaml::YamlTree::parse(&acc.deps.yaml).unwrap();
        let stage = tree.field_at("pipeline/stages/[0]/stage").unwrap().unwrap();
        assert_eq!(stage.node_type(), Some("Custom"));
    }

    #[test]
    fn yaml_update_on_missing_path_fails() {
        let result = PartialResult {
            yaml_updates: BTreeMap::from([("pipeline/nope".to_string(), "a: 1".to_string())]),
            ..PartialResult::default()
        };
        let err = merge(start(), &dispatched(&["root"]), vec![result]).unwrap_err();
        assert!(matches!(err, ResolveError::Yaml(_)), "got: {err}");
    }
}

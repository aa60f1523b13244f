//! Final-graph validation, run once after the last iteration.

use std::collections::{HashMap, VecDeque};

use planfold_types::models::PlanGraph;

/// Accepts or rejects a finished plan graph.
pub trait GraphValidator: Send + Sync {
    /// Return every problem found, or `Ok(())` if the graph can run.
    fn validate(&self, graph: &PlanGraph) -> Result<(), Vec<String>>;
}

// Compile-time assertion: GraphValidator must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn GraphValidator) {}
};

/// Checks that the graph hangs together:
///
/// - a starting node is set and exists;
/// - every child and next reference names an existing node;
/// - layout edges and the layout starting node reference layout nodes;
/// - the child/next graph has no cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

impl GraphValidator for StructuralValidator {
    fn validate(&self, graph: &PlanGraph) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        match &graph.starting_node_id {
            None => problems.push("plan has no starting node".to_string()),
            Some(id) if !graph.nodes.contains_key(id) => {
                problems.push(format!("starting node {id:?} is not a plan node"));
            }
            Some(_) => {}
        }

        for (id, node) in &graph.nodes {
            for child in &node.child_node_ids {
                if !graph.nodes.contains_key(child) {
                    problems.push(format!("node {id:?} has unknown child {child:?}"));
                }
            }
            if let Some(next) = &node.next_node_id {
                if !graph.nodes.contains_key(next) {
                    problems.push(format!("node {id:?} has unknown next node {next:?}"));
                }
            }
        }

        let layout = &graph.layout;
        if let Some(start) = &layout.starting_node_id {
            if !layout.layout_nodes.contains_key(start) {
                problems.push(format!("layout starting node {start:?} is not a layout node"));
            }
        }
        for (id, node) in &layout.layout_nodes {
            let edges = &node.edge_layout_list;
            for target in edges.current_node_children.iter().chain(&edges.next_ids) {
                if !layout.layout_nodes.contains_key(target) {
                    problems.push(format!("layout node {id:?} links to unknown {target:?}"));
                }
            }
        }

        if let Err(cycle) = check_for_cycles(graph) {
            problems.push(format!("plan nodes form a cycle: {}", cycle.join(", ")));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Detect cycles over child and next edges using Kahn's algorithm.
///
/// Edges to unknown nodes are ignored here; they are reported separately.
fn check_for_cycles(graph: &PlanGraph) -> Result<(), Vec<&str>> {
    let ids: Vec<&str> = graph.nodes.keys().map(String::as_str).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let n = ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (i, node) in graph.nodes.values().enumerate() {
        let targets = node
            .child_node_ids
            .iter()
            .chain(node.next_node_id.as_ref());
        for target in targets {
            if let Some(&j) = index.get(target.as_str()) {
                adj[i].push(j);
                in_degree[j] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count == n {
        return Ok(());
    }
    Err(in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg > 0)
        .map(|(i, _)| ids[i])
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use planfold_types::models::{EdgeLayout, GraphLayoutInfo, GraphLayoutNode, PlanNode};

    use super::*;

    fn node(id: &str, children: &[&str], next: Option<&str>) -> (String, PlanNode) {
        (
            id.to_string(),
            PlanNode {
                uuid: id.to_string(),
                child_node_ids: children.iter().map(|c| c.to_string()).collect(),
                next_node_id: next.map(str::to_string),
                ..PlanNode::default()
            },
        )
    }

    fn graph(nodes: Vec<(String, PlanNode)>, start: &str) -> PlanGraph {
        PlanGraph {
            nodes: nodes.into_iter().collect(),
            starting_node_id: Some(start.to_string()),
            ..PlanGraph::default()
        }
    }

    #[test]
    fn accepts_tree_with_sequence() {
        let g = graph(
            vec![
                node("root", &["s1"], None),
                node("s1", &[], Some("s2")),
                node("s2", &[], None),
            ],
            "root",
        );
        assert!(StructuralValidator.validate(&g).is_ok());
    }

    #[test]
    fn rejects_missing_or_unknown_start() {
        let mut g = graph(vec![node("root", &[], None)], "ghost");
        let problems = StructuralValidator.validate(&g).unwrap_err();
        assert!(problems[0].contains("ghost"), "got: {problems:?}");

        g.starting_node_id = None;
        let problems = StructuralValidator.validate(&g).unwrap_err();
        assert_eq!(problems, vec!["plan has no starting node".to_string()]);
    }

    #[test]
    fn rejects_dangling_references() {
        let g = graph(vec![node("root", &["s1"], Some("s9"))], "root");
        let problems = StructuralValidator.validate(&g).unwrap_err();
        assert_eq!(problems.len(), 2, "got: {problems:?}");
    }

    #[test]
    fn rejects_direct_cycle() {
        let g = graph(
            vec![node("root", &["a"], None), node("a", &[], Some("b")), node("b", &[], Some("a"))],
            "root",
        );
        let problems = StructuralValidator.validate(&g).unwrap_err();
        assert!(problems[0].contains("cycle"), "got: {problems:?}");
        assert!(problems[0].contains('a') && problems[0].contains('b'));
    }

    #[test]
    fn rejects_layout_edge_to_unknown_node() {
        let mut g = graph(vec![node("root", &[], None)], "root");
        g.layout = GraphLayoutInfo {
            starting_node_id: Some("root".to_string()),
            layout_nodes: BTreeMap::from([(
                "root".to_string(),
                GraphLayoutNode {
                    node_uuid: "root".to_string(),
                    edge_layout_list: EdgeLayout {
                        current_node_children: vec![],
                        next_ids: vec!["missing".to_string()],
                    },
                    ..GraphLayoutNode::default()
                },
            )]),
        };
        let problems = StructuralValidator.validate(&g).unwrap_err();
        assert!(problems[0].contains("missing"), "got: {problems:?}");
    }
}

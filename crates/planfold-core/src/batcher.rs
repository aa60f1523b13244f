//! Splits one service's routed dependencies into bounded request batches.

use std::collections::BTreeMap;

use planfold_types::models::{Dependency, DependencySet, NodeId, YamlPath};

/// One request's worth of dependencies for a single service.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub service: String,
    pub dependencies: BTreeMap<NodeId, YamlPath>,
    /// Metadata restricted to this batch's node ids.
    pub metadata: BTreeMap<NodeId, serde_json::Value>,
    /// Affinity restricted to this batch's node ids.
    pub affinity: BTreeMap<NodeId, String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// Chunk `dependencies` into batches of at most `max_batch_size` entries,
/// preserving order. A size of zero is treated as one.
pub fn batch(
    service: &str,
    dependencies: &[Dependency],
    deps: &DependencySet,
    max_batch_size: usize,
) -> Vec<Batch> {
    dependencies
        .chunks(max_batch_size.max(1))
        .map(|chunk| {
            let mut batch = Batch {
                service: service.to_string(),
                dependencies: BTreeMap::new(),
                metadata: BTreeMap::new(),
                affinity: BTreeMap::new(),
            };
            for dep in chunk {
                if let Some(meta) = deps.metadata.get(&dep.node_id) {
                    batch.metadata.insert(dep.node_id.clone(), meta.clone());
                }
                if let Some(pin) = deps.service_affinity.get(&dep.node_id) {
                    batch.affinity.insert(dep.node_id.clone(), pin.clone());
                }
                batch
                    .dependencies
                    .insert(dep.node_id.clone(), dep.path.clone());
            }
            batch
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn deps(n: usize) -> (Vec<Dependency>, DependencySet) {
        let mut set = DependencySet::new("pipeline: {}");
        let list: Vec<Dependency> = (0..n)
            .map(|i| Dependency::new(format!("n{i:03}"), format!("pipeline/stages/[{i}]/stage")))
            .collect();
        for dep in &list {
            set.insert(dep.clone());
        }
        (list, set)
    }

    #[test]
    fn batch_count_is_ceiling() {
        for (k, m, expected) in [(0, 3, 0), (1, 3, 1), (3, 3, 1), (4, 3, 2), (7, 2, 4), (5, 50, 1)] {
            let (list, set) = deps(k);
            let batches = batch("ci", &list, &set, m);
            assert_eq!(batches.len(), expected, "k={k} m={m}");
            assert!(batches.iter().all(|b| b.len() <= m && !b.is_empty()));
        }
    }

    #[test]
    fn union_of_batches_equals_input() {
        let (list, set) = deps(11);
        let batches = batch("ci", &list, &set, 4);

        let mut seen = BTreeSet::new();
        for b in &batches {
            for id in b.dependencies.keys() {
                assert!(seen.insert(id.clone()), "{id} appears twice");
            }
        }
        assert_eq!(seen, set.pending_ids());
    }

    #[test]
    fn zero_size_is_clamped() {
        let (list, set) = deps(3);
        let batches = batch("ci", &list, &set, 0);
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn side_maps_are_restricted_to_batch_keys() {
        let (list, mut set) = deps(4);
        set.metadata
            .insert("n000".to_string(), serde_json::json!({"parent": "root"}));
        set.metadata
            .insert("n003".to_string(), serde_json::json!({"parent": "root"}));
        set.service_affinity
            .insert("n003".to_string(), "ci".to_string());

        let batches = batch("ci", &list, &set, 2);
        assert_eq!(batches[0].metadata.keys().collect::<Vec<_>>(), vec!["n000"]);
        assert!(batches[0].affinity.is_empty());
        assert_eq!(batches[1].metadata.keys().collect::<Vec<_>>(), vec!["n003"]);
        assert_eq!(batches[1].affinity["n003"], "ci");
        assert!(batches.iter().all(|b| b.service == "ci"));
    }
}

//! Declarative claim predicate: which yaml fields a service can turn into
//! plan nodes.

use std::collections::{BTreeMap, BTreeSet};

use planfold_types::models::PipelineVersion;
use serde::{Deserialize, Serialize};

use crate::yaml::YamlField;

/// Wildcard type: the service handles the field whatever its `type`.
pub const ANY_TYPE: &str = "__any__";

/// Field name -> set of node `type` values a service supports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SupportedTypes {
    types: BTreeMap<String, BTreeSet<String>>,
}

impl SupportedTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`SupportedTypes::insert`] for several types.
    pub fn with(mut self, field: &str, types: &[&str]) -> Self {
        for t in types {
            self.insert(field, t);
        }
        self
    }

    pub fn insert(&mut self, field: &str, node_type: &str) {
        self.types
            .entry(field.to_string())
            .or_default()
            .insert(node_type.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterate `(field, types)` pairs in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.types.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether `field` is claimable under `version`'s grammar.
    ///
    /// Version 0 keys on the field name, then checks the node's `type`
    /// (an untyped node only matches the wildcard). Version 1 nodes are
    /// identified by `type` alone; untyped v1 nodes fall back to the field
    /// name with the wildcard.
    pub fn supports(&self, field: &YamlField<'_>, version: PipelineVersion) -> bool {
        match version {
            PipelineVersion::V0 => {
                let Some(types) = self.types.get(&field.name) else {
                    return false;
                };
                types.contains(ANY_TYPE) || types.contains(field.node_type().unwrap_or(ANY_TYPE))
            }
            PipelineVersion::V1 => match field.node_type() {
                Some(node_type) => self.types.values().any(|types| types.contains(node_type)),
                None => self
                    .types
                    .get(&field.name)
                    .is_some_and(|types| types.contains(ANY_TYPE)),
            },
        }
    }
}

impl From<BTreeMap<String, Vec<String>>> for SupportedTypes {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        let types = map
            .into_iter()
            .map(|(field, types)| (field, types.into_iter().collect()))
            .collect();
        Self { types }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yaml::YamlTree;

    const V0_DOC: &str = r#"
pipeline:
  __uuid: root
  stages:
    - stage:
        __uuid: s1
        type: CI
    - stage:
        __uuid: s2
        type: Deployment
  notifications:
    __uuid: n1
"#;

    #[test]
    fn v0_matches_field_name_and_type() {
        let tree = YamlTree::parse(V0_DOC).unwrap();
        let ci = tree.field_at("pipeline/stages/[0]/stage").unwrap().unwrap();
        let cd = tree.field_at("pipeline/stages/[1]/stage").unwrap().unwrap();

        let supported = SupportedTypes::new().with("stage", &["CI"]);
        assert!(supported.supports(&ci, PipelineVersion::V0));
        assert!(!supported.supports(&cd, PipelineVersion::V0));
    }

    #[test]
    fn v0_wildcard_matches_any_type_and_untyped() {
        let tree = YamlTree::parse(V0_DOC).unwrap();
        let root = tree.field_at("pipeline").unwrap().unwrap();
        let cd = tree.field_at("pipeline/stages/[1]/stage").unwrap().unwrap();

        let supported = SupportedTypes::new()
            .with("pipeline", &[ANY_TYPE])
            .with("stage", &[ANY_TYPE]);
        assert!(supported.supports(&root, PipelineVersion::V0));
        assert!(supported.supports(&cd, PipelineVersion::V0));
    }

    #[test]
    fn v0_untyped_node_needs_wildcard() {
        let tree = YamlTree::parse(V0_DOC).unwrap();
        let notifications = tree.field_at("pipeline/notifications").unwrap().unwrap();

        let typed_only = SupportedTypes::new().with("notifications", &["Slack"]);
        assert!(!typed_only.supports(&notifications, PipelineVersion::V0));
        let wildcard = SupportedTypes::new().with("notifications", &[ANY_TYPE]);
        assert!(wildcard.supports(&notifications, PipelineVersion::V0));
    }

    #[test]
    fn v1_matches_on_type_regardless_of_field_name() {
        let doc = r#"
__uuid: doc
kind: pipeline
spec:
  stages:
    - __uuid: s1
      type: ci
"#;
        let tree = YamlTree::parse(doc).unwrap();
        let stage = tree.field_at("spec/stages/[0]").unwrap().unwrap();
        let root = tree.field_at("").unwrap().unwrap();

        let supported = SupportedTypes::new()
            .with("stage", &["ci"])
            .with("pipeline", &[ANY_TYPE]);
        assert!(supported.supports(&stage, PipelineVersion::V1));
        assert!(supported.supports(&root, PipelineVersion::V1));

        let other = SupportedTypes::new().with("stage", &["deployment"]);
        assert!(!other.supports(&stage, PipelineVersion::V1));
        assert!(!other.supports(&root, PipelineVersion::V1));
    }

    #[test]
    fn from_map_collects_types() {
        let map = BTreeMap::from([(
            "step".to_string(),
            vec!["Http".to_string(), "ShellScript".to_string()],
        )]);
        let supported = SupportedTypes::from(map);
        let (field, types) = supported.iter().next().unwrap();
        assert_eq!(field, "step");
        assert_eq!(types.len(), 2);
    }
}

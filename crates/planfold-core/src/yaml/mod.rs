//! Pipeline document reader.
//!
//! Every mapping in a processed document carries a stable node id under the
//! [`UUID_FIELD`] key. The resolver addresses fragments by yaml path (see
//! [`path`]) and re-reads the tree once per iteration, since services may
//! rewrite parts of the document through yaml updates.

pub mod path;

use std::collections::BTreeMap;

use planfold_types::models::{PipelineVersion, YamlPath};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use uuid::Uuid;

use self::path::{PathSegment, field_name, join, parse_path};

/// Key holding a mapping's node id.
pub const UUID_FIELD: &str = "__uuid";

/// Field name given to the document root of a v1 pipeline.
pub const V1_ROOT_FIELD_NAME: &str = "pipeline";

/// Errors raised while reading or rewriting a pipeline document.
#[derive(Debug, Error)]
pub enum YamlError {
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid yaml path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("yaml path {0:?} does not exist in the document")]
    PathNotFound(String),

    #[error("document has no root field: {0}")]
    RootNotFound(String),

    #[error("node at {path:?} has no __uuid node id; preprocess the document first")]
    MissingNodeId { path: String },

    #[error("cannot convert node at {path:?} to JSON: {reason}")]
    Conversion { path: String, reason: String },
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// A parsed pipeline document.
#[derive(Debug, Clone)]
pub struct YamlTree {
    root: Value,
}

/// A located field of the document.
#[derive(Debug, Clone)]
pub struct YamlField<'a> {
    /// Last mapping key of the path (or the synthetic root name).
    pub name: String,
    pub path: YamlPath,
    pub node: &'a Value,
}

impl<'a> YamlField<'a> {
    /// The node id stored under [`UUID_FIELD`], if this is a mapping.
    pub fn node_id(&self) -> Option<&'a str> {
        self.node.get(UUID_FIELD).and_then(Value::as_str)
    }

    /// The node's `type` attribute.
    pub fn node_type(&self) -> Option<&'a str> {
        self.node.get("type").and_then(Value::as_str)
    }

    /// The node's `identifier` attribute.
    pub fn identifier(&self) -> Option<&'a str> {
        self.node.get("identifier").and_then(Value::as_str)
    }

    /// Convert this field's subtree to JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, YamlError> {
        to_json_at(self.node, &self.path)
    }
}

impl YamlTree {
    /// Parse a document.
    pub fn parse(text: &str) -> Result<Self, YamlError> {
        let root: Value = serde_yaml::from_str(text)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Look up the node at `path`. `Ok(None)` when the path is well formed
    /// but absent.
    pub fn node_at(&self, path: &str) -> Result<Option<&Value>, YamlError> {
        let segments = parse_path(path)?;
        Ok(node_at(&self.root, &segments))
    }

    /// Look up the field at `path`.
    pub fn field_at(&self, path: &str) -> Result<Option<YamlField<'_>>, YamlError> {
        let segments = parse_path(path)?;
        let Some(node) = node_at(&self.root, &segments) else {
            return Ok(None);
        };
        let name = if segments.is_empty() {
            V1_ROOT_FIELD_NAME.to_string()
        } else {
            field_name(&segments).to_string()
        };
        Ok(Some(YamlField {
            name,
            path: path.to_string(),
            node,
        }))
    }

    /// The field representing the whole pipeline.
    ///
    /// Version 0 documents nest everything under a single top-level key
    /// (normally `pipeline`); version 1 documents are the pipeline
    /// themselves, so the root is the empty path.
    pub fn root_field(&self, version: PipelineVersion) -> Result<YamlField<'_>, YamlError> {
        let Some(mapping) = self.root.as_mapping() else {
            return Err(YamlError::RootNotFound(
                "top level is not a mapping".to_string(),
            ));
        };

        match version {
            PipelineVersion::V1 => Ok(YamlField {
                name: V1_ROOT_FIELD_NAME.to_string(),
                path: String::new(),
                node: &self.root,
            }),
            PipelineVersion::V0 => {
                let key = if mapping.contains_key("pipeline") {
                    "pipeline".to_string()
                } else {
                    let keys: Vec<&str> = mapping
                        .keys()
                        .filter_map(Value::as_str)
                        .filter(|k| *k != UUID_FIELD)
                        .collect();
                    match keys.as_slice() {
                        [only] => (*only).to_string(),
                        [] => {
                            return Err(YamlError::RootNotFound("document is empty".to_string()));
                        }
                        _ => {
                            return Err(YamlError::RootNotFound(format!(
                                "expected a single top-level key, found {}",
                                keys.join(", ")
                            )));
                        }
                    }
                };
                let node = mapping
                    .get(key.as_str())
                    .ok_or_else(|| YamlError::RootNotFound(key.clone()))?;
                Ok(YamlField {
                    name: key.clone(),
                    path: key,
                    node,
                })
            }
        }
    }

    /// Every mapping that carries a node id, in document order.
    pub fn fields(&self) -> Vec<YamlField<'_>> {
        let mut out = Vec::new();
        collect_fields(&self.root, "", V1_ROOT_FIELD_NAME, &mut out);
        out
    }

    /// Serialize the tree back to YAML text.
    pub fn to_yaml(&self) -> Result<String, YamlError> {
        Ok(serde_yaml::to_string(&self.root)?)
    }
}

fn node_at<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match segment {
            PathSegment::Key(key) => current.as_mapping()?.get(key.as_str())?,
            PathSegment::Index(i) => current.as_sequence()?.get(*i)?,
        };
    }
    Some(current)
}

fn node_at_mut<'a>(root: &'a mut Value, segments: &[PathSegment]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in segments {
        current = match segment {
            PathSegment::Key(key) => current.as_mapping_mut()?.get_mut(key.as_str())?,
            PathSegment::Index(i) => current.as_sequence_mut()?.get_mut(*i)?,
        };
    }
    Some(current)
}

fn collect_fields<'a>(node: &'a Value, path: &str, name: &str, out: &mut Vec<YamlField<'a>>) {
    match node {
        Value::Mapping(mapping) => {
            if mapping.contains_key(UUID_FIELD) {
                out.push(YamlField {
                    name: name.to_string(),
                    path: path.to_string(),
                    node,
                });
            }
            for (key, child) in mapping {
                let Some(key) = key.as_str() else { continue };
                if key == UUID_FIELD {
                    continue;
                }
                let child_path = join(path, &PathSegment::Key(key.to_string()));
                collect_fields(child, &child_path, key, out);
            }
        }
        Value::Sequence(items) => {
            for (i, child) in items.iter().enumerate() {
                let child_path = join(path, &PathSegment::Index(i));
                collect_fields(child, &child_path, name, out);
            }
        }
        _ => {}
    }
}

fn to_json_at(node: &Value, path: &str) -> Result<serde_json::Value, YamlError> {
    serde_json::to_value(node).map_err(|e| YamlError::Conversion {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

/// Give every mapping without a node id a fresh random one.
pub fn preprocess(text: &str) -> Result<String, YamlError> {
    preprocess_with(text, || Uuid::new_v4().simple().to_string())
}

/// Like [`preprocess`], drawing ids from `next_id`.
pub fn preprocess_with(
    text: &str,
    mut next_id: impl FnMut() -> String,
) -> Result<String, YamlError> {
    let mut root: Value = serde_yaml::from_str(text)?;
    assign_ids(&mut root, &mut next_id);
    Ok(serde_yaml::to_string(&root)?)
}

fn assign_ids(node: &mut Value, next_id: &mut impl FnMut() -> String) {
    match node {
        Value::Mapping(mapping) => {
            for (_, child) in mapping.iter_mut() {
                assign_ids(child, next_id);
            }
            if !mapping.contains_key(UUID_FIELD) {
                insert_id(mapping, next_id());
            }
        }
        Value::Sequence(items) => {
            for child in items {
                assign_ids(child, next_id);
            }
        }
        _ => {}
    }
}

fn insert_id(mapping: &mut Mapping, id: String) {
    mapping.insert(Value::String(UUID_FIELD.to_string()), Value::String(id));
}

/// Replace the node at each path with the parsed fragment.
///
/// Updates are applied in path order. A path that does not exist in the
/// document is an error; nothing is written in that case.
pub fn apply_updates(
    text: &str,
    updates: &BTreeMap<YamlPath, String>,
) -> Result<String, YamlError> {
    let mut root: Value = serde_yaml::from_str(text)?;
    for (path, fragment) in updates {
        let replacement: Value = serde_yaml::from_str(fragment)?;
        let segments = parse_path(path)?;
        let target = node_at_mut(&mut root, &segments)
            .ok_or_else(|| YamlError::PathNotFound(path.clone()))?;
        *target = replacement;
    }
    Ok(serde_yaml::to_string(&root)?)
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a node in the processed pipeline document.
pub type NodeId = String;

/// Slash-separated location of a field in the pipeline document, e.g.
/// `pipeline/stages/[0]/stage`.
pub type YamlPath = String;

/// Key of the context entry carrying execution-wide metadata.
pub const METADATA_CONTEXT_KEY: &str = "metadata";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Grammar version of a pipeline document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PipelineVersion {
    #[serde(rename = "0")]
    V0,
    #[serde(rename = "1")]
    V1,
}

impl fmt::Display for PipelineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::V0 => "0",
            Self::V1 => "1",
        };
        f.write_str(s)
    }
}

impl FromStr for PipelineVersion {
    type Err = PipelineVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" | "v0" | "V0" => Ok(Self::V0),
            "1" | "v1" | "V1" => Ok(Self::V1),
            other => Err(PipelineVersionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PipelineVersion`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid pipeline version: {0:?} (expected 0 or 1)")]
pub struct PipelineVersionParseError(pub String);

// ---------------------------------------------------------------------------

/// How an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Scheduled,
    Api,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Scheduled => "scheduled",
            Self::Api => "api",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerType {
    type Err = TriggerTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "webhook" => Ok(Self::Webhook),
            "scheduled" => Ok(Self::Scheduled),
            "api" => Ok(Self::Api),
            other => Err(TriggerTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggerType`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid trigger type: {0:?}")]
pub struct TriggerTypeParseError(pub String);

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Who or what started an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    pub trigger_type: TriggerType,
    pub triggered_by: String,
}

/// Execution-wide metadata sent to every plan-creation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub execution_id: Uuid,
    pub run_sequence: u32,
    pub pipeline_identifier: String,
    pub trigger: TriggerInfo,
    pub pipeline_version: PipelineVersion,
    pub started_at: DateTime<Utc>,
}

/// One entry of the context store.
///
/// Services may return additional entries (or replace existing ones) in
/// their answers; every field is therefore optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextValue {
    pub account_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub metadata: Option<ExecutionMetadata>,
    pub trigger_payload: Option<serde_json::Value>,
    pub global_dependency: Option<serde_json::Value>,
    pub execution_input_enabled: bool,
}

/// Execution-wide key/value context, sent unchanged with every batch.
pub type ContextStore = BTreeMap<String, ContextValue>;

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// An unresolved fragment of the pipeline document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub node_id: NodeId,
    pub path: YamlPath,
}

impl Dependency {
    pub fn new(node_id: impl Into<NodeId>, path: impl Into<YamlPath>) -> Self {
        Self {
            node_id: node_id.into(),
            path: path.into(),
        }
    }
}

/// The mutable unit of work: everything still waiting for a service to
/// claim it, plus the document it refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencySet {
    /// The full processed document for this run.
    pub yaml: Arc<str>,
    /// Node id -> yaml path of every unclaimed fragment.
    pub pending: BTreeMap<NodeId, YamlPath>,
    /// Opaque per-node hints forwarded to whichever service claims the node.
    pub metadata: BTreeMap<NodeId, serde_json::Value>,
    /// Node id -> preferred service name.
    pub service_affinity: BTreeMap<NodeId, String>,
}

impl DependencySet {
    /// Create an empty set over `yaml`.
    pub fn new(yaml: impl Into<Arc<str>>) -> Self {
        Self {
            yaml: yaml.into(),
            pending: BTreeMap::new(),
            metadata: BTreeMap::new(),
            service_affinity: BTreeMap::new(),
        }
    }

    /// Create a set holding a single root dependency.
    pub fn with_root(yaml: impl Into<Arc<str>>, root: Dependency) -> Self {
        let mut set = Self::new(yaml);
        set.insert(root);
        set
    }

    /// Add a dependency. Returns `false` (and keeps the existing path) if the
    /// node id is already pending.
    pub fn insert(&mut self, dependency: Dependency) -> bool {
        if self.pending.contains_key(&dependency.node_id) {
            return false;
        }
        self.pending.insert(dependency.node_id, dependency.path);
        true
    }

    /// Remove a pending dependency and its metadata.
    pub fn remove(&mut self, node_id: &str) -> Option<YamlPath> {
        self.metadata.remove(node_id);
        self.pending.remove(node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// The set of pending node ids.
    pub fn pending_ids(&self) -> BTreeSet<NodeId> {
        self.pending.keys().cloned().collect()
    }

    /// Pending yaml paths, in node-id order.
    pub fn pending_paths(&self) -> Vec<YamlPath> {
        self.pending.values().cloned().collect()
    }

    /// Iterate pending entries as [`Dependency`] values, in node-id order.
    pub fn dependencies(&self) -> impl Iterator<Item = Dependency> + '_ {
        self.pending
            .iter()
            .map(|(node_id, path)| Dependency::new(node_id.clone(), path.clone()))
    }
}

// ---------------------------------------------------------------------------
// Plan nodes and layout
// ---------------------------------------------------------------------------

/// An execution plan node produced by a plan-creation service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanNode {
    pub uuid: NodeId,
    pub identifier: String,
    pub name: String,
    pub step_type: String,
    pub group: Option<String>,
    pub step_parameters: serde_json::Value,
    /// Nodes run as children of this one (e.g. the stages of a pipeline).
    pub child_node_ids: Vec<NodeId>,
    /// Node run after this one completes.
    pub next_node_id: Option<NodeId>,
    pub execution_input_template: Option<String>,
}

/// Outgoing edges of a layout node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeLayout {
    pub current_node_children: Vec<String>,
    pub next_ids: Vec<String>,
}

/// A node of the visualization graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphLayoutNode {
    pub node_uuid: String,
    pub node_type: String,
    pub name: String,
    pub node_identifier: String,
    pub node_group: String,
    pub edge_layout_list: EdgeLayout,
}

/// Visualization linkage, kept apart from the execution plan nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphLayoutInfo {
    pub starting_node_id: Option<String>,
    pub layout_nodes: BTreeMap<String, GraphLayoutNode>,
}

impl GraphLayoutInfo {
    pub fn is_empty(&self) -> bool {
        self.starting_node_id.is_none() && self.layout_nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Wire contract
// ---------------------------------------------------------------------------

/// Request sent to one service for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCreationBatchRequest {
    pub dependencies: BTreeMap<NodeId, YamlPath>,
    #[serde(default)]
    pub dependency_metadata: BTreeMap<NodeId, serde_json::Value>,
    pub yaml: Arc<str>,
    pub context: Arc<ContextStore>,
    /// Affinity entries for this batch's node ids only.
    #[serde(default)]
    pub service_affinity: BTreeMap<NodeId, String>,
    pub pipeline_version: PipelineVersion,
}

/// Successful answer to one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialResult {
    pub nodes: BTreeMap<NodeId, PlanNode>,
    /// Newly discovered dependencies, node id -> yaml path.
    pub dependencies: BTreeMap<NodeId, YamlPath>,
    pub dependency_metadata: BTreeMap<NodeId, serde_json::Value>,
    pub layout: GraphLayoutInfo,
    pub starting_node_id: Option<NodeId>,
    pub execution_input_templates: BTreeMap<NodeId, String>,
    pub context: ContextStore,
    pub service_affinity: BTreeMap<NodeId, String>,
    pub preserved_nodes_in_rollback: Vec<NodeId>,
    /// Yaml path -> replacement fragment, applied after the iteration merges.
    pub yaml_updates: BTreeMap<YamlPath, String>,
    /// Requested ids this answer settled without a node keyed by the id.
    pub resolved_dependencies: Vec<NodeId>,
}

impl PartialResult {
    /// Whether this answer settles the requested dependency `node_id`:
    /// it carries a node under that id or lists it as resolved.
    pub fn resolves(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
            || self.resolved_dependencies.iter().any(|id| id == node_id)
    }
}

/// A service's answer to one batch: a partial result or error messages.
///
/// On the wire an object carrying an `errors` key is an error answer and
/// must hold an array of strings; anything else is a partial result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServiceAnswer {
    Error { errors: Vec<String> },
    Success(PartialResult),
}

impl<'de> Deserialize<'de> for ServiceAnswer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ErrorBody {
            errors: Vec<String>,
        }

        let value = serde_json::Value::deserialize(deserializer)?;
        if value.get("errors").is_some() {
            let body = ErrorBody::deserialize(value)
                .map_err(|e| serde::de::Error::custom(format!("malformed error answer: {e}")))?;
            return Ok(Self::Error {
                errors: body.errors,
            });
        }
        PartialResult::deserialize(value)
            .map(Self::Success)
            .map_err(serde::de::Error::custom)
    }
}

impl ServiceAnswer {
    /// Build an error answer carrying a single message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            errors: vec![message.into()],
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<PartialResult> for ServiceAnswer {
    fn from(result: PartialResult) -> Self {
        Self::Success(result)
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// The fully resolved plan graph returned by a successful resolve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanGraph {
    pub nodes: BTreeMap<NodeId, PlanNode>,
    pub starting_node_id: Option<NodeId>,
    pub layout: GraphLayoutInfo,
    pub execution_input_templates: BTreeMap<NodeId, String>,
    pub preserved_nodes_in_rollback: BTreeSet<NodeId>,
    pub context: ContextStore,
}

impl PlanGraph {
    /// Whether `node_id` needs runtime-supplied input before it can run.
    pub fn requires_execution_input(&self, node_id: &str) -> bool {
        self.execution_input_templates.contains_key(node_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Shared test utilities for planfold integration tests.
//!
//! Provides an in-process [`ScriptedPlanCreator`] standing in for a remote
//! plan-creation service, builders for partial results and plan nodes, and
//! a few pipeline documents that are already preprocessed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use uuid::Uuid;

use planfold_core::ResolveRequest;
use planfold_core::service::PlanCreatorClient;
use planfold_types::models::{
    EdgeLayout, ExecutionMetadata, GraphLayoutNode, PartialResult, PipelineVersion,
    PlanCreationBatchRequest, PlanNode, ServiceAnswer, TriggerInfo, TriggerType,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Version 0 pipeline: a root with one CI and one deployment stage.
pub const V0_PIPELINE: &str = r#"
pipeline:
  __uuid: root
  identifier: deploy_prod
  name: Deploy Prod
  properties:
    ci:
      codebase:
        repo: planfold
  stages:
    - __uuid: item0
      stage:
        __uuid: build
        identifier: build
        type: CI
    - __uuid: item1
      stage:
        __uuid: prod
        identifier: prod
        type: Deployment
"#;

/// Path of the CI stage in [`V0_PIPELINE`].
pub const V0_BUILD_PATH: &str = "pipeline/stages/[0]/stage";

/// Path of the deployment stage in [`V0_PIPELINE`].
pub const V0_PROD_PATH: &str = "pipeline/stages/[1]/stage";

/// Version 1 pipeline: the document itself is the pipeline.
pub const V1_PIPELINE: &str = r#"
__uuid: root
version: 1
kind: pipeline
spec:
  __uuid: spec
  stages:
    - __uuid: build
      identifier: build
      type: ci
    - __uuid: prod
      identifier: prod
      type: deployment
"#;

/// A resolve request for `yaml` with fixed identity and fresh metadata.
pub fn resolve_request(yaml: &str, version: PipelineVersion) -> ResolveRequest {
    ResolveRequest {
        account_id: "acct".to_string(),
        org_id: Some("default".to_string()),
        project_id: Some("planfold".to_string()),
        pipeline_version: version,
        execution_metadata: ExecutionMetadata {
            execution_id: Uuid::new_v4(),
            run_sequence: 1,
            pipeline_identifier: "deploy_prod".to_string(),
            trigger: TriggerInfo {
                trigger_type: TriggerType::Manual,
                triggered_by: "tester".to_string(),
            },
            pipeline_version: version,
            started_at: Utc::now(),
        },
        processed_yaml: yaml.to_string(),
        trigger_payload: None,
        execution_input_enabled: false,
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// A plan node whose uuid and identifier are both `id`.
pub fn plan_node(id: &str) -> PlanNode {
    PlanNode {
        uuid: id.to_string(),
        identifier: id.to_string(),
        name: id.to_string(),
        step_type: "STAGE".to_string(),
        ..PlanNode::default()
    }
}

/// Fluent builder for a successful [`ServiceAnswer`].
#[derive(Debug, Default, Clone)]
pub struct PartialBuilder {
    result: PartialResult,
}

impl PartialBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plan node (and a matching layout node).
    pub fn node(mut self, id: &str) -> Self {
        self.result.nodes.insert(id.to_string(), plan_node(id));
        self.result.layout.layout_nodes.insert(
            id.to_string(),
            GraphLayoutNode {
                node_uuid: id.to_string(),
                node_type: "STAGE".to_string(),
                name: id.to_string(),
                node_identifier: id.to_string(),
                node_group: "STAGE".to_string(),
                edge_layout_list: EdgeLayout::default(),
            },
        );
        self
    }

    /// Add `child` to the children of the already added node `parent`.
    pub fn child(mut self, parent: &str, child: &str) -> Self {
        if let Some(node) = self.result.nodes.get_mut(parent) {
            node.child_node_ids.push(child.to_string());
        }
        self
    }

    /// Set the starting node (plan and layout).
    pub fn start(mut self, id: &str) -> Self {
        self.result.starting_node_id = Some(id.to_string());
        self.result.layout.starting_node_id = Some(id.to_string());
        self
    }

    /// Report a newly discovered dependency.
    pub fn dependency(mut self, id: &str, path: &str) -> Self {
        self.result
            .dependencies
            .insert(id.to_string(), path.to_string());
        self
    }

    /// Pin a node id to a service.
    pub fn affinity(mut self, id: &str, service: &str) -> Self {
        self.result
            .service_affinity
            .insert(id.to_string(), service.to_string());
        self
    }

    /// Settle a requested dependency without a node keyed by its id.
    pub fn resolved(mut self, id: &str) -> Self {
        self.result.resolved_dependencies.push(id.to_string());
        self
    }

    pub fn yaml_update(mut self, path: &str, fragment: &str) -> Self {
        self.result
            .yaml_updates
            .insert(path.to_string(), fragment.to_string());
        self
    }

    pub fn template(mut self, id: &str, template: &str) -> Self {
        self.result
            .execution_input_templates
            .insert(id.to_string(), template.to_string());
        self
    }

    pub fn result(self) -> PartialResult {
        self.result
    }

    pub fn build(self) -> ServiceAnswer {
        ServiceAnswer::Success(self.result)
    }
}

// ---------------------------------------------------------------------------
// Scripted service
// ---------------------------------------------------------------------------

type Handler =
    Arc<dyn Fn(PlanCreationBatchRequest) -> BoxFuture<'static, Result<ServiceAnswer>> + Send + Sync>;

/// In-process plan-creation service driven by a closure.
///
/// Every request is recorded before the handler runs, so tests can assert
/// on what the resolver sent.
pub struct ScriptedPlanCreator {
    handler: Handler,
    delay: Duration,
    requests: Mutex<Vec<PlanCreationBatchRequest>>,
}

impl ScriptedPlanCreator {
    /// Answer every request with `f(&request)`.
    pub fn new(
        f: impl Fn(&PlanCreationBatchRequest) -> ServiceAnswer + Send + Sync + 'static,
    ) -> Self {
        Self::from_async(move |request| {
            let answer = f(&request);
            async move { Ok(answer) }.boxed()
        })
    }

    /// Answer every request through an async handler, which may fail.
    pub fn from_async(
        f: impl Fn(PlanCreationBatchRequest) -> BoxFuture<'static, Result<ServiceAnswer>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(f),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer each dependency of a request with `f(node_id, path)`, merging
    /// the per-dependency partial results into one answer.
    pub fn per_dependency(
        f: impl Fn(&str, &str) -> PartialBuilder + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |request| {
            let mut merged = PartialResult::default();
            for (node_id, path) in &request.dependencies {
                let part = f(node_id, path).result();
                merged.nodes.extend(part.nodes);
                merged.dependencies.extend(part.dependencies);
                merged.layout.layout_nodes.extend(part.layout.layout_nodes);
                if merged.starting_node_id.is_none() {
                    merged.starting_node_id = part.starting_node_id;
                }
                if merged.layout.starting_node_id.is_none() {
                    merged.layout.starting_node_id = part.layout.starting_node_id;
                }
                merged.service_affinity.extend(part.service_affinity);
                merged.yaml_updates.extend(part.yaml_updates);
                merged
                    .resolved_dependencies
                    .extend(part.resolved_dependencies);
                merged
                    .execution_input_templates
                    .extend(part.execution_input_templates);
            }
            ServiceAnswer::Success(merged)
        })
    }

    /// One plain node per requested dependency, nothing discovered.
    pub fn echo() -> Self {
        Self::per_dependency(|node_id, _| PartialBuilder::new().node(node_id))
    }

    /// Always answer with the given error message.
    pub fn rejecting(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_| ServiceAnswer::error(message.clone()))
    }

    /// Always fail at the transport level.
    pub fn unreachable() -> Self {
        Self::from_async(|_| async { Err(anyhow::anyhow!("connection refused")) }.boxed())
    }

    /// Sleep before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize {
        self.lock().len()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<PlanCreationBatchRequest> {
        self.lock().clone()
    }

    /// Node ids requested so far, across all requests.
    pub fn requested_ids(&self) -> Vec<String> {
        self.lock()
            .iter()
            .flat_map(|r| r.dependencies.keys().cloned())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PlanCreationBatchRequest>> {
        self.requests.lock().expect("request log poisoned")
    }
}

#[async_trait]
impl PlanCreatorClient for ScriptedPlanCreator {
    async fn create_plan(&self, request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
        self.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(request).await
    }
}

/// Answer map for [`ScriptedPlanCreator::per_dependency`] keyed by node id;
/// unknown ids get a plain node.
pub fn by_node_id(
    answers: BTreeMap<&'static str, PartialBuilder>,
) -> impl Fn(&str, &str) -> PartialBuilder + Send + Sync + 'static {
    move |node_id, _| {
        answers
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| PartialBuilder::new().node(node_id))
    }
}

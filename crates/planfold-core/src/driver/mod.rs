//! Iteration driver: runs route, batch, execute and merge until nothing is
//! pending, then validates the finished graph.
//!
//! ```text
//! INIT --> ITERATING --(pending empty)--> validate --> DONE
//!              |
//!              +--(no progress | depth | service error | timeout)--> FAILED
//! ```
//!
//! Iterations are strictly sequential. Within one, the batches fan out on
//! the shared worker pool and the driver waits for all of them before
//! merging.

use std::collections::BTreeSet;
use std::sync::Arc;

use planfold_types::config::ResolverConfig;
use planfold_types::models::{
    Dependency, DependencySet, ExecutionMetadata, NodeId, PipelineVersion, PlanGraph,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batcher::batch;
use crate::context::initial_context;
use crate::error::ResolveError;
use crate::executor::{IterationInput, WorkerPool, execute_iteration};
use crate::merge::{Accumulator, merge};
use crate::notify::{WaitNotify, Waiter};
use crate::router::Router;
use crate::service::ServiceRegistry;
use crate::validator::{GraphValidator, StructuralValidator};
use crate::yaml::{YamlError, YamlTree};

/// Outcome delivered to a [`WaitNotify`] by [`PlanCreationResolver::submit_iteration`].
pub type IterationOutcome = Result<Accumulator, ResolveError>;

/// Everything needed to resolve one pipeline execution.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub account_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub pipeline_version: PipelineVersion,
    pub execution_metadata: ExecutionMetadata,
    /// Pipeline document whose mappings already carry node ids.
    pub processed_yaml: String,
    pub trigger_payload: Option<serde_json::Value>,
    pub execution_input_enabled: bool,
}

/// Resolves pipeline documents into plan graphs.
///
/// Cheap to clone; clones share the registry, router, worker pool and
/// validator, so concurrent resolve calls compete for the same permits.
#[derive(Clone)]
pub struct PlanCreationResolver {
    registry: Arc<ServiceRegistry>,
    router: Arc<Router>,
    pool: WorkerPool,
    validator: Arc<dyn GraphValidator>,
    config: ResolverConfig,
}

impl PlanCreationResolver {
    /// Create a resolver with the default routing chain, a worker pool
    /// sized from `config`, and the structural validator.
    pub fn new(registry: Arc<ServiceRegistry>, config: ResolverConfig) -> Self {
        Self {
            registry,
            router: Arc::new(Router::default()),
            pool: WorkerPool::new(config.worker_pool_size),
            validator: Arc::new(StructuralValidator),
            config,
        }
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = Arc::new(router);
        self
    }

    pub fn with_validator(mut self, validator: impl GraphValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Share an existing worker pool instead of the one built from config.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Resolve `request` into a validated plan graph.
    pub async fn resolve(&self, request: ResolveRequest) -> Result<PlanGraph, ResolveError> {
        self.resolve_cancellable(request, &CancellationToken::new()).await
    }

    /// Like [`PlanCreationResolver::resolve`], giving up with
    /// [`ResolveError::Cancelled`] once `cancel` fires. In-flight service
    /// calls of the current iteration are aborted.
    pub async fn resolve_cancellable(
        &self,
        request: ResolveRequest,
        cancel: &CancellationToken,
    ) -> Result<PlanGraph, ResolveError> {
        let execution_id = request.execution_metadata.execution_id;
        let version = request.pipeline_version;

        let result: Result<PlanGraph, ResolveError> = async {
            let mut acc = self.initialize(&request)?;
            let mut iteration = 0;
            while acc.has_pending() && iteration < self.config.max_depth {
                iteration += 1;
                let before = acc.deps.pending_ids();
                acc = tokio::select! {
                    outcome = self.run_iteration(acc, iteration, version) => outcome?,
                    () = cancel.cancelled() => {
                        return Err(ResolveError::Cancelled { iteration });
                    }
                };
                check_progress(&before, &acc)?;
            }
            self.finish(acc, iteration)
        }
        .await;

        log_outcome(execution_id, &result);
        result
    }

    /// Like [`PlanCreationResolver::resolve`], but each iteration runs as a
    /// background task published through `hub`; the caller suspends on the
    /// notification between iterations.
    pub async fn resolve_with_notify(
        &self,
        request: ResolveRequest,
        hub: &Arc<WaitNotify<IterationOutcome>>,
    ) -> Result<PlanGraph, ResolveError> {
        let execution_id = request.execution_metadata.execution_id;
        let version = request.pipeline_version;

        let result: Result<PlanGraph, ResolveError> = async {
            let mut acc = self.initialize(&request)?;
            let mut iteration = 0;
            while acc.has_pending() && iteration < self.config.max_depth {
                iteration += 1;
                let before = acc.deps.pending_ids();
                let (correlation_id, waiter) =
                    self.submit_iteration(acc, iteration, version, hub);
                acc = waiter.await.map_err(|_| ResolveError::Service {
                    iteration,
                    messages: vec![format!(
                        "iteration {correlation_id} ended without reporting a result"
                    )],
                })??;
                check_progress(&before, &acc)?;
            }
            self.finish(acc, iteration)
        }
        .await;

        log_outcome(execution_id, &result);
        result
    }

    /// Run one iteration in the background.
    ///
    /// The outcome is delivered through `hub` under the returned correlation
    /// id; await the returned waiter to receive it. An iteration that panics
    /// is delivered as [`ResolveError::Service`].
    pub fn submit_iteration(
        &self,
        acc: Accumulator,
        iteration: usize,
        version: PipelineVersion,
        hub: &Arc<WaitNotify<IterationOutcome>>,
    ) -> (Uuid, Waiter<IterationOutcome>) {
        let (correlation_id, waiter) = hub.register();
        let resolver = self.clone();
        let hub = Arc::clone(hub);

        let work =
            tokio::spawn(async move { resolver.run_iteration(acc, iteration, version).await });
        tokio::spawn(async move {
            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        correlation_id = %correlation_id,
                        iteration = iteration,
                        error = %e,
                        "iteration task failed"
                    );
                    Err(ResolveError::Service {
                        iteration,
                        messages: vec![format!("iteration task failed: {e}")],
                    })
                }
            };
            if !hub.notify(correlation_id, outcome) {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    iteration = iteration,
                    "iteration result had no waiter"
                );
            }
        });

        (correlation_id, waiter)
    }

    /// One route, batch, execute and merge round.
    ///
    /// When no pending dependency can be routed, no service is called and
    /// `acc` comes back unchanged.
    pub async fn run_iteration(
        &self,
        acc: Accumulator,
        iteration: usize,
        version: PipelineVersion,
    ) -> Result<Accumulator, ResolveError> {
        tracing::info!(
            iteration = iteration,
            pending = acc.deps.len(),
            "starting plan creation iteration"
        );

        let (batches, dispatched) = {
            let tree = YamlTree::parse(&acc.deps.yaml)?;
            let routing = self
                .router
                .route(&acc.deps, &tree, &self.registry, version);

            let mut batches = Vec::new();
            let mut dispatched: BTreeSet<NodeId> = BTreeSet::new();
            for (service, deps) in &routing.assigned {
                dispatched.extend(deps.iter().map(|d| d.node_id.clone()));
                batches.extend(batch(
                    service,
                    deps,
                    &acc.deps,
                    self.config.effective_batch_size(),
                ));
            }
            if !routing.unassigned.is_empty() {
                tracing::warn!(
                    iteration = iteration,
                    unassigned = routing.unassigned.len(),
                    "some dependencies were not claimed by any service"
                );
            }
            (batches, dispatched)
        };

        if batches.is_empty() {
            return Ok(acc);
        }

        let input = IterationInput {
            iteration,
            yaml: Arc::clone(&acc.deps.yaml),
            context: Arc::new(acc.context.clone()),
            pipeline_version: version,
            timeout: self.config.iteration_timeout,
            abort_on_timeout: self.config.abort_on_timeout,
        };
        let results = execute_iteration(&self.pool, &self.registry, batches, &input).await?;

        let acc = merge(acc, &dispatched, results)?;
        tracing::info!(
            iteration = iteration,
            nodes = acc.nodes.len(),
            pending = acc.deps.len(),
            "plan creation iteration merged"
        );
        Ok(acc)
    }

    /// Parse the document and seed the accumulator with the root field.
    fn initialize(&self, request: &ResolveRequest) -> Result<Accumulator, ResolveError> {
        let tree = YamlTree::parse(&request.processed_yaml)?;
        let root = tree.root_field(request.pipeline_version)?;
        let root_id = root.node_id().ok_or_else(|| YamlError::MissingNodeId {
            path: root.path.clone(),
        })?;

        let context = initial_context(request, &root)?;
        let deps = DependencySet::with_root(
            request.processed_yaml.as_str(),
            Dependency::new(root_id, root.path.clone()),
        );
        Ok(Accumulator::new(deps, context))
    }

    fn finish(&self, acc: Accumulator, iterations: usize) -> Result<PlanGraph, ResolveError> {
        if acc.has_pending() {
            return Err(ResolveError::DepthExceeded {
                max_depth: self.config.max_depth,
                paths: acc.deps.pending_paths(),
            });
        }

        let graph = acc.into_graph();
        self.validator
            .validate(&graph)
            .map_err(|messages| ResolveError::Validation { messages })?;

        tracing::debug!(iterations = iterations, "plan graph validated");
        Ok(graph)
    }
}

impl std::fmt::Debug for PlanCreationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCreationResolver")
            .field("registry", &self.registry)
            .field("router", &self.router)
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Fail when an iteration left the pending key set exactly as it found it.
fn check_progress(before: &BTreeSet<NodeId>, acc: &Accumulator) -> Result<(), ResolveError> {
    if acc.has_pending() && acc.deps.pending_ids() == *before {
        return Err(ResolveError::UnresolvedDependency {
            paths: acc.deps.pending_paths(),
        });
    }
    Ok(())
}

fn log_outcome(execution_id: Uuid, result: &Result<PlanGraph, ResolveError>) {
    match result {
        Ok(graph) => tracing::info!(
            execution_id = %execution_id,
            nodes = graph.nodes.len(),
            "plan creation complete"
        ),
        Err(e) => tracing::error!(
            execution_id = %execution_id,
            error = %e,
            "plan creation failed"
        ),
    }
}

//! Fan-out/fan-in executor.
//!
//! Every batch of an iteration becomes its own task on a [`JoinSet`]. Tasks
//! take a permit from the shared [`WorkerPool`] before calling their
//! service, so the pool bounds in-flight calls across all concurrent resolve
//! calls. The whole join runs under one iteration-wide timeout.
//!
//! Failure handling happens only after the join: transport failures become
//! synthetic error answers, and if any answer is an error the iteration
//! fails with every error message it collected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use planfold_types::models::{
    ContextStore, PartialResult, PipelineVersion, PlanCreationBatchRequest, ServiceAnswer,
};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};

use crate::batcher::Batch;
use crate::error::ResolveError;
use crate::service::ServiceRegistry;

/// Bounded pool of permits for in-flight service calls.
///
/// Cloning shares the same permits.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool allowing `size` concurrent calls (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running call.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Everything shared by the batches of one iteration.
#[derive(Debug, Clone)]
pub struct IterationInput {
    pub iteration: usize,
    pub yaml: Arc<str>,
    pub context: Arc<ContextStore>,
    pub pipeline_version: PipelineVersion,
    pub timeout: Duration,
    pub abort_on_timeout: bool,
}

/// Send every batch, wait for all of them, and return the partial results
/// in batch order.
pub async fn execute_iteration(
    pool: &WorkerPool,
    registry: &ServiceRegistry,
    batches: Vec<Batch>,
    input: &IterationInput,
) -> Result<Vec<PartialResult>, ResolveError> {
    let mut set: JoinSet<(usize, ServiceAnswer)> = JoinSet::new();
    let mut origins: HashMap<Id, usize> = HashMap::new();
    let services: Vec<String> = batches.iter().map(|b| b.service.clone()).collect();
    let mut answers: Vec<(usize, ServiceAnswer)> = Vec::with_capacity(batches.len());

    for (index, batch) in batches.into_iter().enumerate() {
        let service_name = batch.service.clone();
        let Some(service) = registry.get(&service_name) else {
            answers.push((
                index,
                ServiceAnswer::error(format!("service {service_name} is not registered")),
            ));
            continue;
        };

        let client = service.client();
        let permits = Arc::clone(&pool.permits);
        let request = PlanCreationBatchRequest {
            dependencies: batch.dependencies,
            dependency_metadata: batch.metadata,
            yaml: Arc::clone(&input.yaml),
            context: Arc::clone(&input.context),
            service_affinity: batch.affinity,
            pipeline_version: input.pipeline_version,
        };

        tracing::debug!(
            iteration = input.iteration,
            service = %service_name,
            batch_size = request.dependencies.len(),
            "dispatching batch"
        );

        let task_service = service_name;
        let handle = set.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return (index, ServiceAnswer::error("worker pool is closed"));
            };
            match client.create_plan(request).await {
                Ok(answer) => (index, answer),
                Err(e) => {
                    tracing::warn!(
                        service = %task_service,
                        error = %format!("{e:#}"),
                        "plan creation call failed"
                    );
                    (
                        index,
                        ServiceAnswer::error(format!("service {task_service} failed: {e:#}")),
                    )
                }
            }
        });
        origins.insert(handle.id(), index);
    }

    let joined =
        tokio::time::timeout(input.timeout, join_all(&mut set, &origins, &services)).await;
    let collected = match joined {
        Ok(collected) => collected,
        Err(_) => {
            tracing::warn!(
                iteration = input.iteration,
                timeout = ?input.timeout,
                in_flight = set.len(),
                abort = input.abort_on_timeout,
                "iteration timed out"
            );
            if input.abort_on_timeout {
                set.abort_all();
            } else {
                set.detach_all();
            }
            return Err(ResolveError::Timeout {
                iteration: input.iteration,
                timeout: input.timeout,
            });
        }
    };

    answers.extend(collected);
    answers.sort_by_key(|(index, _)| *index);

    let answers = answers
        .into_iter()
        .map(|(index, answer)| (services[index].as_str(), answer));
    fold_answers(input.iteration, answers)
}

/// Drain the join set. A panicked or cancelled task becomes an error answer
/// for the batch it was carrying.
async fn join_all(
    set: &mut JoinSet<(usize, ServiceAnswer)>,
    origins: &HashMap<Id, usize>,
    services: &[String],
) -> Vec<(usize, ServiceAnswer)> {
    let mut collected = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((_, outcome)) => collected.push(outcome),
            Err(e) => {
                let Some(&index) = origins.get(&e.id()) else {
                    continue;
                };
                let service = &services[index];
                tracing::warn!(
                    service = %service,
                    error = %e,
                    "plan creation task did not complete"
                );
                collected.push((
                    index,
                    ServiceAnswer::error(format!("service {service} task failed: {e}")),
                ));
            }
        }
    }
    collected
}

fn fold_answers<'a>(
    iteration: usize,
    answers: impl Iterator<Item = (&'a str, ServiceAnswer)>,
) -> Result<Vec<PartialResult>, ResolveError> {
    let mut results = Vec::new();
    let mut messages = Vec::new();

    for (service, answer) in answers {
        match answer {
            ServiceAnswer::Success(result) => results.push(result),
            ServiceAnswer::Error { errors } if errors.is_empty() => {
                messages.push(format!("service {service} reported an error without details"));
            }
            ServiceAnswer::Error { errors } => messages.extend(errors),
        }
    }

    if messages.is_empty() {
        Ok(results)
    } else {
        tracing::error!(
            iteration = iteration,
            errors = messages.len(),
            discarded = results.len(),
            "plan creation iteration failed"
        );
        Err(ResolveError::Service {
            iteration,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use planfold_types::models::PlanNode;

    use super::*;
    use crate::service::{PlanCreatorClient, PlanCreatorService, SupportedTypes};

    /// Answers with one node per requested dependency.
    struct EchoClient;

    #[async_trait]
    impl PlanCreatorClient for EchoClient {
        async fn create_plan(&self, request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
            let nodes = request
                .dependencies
                .keys()
                .map(|id| {
                    (
                        id.clone(),
                        PlanNode {
                            uuid: id.clone(),
                            ..PlanNode::default()
                        },
                    )
                })
                .collect();
            Ok(PartialResult {
                nodes,
                ..PartialResult::default()
            }
            .into())
        }
    }

    struct FailingClient;

    #[async_trait]
    impl PlanCreatorClient for FailingClient {
        async fn create_plan(&self, _request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
            Err(anyhow!("connection reset"))
        }
    }

    struct RejectingClient;

    #[async_trait]
    impl PlanCreatorClient for RejectingClient {
        async fn create_plan(&self, _request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
            Ok(ServiceAnswer::error("bad field"))
        }
    }

    struct PanickingClient;

    #[async_trait]
    impl PlanCreatorClient for PanickingClient {
        async fn create_plan(&self, _request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
            panic!("service client bug");
        }
    }

    /// Sleeps, then records that it finished.
    struct SlowClient {
        delay: Duration,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PlanCreatorClient for SlowClient {
        async fn create_plan(&self, _request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(PartialResult::default().into())
        }
    }

    /// Tracks the peak number of concurrent calls.
    struct GaugeClient {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl PlanCreatorClient for GaugeClient {
        async fn create_plan(&self, _request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(PartialResult::default().into())
        }
    }

    fn register(registry: &mut ServiceRegistry, name: &str, client: Arc<dyn PlanCreatorClient>) {
        registry.register(PlanCreatorService::from_arc(name, SupportedTypes::new(), client));
    }

    fn batch_of(service: &str, ids: &[&str]) -> Batch {
        Batch {
            service: service.to_string(),
            dependencies: ids
                .iter()
                .map(|id| (id.to_string(), format!("pipeline/{id}")))
                .collect(),
            metadata: BTreeMap::new(),
            affinity: BTreeMap::new(),
        }
    }

    fn input(timeout: Duration, abort_on_timeout: bool) -> IterationInput {
        IterationInput {
            iteration: 1,
            yaml: Arc::from("pipeline: {}"),
            context: Arc::new(ContextStore::new()),
            pipeline_version: PipelineVersion::V0,
            timeout,
            abort_on_timeout,
        }
    }

    #[tokio::test]
    async fn collects_results_in_batch_order() {
        let mut registry = ServiceRegistry::new();
        register(&mut registry, "ci", Arc::new(EchoClient));
        register(&mut registry, "cd", Arc::new(EchoClient));

        let batches = vec![batch_of("ci", &["a", "b"]), batch_of("cd", &["c"])];
        let results = execute_iteration(
            &WorkerPool::new(4),
            &registry,
            batches,
            &input(Duration::from_secs(5), true),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].nodes.len(), 2);
        assert!(results[1].nodes.contains_key("c"));
    }

    #[tokio::test]
    async fn one_error_fails_the_whole_iteration() {
        let mut registry = ServiceRegistry::new();
        register(&mut registry, "ci", Arc::new(RejectingClient));
        register(&mut registry, "cd", Arc::new(EchoClient));

        let batches = vec![batch_of("ci", &["a"]), batch_of("cd", &["b", "c", "d"])];
        let err = execute_iteration(
            &WorkerPool::new(4),
            &registry,
            batches,
            &input(Duration::from_secs(5), true),
        )
        .await
        .unwrap_err();

        match err {
            ResolveError::Service { iteration, messages } => {
                assert_eq!(iteration, 1);
                assert_eq!(messages, vec!["bad field".to_string()]);
            }
            other => panic!("expected Service, got: {other}"),
        }
    }

    #[tokio::test]
    async fn transport_failures_and_panics_become_error_answers() {
        let mut registry = ServiceRegistry::new();
        register(&mut registry, "ci", Arc::new(FailingClient));
        register(&mut registry, "cd", Arc::new(PanickingClient));

        let batches = vec![batch_of("ci", &["a"]), batch_of("cd", &["b"])];
        let err = execute_iteration(
            &WorkerPool::new(4),
            &registry,
            batches,
            &input(Duration::from_secs(5), true),
        )
        .await
        .unwrap_err();

        let messages = err.messages();
        assert_eq!(messages.len(), 2, "got: {messages:?}");
        assert!(messages[0].contains("service ci failed: connection reset"));
        assert!(messages[1].contains("service cd task failed"));
    }

    #[tokio::test]
    async fn unknown_service_is_an_error_answer() {
        let registry = ServiceRegistry::new();
        let err = execute_iteration(
            &WorkerPool::new(1),
            &registry,
            vec![batch_of("ghost", &["a"])],
            &input(Duration::from_secs(5), true),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("ghost is not registered"), "got: {err}");
    }

    #[tokio::test]
    async fn timeout_aborts_in_flight_calls() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        register(
            &mut registry,
            "ci",
            Arc::new(SlowClient {
                delay: Duration::from_millis(200),
                finished: Arc::clone(&finished),
            }),
        );

        let err = execute_iteration(
            &WorkerPool::new(2),
            &registry,
            vec![batch_of("ci", &["a"])],
            &input(Duration::from_millis(20), true),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::Timeout { iteration: 1, .. }), "got: {err}");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_can_detach_in_flight_calls() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        register(
            &mut registry,
            "ci",
            Arc::new(SlowClient {
                delay: Duration::from_millis(50),
                finished: Arc::clone(&finished),
            }),
        );

        let err = execute_iteration(
            &WorkerPool::new(2),
            &registry,
            vec![batch_of("ci", &["a"])],
            &input(Duration::from_millis(10), false),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::Timeout { .. }), "got: {err}");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let gauge = Arc::new(GaugeClient {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut registry = ServiceRegistry::new();
        register(&mut registry, "ci", gauge.clone());

        let batches = (0..8).map(|i| batch_of("ci", &[format!("n{i}").as_str()])).collect();
        let pool = WorkerPool::new(2);
        execute_iteration(&pool, &registry, batches, &input(Duration::from_secs(5), true))
            .await
            .unwrap();

        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn pool_size_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}

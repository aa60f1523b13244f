//! HTTP transport tests against a throwaway axum plan-creation service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use planfold_core::PlanCreationResolver;
use planfold_core::service::{
    ANY_TYPE, HttpPlanCreatorClient, PlanCreatorClient, PlanCreatorService, RetryingClient,
    ServiceRegistry, SupportedTypes,
};
use planfold_test_utils::{
    PartialBuilder, V0_BUILD_PATH, V0_PIPELINE, V0_PROD_PATH, resolve_request,
};
use planfold_types::config::{ResolverConfig, RetryConfig};
use planfold_types::models::{
    ContextStore, PipelineVersion, PlanCreationBatchRequest, ServiceAnswer,
};

// ===========================================================================
// Fake service
// ===========================================================================

#[derive(Clone, Default)]
struct FakeService {
    calls: Arc<AtomicUsize>,
    /// Requests to fail with 503 before answering normally.
    fail_first: usize,
}

/// Root gets the pipeline node plus both stages; everything else gets one
/// node per dependency. A dependency called `bad` is rejected, and one
/// called `garbled` gets an error body of the wrong shape.
async fn plan_creation(
    State(service): State<FakeService>,
    Json(request): Json<PlanCreationBatchRequest>,
) -> Response {
    let call = service.calls.fetch_add(1, Ordering::SeqCst);
    if call < service.fail_first {
        return (StatusCode::SERVICE_UNAVAILABLE, "warming up").into_response();
    }

    if request.dependencies.contains_key("bad") {
        return Json(ServiceAnswer::error("bad field")).into_response();
    }
    if request.dependencies.contains_key("garbled") {
        return Json(serde_json::json!({"errors": "bad field"})).into_response();
    }

    let mut builder = PartialBuilder::new();
    for node_id in request.dependencies.keys() {
        builder = builder.node(node_id);
        if node_id == "root" {
            builder = builder
                .start("root")
                .child("root", "build")
                .child("root", "prod")
                .dependency("build", V0_BUILD_PATH)
                .dependency("prod", V0_PROD_PATH);
        }
    }
    Json(builder.build()).into_response()
}

async fn spawn_service(service: FakeService) -> SocketAddr {
    let app = Router::new()
        .route("/plan-creation", post(plan_creation))
        .with_state(service);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server failed");
    });
    addr
}

fn request(ids: &[&str]) -> PlanCreationBatchRequest {
    PlanCreationBatchRequest {
        dependencies: ids
            .iter()
            .map(|id| (id.to_string(), format!("pipeline/{id}")))
            .collect(),
        dependency_metadata: Default::default(),
        yaml: Arc::from(V0_PIPELINE),
        context: Arc::new(ContextStore::new()),
        service_affinity: Default::default(),
        pipeline_version: PipelineVersion::V0,
    }
}

fn client(addr: SocketAddr) -> HttpPlanCreatorClient {
    HttpPlanCreatorClient::new(format!("http://{addr}/"), Duration::from_secs(5))
        .expect("valid url")
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn posts_batch_and_decodes_partial_result() {
    let addr = spawn_service(FakeService::default()).await;

    let answer = client(addr).create_plan(request(&["a", "b"])).await.unwrap();

    let ServiceAnswer::Success(result) = answer else {
        panic!("expected a partial result, got: {answer:?}");
    };
    assert_eq!(result.nodes.len(), 2);
    assert!(result.nodes.contains_key("a"));
}

#[tokio::test]
async fn decodes_error_answer() {
    let addr = spawn_service(FakeService::default()).await;

    let answer = client(addr).create_plan(request(&["bad"])).await.unwrap();
    assert_eq!(
        answer,
        ServiceAnswer::Error {
            errors: vec!["bad field".to_string()]
        }
    );
}

#[tokio::test]
async fn malformed_error_answer_is_a_transport_error() {
    let addr = spawn_service(FakeService::default()).await;

    let err = client(addr).create_plan(request(&["garbled"])).await.unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("invalid plan creation answer"), "got: {msg}");
    assert!(msg.contains("malformed error answer"), "got: {msg}");
}

#[tokio::test]
async fn non_success_status_is_a_transport_error() {
    let addr = spawn_service(FakeService {
        fail_first: usize::MAX,
        ..FakeService::default()
    })
    .await;

    let err = client(addr).create_plan(request(&["a"])).await.unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("503"), "got: {msg}");
    assert!(msg.contains("warming up"), "got: {msg}");
}

#[tokio::test]
async fn unreachable_service_is_a_transport_error() {
    // Bind and drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(addr).create_plan(request(&["a"])).await.unwrap_err();
    assert!(format!("{err:#}").contains("request to"), "got: {err:#}");
}

#[tokio::test]
async fn retrying_client_recovers_from_unavailable_service() {
    let service = FakeService {
        fail_first: 2,
        ..FakeService::default()
    };
    let calls = Arc::clone(&service.calls);
    let addr = spawn_service(service).await;

    let retrying = RetryingClient::new(
        "pms",
        Arc::new(client(addr)),
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
        },
    );

    let answer = retrying.create_plan(request(&["a"])).await.unwrap();
    assert!(!answer.is_error());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn resolves_pipeline_over_http() {
    let service = FakeService::default();
    let calls = Arc::clone(&service.calls);
    let addr = spawn_service(service).await;
    let http: Arc<dyn PlanCreatorClient> = Arc::new(client(addr));

    let mut registry = ServiceRegistry::new();
    registry.register_owner(PlanCreatorService::from_arc(
        "pms",
        SupportedTypes::new().with("pipeline", &[ANY_TYPE]),
        Arc::clone(&http),
    ));
    registry.register(PlanCreatorService::from_arc(
        "stages",
        SupportedTypes::new().with("stage", &[ANY_TYPE]),
        Arc::clone(&http),
    ));

    let resolver =
        PlanCreationResolver::new(Arc::new(registry), ResolverConfig::default_values());
    let graph = resolver
        .resolve(resolve_request(V0_PIPELINE, PipelineVersion::V0))
        .await
        .expect("resolve should succeed");

    assert_eq!(graph.nodes.len(), 3);
    assert_eq!(graph.starting_node_id.as_deref(), Some("root"));
    // One call for the root, one batch for both stages.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

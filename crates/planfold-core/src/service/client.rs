//! The `PlanCreatorClient` trait -- the RPC seam to a remote service.
//!
//! Each transport (HTTP, in-process fakes, retry wrappers) implements this
//! trait. The trait is object-safe so clients can be stored as
//! `Arc<dyn PlanCreatorClient>` in the [`super::ServiceRegistry`].

use anyhow::Result;
use async_trait::async_trait;

use planfold_types::models::{PlanCreationBatchRequest, ServiceAnswer};

/// Client for one remote plan-creation service.
///
/// `Err` means the call itself failed (connection refused, timeout, garbled
/// response). A service that processed the batch and rejected it answers
/// `Ok(ServiceAnswer::Error { .. })` instead.
#[async_trait]
pub trait PlanCreatorClient: Send + Sync {
    /// Ask the service to create plan nodes for one batch of dependencies.
    async fn create_plan(&self, request: PlanCreationBatchRequest) -> Result<ServiceAnswer>;
}

// Compile-time assertion: PlanCreatorClient must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn PlanCreatorClient) {}
};

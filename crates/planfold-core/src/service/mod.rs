//! Remote plan-creation services.
//!
//! This module defines the [`PlanCreatorClient`] trait every transport
//! implements, the declarative claim predicate ([`SupportedTypes`]), and the
//! [`ServiceRegistry`] the router consults.
//!
//! # Architecture
//!
//! ```text
//! Router
//!     |
//!     v
//! ServiceRegistry --claims(field, version)--> &PlanCreatorService
//!     |                                            |
//!     |   client() ---------------------------------+
//!     |        |
//!     |        v
//!     |   RetryingClient --> HttpPlanCreatorClient (or any PlanCreatorClient)
//!     |        |
//!     |   create_plan(PlanCreationBatchRequest) --> ServiceAnswer
//! ```

pub mod client;
pub mod http;
pub mod registry;
pub mod retry;
pub mod supported;

// Re-export the primary public API at the module level.
pub use client::PlanCreatorClient;
pub use http::HttpPlanCreatorClient;
pub use registry::{PlanCreatorService, ServiceRegistry};
pub use retry::RetryingClient;
pub use supported::{ANY_TYPE, SupportedTypes};

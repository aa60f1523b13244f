//! Distributed plan-creation resolver.
//!
//! ```text
//! PlanCreationResolver::resolve
//!     |
//!     v
//! loop (<= max_depth):
//!     Router   --pending deps--> service -> [Dependency]
//!     Batcher  --per service---> [Batch] (<= batch_size each)
//!     Executor --fan-out-------> PlanCreatorClient::create_plan (worker pool)
//!              <-fan-in-------- [ServiceAnswer] (single join, one timeout)
//!     merge(acc, answers) -> acc'
//!     |
//!     v
//! GraphValidator -> PlanGraph
//! ```

pub mod batcher;
pub mod context;
pub mod driver;
pub mod error;
pub mod executor;
pub mod merge;
pub mod notify;
pub mod router;
pub mod service;
pub mod validator;
pub mod yaml;

pub use driver::{PlanCreationResolver, ResolveRequest};
pub use error::ResolveError;
pub use merge::Accumulator;

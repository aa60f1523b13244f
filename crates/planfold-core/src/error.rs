//! Terminal failures of a resolve call.

use std::time::Duration;

use planfold_types::models::NodeId;
use thiserror::Error;

use crate::yaml::YamlError;

/// Why a resolve call produced no plan graph.
///
/// Transport failures of individual batches never appear here directly:
/// the executor folds them into [`ResolveError::Service`] together with the
/// errors services report themselves.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("plan creation failed in iteration {iteration}:\n  {}", .messages.join("\n  "))]
    Service {
        iteration: usize,
        messages: Vec<String>,
    },

    #[error("no service could resolve dependencies at paths: {}", .paths.join(", "))]
    UnresolvedDependency { paths: Vec<String> },

    #[error(
        "dependencies still pending after {max_depth} iterations at paths: {}",
        .paths.join(", ")
    )]
    DepthExceeded { max_depth: usize, paths: Vec<String> },

    #[error("plan graph validation failed:\n  {}", .messages.join("\n  "))]
    Validation { messages: Vec<String> },

    #[error("plan node {node_id:?} was produced by more than one service")]
    MergeConflict { node_id: NodeId },

    #[error("iteration {iteration} did not complete within {timeout:?}")]
    Timeout { iteration: usize, timeout: Duration },

    #[error("resolve cancelled during iteration {iteration}")]
    Cancelled { iteration: usize },

    #[error(transparent)]
    Yaml(#[from] YamlError),
}

impl ResolveError {
    /// Every message carried by this error, one per line of the aggregate.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Service { messages, .. } | Self::Validation { messages } => messages.clone(),
            other => vec![other.to_string()],
        }
    }
}

//! Initial context store of a resolve call.

use planfold_types::models::{ContextStore, ContextValue, METADATA_CONTEXT_KEY};
use serde_json::{Map, Value};

use crate::driver::ResolveRequest;
use crate::yaml::{YamlError, YamlField};

/// Root-field children copied into the global dependency blob.
const GLOBAL_FIELDS: [&str; 2] = ["properties", "variables"];

/// Build the context every service receives with every batch.
///
/// A single [`METADATA_CONTEXT_KEY`] entry carries the request identity, the
/// execution metadata, the trigger payload and the global dependency blob.
pub fn initial_context(
    request: &ResolveRequest,
    root: &YamlField<'_>,
) -> Result<ContextStore, YamlError> {
    let value = ContextValue {
        account_id: request.account_id.clone(),
        org_id: request.org_id.clone(),
        project_id: request.project_id.clone(),
        metadata: Some(request.execution_metadata.clone()),
        trigger_payload: request.trigger_payload.clone(),
        global_dependency: Some(global_dependency(request, root)?),
        execution_input_enabled: request.execution_input_enabled,
    };
    Ok(ContextStore::from([(METADATA_CONTEXT_KEY.to_string(), value)]))
}

/// JSON view of the pipeline-wide inputs: the root field's `properties` and
/// `variables` plus the pipeline identifier.
pub fn global_dependency(
    request: &ResolveRequest,
    root: &YamlField<'_>,
) -> Result<Value, YamlError> {
    let mut blob = Map::new();

    let identifier = root
        .identifier()
        .unwrap_or(request.execution_metadata.pipeline_identifier.as_str());
    blob.insert(
        "pipelineIdentifier".to_string(),
        Value::String(identifier.to_string()),
    );

    for key in GLOBAL_FIELDS {
        if let Some(child) = root.node.get(key) {
            let json = serde_json::to_value(child).map_err(|e| YamlError::Conversion {
                path: format!("{}/{key}", root.path),
                reason: e.to_string(),
            })?;
            blob.insert(key.to_string(), json);
        }
    }

    Ok(Value::Object(blob))
}

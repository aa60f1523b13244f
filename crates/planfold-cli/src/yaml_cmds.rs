//! `planfold preprocess` and `planfold inspect`: offline views of a pipeline
//! document.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use planfold_core::router::Router;
use planfold_core::service::ServiceRegistry;
use planfold_core::yaml::{self, YamlTree};
use planfold_types::models::{Dependency, DependencySet, PipelineVersion};

/// Read a pipeline document from disk.
pub fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline file {}", path.display()))
}

/// Assign node ids to `file` and write the result to `output` (or stdout).
pub fn run_preprocess(file: &Path, output: Option<&Path>) -> Result<()> {
    let text = read_document(file)?;
    let processed = yaml::preprocess(&text)
        .with_context(|| format!("failed to preprocess {}", file.display()))?;

    match output {
        Some(out) => {
            std::fs::write(out, &processed)
                .with_context(|| format!("failed to write {}", out.display()))?;
            tracing::info!(output = %out.display(), "wrote processed pipeline");
        }
        None => print!("{processed}"),
    }
    Ok(())
}

/// List every identified field of `file` and the service that would claim it.
pub fn run_inspect(file: &Path, version: PipelineVersion, registry: &ServiceRegistry) -> Result<()> {
    let text = read_document(file)?;
    let report = render_inspect(&text, version, registry)
        .with_context(|| format!("failed to inspect {}", file.display()))?;
    print!("{report}");
    Ok(())
}

/// Build the inspect table.
///
/// Every field carrying a node id is routed as if it were pending in the
/// first iteration, so the claim column shows what the default routing chain
/// would decide without calling any service.
pub fn render_inspect(
    text: &str,
    version: PipelineVersion,
    registry: &ServiceRegistry,
) -> Result<String> {
    let tree = YamlTree::parse(text)?;
    let fields = tree.fields();

    let mut deps = DependencySet::new(text);
    let mut duplicates = Vec::new();
    for field in &fields {
        let Some(id) = field.node_id() else {
            continue;
        };
        if !deps.insert(Dependency::new(id, field.path.clone())) {
            duplicates.push(id);
        }
    }

    let routing = Router::default().route(&deps, &tree, registry, version);
    let claims: HashMap<&str, &str> = routing
        .assigned
        .iter()
        .flat_map(|(service, deps)| {
            deps.iter()
                .map(move |d| (d.node_id.as_str(), service.as_str()))
        })
        .collect();

    let mut out = String::new();
    out.push_str(&format!(
        "Fields: {} (version {version}, {} claimed)\n",
        fields.len(),
        routing.assigned_count()
    ));
    for field in &fields {
        let id = field.node_id().unwrap_or("-");
        let path = if field.path.is_empty() {
            "<root>"
        } else {
            field.path.as_str()
        };
        let claimed_by = claims.get(id).copied().unwrap_or("-");
        out.push_str(&format!(
            "  {path}  name={} id={id} type={} service={claimed_by}\n",
            field.name,
            field.node_type().unwrap_or("-"),
        ));
    }
    for id in duplicates {
        out.push_str(&format!("warning: node id {id} appears more than once\n"));
    }
    Ok(out)
}

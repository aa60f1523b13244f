//! `planfold resolve` command: turn a pipeline document into a plan graph by
//! calling the configured services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use planfold_core::yaml::{self, YamlTree};
use planfold_core::{PlanCreationResolver, ResolveRequest};
use planfold_types::models::{ExecutionMetadata, PipelineVersion, TriggerInfo, TriggerType};

use crate::config::PlanfoldConfig;
use crate::yaml_cmds::read_document;

/// Per-run settings taken from the command line.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub version: PipelineVersion,
    /// Assign node ids before resolving.
    pub preprocess: bool,
    pub account_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub execution_input: bool,
    pub output: Option<PathBuf>,
}

pub async fn run_resolve(file: &Path, options: &ResolveOptions, config: &PlanfoldConfig) -> Result<()> {
    let text = read_document(file)?;
    let processed = if options.preprocess {
        yaml::preprocess(&text).with_context(|| format!("failed to preprocess {}", file.display()))?
    } else {
        text
    };

    let registry = config.registry()?;
    if registry.is_empty() {
        bail!("no services configured; run `planfold init` or add [[services]] to the config file");
    }

    let request = build_request(processed, file, options)?;
    let execution_id = request.execution_metadata.execution_id;
    let resolver = PlanCreationResolver::new(Arc::new(registry), config.resolver.clone());

    // First signal cancels the resolve, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nCancelling plan creation (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let graph = resolver
        .resolve_cancellable(request, &cancel)
        .await
        .with_context(|| format!("plan creation for execution {execution_id} failed"))?;

    let json = serde_json::to_string_pretty(&graph).context("failed to serialize plan graph")?;
    match &options.output {
        Some(out) => {
            std::fs::write(out, format!("{json}\n"))
                .with_context(|| format!("failed to write {}", out.display()))?;
            eprintln!(
                "Plan graph with {} nodes written to {}",
                graph.nodes.len(),
                out.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Wrap a processed document in a resolve request for a fresh manual
/// execution.
///
/// The pipeline identifier is the root's `identifier`, or the file stem
/// when the root has none.
pub fn build_request(
    processed_yaml: String,
    file: &Path,
    options: &ResolveOptions,
) -> Result<ResolveRequest> {
    let pipeline_identifier = {
        let tree = YamlTree::parse(&processed_yaml)
            .with_context(|| format!("failed to parse {}", file.display()))?;
        let root = tree
            .root_field(options.version)
            .with_context(|| format!("{} has no pipeline root", file.display()))?;
        match root.identifier() {
            Some(id) => id.to_string(),
            None => file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "pipeline".to_string()),
        }
    };

    let triggered_by = std::env::var("USER").unwrap_or_else(|_| "planfold".to_string());

    Ok(ResolveRequest {
        account_id: options.account_id.clone(),
        org_id: options.org_id.clone(),
        project_id: options.project_id.clone(),
        pipeline_version: options.version,
        execution_metadata: ExecutionMetadata {
            execution_id: Uuid::new_v4(),
            run_sequence: 1,
            pipeline_identifier,
            trigger: TriggerInfo {
                trigger_type: TriggerType::Manual,
                triggered_by,
            },
            pipeline_version: options.version,
            started_at: Utc::now(),
        },
        processed_yaml,
        trigger_payload: None,
        execution_input_enabled: options.execution_input,
    })
}

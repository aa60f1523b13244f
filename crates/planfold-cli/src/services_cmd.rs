//! `planfold services` command: show the configured plan-creation services.

use anyhow::Result;

use crate::config::PlanfoldConfig;

/// Print the services and resolver settings in effect.
pub fn run_services(config: &PlanfoldConfig) -> Result<()> {
    // Building the registry validates every service URL.
    config.registry()?;
    print!("{}", render_services(config));
    Ok(())
}

pub fn render_services(config: &PlanfoldConfig) -> String {
    let mut out = String::new();
    match &config.source {
        Some(path) => out.push_str(&format!("Config: {}\n", path.display())),
        None => out.push_str("Config: (none, using defaults)\n"),
    }
    let r = &config.resolver;
    out.push_str(&format!(
        "Resolver: max_depth={} batch_size={} iteration_timeout={}s worker_pool_size={} abort_on_timeout={}\n",
        r.max_depth,
        r.batch_size,
        r.iteration_timeout.as_secs(),
        r.worker_pool_size,
        r.abort_on_timeout,
    ));
    out.push_str(&format!(
        "Retry: max_attempts={} initial_backoff={}ms max_backoff={}ms\n",
        config.retry.max_attempts,
        config.retry.initial_backoff.as_millis(),
        config.retry.max_backoff.as_millis(),
    ));
    out.push('\n');

    if config.services.is_empty() {
        out.push_str("No services configured. Run `planfold init` to write a sample config.\n");
        return out;
    }

    out.push_str(&format!("Services ({}):\n", config.services.len()));
    for entry in &config.services {
        let marker = if entry.owner { " [owner]" } else { "" };
        let versions: Vec<String> = entry.versions.iter().map(ToString::to_string).collect();
        out.push_str(&format!(
            "  {}{marker} {} (versions {})\n",
            entry.name,
            entry.url,
            versions.join(",")
        ));
        for (field, types) in &entry.supported_types {
            out.push_str(&format!("    {field}: {}\n", types.join(", ")));
        }
    }
    out
}

mod config;
mod resolve_cmd;
mod services_cmd;
#[cfg(test)]
mod test_util;
mod yaml_cmds;

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use planfold_types::models::PipelineVersion;

use config::{Overrides, PlanfoldConfig};
use resolve_cmd::ResolveOptions;

#[derive(Parser)]
#[command(
    name = "planfold",
    about = "Resolve pipeline documents into plan graphs using remote plan-creation services"
)]
struct Cli {
    /// Config file (defaults to ~/.config/planfold/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Show the configured services and resolver settings
    Services,
    /// Assign a node id to every mapping of a pipeline file
    Preprocess {
        /// Pipeline YAML file
        file: PathBuf,
        /// Output file path (defaults to stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// List the identified fields of a pipeline file and which service claims each
    Inspect {
        /// Pipeline YAML file (already preprocessed)
        file: PathBuf,
        /// Pipeline grammar version: 0 or 1
        #[arg(long = "pipeline-version", default_value = "0")]
        version: PipelineVersion,
    },
    /// Resolve a pipeline file into a plan graph (JSON)
    Resolve {
        /// Pipeline YAML file
        file: PathBuf,
        /// Pipeline grammar version: 0 or 1
        #[arg(long = "pipeline-version", default_value = "0")]
        version: PipelineVersion,
        /// Assign node ids before resolving
        #[arg(long)]
        preprocess: bool,
        #[arg(long, default_value = "default")]
        account: String,
        #[arg(long)]
        org: Option<String>,
        #[arg(long)]
        project: Option<String>,
        /// Mark the execution as accepting runtime input
        #[arg(long)]
        execution_input: bool,
        /// Maximum number of iterations (overrides PLANFOLD_MAX_DEPTH)
        #[arg(long)]
        max_depth: Option<usize>,
        /// Dependencies per service request (overrides PLANFOLD_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Seconds allowed per iteration (overrides PLANFOLD_ITERATION_TIMEOUT_SECS)
        #[arg(long)]
        timeout: Option<u64>,
        /// Concurrent service calls (overrides PLANFOLD_WORKER_POOL_SIZE)
        #[arg(long)]
        workers: Option<usize>,
        /// Output file path (defaults to stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

/// Execute the `planfold init` command: write a sample config file.
fn cmd_init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let sample = config::ConfigFile::sample();
    config::save_config(path, &sample)?;

    println!("Config written to {}", path.display());
    for entry in &sample.services {
        println!("  service {} -> {}", entry.name, entry.url);
    }
    println!();
    println!("Edit the [[services]] entries, then run `planfold services` to check them.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let base = Overrides {
        config_path: cli.config.clone(),
        ..Overrides::default()
    };

    match cli.command {
        Commands::Init { force } => {
            let path = cli.config.unwrap_or_else(config::config_path);
            cmd_init(&path, force)?;
        }
        Commands::Services => {
            let resolved = PlanfoldConfig::resolve(&base)?;
            services_cmd::run_services(&resolved)?;
        }
        Commands::Preprocess { file, output } => {
            yaml_cmds::run_preprocess(&file, output.as_deref())?;
        }
        Commands::Inspect { file, version } => {
            let resolved = PlanfoldConfig::resolve(&base)?;
            let registry = resolved.registry()?;
            yaml_cmds::run_inspect(&file, version, &registry)?;
        }
        Commands::Resolve {
            file,
            version,
            preprocess,
            account,
            org,
            project,
            execution_input,
            max_depth,
            batch_size,
            timeout,
            workers,
            output,
        } => {
            let resolved = PlanfoldConfig::resolve(&Overrides {
                max_depth,
                batch_size,
                iteration_timeout_secs: timeout,
                worker_pool_size: workers,
                ..base
            })?;
            let options = ResolveOptions {
                version,
                preprocess,
                account_id: account,
                org_id: org,
                project_id: project,
                execution_input,
                output,
            };
            resolve_cmd::run_resolve(&file, &options, &resolved).await?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "planfold",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

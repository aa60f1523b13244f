//! Configuration file management for planfold.
//!
//! Provides a TOML-based config file at `~/.config/planfold/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use planfold_core::service::{
    ANY_TYPE, HttpPlanCreatorClient, PlanCreatorService, RetryingClient, ServiceRegistry,
    SupportedTypes,
};
use planfold_types::config::{ResolverConfig, RetryConfig};
use planfold_types::models::PipelineVersion;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub resolver: ResolverSection,
    pub retry: RetrySection,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub max_depth: Option<usize>,
    pub batch_size: Option<usize>,
    pub iteration_timeout_secs: Option<u64>,
    pub worker_pool_size: Option<usize>,
    pub abort_on_timeout: Option<bool>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

/// One remote plan-creation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    /// Base URL; batches are posted to `{url}/plan-creation`.
    pub url: String,
    /// Marks the service that owns the document root.
    #[serde(default)]
    pub owner: bool,
    #[serde(default = "all_versions")]
    pub versions: Vec<PipelineVersion>,
    /// Field name -> node types claimed (`__any__` claims every type).
    #[serde(default)]
    pub supported_types: BTreeMap<String, Vec<String>>,
}

fn all_versions() -> Vec<PipelineVersion> {
    vec![PipelineVersion::V0, PipelineVersion::V1]
}

impl ConfigFile {
    /// The file `planfold init` writes: every resolver knob spelled out, an
    /// owner service for the root, and one stage service.
    pub fn sample() -> Self {
        let resolver = ResolverConfig::default_values();
        let retry = RetryConfig::default();
        Self {
            resolver: ResolverSection {
                max_depth: Some(resolver.max_depth),
                batch_size: Some(resolver.batch_size),
                iteration_timeout_secs: Some(resolver.iteration_timeout.as_secs()),
                worker_pool_size: Some(resolver.worker_pool_size),
                abort_on_timeout: Some(resolver.abort_on_timeout),
            },
            retry: RetrySection {
                max_attempts: Some(retry.max_attempts),
                initial_backoff_ms: Some(millis(retry.initial_backoff)),
                max_backoff_ms: Some(millis(retry.max_backoff)),
            },
            services: vec![
                ServiceEntry {
                    name: "pms".to_string(),
                    url: "http://localhost:8080".to_string(),
                    owner: true,
                    versions: all_versions(),
                    supported_types: BTreeMap::from([(
                        "pipeline".to_string(),
                        vec![ANY_TYPE.to_string()],
                    )]),
                },
                ServiceEntry {
                    name: "ci".to_string(),
                    url: "http://localhost:8081".to_string(),
                    owner: false,
                    versions: all_versions(),
                    supported_types: BTreeMap::from([(
                        "stage".to_string(),
                        vec!["CI".to_string(), "ci".to_string()],
                    )]),
                },
            ],
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the planfold config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/planfold` or
/// `~/.config/planfold`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("planfold");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("planfold")
}

/// Return the path to the default config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line. `None` defers to the rest of the chain.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub max_depth: Option<usize>,
    pub batch_size: Option<usize>,
    pub iteration_timeout_secs: Option<u64>,
    pub worker_pool_size: Option<usize>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct PlanfoldConfig {
    pub resolver: ResolverConfig,
    pub retry: RetryConfig,
    pub services: Vec<ServiceEntry>,
    /// The config file that was read, if any.
    pub source: Option<PathBuf>,
}

impl PlanfoldConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// An explicit `--config` path must exist. The default path is optional.
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let (file, source) = match &overrides.config_path {
            Some(path) => (load_config(path)?, Some(path.clone())),
            None => {
                let path = config_path();
                if path.exists() {
                    (load_config(&path)?, Some(path))
                } else {
                    (ConfigFile::default(), None)
                }
            }
        };

        let defaults = ResolverConfig::default_values();
        let resolver = ResolverConfig {
            max_depth: pick(
                overrides.max_depth,
                "PLANFOLD_MAX_DEPTH",
                file.resolver.max_depth,
                defaults.max_depth,
            )?,
            batch_size: pick(
                overrides.batch_size,
                "PLANFOLD_BATCH_SIZE",
                file.resolver.batch_size,
                defaults.batch_size,
            )?,
            iteration_timeout: Duration::from_secs(pick(
                overrides.iteration_timeout_secs,
                "PLANFOLD_ITERATION_TIMEOUT_SECS",
                file.resolver.iteration_timeout_secs,
                defaults.iteration_timeout.as_secs(),
            )?),
            worker_pool_size: pick(
                overrides.worker_pool_size,
                "PLANFOLD_WORKER_POOL_SIZE",
                file.resolver.worker_pool_size,
                defaults.worker_pool_size,
            )?,
            abort_on_timeout: pick(
                None,
                "PLANFOLD_ABORT_ON_TIMEOUT",
                file.resolver.abort_on_timeout,
                defaults.abort_on_timeout,
            )?,
        };

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: pick(
                None,
                "PLANFOLD_RETRY_MAX_ATTEMPTS",
                file.retry.max_attempts,
                retry_defaults.max_attempts,
            )?,
            initial_backoff: Duration::from_millis(pick(
                None,
                "PLANFOLD_RETRY_INITIAL_BACKOFF_MS",
                file.retry.initial_backoff_ms,
                millis(retry_defaults.initial_backoff),
            )?),
            max_backoff: Duration::from_millis(pick(
                None,
                "PLANFOLD_RETRY_MAX_BACKOFF_MS",
                file.retry.max_backoff_ms,
                millis(retry_defaults.max_backoff),
            )?),
        };

        check_services(&file.services)?;

        Ok(Self {
            resolver,
            retry,
            services: file.services,
            source,
        })
    }

    /// Build the service registry: one retrying HTTP client per entry.
    pub fn registry(&self) -> Result<ServiceRegistry> {
        let mut registry = ServiceRegistry::new();
        for entry in &self.services {
            let http = HttpPlanCreatorClient::new(&entry.url, self.resolver.iteration_timeout)
                .with_context(|| format!("invalid URL for service {}", entry.name))?;
            let client = RetryingClient::new(&entry.name, Arc::new(http), self.retry.clone());
            let service = PlanCreatorService::new(
                &entry.name,
                SupportedTypes::from(entry.supported_types.clone()),
                client,
            )
            .with_versions(entry.versions.iter().copied());

            if entry.owner {
                registry.register_owner(service);
            } else {
                registry.register(service);
            }
        }
        Ok(registry)
    }
}

/// Names must be unique and at most one service may own the root.
fn check_services(services: &[ServiceEntry]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for entry in services {
        if !seen.insert(entry.name.as_str()) {
            bail!("service {:?} is configured more than once", entry.name);
        }
    }

    let owners: Vec<&str> = services
        .iter()
        .filter(|s| s.owner)
        .map(|s| s.name.as_str())
        .collect();
    if owners.len() > 1 {
        bail!("only one service may be the owner, found: {}", owners.join(", "));
    }
    Ok(())
}

fn pick<T>(cli: Option<T>, env_key: &str, file: Option<T>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    if let Ok(raw) = std::env::var(env_key) {
        return raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{env_key}={raw:?} is not valid: {e}"));
    }
    Ok(file.unwrap_or(default))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

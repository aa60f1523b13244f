use std::env;
use std::time::Duration;

/// Resolver tuning knobs.
///
/// Reads from `PLANFOLD_*` environment variables, falling back to the
/// defaults below when unset or unparsable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Maximum number of fan-out iterations per resolve call.
    pub max_depth: usize,
    /// Maximum number of dependencies sent to a service in one request.
    pub batch_size: usize,
    /// Wall time allowed for all batches of one iteration.
    pub iteration_timeout: Duration,
    /// Number of batch calls allowed in flight at once, across all
    /// concurrent resolve calls sharing the pool.
    pub worker_pool_size: usize,
    /// Abort in-flight batch calls when an iteration times out. When false
    /// they are detached and left to finish unobserved.
    pub abort_on_timeout: bool,
}

impl ResolverConfig {
    pub const DEFAULT_MAX_DEPTH: usize = 10;
    pub const DEFAULT_BATCH_SIZE: usize = 50;
    pub const DEFAULT_ITERATION_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_WORKER_POOL_SIZE: usize = 16;

    /// Build a config from the environment.
    ///
    /// Recognized variables: `PLANFOLD_MAX_DEPTH`, `PLANFOLD_BATCH_SIZE`,
    /// `PLANFOLD_ITERATION_TIMEOUT_SECS`, `PLANFOLD_WORKER_POOL_SIZE`.
    pub fn from_env() -> Self {
        let defaults = Self::default_values();
        Self {
            max_depth: env_parse("PLANFOLD_MAX_DEPTH").unwrap_or(defaults.max_depth),
            batch_size: env_parse("PLANFOLD_BATCH_SIZE").unwrap_or(defaults.batch_size),
            iteration_timeout: env_parse("PLANFOLD_ITERATION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.iteration_timeout),
            worker_pool_size: env_parse("PLANFOLD_WORKER_POOL_SIZE")
                .unwrap_or(defaults.worker_pool_size),
            abort_on_timeout: defaults.abort_on_timeout,
        }
    }

    /// The compile-time defaults, ignoring the environment.
    pub fn default_values() -> Self {
        Self {
            max_depth: Self::DEFAULT_MAX_DEPTH,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            iteration_timeout: Self::DEFAULT_ITERATION_TIMEOUT,
            worker_pool_size: Self::DEFAULT_WORKER_POOL_SIZE,
            abort_on_timeout: true,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = timeout;
        self
    }

    /// Batch size clamped to at least one entry per request.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Retry policy for calls to a single plan-creation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

    /// Backoff before retry number `retry` (1-based), before jitter.
    ///
    /// Doubles from `initial_backoff` and saturates at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

//! Bounded retry around any [`PlanCreatorClient`].
//!
//! Only transport failures (`Err`) are retried. A service that answers with
//! error messages has made its decision; retrying would not change it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;

use planfold_types::config::RetryConfig;
use planfold_types::models::{PlanCreationBatchRequest, ServiceAnswer};

use super::client::PlanCreatorClient;

/// Retries failed calls with jittered exponential backoff.
pub struct RetryingClient {
    service: String,
    inner: Arc<dyn PlanCreatorClient>,
    policy: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        service: impl Into<String>,
        inner: Arc<dyn PlanCreatorClient>,
        policy: RetryConfig,
    ) -> Self {
        Self {
            service: service.into(),
            inner,
            policy,
        }
    }
}

#[async_trait]
impl PlanCreatorClient for RetryingClient {
    async fn create_plan(&self, request: PlanCreationBatchRequest) -> Result<ServiceAnswer> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.inner.create_plan(request.clone()).await {
                Ok(answer) => return Ok(answer),
                Err(e) if attempt < max_attempts => {
                    let delay = jittered(self.policy.backoff_for(attempt));
                    tracing::warn!(
                        service = %self.service,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "plan creation call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "service {} failed after {attempt} attempt(s)",
                        self.service
                    )));
                }
            }
        }
    }
}

/// Pick a delay uniformly between half of `base` and `base`.
fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis < 2 {
        return base;
    }
    Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
}

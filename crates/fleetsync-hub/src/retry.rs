use crate::config::RetryConfig;
use crate::provider::{
    ProviderError, RawCluster, RawInstance, RawScheduledRule, RawService, RawStoppedTask,
    RawTaskDefinition, TopologyProvider,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based): doubles each
    /// time, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Wraps a provider so each call is retried on transient or throttle errors.
pub struct RetryingProvider {
    inner: Arc<dyn TopologyProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn TopologyProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        event = "upstream_retry",
                        operation = operation,
                        kind = %err.kind,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl TopologyProvider for RetryingProvider {
    async fn list_clusters(&self) -> Result<Vec<RawCluster>, ProviderError> {
        self.run("list_clusters", || self.inner.list_clusters()).await
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, ProviderError> {
        self.run("list_services", || self.inner.list_services(cluster))
            .await
    }

    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> Result<Vec<RawService>, ProviderError> {
        self.run("describe_services", || {
            self.inner.describe_services(cluster, services)
        })
        .await
    }

    async fn describe_task_definition(&self, arn: &str) -> Result<RawTaskDefinition, ProviderError> {
        self.run("describe_task_definition", || {
            self.inner.describe_task_definition(arn)
        })
        .await
    }

    async fn list_scheduled_rules(
        &self,
        cluster_arn: &str,
    ) -> Result<Vec<RawScheduledRule>, ProviderError> {
        self.run("list_scheduled_rules", || {
            self.inner.list_scheduled_rules(cluster_arn)
        })
        .await
    }

    async fn list_stopped_tasks(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Vec<RawStoppedTask>, ProviderError> {
        self.run("list_stopped_tasks", || {
            self.inner.list_stopped_tasks(cluster, service_name)
        })
        .await
    }

    async fn list_instances(&self) -> Result<Vec<RawInstance>, ProviderError> {
        self.run("list_instances", || self.inner.list_instances()).await
    }
}

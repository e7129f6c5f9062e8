use crate::provider::{ProviderError, RawTaskDefinition, TopologyProvider};
use chrono::{DateTime, Utc};
use fleetsync_core::topology::{DeploymentEntry, DeploymentStatus, StuckEvidence};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Task definitions already resolved during the current aggregation pass,
/// keyed by ARN.
pub type DefinitionLookup = HashMap<String, RawTaskDefinition>;

pub struct StuckRolloutDetector {
    provider: Arc<dyn TopologyProvider>,
    timeout: Duration,
}

/// The incoming (`PRIMARY`) and outgoing (`ACTIVE`) deployments of a rollout.
pub fn rollout_pair(deployments: &[DeploymentEntry]) -> Option<(&DeploymentEntry, &DeploymentEntry)> {
    if deployments.len() < 2 {
        return None;
    }
    let primary = deployments.iter().find(|entry| entry.is_primary())?;
    let outgoing = deployments
        .iter()
        .filter(|entry| entry.is_active())
        .max_by_key(|entry| entry.created_at)?;
    Some((primary, outgoing))
}

impl StuckRolloutDetector {
    pub fn new(provider: Arc<dyn TopologyProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Looks up a single service and assesses its rollout as of now.
    pub async fn check_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<DeploymentStatus, ProviderError> {
        let described = self
            .provider
            .describe_services(cluster, &[service.to_string()])
            .await?;
        let Some(raw) = described.into_iter().next() else {
            return Err(ProviderError::not_found(
                "describe_services",
                format!("service {service} in {cluster}"),
            ));
        };
        let deployments = raw
            .deployments
            .iter()
            .map(crate::aggregate::normalize_deployment)
            .collect::<Vec<_>>();
        self.assess(&deployments, &DefinitionLookup::new(), Utc::now())
            .await
    }

    /// A rollout is stuck once the primary deployment has been live longer
    /// than the timeout without reaching its desired count. Evidence is
    /// attached whenever a rollout is in progress, stuck or not.
    pub async fn assess(
        &self,
        deployments: &[DeploymentEntry],
        definitions: &DefinitionLookup,
        now: DateTime<Utc>,
    ) -> Result<DeploymentStatus, ProviderError> {
        let Some((primary, outgoing)) = rollout_pair(deployments) else {
            return Ok(DeploymentStatus::not_stuck());
        };

        let elapsed = now.signed_duration_since(primary.created_at);
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        let is_stuck = elapsed > timeout && primary.running_count < primary.desired_count;

        let target_images = self
            .images_for(&primary.task_definition_arn, definitions)
            .await?;
        let current_images = self
            .images_for(&outgoing.task_definition_arn, definitions)
            .await?;

        if is_stuck {
            info!(
                event = "rollout_stuck",
                deployment_id = %primary.id,
                elapsed_seconds = elapsed.num_seconds(),
                running = primary.running_count,
                desired = primary.desired_count
            );
        }

        Ok(DeploymentStatus {
            is_stuck,
            evidence: Some(StuckEvidence {
                elapsed_seconds: elapsed.num_seconds(),
                timeout_seconds: self.timeout.as_secs(),
                primary_deployment_id: primary.id.clone(),
                desired_count: primary.desired_count,
                running_count: primary.running_count,
                pending_count: primary.pending_count,
                outgoing_running_count: outgoing.running_count,
                current_images,
                target_images,
            }),
        })
    }

    async fn images_for(
        &self,
        arn: &str,
        definitions: &DefinitionLookup,
    ) -> Result<Vec<String>, ProviderError> {
        if arn.is_empty() {
            return Ok(Vec::new());
        }
        let images = match definitions.get(arn) {
            Some(definition) => container_images(definition),
            None => {
                debug!(event = "task_definition_fallback", arn = arn);
                container_images(&self.provider.describe_task_definition(arn).await?)
            }
        };
        Ok(images)
    }
}

fn container_images(definition: &RawTaskDefinition) -> Vec<String> {
    definition
        .containers
        .iter()
        .filter_map(|container| container.image.clone())
        .collect()
}

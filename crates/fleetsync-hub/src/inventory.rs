use crate::provider::{
    ProviderError, ProviderErrorKind, RawCluster, RawInstance, RawScheduledRule, RawService,
    RawStoppedTask, RawTaskDefinition, TopologyProvider,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// Whole-fleet inventory in the provider's raw shape. Backs the file
/// provider and the scripted test provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InventoryDocument {
    pub clusters: Vec<InventoryCluster>,
    pub task_definitions: Vec<RawTaskDefinition>,
    pub instances: Vec<RawInstance>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InventoryCluster {
    #[serde(flatten)]
    pub cluster: RawCluster,
    pub services: Vec<RawService>,
    pub scheduled_rules: Vec<RawScheduledRule>,
    /// Stopped tasks keyed by service name.
    pub stopped_tasks: BTreeMap<String, Vec<RawStoppedTask>>,
}

impl InventoryDocument {
    pub fn find_cluster(
        &self,
        operation: &str,
        reference: &str,
    ) -> Result<&InventoryCluster, ProviderError> {
        self.clusters
            .iter()
            .find(|entry| entry.cluster.name == reference || entry.cluster.arn == reference)
            .ok_or_else(|| ProviderError::not_found(operation, format!("cluster {reference}")))
    }

    pub fn clusters(&self) -> Vec<RawCluster> {
        self.clusters
            .iter()
            .map(|entry| entry.cluster.clone())
            .collect()
    }

    pub fn service_arns(&self, cluster: &str) -> Result<Vec<String>, ProviderError> {
        let entry = self.find_cluster("list_services", cluster)?;
        Ok(entry
            .services
            .iter()
            .map(|service| service.arn.clone())
            .collect())
    }

    /// Unknown service references are skipped, matching batch describe
    /// semantics where misses are reported per item rather than failing.
    pub fn describe_services(
        &self,
        cluster: &str,
        references: &[String],
    ) -> Result<Vec<RawService>, ProviderError> {
        let entry = self.find_cluster("describe_services", cluster)?;
        Ok(references
            .iter()
            .filter_map(|reference| {
                entry
                    .services
                    .iter()
                    .find(|service| &service.arn == reference || &service.name == reference)
                    .cloned()
            })
            .collect())
    }

    pub fn task_definition(&self, reference: &str) -> Result<RawTaskDefinition, ProviderError> {
        self.task_definitions
            .iter()
            .find(|definition| {
                definition.arn == reference
                    || definition
                        .revision
                        .map(|revision| format!("{}:{revision}", definition.family) == reference)
                        .unwrap_or(false)
            })
            .cloned()
            .ok_or_else(|| {
                ProviderError::not_found(
                    "describe_task_definition",
                    format!("task definition {reference}"),
                )
            })
    }

    pub fn scheduled_rules(&self, cluster: &str) -> Result<Vec<RawScheduledRule>, ProviderError> {
        Ok(self
            .find_cluster("list_scheduled_rules", cluster)?
            .scheduled_rules
            .clone())
    }

    pub fn stopped_tasks(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Vec<RawStoppedTask>, ProviderError> {
        let entry = self.find_cluster("list_stopped_tasks", cluster)?;
        Ok(entry
            .stopped_tasks
            .get(service_name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Reads a JSON [`InventoryDocument`] from disk on every call, so edits to
/// the file show up on the next cache miss.
pub struct FileTopologyProvider {
    path: PathBuf,
}

impl FileTopologyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self, operation: &str) -> Result<InventoryDocument, ProviderError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|err| {
            let kind = match err.kind() {
                io::ErrorKind::NotFound => ProviderErrorKind::NotFound,
                io::ErrorKind::PermissionDenied => ProviderErrorKind::PermissionDenied,
                _ => ProviderErrorKind::Transient,
            };
            ProviderError::new(kind, operation, format!("{}: {err}", self.path.display()))
        })?;
        debug!(event = "inventory_read", operation = operation, bytes = bytes.len());
        serde_json::from_slice(&bytes).map_err(|err| {
            ProviderError::new(
                ProviderErrorKind::Invalid,
                operation,
                format!("{}: {err}", self.path.display()),
            )
        })
    }
}

#[async_trait]
impl TopologyProvider for FileTopologyProvider {
    async fn list_clusters(&self) -> Result<Vec<RawCluster>, ProviderError> {
        Ok(self.load("list_clusters").await?.clusters())
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, ProviderError> {
        self.load("list_services").await?.service_arns(cluster)
    }

    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> Result<Vec<RawService>, ProviderError> {
        self.load("describe_services")
            .await?
            .describe_services(cluster, services)
    }

    async fn describe_task_definition(&self, arn: &str) -> Result<RawTaskDefinition, ProviderError> {
        self.load("describe_task_definition")
            .await?
            .task_definition(arn)
    }

    async fn list_scheduled_rules(
        &self,
        cluster_arn: &str,
    ) -> Result<Vec<RawScheduledRule>, ProviderError> {
        self.load("list_scheduled_rules")
            .await?
            .scheduled_rules(cluster_arn)
    }

    async fn list_stopped_tasks(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Vec<RawStoppedTask>, ProviderError> {
        self.load("list_stopped_tasks")
            .await?
            .stopped_tasks(cluster, service_name)
    }

    async fn list_instances(&self) -> Result<Vec<RawInstance>, ProviderError> {
        Ok(self.load("list_instances").await?.instances)
    }
}

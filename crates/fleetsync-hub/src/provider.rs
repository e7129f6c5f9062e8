use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Structured classification of an upstream failure. Retry decisions key off
/// this, never off the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    Transient,
    Throttled,
    NotFound,
    PermissionDenied,
    Invalid,
    Other,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Throttled => "throttled",
            ProviderErrorKind::NotFound => "not_found",
            ProviderErrorKind::PermissionDenied => "permission_denied",
            ProviderErrorKind::Invalid => "invalid",
            ProviderErrorKind::Other => "other",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderErrorKind::Transient | ProviderErrorKind::Throttled)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub operation: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, operation: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn transient(operation: &str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, operation, message)
    }

    pub fn throttled(operation: &str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Throttled, operation, message)
    }

    pub fn not_found(operation: &str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, operation, message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawCluster {
    pub arn: String,
    pub name: String,
    pub status: Option<String>,
    pub running_tasks_count: Option<u32>,
    pub pending_tasks_count: Option<u32>,
    pub active_services_count: Option<u32>,
    pub registered_container_instances_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawService {
    pub arn: String,
    pub name: String,
    pub status: Option<String>,
    pub desired_count: Option<u32>,
    pub running_count: Option<u32>,
    pub pending_count: Option<u32>,
    pub launch_type: Option<String>,
    pub task_definition: Option<String>,
    pub deployments: Vec<RawDeployment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawDeployment {
    pub id: String,
    pub status: Option<String>,
    pub task_definition: Option<String>,
    pub desired_count: Option<u32>,
    pub running_count: Option<u32>,
    pub pending_count: Option<u32>,
    pub rollout_state: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawTaskDefinition {
    pub arn: String,
    pub family: String,
    pub revision: Option<u32>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub containers: Vec<RawContainerDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawContainerDefinition {
    pub name: String,
    pub image: Option<String>,
    pub cpu: Option<u32>,
    pub memory: Option<u32>,
    pub memory_reservation: Option<u32>,
    pub environment: Vec<RawKeyValue>,
    pub secrets: Vec<RawSecret>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawKeyValue {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawSecret {
    pub name: String,
    pub value_from: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawScheduledRule {
    pub name: String,
    pub schedule_expression: Option<String>,
    pub state: Option<String>,
    pub target_task_definition: Option<String>,
    pub task_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawStoppedTask {
    pub task_arn: String,
    pub stopped_reason: Option<String>,
    pub stop_code: Option<String>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub containers: Vec<RawStoppedContainer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawStoppedContainer {
    pub name: String,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawInstance {
    pub instance_id: String,
    pub instance_type: Option<String>,
    pub state: Option<String>,
    pub private_ip: Option<String>,
    pub availability_zone: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
    pub tags: Vec<RawKeyValue>,
}

/// Upstream infrastructure API. Implementations return raw, possibly
/// incomplete records; normalisation happens in the aggregation engine.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<RawCluster>, ProviderError>;

    /// Service ARNs registered in `cluster` (name or ARN).
    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, ProviderError>;

    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> Result<Vec<RawService>, ProviderError>;

    async fn describe_task_definition(&self, arn: &str) -> Result<RawTaskDefinition, ProviderError>;

    async fn list_scheduled_rules(
        &self,
        cluster_arn: &str,
    ) -> Result<Vec<RawScheduledRule>, ProviderError>;

    async fn list_stopped_tasks(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Vec<RawStoppedTask>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<RawInstance>, ProviderError>;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Active,
    Inactive,
    Draining,
    Provisioning,
    Deprovisioning,
    Pending,
    Running,
    Stopped,
    Failed,
}

impl Default for ResourceStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Active => "ACTIVE",
            ResourceStatus::Inactive => "INACTIVE",
            ResourceStatus::Draining => "DRAINING",
            ResourceStatus::Provisioning => "PROVISIONING",
            ResourceStatus::Deprovisioning => "DEPROVISIONING",
            ResourceStatus::Pending => "PENDING",
            ResourceStatus::Running => "RUNNING",
            ResourceStatus::Stopped => "STOPPED",
            ResourceStatus::Failed => "FAILED",
        }
    }

    /// Upstream status strings are optional and loosely cased; anything
    /// absent or unrecognised collapses to `Inactive`.
    pub fn from_upstream(raw: Option<&str>) -> Self {
        raw.and_then(|value| value.parse().ok()).unwrap_or_default()
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_uppercase().replace('-', "_");
        match normalized.as_str() {
            "ACTIVE" => Ok(ResourceStatus::Active),
            "INACTIVE" => Ok(ResourceStatus::Inactive),
            "DRAINING" => Ok(ResourceStatus::Draining),
            "PROVISIONING" => Ok(ResourceStatus::Provisioning),
            "DEPROVISIONING" => Ok(ResourceStatus::Deprovisioning),
            "PENDING" => Ok(ResourceStatus::Pending),
            "RUNNING" => Ok(ResourceStatus::Running),
            "STOPPED" => Ok(ResourceStatus::Stopped),
            "FAILED" => Ok(ResourceStatus::Failed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologySnapshot {
    pub clusters: Vec<ClusterSnapshot>,
    #[serde(default)]
    pub instances: Vec<InstanceSummary>,
    pub captured_at: DateTime<Utc>,
}

impl TopologySnapshot {
    pub fn cluster(&self, name: &str) -> Option<&ClusterSnapshot> {
        self.clusters
            .iter()
            .find(|cluster| cluster.name == name || cluster.arn == name)
    }

    pub fn service_count(&self) -> usize {
        self.clusters.iter().map(|cluster| cluster.services.len()).sum()
    }

    /// Every service must point back at a cluster carried by the same snapshot.
    pub fn is_consistent(&self) -> bool {
        let names = self
            .clusters
            .iter()
            .map(|cluster| cluster.name.as_str())
            .collect::<HashSet<_>>();
        self.clusters.iter().all(|cluster| {
            cluster
                .services
                .iter()
                .all(|service| service.cluster_name == cluster.name && names.contains(service.cluster_name.as_str()))
        })
    }

    pub fn basic_clusters(&self) -> Vec<ClusterSummary> {
        self.clusters.iter().map(ClusterSnapshot::summary).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSnapshot {
    pub name: String,
    pub arn: String,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub running_tasks: u32,
    #[serde(default)]
    pub pending_tasks: u32,
    #[serde(default)]
    pub active_services: u32,
    #[serde(default)]
    pub container_instances: u32,
    #[serde(default)]
    pub services: Vec<ServiceSnapshot>,
    #[serde(default)]
    pub scheduled_jobs: Vec<ScheduledJob>,
}

impl ClusterSnapshot {
    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            name: self.name.clone(),
            arn: self.arn.clone(),
            status: self.status,
            running_tasks: self.running_tasks,
            pending_tasks: self.pending_tasks,
            active_services: self.active_services,
            container_instances: self.container_instances,
        }
    }
}

/// Cluster header without nested services, used for staged delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterSummary {
    pub name: String,
    pub arn: String,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub running_tasks: u32,
    #[serde(default)]
    pub pending_tasks: u32,
    #[serde(default)]
    pub active_services: u32,
    #[serde(default)]
    pub container_instances: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSnapshot {
    pub name: String,
    pub arn: String,
    pub cluster_name: String,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub desired_count: u32,
    #[serde(default)]
    pub running_count: u32,
    #[serde(default)]
    pub pending_count: u32,
    #[serde(default)]
    pub launch_type: String,
    #[serde(default)]
    pub task_definition: Option<TaskDefinitionSummary>,
    #[serde(default)]
    pub containers: Vec<ContainerSummary>,
    #[serde(default)]
    pub deployments: Vec<DeploymentEntry>,
    #[serde(default)]
    pub deployment_status: Option<DeploymentStatus>,
    #[serde(default)]
    pub failed_tasks: Vec<FailedTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDefinitionSummary {
    pub arn: String,
    pub family: String,
    pub revision: u32,
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub memory: Option<u32>,
    #[serde(default)]
    pub memory_reservation: Option<u32>,
    #[serde(default)]
    pub environment: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub secrets: Vec<SecretReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
    pub value_from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentEntry {
    pub id: String,
    /// `PRIMARY` for the incoming rollout, `ACTIVE` for the outgoing one.
    pub status: String,
    #[serde(default)]
    pub task_definition_arn: String,
    #[serde(default)]
    pub desired_count: u32,
    #[serde(default)]
    pub running_count: u32,
    #[serde(default)]
    pub pending_count: u32,
    #[serde(default)]
    pub rollout_state: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeploymentEntry {
    pub fn is_primary(&self) -> bool {
        self.status.eq_ignore_ascii_case("PRIMARY")
    }

    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("ACTIVE")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub is_stuck: bool,
    #[serde(default)]
    pub evidence: Option<StuckEvidence>,
}

impl DeploymentStatus {
    pub fn not_stuck() -> Self {
        Self {
            is_stuck: false,
            evidence: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StuckEvidence {
    pub elapsed_seconds: i64,
    pub timeout_seconds: u64,
    pub primary_deployment_id: String,
    pub desired_count: u32,
    pub running_count: u32,
    pub pending_count: u32,
    pub outgoing_running_count: u32,
    /// Images the service is currently running (outgoing deployment).
    pub current_images: Vec<String>,
    /// Images the rollout is trying to reach (primary deployment).
    pub target_images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedTask {
    pub task_arn: String,
    #[serde(default)]
    pub stopped_reason: String,
    #[serde(default)]
    pub stop_code: String,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub containers: Vec<FailedContainer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedContainer {
    pub name: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledJob {
    pub rule_name: String,
    #[serde(default)]
    pub schedule_expression: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub task_definition_arn: String,
    #[serde(default)]
    pub task_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSummary {
    pub instance_id: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub launch_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub name: String,
}

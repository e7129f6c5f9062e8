//! In-memory provider with call counters and scripted failures, plus a
//! small sample fleet. Used by unit tests, integration tests and local demos.

use crate::inventory::{InventoryCluster, InventoryDocument};
use crate::provider::{
    ProviderError, ProviderErrorKind, RawCluster, RawContainerDefinition, RawDeployment,
    RawInstance, RawKeyValue, RawScheduledRule, RawSecret, RawService, RawStoppedContainer,
    RawStoppedTask, RawTaskDefinition, TopologyProvider,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

pub struct ScriptedProvider {
    document: RwLock<InventoryDocument>,
    calls: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, (ProviderErrorKind, u32)>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a> {
    provider: &'a ScriptedProvider,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.provider.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProvider {
    pub fn new(document: InventoryDocument) -> Self {
        Self {
            document: RwLock::new(document),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the next `times` calls of `operation` fail with `kind`.
    pub fn fail_next(&self, operation: &str, kind: ProviderErrorKind, times: u32) {
        let mut failures = self.failures.lock().unwrap_or_else(|err| err.into_inner());
        failures.insert(operation.to_string(), (kind, times));
    }

    /// Swaps the fleet served by subsequent calls.
    pub fn replace_document(&self, document: InventoryDocument) {
        *self.document.write().unwrap_or_else(|err| err.into_inner()) = document;
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .values()
            .sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &str) -> Result<InFlight<'_>, ProviderError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .entry(operation.to_string())
            .or_default() += 1;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight { provider: self };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut failures = self.failures.lock().unwrap_or_else(|err| err.into_inner());
        if let Some((kind, remaining)) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::new(*kind, operation, "scripted failure"));
            }
        }
        Ok(guard)
    }

    fn read<T>(&self, f: impl FnOnce(&InventoryDocument) -> T) -> T {
        let document = self.document.read().unwrap_or_else(|err| err.into_inner());
        f(&document)
    }
}

#[async_trait]
impl TopologyProvider for ScriptedProvider {
    async fn list_clusters(&self) -> Result<Vec<RawCluster>, ProviderError> {
        let _guard = self.enter("list_clusters").await?;
        Ok(self.read(InventoryDocument::clusters))
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, ProviderError> {
        let _guard = self.enter("list_services").await?;
        self.read(|document| document.service_arns(cluster))
    }

    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> Result<Vec<RawService>, ProviderError> {
        let _guard = self.enter("describe_services").await?;
        self.read(|document| document.describe_services(cluster, services))
    }

    async fn describe_task_definition(&self, arn: &str) -> Result<RawTaskDefinition, ProviderError> {
        let _guard = self.enter("describe_task_definition").await?;
        self.read(|document| document.task_definition(arn))
    }

    async fn list_scheduled_rules(
        &self,
        cluster_arn: &str,
    ) -> Result<Vec<RawScheduledRule>, ProviderError> {
        let _guard = self.enter("list_scheduled_rules").await?;
        self.read(|document| document.scheduled_rules(cluster_arn))
    }

    async fn list_stopped_tasks(
        &self,
        cluster: &str,
        service_name: &str,
    ) -> Result<Vec<RawStoppedTask>, ProviderError> {
        let _guard = self.enter("list_stopped_tasks").await?;
        self.read(|document| document.stopped_tasks(cluster, service_name))
    }

    async fn list_instances(&self) -> Result<Vec<RawInstance>, ProviderError> {
        let _guard = self.enter("list_instances").await?;
        Ok(self.read(|document| document.instances.clone()))
    }
}

pub fn ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_default()
}

pub fn deployment(
    id: &str,
    status: &str,
    task_definition: &str,
    desired: u32,
    running: u32,
    created_at: DateTime<Utc>,
) -> RawDeployment {
    RawDeployment {
        id: id.to_string(),
        status: Some(status.to_string()),
        task_definition: Some(task_definition.to_string()),
        desired_count: Some(desired),
        running_count: Some(running),
        pending_count: Some(desired.saturating_sub(running)),
        rollout_state: Some("IN_PROGRESS".to_string()),
        created_at: Some(created_at),
        updated_at: None,
    }
}

pub fn service(
    cluster: &str,
    name: &str,
    task_definition: &str,
    deployments: Vec<RawDeployment>,
) -> RawService {
    RawService {
        arn: format!("arn:aws:ecs:service/{cluster}/{name}"),
        name: name.to_string(),
        status: Some("ACTIVE".to_string()),
        desired_count: Some(2),
        running_count: Some(2),
        pending_count: Some(0),
        launch_type: Some("FARGATE".to_string()),
        task_definition: Some(task_definition.to_string()),
        deployments,
    }
}

pub fn task_definition(family: &str, revision: u32, image: &str) -> RawTaskDefinition {
    RawTaskDefinition {
        arn: format!("arn:aws:ecs:task-definition/{family}:{revision}"),
        family: family.to_string(),
        revision: Some(revision),
        cpu: Some("256".to_string()),
        memory: Some("512".to_string()),
        containers: vec![RawContainerDefinition {
            name: family.to_string(),
            image: Some(image.to_string()),
            cpu: Some(128),
            memory: Some(512),
            memory_reservation: None,
            environment: vec![RawKeyValue {
                name: "RUST_LOG".to_string(),
                value: Some("info".to_string()),
            }],
            secrets: vec![RawSecret {
                name: "DATABASE_URL".to_string(),
                value_from: format!("arn:aws:ssm:parameter/{family}/database-url"),
            }],
        }],
    }
}

/// Two clusters. `prod/api` is rolling from app:7 to app:8 since New Year
/// and is short of its desired count; `prod/web` shares app:7 with it.
pub fn sample_inventory() -> InventoryDocument {
    let app_7 = "arn:aws:ecs:task-definition/app:7";
    let app_8 = "arn:aws:ecs:task-definition/app:8";
    let worker_3 = "arn:aws:ecs:task-definition/worker:3";
    let long_ago = ts("2026-01-01T00:00:00Z");

    let mut prod_stopped = BTreeMap::new();
    prod_stopped.insert(
        "api".to_string(),
        vec![RawStoppedTask {
            task_arn: "arn:aws:ecs:task/prod/1f2e".to_string(),
            stopped_reason: Some("Essential container in task exited".to_string()),
            stop_code: Some("EssentialContainerExited".to_string()),
            stopped_at: Some(ts("2026-01-01T00:05:00Z")),
            containers: vec![RawStoppedContainer {
                name: "app".to_string(),
                exit_code: Some(137),
                reason: Some("OutOfMemoryError".to_string()),
            }],
        }],
    );

    InventoryDocument {
        clusters: vec![
            InventoryCluster {
                cluster: RawCluster {
                    arn: "arn:aws:ecs:cluster/prod".to_string(),
                    name: "prod".to_string(),
                    status: Some("ACTIVE".to_string()),
                    running_tasks_count: Some(5),
                    pending_tasks_count: Some(1),
                    active_services_count: Some(3),
                    registered_container_instances_count: Some(0),
                },
                services: vec![
                    service(
                        "prod",
                        "api",
                        app_8,
                        vec![
                            deployment("ecs-svc/2", "PRIMARY", app_8, 2, 0, long_ago),
                            deployment("ecs-svc/1", "ACTIVE", app_7, 2, 2, long_ago),
                        ],
                    ),
                    service(
                        "prod",
                        "web",
                        app_7,
                        vec![deployment("ecs-svc/3", "PRIMARY", app_7, 2, 2, long_ago)],
                    ),
                    service(
                        "prod",
                        "worker",
                        worker_3,
                        vec![deployment("ecs-svc/4", "PRIMARY", worker_3, 1, 1, long_ago)],
                    ),
                ],
                scheduled_rules: vec![RawScheduledRule {
                    name: "nightly-report".to_string(),
                    schedule_expression: Some("cron(0 3 * * ? *)".to_string()),
                    state: Some("ENABLED".to_string()),
                    target_task_definition: Some(worker_3.to_string()),
                    task_count: Some(1),
                }],
                stopped_tasks: prod_stopped,
            },
            InventoryCluster {
                cluster: RawCluster {
                    arn: "arn:aws:ecs:cluster/staging".to_string(),
                    name: "staging".to_string(),
                    status: None,
                    running_tasks_count: None,
                    pending_tasks_count: None,
                    active_services_count: Some(1),
                    registered_container_instances_count: None,
                },
                services: vec![service(
                    "staging",
                    "api",
                    app_8,
                    vec![deployment("ecs-svc/9", "PRIMARY", app_8, 1, 1, long_ago)],
                )],
                scheduled_rules: Vec::new(),
                stopped_tasks: BTreeMap::new(),
            },
        ],
        task_definitions: vec![
            task_definition("app", 7, "registry.local/app:1.4.0"),
            task_definition("app", 8, "registry.local/app:1.5.0"),
            task_definition("worker", 3, "registry.local/worker:0.9.2"),
        ],
        instances: vec![
            RawInstance {
                instance_id: "i-0a1".to_string(),
                instance_type: Some("m6i.large".to_string()),
                state: Some("running".to_string()),
                private_ip: Some("10.0.1.12".to_string()),
                availability_zone: Some("eu-west-1a".to_string()),
                launch_time: Some(long_ago),
                tags: vec![RawKeyValue {
                    name: "Name".to_string(),
                    value: Some("bastion".to_string()),
                }],
            },
            RawInstance {
                instance_id: "i-0b2".to_string(),
                instance_type: None,
                state: None,
                private_ip: None,
                availability_zone: None,
                launch_time: None,
                tags: Vec::new(),
            },
        ],
    }
}

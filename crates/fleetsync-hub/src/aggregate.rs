use crate::config::{AggregationConfig, HubConfig};
use crate::provider::{
    ProviderError, ProviderErrorKind, RawCluster, RawDeployment, RawInstance, RawScheduledRule,
    RawService, RawStoppedTask, RawTaskDefinition, TopologyProvider,
};
use crate::stuck::{DefinitionLookup, StuckRolloutDetector};
use chrono::{DateTime, Utc};
use fleetsync_core::topology::{
    ClusterSnapshot, ClusterSummary, ContainerSummary, DeploymentEntry, EnvironmentVariable,
    FailedContainer, FailedTask, InstanceSummary, ResourceStatus, ScheduledJob, SecretReference,
    ServiceSnapshot, TaskDefinitionSummary, TopologySnapshot,
};
use futures_util::future::try_join;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Clusters,
    Services,
    ScheduledJobs,
    DescribeServices,
    TaskDefinitions,
    RolloutStatus,
    FailedTasks,
    Instances,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Clusters => "clusters",
            PipelineStage::Services => "services",
            PipelineStage::ScheduledJobs => "scheduled_jobs",
            PipelineStage::DescribeServices => "describe_services",
            PipelineStage::TaskDefinitions => "task_definitions",
            PipelineStage::RolloutStatus => "rollout_status",
            PipelineStage::FailedTasks => "failed_tasks",
            PipelineStage::Instances => "instances",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("{stage} stage failed: {source}")]
    Provider {
        stage: PipelineStage,
        #[source]
        source: ProviderError,
    },
    #[error("cluster {0} not found")]
    ClusterNotFound(String),
}

impl AggregationError {
    fn at(stage: PipelineStage) -> impl FnOnce(ProviderError) -> Self {
        move |source| AggregationError::Provider { stage, source }
    }

    /// Stable code carried by `error` pushes.
    pub fn code(&self) -> &'static str {
        match self {
            AggregationError::Provider { source, .. } => match source.kind {
                ProviderErrorKind::Throttled => "upstream_throttled",
                ProviderErrorKind::NotFound => "upstream_not_found",
                ProviderErrorKind::PermissionDenied => "upstream_permission_denied",
                ProviderErrorKind::Invalid => "upstream_invalid",
                ProviderErrorKind::Transient | ProviderErrorKind::Other => "upstream_failure",
            },
            AggregationError::ClusterNotFound(_) => "cluster_not_found",
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            AggregationError::Provider { source, .. } if source.kind == ProviderErrorKind::Throttled
        )
    }
}

/// A full snapshot as handed to a session. `served_at` is always the time of
/// this call, even when the snapshot itself came from the cache.
#[derive(Debug, Clone)]
pub struct SnapshotFetch {
    pub snapshot: Arc<TopologySnapshot>,
    pub from_cache: bool,
    pub served_at: DateTime<Utc>,
}

struct CachedSnapshot {
    snapshot: Arc<TopologySnapshot>,
    stored_at: Instant,
}

/// Outcome of the most recent miss pipeline, kept under the fetch gate so
/// callers that queued behind it share its result.
struct SettledRun {
    generation: u64,
    outcome: Result<Arc<TopologySnapshot>, AggregationError>,
}

/// Raw records gathered for one cluster before normalisation.
struct ClusterParts {
    cluster: RawCluster,
    services: Vec<RawService>,
    rules: Vec<RawScheduledRule>,
}

pub struct AggregationEngine {
    provider: Arc<dyn TopologyProvider>,
    detector: StuckRolloutDetector,
    config: AggregationConfig,
    ttl: Duration,
    cache: RwLock<Option<CachedSnapshot>>,
    fetch_gate: Mutex<Option<SettledRun>>,
    settled_runs: AtomicU64,
    pipeline_runs: AtomicU64,
}

impl AggregationEngine {
    pub fn new(
        provider: Arc<dyn TopologyProvider>,
        config: AggregationConfig,
        ttl: Duration,
        stuck_timeout: Duration,
    ) -> Self {
        Self {
            detector: StuckRolloutDetector::new(provider.clone(), stuck_timeout),
            provider,
            config,
            ttl,
            cache: RwLock::new(None),
            fetch_gate: Mutex::new(None),
            settled_runs: AtomicU64::new(0),
            pipeline_runs: AtomicU64::new(0),
        }
    }

    pub fn from_config(provider: Arc<dyn TopologyProvider>, config: &HubConfig) -> Self {
        Self::new(
            provider,
            config.aggregation.clone(),
            config.cache.ttl(),
            config.rollout.stuck_timeout(),
        )
    }

    /// Number of miss pipelines run since startup.
    pub fn pipeline_runs(&self) -> u64 {
        self.pipeline_runs.load(Ordering::SeqCst)
    }

    pub async fn cache_age(&self) -> Option<Duration> {
        self.cache
            .read()
            .await
            .as_ref()
            .map(|cached| cached.stored_at.elapsed())
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    pub async fn full_snapshot(&self) -> Result<SnapshotFetch, AggregationError> {
        if let Some(snapshot) = self.fresh_cached().await {
            debug!(event = "snapshot_cache_hit");
            return Ok(SnapshotFetch::cached(snapshot));
        }

        let observed = self.settled_runs.load(Ordering::SeqCst);
        let mut last_run = self.fetch_gate.lock().await;
        // A run that settled while we queued answers for us, failed or not.
        if let Some(run) = last_run.as_ref().filter(|run| run.generation > observed) {
            debug!(event = "snapshot_joined", generation = run.generation, ok = run.outcome.is_ok());
            return run.outcome.clone().map(SnapshotFetch::cached);
        }
        if let Some(snapshot) = self.fresh_cached().await {
            debug!(event = "snapshot_cache_hit", after_wait = true);
            return Ok(SnapshotFetch::cached(snapshot));
        }

        let outcome = self.run_pipeline().await.map(Arc::new);
        if let Ok(snapshot) = &outcome {
            *self.cache.write().await = Some(CachedSnapshot {
                snapshot: snapshot.clone(),
                stored_at: Instant::now(),
            });
        }
        let generation = self.settled_runs.fetch_add(1, Ordering::SeqCst) + 1;
        *last_run = Some(SettledRun {
            generation,
            outcome: outcome.clone(),
        });
        outcome.map(|snapshot| SnapshotFetch {
            snapshot,
            from_cache: false,
            served_at: Utc::now(),
        })
    }

    pub async fn basic_clusters(&self) -> Result<Vec<ClusterSummary>, AggregationError> {
        if let Some(snapshot) = self.fresh_cached().await {
            return Ok(snapshot.basic_clusters());
        }
        let mut clusters = self
            .provider
            .list_clusters()
            .await
            .map_err(AggregationError::at(PipelineStage::Clusters))?
            .iter()
            .map(|raw| normalize_cluster(raw, Vec::new(), Vec::new()).summary())
            .collect::<Vec<_>>();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    pub async fn cluster_services(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<ServiceSnapshot>, AggregationError> {
        if let Some(snapshot) = self.fresh_cached().await {
            return snapshot
                .cluster(cluster_name)
                .map(|cluster| cluster.services.clone())
                .ok_or_else(|| AggregationError::ClusterNotFound(cluster_name.to_string()));
        }

        let arns = self
            .provider
            .list_services(cluster_name)
            .await
            .map_err(|err| not_found_as_cluster(err, cluster_name, PipelineStage::Services))?;
        let raw = self.describe_in_batches(cluster_name, &arns).await?;
        let definitions = self.resolve_task_definitions(raw.iter()).await?;
        let now = Utc::now();
        let mut services = stream::iter(raw)
            .map(|service| self.build_service(cluster_name, service, &definitions, now))
            .buffer_unordered(self.concurrency())
            .try_collect::<Vec<_>>()
            .await?;
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    pub async fn scheduled_jobs(
        &self,
        cluster_name: &str,
        cluster_arn: Option<&str>,
    ) -> Result<Vec<ScheduledJob>, AggregationError> {
        if let Some(snapshot) = self.fresh_cached().await {
            let cluster = cluster_arn
                .and_then(|arn| snapshot.cluster(arn))
                .or_else(|| snapshot.cluster(cluster_name));
            return cluster
                .map(|cluster| cluster.scheduled_jobs.clone())
                .ok_or_else(|| AggregationError::ClusterNotFound(cluster_name.to_string()));
        }

        let reference = cluster_arn.unwrap_or(cluster_name);
        let rules = self
            .provider
            .list_scheduled_rules(reference)
            .await
            .map_err(|err| not_found_as_cluster(err, cluster_name, PipelineStage::ScheduledJobs))?;
        Ok(rules.iter().map(normalize_rule).collect())
    }

    pub async fn inventory_only(&self) -> Result<Vec<InstanceSummary>, AggregationError> {
        if let Some(snapshot) = self.fresh_cached().await {
            return Ok(snapshot.instances.clone());
        }
        self.fetch_instances().await
    }

    async fn fresh_cached(&self) -> Option<Arc<TopologySnapshot>> {
        if self.ttl.is_zero() {
            return None;
        }
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|cached| cached.stored_at.elapsed() < self.ttl)
            .map(|cached| cached.snapshot.clone())
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    async fn run_pipeline(&self) -> Result<TopologySnapshot, AggregationError> {
        let run = self.pipeline_runs.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        debug!(event = "snapshot_pipeline_start", run = run);

        let result = self.collect_snapshot().await;
        match &result {
            Ok(snapshot) => info!(
                event = "snapshot_built",
                run = run,
                clusters = snapshot.clusters.len(),
                services = snapshot.service_count(),
                instances = snapshot.instances.len(),
                elapsed_ms = started.elapsed().as_millis() as u64
            ),
            Err(err) => warn!(
                event = "snapshot_failed",
                run = run,
                code = err.code(),
                throttled = err.is_throttled(),
                error = %err
            ),
        }
        result
    }

    async fn collect_snapshot(&self) -> Result<TopologySnapshot, AggregationError> {
        let raw_clusters = self
            .provider
            .list_clusters()
            .await
            .map_err(AggregationError::at(PipelineStage::Clusters))?;

        let parts = stream::iter(raw_clusters)
            .map(|cluster| self.collect_cluster(cluster))
            .buffer_unordered(self.concurrency())
            .try_collect::<Vec<_>>()
            .await?;

        let definitions = self
            .resolve_task_definitions(parts.iter().flat_map(|part| part.services.iter()))
            .await?;

        let now = Utc::now();
        let definitions = &definitions;
        let pending = parts
            .iter()
            .flat_map(|part| {
                let name = cluster_name(&part.cluster).to_string();
                part.services
                    .iter()
                    .map(move |service| (name.clone(), service.clone()))
            })
            .collect::<Vec<_>>();
        let services = stream::iter(pending)
            .map(|(name, service)| async move {
                self.build_service(&name, service, definitions, now).await
            })
            .buffer_unordered(self.concurrency())
            .try_collect::<Vec<_>>()
            .await?;

        let instances = self.fetch_instances().await?;

        let mut clusters = parts
            .iter()
            .map(|part| {
                let name = cluster_name(&part.cluster);
                let owned = services
                    .iter()
                    .filter(|service| service.cluster_name == name)
                    .cloned()
                    .collect();
                let jobs = part.rules.iter().map(normalize_rule).collect();
                normalize_cluster(&part.cluster, owned, jobs)
            })
            .collect::<Vec<_>>();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        for cluster in &mut clusters {
            cluster.services.sort_by(|a, b| a.name.cmp(&b.name));
        }

        Ok(TopologySnapshot {
            clusters,
            instances,
            captured_at: now,
        })
    }

    async fn collect_cluster(&self, cluster: RawCluster) -> Result<ClusterParts, AggregationError> {
        let reference = cluster_name(&cluster).to_string();
        let rules_reference = if cluster.arn.is_empty() {
            reference.clone()
        } else {
            cluster.arn.clone()
        };

        let (arns, rules) = try_join(
            async {
                self.provider
                    .list_services(&reference)
                    .await
                    .map_err(AggregationError::at(PipelineStage::Services))
            },
            async {
                self.provider
                    .list_scheduled_rules(&rules_reference)
                    .await
                    .map_err(AggregationError::at(PipelineStage::ScheduledJobs))
            },
        )
        .await?;

        let services = self.describe_in_batches(&reference, &arns).await?;
        Ok(ClusterParts {
            cluster,
            services,
            rules,
        })
    }

    async fn describe_in_batches(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> Result<Vec<RawService>, AggregationError> {
        let batch_size = self.config.describe_batch_size.max(1);
        let batches = stream::iter(arns.chunks(batch_size).map(<[String]>::to_vec))
            .map(|batch| async move { self.provider.describe_services(cluster, &batch).await })
            .buffer_unordered(self.concurrency())
            .try_collect::<Vec<_>>()
            .await
            .map_err(AggregationError::at(PipelineStage::DescribeServices))?;
        Ok(batches.into_iter().flatten().collect())
    }

    /// Every distinct task definition referenced by the services or their
    /// deployments is described exactly once.
    async fn resolve_task_definitions<'a>(
        &self,
        services: impl Iterator<Item = &'a RawService>,
    ) -> Result<DefinitionLookup, AggregationError> {
        let distinct = services
            .flat_map(|service| {
                service
                    .task_definition
                    .iter()
                    .chain(service.deployments.iter().filter_map(|d| d.task_definition.as_ref()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|arn| !arn.is_empty())
            .collect::<BTreeSet<_>>();

        stream::iter(distinct)
            .map(|arn| async move {
                let definition = self.provider.describe_task_definition(&arn).await?;
                Ok::<_, ProviderError>((arn, definition))
            })
            .buffer_unordered(self.concurrency())
            .try_collect::<DefinitionLookup>()
            .await
            .map_err(AggregationError::at(PipelineStage::TaskDefinitions))
    }

    async fn build_service(
        &self,
        cluster_name: &str,
        raw: RawService,
        definitions: &DefinitionLookup,
        now: DateTime<Utc>,
    ) -> Result<ServiceSnapshot, AggregationError> {
        let deployments = raw
            .deployments
            .iter()
            .map(normalize_deployment)
            .collect::<Vec<_>>();

        let deployment_status = if deployments.len() > 1 {
            Some(
                self.detector
                    .assess(&deployments, definitions, now)
                    .await
                    .map_err(AggregationError::at(PipelineStage::RolloutStatus))?,
            )
        } else {
            None
        };

        let failed_tasks = self
            .provider
            .list_stopped_tasks(cluster_name, &raw.name)
            .await
            .map_err(AggregationError::at(PipelineStage::FailedTasks))?
            .iter()
            .map(normalize_failed_task)
            .collect();

        let definition = raw
            .task_definition
            .as_ref()
            .and_then(|arn| definitions.get(arn));

        Ok(ServiceSnapshot {
            name: raw.name,
            arn: raw.arn,
            cluster_name: cluster_name.to_string(),
            status: ResourceStatus::from_upstream(raw.status.as_deref()),
            desired_count: raw.desired_count.unwrap_or(0),
            running_count: raw.running_count.unwrap_or(0),
            pending_count: raw.pending_count.unwrap_or(0),
            launch_type: raw.launch_type.unwrap_or_default(),
            task_definition: definition.map(summarize_task_definition),
            containers: definition.map(container_summaries).unwrap_or_default(),
            deployments,
            deployment_status,
            failed_tasks,
        })
    }

    async fn fetch_instances(&self) -> Result<Vec<InstanceSummary>, AggregationError> {
        let mut instances = self
            .provider
            .list_instances()
            .await
            .map_err(AggregationError::at(PipelineStage::Instances))?
            .iter()
            .map(normalize_instance)
            .collect::<Vec<_>>();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }
}

impl SnapshotFetch {
    fn cached(snapshot: Arc<TopologySnapshot>) -> Self {
        Self {
            snapshot,
            from_cache: true,
            served_at: Utc::now(),
        }
    }
}

fn not_found_as_cluster(err: ProviderError, cluster: &str, stage: PipelineStage) -> AggregationError {
    if err.kind == ProviderErrorKind::NotFound {
        AggregationError::ClusterNotFound(cluster.to_string())
    } else {
        AggregationError::Provider { stage, source: err }
    }
}

fn cluster_name(cluster: &RawCluster) -> &str {
    if cluster.name.is_empty() {
        &cluster.arn
    } else {
        &cluster.name
    }
}

fn normalize_cluster(
    raw: &RawCluster,
    services: Vec<ServiceSnapshot>,
    scheduled_jobs: Vec<ScheduledJob>,
) -> ClusterSnapshot {
    ClusterSnapshot {
        name: cluster_name(raw).to_string(),
        arn: raw.arn.clone(),
        status: ResourceStatus::from_upstream(raw.status.as_deref()),
        running_tasks: raw.running_tasks_count.unwrap_or(0),
        pending_tasks: raw.pending_tasks_count.unwrap_or(0),
        active_services: raw.active_services_count.unwrap_or(0),
        container_instances: raw.registered_container_instances_count.unwrap_or(0),
        services,
        scheduled_jobs,
    }
}

/// Absent timestamps fall back to `updated_at`, then to the epoch.
pub fn normalize_deployment(raw: &RawDeployment) -> DeploymentEntry {
    DeploymentEntry {
        id: raw.id.clone(),
        status: raw.status.clone().unwrap_or_default(),
        task_definition_arn: raw.task_definition.clone().unwrap_or_default(),
        desired_count: raw.desired_count.unwrap_or(0),
        running_count: raw.running_count.unwrap_or(0),
        pending_count: raw.pending_count.unwrap_or(0),
        rollout_state: raw.rollout_state.clone(),
        created_at: raw.created_at.or(raw.updated_at).unwrap_or_default(),
        updated_at: raw.updated_at,
    }
}

fn summarize_task_definition(raw: &RawTaskDefinition) -> TaskDefinitionSummary {
    TaskDefinitionSummary {
        arn: raw.arn.clone(),
        family: raw.family.clone(),
        revision: raw.revision.unwrap_or(0),
        cpu: raw.cpu.clone().unwrap_or_default(),
        memory: raw.memory.clone().unwrap_or_default(),
    }
}

fn container_summaries(raw: &RawTaskDefinition) -> Vec<ContainerSummary> {
    raw.containers
        .iter()
        .map(|container| ContainerSummary {
            name: container.name.clone(),
            image: container.image.clone().unwrap_or_default(),
            cpu: container.cpu.unwrap_or(0),
            memory: container.memory,
            memory_reservation: container.memory_reservation,
            environment: container
                .environment
                .iter()
                .map(|pair| EnvironmentVariable {
                    name: pair.name.clone(),
                    value: pair.value.clone().unwrap_or_default(),
                })
                .collect(),
            secrets: container
                .secrets
                .iter()
                .map(|secret| SecretReference {
                    name: secret.name.clone(),
                    value_from: secret.value_from.clone(),
                })
                .collect(),
        })
        .collect()
}

fn normalize_rule(raw: &RawScheduledRule) -> ScheduledJob {
    ScheduledJob {
        rule_name: raw.name.clone(),
        schedule_expression: raw.schedule_expression.clone().unwrap_or_default(),
        state: raw.state.clone().unwrap_or_default(),
        task_definition_arn: raw.target_task_definition.clone().unwrap_or_default(),
        task_count: raw.task_count.unwrap_or(0),
    }
}

fn normalize_failed_task(raw: &RawStoppedTask) -> FailedTask {
    FailedTask {
        task_arn: raw.task_arn.clone(),
        stopped_reason: raw.stopped_reason.clone().unwrap_or_default(),
        stop_code: raw.stop_code.clone().unwrap_or_default(),
        stopped_at: raw.stopped_at,
        containers: raw
            .containers
            .iter()
            .map(|container| FailedContainer {
                name: container.name.clone(),
                exit_code: container.exit_code,
                reason: container.reason.clone().unwrap_or_default(),
            })
            .collect(),
    }
}

fn normalize_instance(raw: &RawInstance) -> InstanceSummary {
    let name = raw
        .tags
        .iter()
        .find(|tag| tag.name == "Name")
        .and_then(|tag| tag.value.clone())
        .unwrap_or_default();
    InstanceSummary {
        instance_id: raw.instance_id.clone(),
        instance_type: raw.instance_type.clone().unwrap_or_default(),
        state: raw.state.clone().unwrap_or_default(),
        private_ip: raw.private_ip.clone().unwrap_or_default(),
        availability_zone: raw.availability_zone.clone().unwrap_or_default(),
        launch_time: raw.launch_time,
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_inventory, ScriptedProvider};
    use futures_util::future::join_all;

    fn engine_with(
        provider: Arc<ScriptedProvider>,
        batch_size: usize,
        ttl: Duration,
    ) -> Arc<AggregationEngine> {
        Arc::new(AggregationEngine::new(
            provider,
            AggregationConfig {
                describe_batch_size: batch_size,
                max_concurrency: 4,
            },
            ttl,
            Duration::from_secs(600),
        ))
    }

    fn scripted() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(sample_inventory()))
    }

    #[tokio::test]
    async fn full_snapshot_normalizes_the_fleet() {
        let provider = scripted();
        let engine = engine_with(provider, 10, Duration::from_secs(5));
        let fetch = engine.full_snapshot().await.expect("snapshot");
        let snapshot = &fetch.snapshot;

        assert!(!fetch.from_cache);
        assert!(snapshot.is_consistent());
        let names = snapshot
            .clusters
            .iter()
            .map(|cluster| cluster.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["prod", "staging"]);

        let staging = snapshot.cluster("staging").expect("staging");
        assert_eq!(staging.status, ResourceStatus::Inactive);
        assert_eq!(staging.running_tasks, 0);

        let prod = snapshot.cluster("prod").expect("prod");
        let services = prod
            .services
            .iter()
            .map(|service| service.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(services, ["api", "web", "worker"]);
        assert_eq!(prod.scheduled_jobs[0].rule_name, "nightly-report");

        let api = &prod.services[0];
        let status = api.deployment_status.as_ref().expect("rollout assessed");
        assert!(status.is_stuck);
        let evidence = status.evidence.as_ref().expect("evidence");
        assert_eq!(evidence.target_images, ["registry.local/app:1.5.0"]);
        assert_eq!(evidence.current_images, ["registry.local/app:1.4.0"]);
        assert_eq!(api.failed_tasks.len(), 1);
        assert_eq!(api.failed_tasks[0].containers[0].exit_code, Some(137));
        assert_eq!(api.containers[0].secrets[0].name, "DATABASE_URL");
        assert_eq!(
            api.task_definition.as_ref().map(|td| td.revision),
            Some(8)
        );

        let web = &prod.services[1];
        assert!(web.deployment_status.is_none());

        assert_eq!(snapshot.instances.len(), 2);
        assert_eq!(snapshot.instances[0].name, "bastion");
        assert_eq!(snapshot.instances[1].instance_type, "");
    }

    #[tokio::test]
    async fn task_definitions_resolve_once_and_batches_respect_size() {
        let provider = scripted();
        let engine = engine_with(provider.clone(), 2, Duration::from_secs(5));
        engine.full_snapshot().await.expect("snapshot");

        assert_eq!(provider.calls("describe_task_definition"), 3);
        // prod: 3 services in batches of 2, staging: 1 service.
        assert_eq!(provider.calls("describe_services"), 3);
        assert_eq!(provider.calls("list_stopped_tasks"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_serves_within_ttl_and_expires_after() {
        let provider = scripted();
        let engine = engine_with(provider.clone(), 10, Duration::from_secs(5));

        engine.full_snapshot().await.expect("first");
        let second = engine.full_snapshot().await.expect("second");
        assert!(second.from_cache);
        assert_eq!(engine.pipeline_runs(), 1);
        assert_eq!(provider.calls("list_clusters"), 1);

        let mut shrunk = sample_inventory();
        shrunk.clusters.retain(|entry| entry.cluster.name == "prod");
        provider.replace_document(shrunk);
        let cached = engine.full_snapshot().await.expect("cached");
        assert_eq!(cached.snapshot.clusters.len(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        let third = engine.full_snapshot().await.expect("third");
        assert!(!third.from_cache);
        assert_eq!(third.snapshot.clusters.len(), 1);
        assert_eq!(engine.pipeline_runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_run_the_pipeline_once() {
        let provider = Arc::new(
            ScriptedProvider::new(sample_inventory()).with_latency(Duration::from_millis(50)),
        );
        let engine = engine_with(provider.clone(), 10, Duration::from_secs(5));

        let fetches = join_all((0..5).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.full_snapshot().await })
        }))
        .await;

        let mut misses = 0;
        for fetch in fetches {
            let fetch = fetch.expect("join").expect("snapshot");
            if !fetch.from_cache {
                misses += 1;
            }
        }
        assert_eq!(misses, 1);
        assert_eq!(engine.pipeline_runs(), 1);
        assert_eq!(provider.calls("list_clusters"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_a_failed_run() {
        let provider = Arc::new(
            ScriptedProvider::new(sample_inventory()).with_latency(Duration::from_millis(50)),
        );
        provider.fail_next("list_clusters", ProviderErrorKind::Throttled, 100);
        let engine = engine_with(provider.clone(), 10, Duration::from_secs(5));

        let fetches = join_all((0..5).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.full_snapshot().await })
        }))
        .await;

        for fetch in fetches {
            let err = fetch.expect("join").expect_err("throttled");
            assert!(err.is_throttled());
        }
        assert_eq!(engine.pipeline_runs(), 1);
        assert_eq!(provider.calls("list_clusters"), 1);
        assert!(engine.cache_age().await.is_none());

        // A later miss is a new run, not a replay of the old failure.
        engine.full_snapshot().await.expect_err("still throttled");
        assert_eq!(engine.pipeline_runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_bounds_upstream_fanout() {
        let provider = Arc::new(
            ScriptedProvider::new(sample_inventory()).with_latency(Duration::from_millis(10)),
        );
        let engine = AggregationEngine::new(
            provider.clone(),
            AggregationConfig {
                describe_batch_size: 1,
                max_concurrency: 1,
            },
            Duration::ZERO,
            Duration::from_secs(600),
        );
        engine.full_snapshot().await.expect("snapshot");
        // One cluster at a time; its service and rule listings overlap.
        assert_eq!(provider.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn zero_ttl_never_serves_from_cache() {
        let provider = scripted();
        let engine = engine_with(provider, 10, Duration::ZERO);
        engine.full_snapshot().await.expect("first");
        let second = engine.full_snapshot().await.expect("second");
        assert!(!second.from_cache);
        assert_eq!(engine.pipeline_runs(), 2);
    }

    #[tokio::test]
    async fn failures_abort_the_snapshot_with_their_stage() {
        let provider = scripted();
        provider.fail_next("list_stopped_tasks", ProviderErrorKind::PermissionDenied, 1);
        let engine = engine_with(provider.clone(), 10, Duration::from_secs(5));

        let err = engine.full_snapshot().await.expect_err("aborted");
        assert_eq!(err.code(), "upstream_permission_denied");
        assert!(matches!(
            err,
            AggregationError::Provider {
                stage: PipelineStage::FailedTasks,
                ..
            }
        ));
        assert!(engine.cache_age().await.is_none());

        let retry = engine.full_snapshot().await.expect("recovered");
        assert!(!retry.from_cache);
    }

    #[tokio::test]
    async fn throttling_is_reported_as_such() {
        let provider = scripted();
        provider.fail_next("list_clusters", ProviderErrorKind::Throttled, 1);
        let engine = engine_with(provider, 10, Duration::from_secs(5));
        let err = engine.full_snapshot().await.expect_err("throttled");
        assert!(err.is_throttled());
        assert_eq!(err.code(), "upstream_throttled");
    }

    #[tokio::test]
    async fn staged_calls_fetch_live_without_caching() {
        let provider = scripted();
        let engine = engine_with(provider.clone(), 10, Duration::from_secs(5));

        let clusters = engine.basic_clusters().await.expect("clusters");
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "prod");

        let services = engine.cluster_services("prod").await.expect("services");
        assert_eq!(services.len(), 3);
        assert!(services[0]
            .deployment_status
            .as_ref()
            .map(|status| status.is_stuck)
            .unwrap_or(false));

        let jobs = engine
            .scheduled_jobs("prod", Some("arn:aws:ecs:cluster/prod"))
            .await
            .expect("jobs");
        assert_eq!(jobs.len(), 1);

        let instances = engine.inventory_only().await.expect("instances");
        assert_eq!(instances.len(), 2);

        assert_eq!(engine.pipeline_runs(), 0);
        assert!(engine.cache_age().await.is_none());

        let missing = engine.cluster_services("nowhere").await.expect_err("missing");
        assert_eq!(missing, AggregationError::ClusterNotFound("nowhere".to_string()));
    }

    #[tokio::test]
    async fn staged_calls_prefer_a_fresh_snapshot() {
        let provider = scripted();
        let engine = engine_with(provider.clone(), 10, Duration::from_secs(5));
        engine.full_snapshot().await.expect("warm");
        let before = provider.total_calls();

        assert_eq!(engine.basic_clusters().await.expect("clusters").len(), 2);
        assert_eq!(engine.cluster_services("prod").await.expect("services").len(), 3);
        assert_eq!(engine.scheduled_jobs("prod", None).await.expect("jobs").len(), 1);
        assert_eq!(engine.inventory_only().await.expect("instances").len(), 2);
        assert!(matches!(
            engine.cluster_services("nowhere").await,
            Err(AggregationError::ClusterNotFound(_))
        ));

        assert_eq!(provider.total_calls(), before);
    }
}

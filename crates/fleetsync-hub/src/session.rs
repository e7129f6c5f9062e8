//! Per-identity execution scheduler.
//!
//! Each identity gets one [`Session`] task that owns its polling mode, its
//! single pending deadline and the `executing` guard. Client commands,
//! timer expiry, automatic-interval changes and cycle completions are all
//! funnelled through one `select!` loop, so the state is never shared.

use crate::aggregate::{AggregationEngine, AggregationError, SnapshotFetch};
use crate::throttle::AdaptiveIntervalController;
use fleetsync_core::interval::{ConnectionInfo, PollMode};
use fleetsync_core::sync_ipc::{
    BasicClustersPayload, ClusterServicesPayload, ConnectionInfoPayload, ConnectionReason,
    ErrorPayload, IntervalErrorPayload, InventoryPayload, Progress, ScheduledTasksPayload,
    SnapshotPayload, WelcomePayload, WireEnvelope, WireMsg,
};
use fleetsync_core::topology::{ClusterSummary, InstanceSummary, ScheduledJob, ServiceSnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Outbound half of one live channel bound to an identity.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub channel_id: String,
    pub sender: mpsc::Sender<WireEnvelope>,
}

#[derive(Debug)]
pub enum SessionCommand {
    Attach(ChannelHandle),
    Detach {
        channel_id: String,
    },
    SetInterval {
        interval: i64,
        channel_id: String,
    },
    ManualRefresh,
    ToggleProgressiveLoading {
        enabled: bool,
    },
    RefreshClusterServices {
        cluster_name: String,
    },
    RefreshClusterScheduledTasks {
        cluster_name: String,
        cluster_arn: Option<String>,
    },
    GetInventory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    Initial,
    Timer,
    Manual,
}

impl CycleTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            CycleTrigger::Initial => "initial",
            CycleTrigger::Timer => "timer",
            CycleTrigger::Manual => "manual",
        }
    }
}

/// Results reported back to the session loop by spawned fetch tasks.
#[derive(Debug)]
enum SessionEvent {
    Snapshot(SnapshotFetch),
    BasicClusters {
        clusters: Vec<ClusterSummary>,
        progress: Progress,
    },
    ClusterServices {
        cluster_name: String,
        services: Vec<ServiceSnapshot>,
        progress: Option<Progress>,
    },
    ScheduledTasks {
        cluster_name: String,
        jobs: Vec<ScheduledJob>,
        progress: Option<Progress>,
    },
    Inventory {
        instances: Vec<InstanceSummary>,
        progress: Option<Progress>,
    },
    Failed {
        code: String,
        message: String,
        cluster_name: Option<String>,
    },
    CycleFinished {
        trigger: CycleTrigger,
        success: bool,
    },
}

impl SessionEvent {
    fn failed(err: &AggregationError, cluster_name: Option<&str>) -> Self {
        SessionEvent::Failed {
            code: err.code().to_string(),
            message: err.to_string(),
            cluster_name: cluster_name.map(str::to_string),
        }
    }
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub engine: Arc<AggregationEngine>,
    pub controller: Arc<AdaptiveIntervalController>,
    pub allowed_intervals: Arc<[u64]>,
}

enum Wake {
    Command(SessionCommand),
    CommandsClosed,
    Event(SessionEvent),
    Timer,
    AutomaticChanged,
    AutomaticClosed,
}

pub struct Session {
    identity: String,
    organization: String,
    channels: BTreeMap<String, mpsc::Sender<WireEnvelope>>,
    mode: PollMode,
    deadline: Option<Instant>,
    executing: bool,
    rearm_after_cycle: bool,
    progressive_loading: bool,
    context: SessionContext,
    commands: mpsc::Receiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    automatic: watch::Receiver<u64>,
    automatic_open: bool,
}

impl Session {
    /// Spawns the session task for a new identity with its first channel.
    /// The task ends once its last channel detaches.
    pub fn spawn(
        identity: String,
        organization: String,
        first: ChannelHandle,
        context: SessionContext,
    ) -> (mpsc::Sender<SessionCommand>, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let automatic = context.controller.subscribe();

        let session = Session {
            identity,
            organization,
            channels: BTreeMap::new(),
            mode: PollMode::Off,
            deadline: None,
            executing: false,
            rearm_after_cycle: false,
            progressive_loading: false,
            context,
            commands,
            events_tx,
            events_rx,
            automatic,
            automatic_open: true,
        };
        let handle = tokio::spawn(session.run(first));
        (commands_tx, handle)
    }

    async fn run(mut self, first: ChannelHandle) {
        info!(
            event = "session_start",
            identity = %self.identity,
            organization = %self.organization
        );
        self.attach(first);
        self.start_cycle(CycleTrigger::Initial);

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::CommandsClosed,
                },
                Some(event) = self.events_rx.recv() => Wake::Event(event),
                _ = sleep_until(self.deadline.unwrap_or_else(Instant::now)), if self.deadline.is_some() => Wake::Timer,
                changed = self.automatic.changed(), if self.automatic_open => match changed {
                    Ok(()) => Wake::AutomaticChanged,
                    Err(_) => Wake::AutomaticClosed,
                },
            };

            match wake {
                Wake::Command(command) => self.handle_command(command),
                Wake::CommandsClosed => break,
                Wake::Event(event) => self.handle_event(event),
                Wake::Timer => self.timer_fired(),
                Wake::AutomaticChanged => self.automatic_changed(),
                Wake::AutomaticClosed => self.automatic_open = false,
            }

            if self.channels.is_empty() {
                break;
            }
        }

        self.deadline = None;
        info!(
            event = "session_end",
            identity = %self.identity,
            executing = self.executing
        );
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Attach(handle) => {
                self.attach(handle);
                self.push_connection(ConnectionReason::Connected);
            }
            SessionCommand::Detach { channel_id } => {
                self.channels.remove(&channel_id);
                debug!(
                    event = "channel_detached",
                    identity = %self.identity,
                    channel_id = %channel_id,
                    remaining = self.channels.len()
                );
            }
            SessionCommand::SetInterval {
                interval,
                channel_id,
            } => self.set_interval(interval, &channel_id),
            SessionCommand::ManualRefresh => {
                if self.executing {
                    info!(event = "manual_refresh_ignored", identity = %self.identity);
                } else {
                    self.start_cycle(CycleTrigger::Manual);
                }
            }
            SessionCommand::ToggleProgressiveLoading { enabled } => {
                self.progressive_loading = enabled;
                self.push_connection(ConnectionReason::ProgressiveLoadingChanged);
            }
            SessionCommand::RefreshClusterServices { cluster_name } => {
                self.spawn_request(move |engine, events| async move {
                    match engine.cluster_services(&cluster_name).await {
                        Ok(services) => events.send(SessionEvent::ClusterServices {
                            cluster_name,
                            services,
                            progress: None,
                        }),
                        Err(err) => events.send(SessionEvent::failed(&err, Some(&cluster_name))),
                    }
                });
            }
            SessionCommand::RefreshClusterScheduledTasks {
                cluster_name,
                cluster_arn,
            } => {
                self.spawn_request(move |engine, events| async move {
                    match engine
                        .scheduled_jobs(&cluster_name, cluster_arn.as_deref())
                        .await
                    {
                        Ok(jobs) => events.send(SessionEvent::ScheduledTasks {
                            cluster_name,
                            jobs,
                            progress: None,
                        }),
                        Err(err) => events.send(SessionEvent::failed(&err, Some(&cluster_name))),
                    }
                });
            }
            SessionCommand::GetInventory => {
                self.spawn_request(|engine, events| async move {
                    match engine.inventory_only().await {
                        Ok(instances) => events.send(SessionEvent::Inventory {
                            instances,
                            progress: None,
                        }),
                        Err(err) => events.send(SessionEvent::failed(&err, None)),
                    }
                });
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        let connection = self.connection_info();
        let msg = match event {
            SessionEvent::Snapshot(fetch) => WireMsg::Snapshot(SnapshotPayload {
                snapshot: fetch.snapshot.as_ref().clone(),
                served_at: fetch.served_at,
                from_cache: fetch.from_cache,
                connection,
            }),
            SessionEvent::BasicClusters { clusters, progress } => {
                WireMsg::BasicClusters(BasicClustersPayload {
                    clusters,
                    progress: Some(progress),
                    connection,
                })
            }
            SessionEvent::ClusterServices {
                cluster_name,
                services,
                progress,
            } => WireMsg::ClusterServices(ClusterServicesPayload {
                cluster_name,
                services,
                progress,
            }),
            SessionEvent::ScheduledTasks {
                cluster_name,
                jobs,
                progress,
            } => WireMsg::ScheduledTasks(ScheduledTasksPayload {
                cluster_name,
                jobs,
                progress,
            }),
            SessionEvent::Inventory {
                instances,
                progress,
            } => WireMsg::Inventory(InventoryPayload {
                instances,
                progress,
            }),
            SessionEvent::Failed {
                code,
                message,
                cluster_name,
            } => WireMsg::Error(ErrorPayload {
                code,
                message,
                cluster_name,
                connection: Some(connection),
            }),
            SessionEvent::CycleFinished { trigger, success } => {
                self.cycle_finished(trigger, success);
                return;
            }
        };
        self.broadcast(msg);
    }

    fn attach(&mut self, handle: ChannelHandle) {
        let welcome = WireMsg::Welcome(WelcomePayload {
            identity: self.identity.clone(),
            organization: self.organization.clone(),
            connection: ConnectionInfo {
                channel_count: self.channels.len() + 1,
                ..self.connection_info()
            },
        });
        send_to(&self.identity, &handle.channel_id, &handle.sender, WireEnvelope::new(welcome));
        debug!(
            event = "channel_attached",
            identity = %self.identity,
            channel_id = %handle.channel_id
        );
        self.channels.insert(handle.channel_id, handle.sender);
    }

    fn set_interval(&mut self, interval: i64, channel_id: &str) {
        match PollMode::from_wire(interval, &self.context.allowed_intervals) {
            Ok(mode) => {
                self.deadline = None;
                self.mode = mode;
                self.arm();
                info!(
                    event = "mode_changed",
                    identity = %self.identity,
                    mode = %self.mode,
                    next_in_secs = self.period().unwrap_or(0)
                );
                self.push_connection(ConnectionReason::ModeChanged);
            }
            Err(err) => {
                warn!(
                    event = "interval_rejected",
                    identity = %self.identity,
                    requested = interval
                );
                let msg = WireMsg::IntervalError(IntervalErrorPayload {
                    message: err.to_string(),
                    allowed: err.allowed().to_vec(),
                    connection: self.connection_info(),
                });
                if let Some(sender) = self.channels.get(channel_id) {
                    send_to(&self.identity, channel_id, sender, WireEnvelope::new(msg));
                }
            }
        }
    }

    fn timer_fired(&mut self) {
        self.deadline = None;
        if self.executing {
            self.rearm_after_cycle = true;
            debug!(event = "timer_skipped", identity = %self.identity);
            return;
        }
        self.start_cycle(CycleTrigger::Timer);
    }

    fn automatic_changed(&mut self) {
        let interval = *self.automatic.borrow_and_update();
        if !self.mode.is_automatic() {
            return;
        }
        if self.deadline.is_some() {
            self.arm();
        }
        debug!(
            event = "automatic_rearmed",
            identity = %self.identity,
            interval_secs = interval
        );
        self.push_connection(ConnectionReason::IntervalAdjusted);
    }

    fn start_cycle(&mut self, trigger: CycleTrigger) {
        self.executing = true;
        self.push_connection(ConnectionReason::ExecutionStarted);
        debug!(
            event = "cycle_start",
            identity = %self.identity,
            trigger = trigger.as_str(),
            progressive = self.progressive_loading
        );

        let engine = self.context.engine.clone();
        let controller = self.context.controller.clone();
        let events = self.events_tx.clone();
        let progressive = self.progressive_loading;
        tokio::spawn(async move {
            let success = if progressive {
                progressive_cycle(&engine, &events).await
            } else {
                full_cycle(&engine, &events).await
            };
            controller.report_outcome(success);
            let _ = events.send(SessionEvent::CycleFinished { trigger, success });
        });
    }

    fn cycle_finished(&mut self, trigger: CycleTrigger, success: bool) {
        self.executing = false;
        debug!(
            event = "cycle_finished",
            identity = %self.identity,
            trigger = trigger.as_str(),
            success = success
        );
        self.push_connection(ConnectionReason::ExecutionFinished);

        let rearm = trigger == CycleTrigger::Timer || std::mem::take(&mut self.rearm_after_cycle);
        if rearm && self.deadline.is_none() {
            self.arm();
        }
    }

    /// On-demand fetches run beside the schedule and leave `executing` alone.
    fn spawn_request<F, Fut>(&self, request: F)
    where
        F: FnOnce(Arc<AggregationEngine>, mpsc::UnboundedSender<SessionEvent>) -> Fut,
        Fut: std::future::Future<Output = Result<(), mpsc::error::SendError<SessionEvent>>>
            + Send
            + 'static,
    {
        let task = request(self.context.engine.clone(), self.events_tx.clone());
        tokio::spawn(async move {
            let _ = task.await;
        });
    }

    fn period(&self) -> Option<u64> {
        self.mode
            .period_seconds(self.context.controller.current_interval())
    }

    /// Replaces any pending deadline with one a full period from now.
    fn arm(&mut self) {
        self.deadline = self
            .period()
            .map(|seconds| Instant::now() + Duration::from_secs(seconds));
    }

    fn connection_info(&self) -> ConnectionInfo {
        let automatic = self.context.controller.current_interval();
        ConnectionInfo {
            mode: self.mode,
            interval_seconds: self.mode.period_seconds(automatic).unwrap_or(0),
            executing: self.executing,
            channel_count: self.channels.len(),
            automatic_interval_seconds: automatic,
            progressive_loading: self.progressive_loading,
        }
    }

    fn push_connection(&self, reason: ConnectionReason) {
        self.broadcast(WireMsg::ConnectionInfo(ConnectionInfoPayload {
            reason,
            connection: self.connection_info(),
        }));
    }

    fn broadcast(&self, msg: WireMsg) {
        let envelope = WireEnvelope::new(msg);
        for (channel_id, sender) in &self.channels {
            send_to(&self.identity, channel_id, sender, envelope.clone());
        }
    }
}

fn send_to(
    identity: &str,
    channel_id: &str,
    sender: &mpsc::Sender<WireEnvelope>,
    envelope: WireEnvelope,
) {
    let kind = envelope.msg.kind();
    match sender.try_send(envelope) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                event = "push_backpressure",
                identity = identity,
                channel_id = channel_id,
                kind = kind
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(
                event = "push_dropped",
                identity = identity,
                channel_id = channel_id,
                kind = kind
            );
        }
    }
}

async fn full_cycle(
    engine: &AggregationEngine,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> bool {
    match engine.full_snapshot().await {
        Ok(fetch) => {
            let _ = events.send(SessionEvent::Snapshot(fetch));
            true
        }
        Err(err) => {
            let _ = events.send(SessionEvent::failed(&err, None));
            false
        }
    }
}

/// Staged delivery: cluster headers first, then services and scheduled
/// jobs cluster by cluster, then the instance inventory. Stops at the
/// first failure.
async fn progressive_cycle(
    engine: &AggregationEngine,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> bool {
    let clusters = match engine.basic_clusters().await {
        Ok(clusters) => clusters,
        Err(err) => {
            let _ = events.send(SessionEvent::failed(&err, None));
            return false;
        }
    };
    let total = clusters.len();
    let _ = events.send(SessionEvent::BasicClusters {
        clusters: clusters.clone(),
        progress: Progress::new(0, total),
    });

    for (index, cluster) in clusters.iter().enumerate() {
        let progress = Some(Progress::new(index + 1, total));
        let services = match engine.cluster_services(&cluster.name).await {
            Ok(services) => services,
            Err(err) => {
                let _ = events.send(SessionEvent::failed(&err, Some(&cluster.name)));
                return false;
            }
        };
        let _ = events.send(SessionEvent::ClusterServices {
            cluster_name: cluster.name.clone(),
            services,
            progress,
        });

        let arn = (!cluster.arn.is_empty()).then_some(cluster.arn.as_str());
        let jobs = match engine.scheduled_jobs(&cluster.name, arn).await {
            Ok(jobs) => jobs,
            Err(err) => {
                let _ = events.send(SessionEvent::failed(&err, Some(&cluster.name)));
                return false;
            }
        };
        let _ = events.send(SessionEvent::ScheduledTasks {
            cluster_name: cluster.name.clone(),
            jobs,
            progress,
        });
    }

    match engine.inventory_only().await {
        Ok(instances) => {
            let _ = events.send(SessionEvent::Inventory {
                instances,
                progress: Some(Progress::new(total, total)),
            });
            true
        }
        Err(err) => {
            let _ = events.send(SessionEvent::failed(&err, None));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregationConfig, ThrottleConfig};
    use crate::provider::ProviderErrorKind;
    use crate::testing::{sample_inventory, ScriptedProvider};
    use fleetsync_core::interval::DEFAULT_ALLOWED_INTERVALS;

    struct Harness {
        provider: Arc<ScriptedProvider>,
        controller: Arc<AdaptiveIntervalController>,
        commands: mpsc::Sender<SessionCommand>,
        rx: mpsc::Receiver<WireEnvelope>,
        handle: JoinHandle<()>,
    }

    fn start() -> Harness {
        let provider = Arc::new(ScriptedProvider::new(sample_inventory()));
        let controller = Arc::new(AdaptiveIntervalController::new(ThrottleConfig::default()));
        let engine = Arc::new(AggregationEngine::new(
            provider.clone(),
            AggregationConfig::default(),
            Duration::ZERO,
            Duration::from_secs(600),
        ));
        let context = SessionContext {
            engine,
            controller: controller.clone(),
            allowed_intervals: Arc::from(DEFAULT_ALLOWED_INTERVALS.as_slice()),
        };
        let (tx, rx) = mpsc::channel(256);
        let (commands, handle) = Session::spawn(
            "alice".to_string(),
            "acme".to_string(),
            ChannelHandle {
                channel_id: "c1".to_string(),
                sender: tx,
            },
            context,
        );
        Harness {
            provider,
            controller,
            commands,
            rx,
            handle,
        }
    }

    async fn next_kind(rx: &mut mpsc::Receiver<WireEnvelope>, kind: &str) -> WireEnvelope {
        loop {
            let envelope = rx.recv().await.expect("channel open");
            if envelope.msg.kind() == kind {
                return envelope;
            }
        }
    }

    async fn wait_idle(rx: &mut mpsc::Receiver<WireEnvelope>) {
        loop {
            let envelope = next_kind(rx, "connection-info").await;
            if reason(&envelope) == Some(ConnectionReason::ExecutionFinished) {
                return;
            }
        }
    }

    fn reason(envelope: &WireEnvelope) -> Option<ConnectionReason> {
        match &envelope.msg {
            WireMsg::ConnectionInfo(payload) => Some(payload.reason),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_channel_gets_welcome_then_snapshot() {
        let mut harness = start();
        let first = harness.rx.recv().await.expect("welcome");
        match &first.msg {
            WireMsg::Welcome(payload) => {
                assert_eq!(payload.identity, "alice");
                assert_eq!(payload.organization, "acme");
                assert_eq!(payload.connection.mode, PollMode::Off);
                assert_eq!(payload.connection.channel_count, 1);
            }
            other => panic!("expected welcome, got {}", other.kind()),
        }
        let snapshot = next_kind(&mut harness.rx, "snapshot").await;
        match snapshot.msg {
            WireMsg::Snapshot(payload) => {
                assert_eq!(payload.snapshot.clusters.len(), 2);
                assert!(payload.connection.executing);
            }
            other => panic!("expected snapshot, got {}", other.kind()),
        }
        let finished = next_kind(&mut harness.rx, "connection-info").await;
        assert_eq!(reason(&finished), Some(ConnectionReason::ExecutionFinished));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_interval_fires_on_schedule_and_off_cancels() {
        let mut harness = start();
        next_kind(&mut harness.rx, "snapshot").await;
        let started = Instant::now();

        harness
            .commands
            .send(SessionCommand::SetInterval {
                interval: 5,
                channel_id: "c1".to_string(),
            })
            .await
            .expect("send");
        next_kind(&mut harness.rx, "snapshot").await;
        assert_eq!(started.elapsed().as_secs(), 5);
        next_kind(&mut harness.rx, "snapshot").await;
        assert_eq!(started.elapsed().as_secs(), 10);

        harness
            .commands
            .send(SessionCommand::SetInterval {
                interval: 0,
                channel_id: "c1".to_string(),
            })
            .await
            .expect("send");
        let calls = harness.provider.calls("list_clusters");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.provider.calls("list_clusters"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_interval_only_reaches_the_requester() {
        let mut harness = start();
        next_kind(&mut harness.rx, "snapshot").await;
        harness
            .commands
            .send(SessionCommand::SetInterval {
                interval: 7,
                channel_id: "c1".to_string(),
            })
            .await
            .expect("send");
        let rejected = next_kind(&mut harness.rx, "interval-error").await;
        match rejected.msg {
            WireMsg::IntervalError(payload) => {
                assert_eq!(payload.allowed, vec![5, 10, 15, 60]);
                assert_eq!(payload.connection.mode, PollMode::Off);
            }
            other => panic!("expected interval-error, got {}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_while_executing_is_ignored() {
        let provider =
            Arc::new(ScriptedProvider::new(sample_inventory()).with_latency(Duration::from_secs(1)));
        let controller = Arc::new(AdaptiveIntervalController::new(ThrottleConfig::default()));
        let context = SessionContext {
            engine: Arc::new(AggregationEngine::new(
                provider.clone(),
                AggregationConfig::default(),
                Duration::ZERO,
                Duration::from_secs(600),
            )),
            controller,
            allowed_intervals: Arc::from(DEFAULT_ALLOWED_INTERVALS.as_slice()),
        };
        let (tx, mut rx) = mpsc::channel(256);
        let (commands, _handle) = Session::spawn(
            "bob".to_string(),
            "acme".to_string(),
            ChannelHandle {
                channel_id: "c1".to_string(),
                sender: tx,
            },
            context,
        );

        commands.send(SessionCommand::ManualRefresh).await.expect("send");
        next_kind(&mut rx, "snapshot").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(provider.calls("list_clusters"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_push_errors_and_feed_the_controller() {
        let mut harness = start();
        wait_idle(&mut harness.rx).await;
        harness
            .provider
            .fail_next("list_clusters", ProviderErrorKind::Invalid, 1);
        harness
            .commands
            .send(SessionCommand::ManualRefresh)
            .await
            .expect("send");
        let error = next_kind(&mut harness.rx, "error").await;
        match error.msg {
            WireMsg::Error(payload) => {
                assert_eq!(payload.code, "upstream_invalid");
                assert!(payload.connection.is_some());
            }
            other => panic!("expected error, got {}", other.kind()),
        }
        next_kind(&mut harness.rx, "connection-info").await;
        assert_eq!(harness.controller.current_interval(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn progressive_cycle_delivers_staged_events() {
        let mut harness = start();
        wait_idle(&mut harness.rx).await;
        harness
            .commands
            .send(SessionCommand::ToggleProgressiveLoading { enabled: true })
            .await
            .expect("send");
        harness
            .commands
            .send(SessionCommand::ManualRefresh)
            .await
            .expect("send");

        let basic = next_kind(&mut harness.rx, "basic-clusters").await;
        match basic.msg {
            WireMsg::BasicClusters(payload) => {
                assert_eq!(payload.clusters.len(), 2);
                assert!(payload.connection.progressive_loading);
            }
            other => panic!("expected basic-clusters, got {}", other.kind()),
        }
        let services = next_kind(&mut harness.rx, "cluster-services").await;
        match services.msg {
            WireMsg::ClusterServices(payload) => {
                assert_eq!(payload.cluster_name, "prod");
                assert_eq!(payload.progress.map(|p| p.current), Some(1));
            }
            other => panic!("expected cluster-services, got {}", other.kind()),
        }
        let inventory = next_kind(&mut harness.rx, "inventory").await;
        match inventory.msg {
            WireMsg::Inventory(payload) => {
                assert_eq!(payload.instances.len(), 2);
                assert_eq!(payload.progress.map(|p| p.percentage), Some(100));
            }
            other => panic!("expected inventory, got {}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_requests_reply_without_a_cycle() {
        let mut harness = start();
        wait_idle(&mut harness.rx).await;

        harness
            .commands
            .send(SessionCommand::RefreshClusterScheduledTasks {
                cluster_name: "prod".to_string(),
                cluster_arn: None,
            })
            .await
            .expect("send");
        let jobs = next_kind(&mut harness.rx, "scheduled-tasks").await;
        match jobs.msg {
            WireMsg::ScheduledTasks(payload) => assert_eq!(payload.jobs.len(), 1),
            other => panic!("expected scheduled-tasks, got {}", other.kind()),
        }

        harness
            .commands
            .send(SessionCommand::RefreshClusterServices {
                cluster_name: "nowhere".to_string(),
            })
            .await
            .expect("send");
        let error = next_kind(&mut harness.rx, "error").await;
        match error.msg {
            WireMsg::Error(payload) => {
                assert_eq!(payload.code, "cluster_not_found");
                assert_eq!(payload.cluster_name.as_deref(), Some("nowhere"));
            }
            other => panic!("expected error, got {}", other.kind()),
        }
        assert_eq!(harness.controller.current_interval(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn last_detach_ends_the_session() {
        let mut harness = start();
        next_kind(&mut harness.rx, "snapshot").await;
        harness
            .commands
            .send(SessionCommand::SetInterval {
                interval: 5,
                channel_id: "c1".to_string(),
            })
            .await
            .expect("send");
        harness
            .commands
            .send(SessionCommand::Detach {
                channel_id: "c1".to_string(),
            })
            .await
            .expect("send");
        harness.handle.await.expect("session task");

        let calls = harness.provider.total_calls();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.provider.total_calls(), calls);
    }
}

use fleetsync_core::interval::PollMode;
use fleetsync_core::sync_ipc::{ConnectionReason, WireEnvelope, WireMsg};
use fleetsync_hub::config::HubConfig;
use fleetsync_hub::identity::ResolvedIdentity;
use fleetsync_hub::provider::ProviderErrorKind;
use fleetsync_hub::session::{ChannelHandle, SessionCommand};
use fleetsync_hub::testing::{sample_inventory, ScriptedProvider};
use fleetsync_hub::Hub;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn hub() -> (Arc<ScriptedProvider>, Hub) {
    hub_over(ScriptedProvider::new(sample_inventory()))
}

fn hub_over(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, Hub) {
    let provider = Arc::new(provider);
    let mut config = HubConfig::default();
    config.cache.ttl_ms = 0;
    let hub = Hub::new(&config, provider.clone());
    (provider, hub)
}

fn who(identity: &str) -> ResolvedIdentity {
    ResolvedIdentity {
        identity: identity.to_string(),
        organization: "acme".to_string(),
    }
}

async fn attach(hub: &Hub, identity: &str, channel_id: &str) -> mpsc::Receiver<WireEnvelope> {
    let (sender, rx) = mpsc::channel(256);
    hub.registry()
        .connect(
            &who(identity),
            ChannelHandle {
                channel_id: channel_id.to_string(),
                sender,
            },
        )
        .await
        .expect("connect");
    rx
}

async fn set_interval(hub: &Hub, identity: &str, channel_id: &str, interval: i64) {
    hub.registry()
        .command(
            identity,
            SessionCommand::SetInterval {
                interval,
                channel_id: channel_id.to_string(),
            },
        )
        .await
        .expect("command");
}

async fn next_kind(rx: &mut mpsc::Receiver<WireEnvelope>, kind: &str) -> WireEnvelope {
    loop {
        let envelope = rx.recv().await.expect("channel open");
        if envelope.msg.kind() == kind {
            return envelope;
        }
    }
}

fn reason(envelope: &WireEnvelope) -> Option<ConnectionReason> {
    match &envelope.msg {
        WireMsg::ConnectionInfo(payload) => Some(payload.reason),
        _ => None,
    }
}

async fn wait_for(rx: &mut mpsc::Receiver<WireEnvelope>, expected: ConnectionReason) {
    loop {
        let envelope = next_kind(rx, "connection-info").await;
        if reason(&envelope) == Some(expected) {
            return;
        }
    }
}

async fn wait_idle(rx: &mut mpsc::Receiver<WireEnvelope>) {
    wait_for(rx, ConnectionReason::ExecutionFinished).await;
}

#[tokio::test(start_paused = true)]
async fn interval_lifecycle_follows_mode_changes_and_backoff() {
    let (provider, hub) = hub();
    let origin = Instant::now();
    let mut rx = attach(&hub, "alice", "c1").await;

    next_kind(&mut rx, "snapshot").await;
    assert_eq!(origin.elapsed().as_secs(), 0);
    wait_idle(&mut rx).await;

    set_interval(&hub, "alice", "c1", -1).await;
    next_kind(&mut rx, "snapshot").await;
    assert_eq!(origin.elapsed().as_secs(), 3);

    provider.fail_next("list_clusters", ProviderErrorKind::Invalid, 1);
    let error = next_kind(&mut rx, "error").await;
    assert_eq!(origin.elapsed().as_secs(), 6);
    match error.msg {
        WireMsg::Error(payload) => assert_eq!(payload.code, "upstream_invalid"),
        other => panic!("expected error, got {}", other.kind()),
    }
    assert_eq!(hub.controller().current_interval(), 6);

    next_kind(&mut rx, "snapshot").await;
    assert_eq!(origin.elapsed().as_secs(), 12);
    wait_idle(&mut rx).await;

    let mark = Instant::now();
    set_interval(&hub, "alice", "c1", 15).await;
    next_kind(&mut rx, "snapshot").await;
    assert_eq!(mark.elapsed().as_secs(), 15);
    next_kind(&mut rx, "snapshot").await;
    assert_eq!(mark.elapsed().as_secs(), 30);
    wait_idle(&mut rx).await;

    set_interval(&hub, "alice", "c1", 7).await;
    let rejected = next_kind(&mut rx, "interval-error").await;
    match rejected.msg {
        WireMsg::IntervalError(payload) => {
            assert_eq!(payload.allowed, vec![5, 10, 15, 60]);
            assert_eq!(payload.connection.mode, PollMode::Manual(15));
        }
        other => panic!("expected interval-error, got {}", other.kind()),
    }
    next_kind(&mut rx, "snapshot").await;
    assert_eq!(mark.elapsed().as_secs(), 45);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_provider_calls() {
    let (provider, hub) = hub();
    let mut rx = attach(&hub, "alice", "c1").await;
    wait_idle(&mut rx).await;
    set_interval(&hub, "alice", "c1", 5).await;
    next_kind(&mut rx, "snapshot").await;
    wait_idle(&mut rx).await;

    hub.registry().disconnect("alice", "c1").await;
    assert!(!hub.registry().is_connected("alice").await);

    let calls = provider.total_calls();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(provider.total_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn execution_notifications_alternate() {
    let (_, hub) = hub();
    let mut rx = attach(&hub, "alice", "c1").await;
    set_interval(&hub, "alice", "c1", 5).await;

    let mut seen = Vec::new();
    while seen.len() < 6 {
        let envelope = next_kind(&mut rx, "connection-info").await;
        match reason(&envelope) {
            Some(ConnectionReason::ExecutionStarted) => seen.push(true),
            Some(ConnectionReason::ExecutionFinished) => seen.push(false),
            _ => {}
        }
    }
    assert_eq!(seen, vec![true, false, true, false, true, false]);
}

#[tokio::test(start_paused = true)]
async fn identities_keep_independent_schedules() {
    let (_, hub) = hub();
    let mut alice = attach(&hub, "alice", "a1").await;
    let mut bob = attach(&hub, "bob", "b1").await;
    wait_idle(&mut alice).await;
    wait_idle(&mut bob).await;

    set_interval(&hub, "alice", "a1", 5).await;
    for _ in 0..3 {
        next_kind(&mut alice, "snapshot").await;
    }
    wait_idle(&mut alice).await;

    let mut bob_snapshots = 0;
    while let Ok(envelope) = bob.try_recv() {
        if envelope.msg.kind() == "snapshot" {
            bob_snapshots += 1;
        }
    }
    assert_eq!(bob_snapshots, 0);
    assert_eq!(hub.registry().stats().await.identities, 2);
}

#[tokio::test(start_paused = true)]
async fn another_identity_failure_rearms_automatic_sessions_only() {
    let (provider, hub) = hub();
    let origin = Instant::now();
    let mut alice = attach(&hub, "alice", "a1").await;
    let mut bob = attach(&hub, "bob", "b1").await;
    wait_idle(&mut alice).await;
    wait_idle(&mut bob).await;

    set_interval(&hub, "bob", "b1", 15).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    set_interval(&hub, "alice", "a1", -1).await;
    wait_for(&mut alice, ConnectionReason::ModeChanged).await;

    provider.fail_next("list_clusters", ProviderErrorKind::Invalid, 1);
    hub.registry()
        .command("bob", SessionCommand::ManualRefresh)
        .await
        .expect("command");
    next_kind(&mut bob, "error").await;

    let adjusted = loop {
        let envelope = next_kind(&mut alice, "connection-info").await;
        if let WireMsg::ConnectionInfo(payload) = envelope.msg {
            if payload.reason == ConnectionReason::IntervalAdjusted {
                break payload;
            }
        }
    };
    assert_eq!(origin.elapsed().as_secs(), 1);
    assert_eq!(adjusted.connection.mode, PollMode::Automatic);
    assert_eq!(adjusted.connection.automatic_interval_seconds, 6);
    assert_eq!(adjusted.connection.interval_seconds, 6);

    next_kind(&mut alice, "snapshot").await;
    assert_eq!(origin.elapsed().as_secs(), 7);

    next_kind(&mut bob, "snapshot").await;
    assert_eq!(origin.elapsed().as_secs(), 15);
}

#[tokio::test(start_paused = true)]
async fn slow_cycles_never_overlap_and_keep_the_schedule() {
    let (_, hub) = hub_over(
        ScriptedProvider::new(sample_inventory()).with_latency(Duration::from_secs(2)),
    );
    let mut rx = attach(&hub, "alice", "c1").await;
    set_interval(&hub, "alice", "c1", 5).await;

    let end = Instant::now() + Duration::from_secs(120);
    let mut executing = false;
    let mut finished = 0;
    let mut snapshots = 0;
    while let Ok(envelope) = tokio::time::timeout_at(end, rx.recv()).await {
        let envelope = envelope.expect("channel open");
        match envelope.msg {
            WireMsg::Snapshot(_) => snapshots += 1,
            WireMsg::ConnectionInfo(payload) => match payload.reason {
                ConnectionReason::ExecutionStarted => {
                    assert!(!executing, "cycle started while another was running");
                    executing = true;
                }
                ConnectionReason::ExecutionFinished => {
                    assert!(executing, "finished without a start");
                    executing = false;
                    finished += 1;
                }
                _ => {}
            },
            _ => {}
        }
    }
    assert!(finished >= 5, "only {finished} cycles in 120s");
    assert!(snapshots >= finished);
}

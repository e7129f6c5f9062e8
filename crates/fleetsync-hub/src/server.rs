use crate::identity::ResolvedIdentity;
use crate::session::{ChannelHandle, SessionCommand};
use crate::Hub;
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fleetsync_core::sync_ipc::{
    decode_frame, encode_frame, ErrorPayload, HelloPayload, WireEnvelope, WireMsg,
    DEFAULT_MAX_FRAME_BYTES,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Serialize;
use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub allow_remote: bool,
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            allow_remote: false,
            debug: false,
        }
    }
}

struct ServerState {
    hub: Arc<Hub>,
    config: ServerConfig,
    conn_counter: AtomicU64,
}

impl ServerState {
    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn admits(&self, remote: &SocketAddr) -> bool {
        self.config.allow_remote || remote.ip().is_loopback()
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    identities: usize,
    channels: usize,
    automatic_interval_seconds: u64,
    consecutive_successes: u32,
    pipeline_runs: u64,
    cache_age_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RefreshReport {
    sessions: usize,
}

pub fn router(hub: Arc<Hub>, config: ServerConfig) -> Router {
    let state = Arc::new(ServerState {
        hub,
        config,
        conn_counter: AtomicU64::new(0),
    });
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status_handler))
        .route("/refresh", post(refresh_handler))
        .with_state(state)
}

/// Serves the hub on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    hub: Arc<Hub>,
    config: ServerConfig,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(hub, config);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    if !state.admits(&addr) {
        warn!(event = "remote_rejected", remote = %addr);
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        handle_socket(state, socket, addr).await;
    })
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> Json<StatusReport> {
    let stats = state.hub.registry().stats().await;
    let throttle = state.hub.controller().snapshot();
    let cache_age_ms = state
        .hub
        .engine()
        .cache_age()
        .await
        .map(|age| age.as_millis() as u64);
    Json(StatusReport {
        identities: stats.identities,
        channels: stats.channels,
        automatic_interval_seconds: throttle.automatic_interval_secs,
        consecutive_successes: throttle.consecutive_successes,
        pipeline_runs: state.hub.engine().pipeline_runs(),
        cache_age_ms,
    })
}

/// External trigger: drops the cached snapshot and runs a cycle for every
/// connected identity.
async fn refresh_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    if !state.admits(&addr) {
        return StatusCode::FORBIDDEN.into_response();
    }
    state.hub.engine().invalidate().await;
    let sessions = state.hub.registry().refresh_all().await;
    Json(RefreshReport { sessions }).into_response()
}

async fn handle_socket(state: Arc<ServerState>, socket: WebSocket, remote: SocketAddr) {
    let conn_id = state.next_conn_id();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<WireEnvelope>(CHANNEL_CAPACITY);
    let write_task = tokio::spawn(writer_loop(
        ws_sender,
        rx,
        conn_id.clone(),
        state.config.clone(),
    ));

    let Some(who) = handshake(&state, &mut ws_receiver, &tx, &conn_id, remote).await else {
        drop(tx);
        let _ = write_task.await;
        return;
    };

    info!(
        event = "handshake_ok",
        conn_id = %conn_id,
        identity = %who.identity,
        organization = %who.organization,
        remote = %remote
    );

    let max_frame_bytes = state.config.max_frame_bytes;
    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if data.len() > max_frame_bytes {
            warn!(event = "message_too_large", conn_id = %conn_id, size = data.len());
            continue;
        }
        if state.config.debug {
            debug!(event = "message_received", conn_id = %conn_id, raw = %String::from_utf8_lossy(&data));
        }
        let envelope: WireEnvelope = match decode_frame(&data, max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %conn_id, error = %err);
                send_error(&tx, "invalid_message", &err.to_string());
                continue;
            }
        };
        let kind = envelope.msg.kind();
        let request_id = envelope.request_id.clone();
        let Some(command) = session_command(envelope.msg, &conn_id) else {
            warn!(event = "message_unsupported", conn_id = %conn_id, kind = kind);
            let reply = error_envelope("unsupported_message", &format!("{kind} is not accepted here"))
                .with_request_id(request_id);
            let _ = tx.try_send(reply);
            continue;
        };
        if let Err(err) = state.hub.registry().command(&who.identity, command).await {
            warn!(event = "command_failed", conn_id = %conn_id, error = %err);
            break;
        }
    }

    state.hub.registry().disconnect(&who.identity, &conn_id).await;
    drop(tx);
    let _ = write_task.await;
    info!(event = "channel_closed", conn_id = %conn_id, identity = %who.identity);
}

/// Reads the first frame, which must be a `hello`, resolves its identity and
/// binds the channel. Returns `None` once the socket should be closed.
async fn handshake(
    state: &ServerState,
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::Sender<WireEnvelope>,
    conn_id: &str,
    remote: SocketAddr,
) -> Option<ResolvedIdentity> {
    let first = match ws_receiver.next().await {
        Some(Ok(msg)) => msg,
        _ => return None,
    };
    let data = message_bytes(first)?;
    let max_frame_bytes = state.config.max_frame_bytes;
    if data.len() > max_frame_bytes {
        warn!(event = "hello_too_large", remote = %remote, size = data.len());
        return None;
    }

    let hello: HelloPayload = match decode_frame::<WireEnvelope>(&data, max_frame_bytes) {
        Ok(WireEnvelope {
            msg: WireMsg::Hello(payload),
            ..
        }) => payload,
        Ok(other) => {
            warn!(event = "expected_hello", remote = %remote, kind = other.msg.kind());
            send_error(tx, "expected_hello", "first frame must be hello");
            return None;
        }
        Err(err) => {
            warn!(event = "hello_parse", remote = %remote, error = %err);
            send_error(tx, "expected_hello", &err.to_string());
            return None;
        }
    };

    let who = match state.hub.resolver().resolve(&hello) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "identity_rejected", remote = %remote, code = err.code());
            send_error(tx, err.code(), &err.to_string());
            return None;
        }
    };

    let channel = ChannelHandle {
        channel_id: conn_id.to_string(),
        sender: tx.clone(),
    };
    if let Err(err) = state.hub.registry().connect(&who, channel).await {
        send_error(tx, err.code(), &err.to_string());
        return None;
    }
    Some(who)
}

async fn writer_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<WireEnvelope>,
    conn_id: String,
    config: ServerConfig,
) {
    let mut ping = (!config.ping_interval.is_zero()).then(|| {
        tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval)
    });

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                let text = match encode_frame(&envelope, config.max_frame_bytes) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(event = "frame_dropped", conn_id = %conn_id, kind = envelope.msg.kind(), error = %err);
                        continue;
                    }
                };
                let send = ws_sender.send(Message::Text(text));
                if !matches!(tokio::time::timeout(config.write_timeout, send).await, Ok(Ok(()))) {
                    warn!(event = "write_failed", conn_id = %conn_id);
                    break;
                }
            }
            _ = async {
                match ping.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let send = ws_sender.send(Message::Ping(Vec::new()));
                if !matches!(tokio::time::timeout(config.write_timeout, send).await, Ok(Ok(()))) {
                    warn!(event = "ping_failed", conn_id = %conn_id);
                    break;
                }
            }
        }
    }
    let _ = ws_sender.close().await;
}

fn session_command(msg: WireMsg, channel_id: &str) -> Option<SessionCommand> {
    let command = match msg {
        WireMsg::SetInterval(payload) => SessionCommand::SetInterval {
            interval: payload.interval,
            channel_id: channel_id.to_string(),
        },
        WireMsg::ManualRefresh => SessionCommand::ManualRefresh,
        WireMsg::ToggleProgressiveLoading(payload) => SessionCommand::ToggleProgressiveLoading {
            enabled: payload.enabled,
        },
        WireMsg::RefreshClusterServices(payload) => SessionCommand::RefreshClusterServices {
            cluster_name: payload.cluster_name,
        },
        WireMsg::RefreshClusterScheduledTasks(payload) => {
            SessionCommand::RefreshClusterScheduledTasks {
                cluster_name: payload.cluster_name,
                cluster_arn: payload.cluster_arn,
            }
        }
        WireMsg::GetEc2Inventory => SessionCommand::GetInventory,
        _ => return None,
    };
    Some(command)
}

fn error_envelope(code: &str, message: &str) -> WireEnvelope {
    WireEnvelope::new(WireMsg::Error(ErrorPayload {
        code: code.to_string(),
        message: message.to_string(),
        cluster_name: None,
        connection: None,
    }))
}

fn send_error(tx: &mpsc::Sender<WireEnvelope>, code: &str, message: &str) {
    let _ = tx.try_send(error_envelope(code, message));
}

fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Close(_) => None,
        Message::Ping(_) => None,
        Message::Pong(_) => None,
    }
}

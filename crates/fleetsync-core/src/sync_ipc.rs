use crate::interval::ConnectionInfo;
use crate::topology::{ClusterSummary, InstanceSummary, ScheduledJob, ServiceSnapshot, TopologySnapshot};
use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(value)
                    .map(ProtocolVersion)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                cleaned.parse::<u16>().map(ProtocolVersion).map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            timestamp: Utc::now(),
            request_id: None,
            msg,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Every event exchanged over a sync channel. The first six variants are
/// sent by clients; the rest are pushed by the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum WireMsg {
    Hello(HelloPayload),
    SetInterval(SetIntervalPayload),
    ManualRefresh,
    ToggleProgressiveLoading(TogglePayload),
    RefreshClusterServices(ClusterRefPayload),
    RefreshClusterScheduledTasks(ClusterRefPayload),
    GetEc2Inventory,

    Welcome(WelcomePayload),
    Snapshot(SnapshotPayload),
    BasicClusters(BasicClustersPayload),
    ClusterServices(ClusterServicesPayload),
    ScheduledTasks(ScheduledTasksPayload),
    Inventory(InventoryPayload),
    Error(ErrorPayload),
    IntervalError(IntervalErrorPayload),
    ConnectionInfo(ConnectionInfoPayload),
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::Hello(_) => "hello",
            WireMsg::SetInterval(_) => "set-interval",
            WireMsg::ManualRefresh => "manual-refresh",
            WireMsg::ToggleProgressiveLoading(_) => "toggle-progressive-loading",
            WireMsg::RefreshClusterServices(_) => "refresh-cluster-services",
            WireMsg::RefreshClusterScheduledTasks(_) => "refresh-cluster-scheduled-tasks",
            WireMsg::GetEc2Inventory => "get-ec2-inventory",
            WireMsg::Welcome(_) => "welcome",
            WireMsg::Snapshot(_) => "snapshot",
            WireMsg::BasicClusters(_) => "basic-clusters",
            WireMsg::ClusterServices(_) => "cluster-services",
            WireMsg::ScheduledTasks(_) => "scheduled-tasks",
            WireMsg::Inventory(_) => "inventory",
            WireMsg::Error(_) => "error",
            WireMsg::IntervalError(_) => "interval-error",
            WireMsg::ConnectionInfo(_) => "connection-info",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetIntervalPayload {
    pub interval: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TogglePayload {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterRefPayload {
    pub cluster_name: String,
    #[serde(default)]
    pub cluster_arn: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomePayload {
    pub identity: String,
    pub organization: String,
    pub connection: ConnectionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPayload {
    pub snapshot: TopologySnapshot,
    pub served_at: DateTime<Utc>,
    pub from_cache: bool,
    pub connection: ConnectionInfo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub percentage: u8,
}

impl Progress {
    pub fn new(current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            ((current.min(total) * 100) / total) as u8
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasicClustersPayload {
    pub clusters: Vec<ClusterSummary>,
    #[serde(default)]
    pub progress: Option<Progress>,
    pub connection: ConnectionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterServicesPayload {
    pub cluster_name: String,
    pub services: Vec<ServiceSnapshot>,
    #[serde(default)]
    pub progress: Option<Progress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTasksPayload {
    pub cluster_name: String,
    pub jobs: Vec<ScheduledJob>,
    #[serde(default)]
    pub progress: Option<Progress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryPayload {
    pub instances: Vec<InstanceSummary>,
    #[serde(default)]
    pub progress: Option<Progress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub connection: Option<ConnectionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntervalErrorPayload {
    pub message: String,
    pub allowed: Vec<u64>,
    pub connection: ConnectionInfo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionReason {
    Connected,
    ModeChanged,
    ProgressiveLoadingChanged,
    ExecutionStarted,
    ExecutionFinished,
    IntervalAdjusted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfoPayload {
    pub reason: ConnectionReason,
    pub connection: ConnectionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    let mut raw = bytes;
    while let Some((last, rest)) = raw.split_last() {
        if *last == b'\n' || *last == b'\r' {
            raw = rest;
        } else {
            break;
        }
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

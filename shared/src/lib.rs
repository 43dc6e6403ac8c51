//! Mesh Coordinator Shared Types
//!
//! This crate provides the data model, lifecycle state machine and admin
//! protocol codec shared by the coordinator daemon and `meshctl`.

pub mod admin;
pub mod codec;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use admin::{AdminEnvelope, AdminReply, AdminRequest, AdminResponse, CommandRequest};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default operating parameters for the coordinator
pub mod defaults {
    /// Maximum number of queued (not yet dispatched) commands
    pub const QUEUE_MAX_LEN: usize = 50;

    /// Minimum gap between two commands on the radio
    pub const QUEUE_PAUSE_MS: u64 = 100;

    /// Response wait used when a command carries no timeout of its own
    pub const QUEUE_MAX_WAIT_MS: u64 = 5000;

    /// How long a timed-out command may still hold the radio for a late response
    pub const LATE_RESPONSE_GUARD_MS: u64 = 1000;

    /// Delay before the single automatic start retry
    pub const START_RETRY_BACKOFF_MS: u64 = 60_000;

    /// Start attempts before the coordinator is declared failed
    pub const START_ATTEMPTS: u32 = 2;

    /// Period of the overdue check
    pub const OVERDUE_CHECK_INTERVAL_MS: u64 = 60_000;

    /// Bound on bridge requests other than command invocations
    pub const BRIDGE_REQUEST_TIMEOUT_MS: u64 = 10_000;

    pub const SERIAL_BAUD_RATE: u32 = 115_200;

    /// PAN id used when none is configured (lets the stack choose)
    pub const PAN_ID: u16 = 0xFFFF;

    pub const ADMIN_LISTEN: &str = "127.0.0.1:7878";
}

/// Role of a device in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeType {
    Coordinator,
    Router,
    EndDevice,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Coordinator => write!(f, "Coordinator"),
            NodeType::Router => write!(f, "Router"),
            NodeType::EndDevice => write!(f, "EndDevice"),
            NodeType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One device as reported by the transport's roster
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    #[serde(rename = "ieeeAddr")]
    pub address: String,
    #[serde(rename = "manufName", default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub power_source: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "epList", default)]
    pub endpoints: Vec<u8>,
}

/// Persisted record of a known device.
///
/// The serialized key names are those of the on-disk names file so that
/// existing files keep loading.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(rename = "ieeeAddr", default)]
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "manufName", default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub power_source: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Last time traffic from this device was seen (ms since epoch)
    #[serde(rename = "ts", default)]
    pub last_seen_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overdue: Option<bool>,
}

impl Device {
    /// Create a new entry for a device first seen in a roster scan
    pub fn from_roster(entry: &RosterEntry) -> Self {
        let mut device = Self {
            address: entry.address.clone(),
            ..Default::default()
        };
        device.merge(entry);
        device
    }

    /// Copy roster metadata onto this record, returning whether anything changed
    pub fn merge(&mut self, entry: &RosterEntry) -> bool {
        let before = self.clone();
        self.address = entry.address.clone();
        self.manufacturer = entry.manufacturer.clone();
        self.model_id = entry.model_id.clone();
        self.node_type = entry.node_type;
        self.power_source = entry.power_source.clone();
        self.status = entry.status.clone();
        *self != before
    }
}

/// Device map keyed by network address
pub type DeviceMap = BTreeMap<String, Device>;

/// A parent/child link reported by a link-quality scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyLink {
    pub child: String,
    pub parent: String,
    pub lqi: u8,
}

/// Which devices may join while the join window is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinFilter {
    /// Any router may accept joins
    #[default]
    All,
    /// Only the coordinator accepts joins
    Coord,
}

impl std::str::FromStr for JoinFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "all" => Ok(JoinFilter::All),
            "coord" | "coordinator" => Ok(JoinFilter::Coord),
            other => Err(format!("unknown join filter: {other}")),
        }
    }
}

/// Destination of a bind/unbind request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindTarget {
    Endpoint { address: String, endpoint: u8 },
    Group(u16),
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Endpoint { address, endpoint } => write!(f, "{} ep {}", address, endpoint),
            BindTarget::Group(group) => write!(f, "group {}", group),
        }
    }
}

/// Traffic and membership notifications from the network layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Indication {
    DeviceIncoming { address: String },
    DeviceLeaving { address: String },
    /// Any other application traffic; `address` is the originating device
    Message {
        address: Option<String>,
        endpoint: Option<u8>,
        cluster: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl Indication {
    /// Address of the device this indication originates from
    pub fn address(&self) -> Option<&str> {
        match self {
            Indication::DeviceIncoming { address } | Indication::DeviceLeaving { address } => {
                Some(address)
            }
            Indication::Message { address, .. } => address.as_deref(),
        }
    }

    /// Whether the indication changes network membership
    pub fn is_membership_change(&self) -> bool {
        matches!(
            self,
            Indication::DeviceIncoming { .. } | Indication::DeviceLeaving { .. }
        )
    }
}

/// Events emitted by the transport adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum NetworkEvent {
    /// The coordinator radio is up and the network formed
    Ready,
    Error { message: String },
    Indication(Indication),
    /// Seconds left in the join window (negative when the stack lost track)
    JoinWindowChanged { seconds_left: i32 },
}

/// Connection status of a coordinator instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CoordinatorStatus {
    Starting,
    Connecting,
    Connected,
    Closing,
    Stopped,
    Failed(String),
}

impl fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorStatus::Starting => write!(f, "starting"),
            CoordinatorStatus::Connecting => write!(f, "connecting"),
            CoordinatorStatus::Connected => write!(f, "connected"),
            CoordinatorStatus::Closing => write!(f, "closing"),
            CoordinatorStatus::Stopped => write!(f, "stopped"),
            CoordinatorStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

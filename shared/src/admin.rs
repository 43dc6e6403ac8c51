//! Administrative request/response protocol
//!
//! Every request is addressed to one coordinator instance by its id.

use crate::{BindTarget, CoordinatorStatus, DeviceMap, JoinFilter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A request addressed to a coordinator instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminEnvelope {
    pub instance_id: String,
    pub request_id: u64,
    pub request: AdminRequest,
}

/// Operations exposed to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AdminRequest {
    ListDevices,
    /// Topology as Graphviz DOT text
    TopologyGraph,
    /// Bulk rename, keyed by device address
    RenameDevices { names: BTreeMap<String, String> },
    RemoveDevice { address: String },
    PermitJoin {
        seconds: u32,
        #[serde(default)]
        filter: JoinFilter,
    },
    Bind {
        source: String,
        source_endpoint: u8,
        target: BindTarget,
        cluster: String,
    },
    Unbind {
        source: String,
        source_endpoint: u8,
        target: BindTarget,
        cluster: String,
    },
    JoinTimeLeft,
    Status,
    SendCommand(CommandRequest),
}

/// A command to a device endpoint, as submitted over the admin surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub target: String,
    pub endpoint: u8,
    /// `foundation` or `functional`; absent means `foundation`
    #[serde(default)]
    pub kind: Option<String>,
    pub cluster: String,
    pub command: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub suppress_default_response: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_blocks_queue")]
    pub blocks_queue: bool,
}

fn default_blocks_queue() -> bool {
    true
}

/// Reply payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum AdminResponse {
    Devices(DeviceMap),
    Graph(String),
    JoinTimeLeft { seconds: i32 },
    Status(CoordinatorStatus),
    CommandResult(Value),
    Ack,
    Error { message: String },
}

impl AdminResponse {
    pub fn error(message: impl Into<String>) -> Self {
        AdminResponse::Error {
            message: message.into(),
        }
    }
}

/// Reply to an [`AdminEnvelope`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminReply {
    pub request_id: u64,
    pub response: AdminResponse,
}

//! Command dispatch for the shared coordinator radio
//!
//! This module handles:
//! - Modelling commands addressed to device endpoints
//! - De-duplicating and bounding the pending queue
//! - Keeping at most one command in flight on the radio
//! - Pacing, timeouts and late responses

mod dispatcher;
mod inflight;
mod queue;

pub use dispatcher::{CommandDispatcher, CommandTicket, DispatcherConfig, DispatcherStats};

use crate::error::DispatchError;
use crate::transport::EndpointCall;
use meshcoord_shared::CommandRequest;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Application protocol command family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// Profile-wide commands (read/write attributes, configure reporting...)
    #[default]
    Foundation,
    /// Cluster-specific commands
    Functional,
}

impl FromStr for CommandKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "foundation" => Ok(CommandKind::Foundation),
            "functional" => Ok(CommandKind::Functional),
            _ => Err(DispatchError::UnsupportedKind(s.to_string())),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Foundation => write!(f, "foundation"),
            CommandKind::Functional => write!(f, "functional"),
        }
    }
}

/// Per-command radio options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandConfig {
    /// Ask the device not to send a default response
    pub suppress_default_response: bool,
}

/// A command addressed to one device endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub target: String,
    pub endpoint: u8,
    pub kind: CommandKind,
    pub cluster: String,
    pub command: String,
    pub payload: Map<String, Value>,
    pub config: CommandConfig,
    /// Response wait; the dispatcher default applies when unset
    pub timeout: Option<Duration>,
    /// Whether the radio stays reserved until the response arrives
    pub blocks_queue: bool,
}

impl Command {
    pub fn new(
        target: impl Into<String>,
        endpoint: u8,
        cluster: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            endpoint,
            kind: CommandKind::Foundation,
            cluster: cluster.into(),
            command: command.into(),
            payload: Map::new(),
            config: CommandConfig::default(),
            timeout: None,
            blocks_queue: true,
        }
    }

    pub fn with_kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add a single payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn suppress_default_response(mut self) -> Self {
        self.config.suppress_default_response = true;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocks_queue = false;
        self
    }

    /// Same target endpoint, kind and command id. The cluster is not part of the identity.
    pub fn same_identity(&self, other: &Command) -> bool {
        self.target == other.target
            && self.endpoint == other.endpoint
            && self.kind == other.kind
            && self.command == other.command
    }

    /// Whether this command makes the queued `older` one redundant
    pub fn supersedes(&self, older: &Command) -> bool {
        self.same_identity(older)
            && older
                .payload
                .keys()
                .all(|key| self.payload.contains_key(key))
    }

    /// The call handed to the resolved endpoint
    pub fn endpoint_call(&self) -> EndpointCall {
        EndpointCall {
            kind: self.kind,
            cluster: self.cluster.clone(),
            command: self.command.clone(),
            payload: self.payload.clone(),
            config: self.config,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ep {} {} {}/{} {}",
            self.target,
            self.endpoint,
            self.kind,
            self.cluster,
            self.command,
            Value::Object(self.payload.clone())
        )
    }
}

impl TryFrom<CommandRequest> for Command {
    type Error = DispatchError;

    fn try_from(req: CommandRequest) -> Result<Self, Self::Error> {
        let kind = match req.kind.as_deref() {
            None => CommandKind::default(),
            Some(kind) => kind.parse()?,
        };

        Ok(Self {
            target: req.target,
            endpoint: req.endpoint,
            kind,
            cluster: req.cluster,
            command: req.command,
            payload: req.payload,
            config: CommandConfig {
                suppress_default_response: req.suppress_default_response,
            },
            timeout: req.timeout_ms.map(Duration::from_millis),
            blocks_queue: req.blocks_queue,
        })
    }
}

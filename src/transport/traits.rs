//! Transport adapter abstraction for the coordinator radio

use crate::command::{CommandConfig, CommandKind};
use crate::error::TransportError;
use async_trait::async_trait;
use meshcoord_shared::{BindTarget, JoinFilter, NetworkEvent, RosterEntry, TopologyLink};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// What an endpoint is asked to execute
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointCall {
    pub kind: CommandKind,
    pub cluster: String,
    pub command: String,
    pub payload: Map<String, Value>,
    pub config: CommandConfig,
}

/// Options for removing a device from the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Let the device join again later
    pub rejoin: bool,
    /// Also remove the device's children
    pub remove_children: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            rejoin: true,
            remove_children: false,
        }
    }
}

/// A resolved device endpoint
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Send a command and wait for the device's response
    async fn invoke(&self, call: EndpointCall) -> Result<Value, TransportError>;

    async fn bind(&self, cluster: &str, target: &BindTarget) -> Result<(), TransportError>;

    async fn unbind(&self, cluster: &str, target: &BindTarget) -> Result<(), TransportError>;
}

/// The radio driver as seen by the coordinator engine
#[async_trait]
pub trait MeshTransport: Send + Sync + 'static {
    /// Bring up the radio and form or join the network
    async fn start(&self) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    /// Release the underlying handle after a failed start
    async fn close(&self);

    /// Resolve an endpoint against the current roster
    fn find_endpoint(&self, address: &str, endpoint: u8) -> Option<Arc<dyn Endpoint>>;

    async fn roster(&self) -> Result<Vec<RosterEntry>, TransportError>;

    /// Address of the coordinator itself, once known
    fn coordinator_address(&self) -> Option<String>;

    /// Link-quality scan of the mesh rooted at `root`
    async fn lqi_scan(&self, root: &str) -> Result<Vec<TopologyLink>, TransportError>;

    async fn permit_join(&self, seconds: u8, filter: JoinFilter) -> Result<(), TransportError>;

    async fn remove_device(&self, address: &str, options: RemoveOptions)
        -> Result<(), TransportError>;

    /// Switch the coordinator's indicator LED
    async fn set_indicator(&self, enabled: bool) -> Result<(), TransportError>;

    /// Attach a listener for network events
    fn subscribe(&self) -> Subscription;

    /// Detach a listener; returns false if it was not attached
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// An attached event listener
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<NetworkEvent>,
}

/// Fan-out of network events to attached listeners
#[derive(Debug, Default)]
pub struct EventHub {
    inner: Mutex<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    next_id: u64,
    listeners: HashMap<SubscriptionId, mpsc::UnboundedSender<NetworkEvent>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.listeners.insert(id, tx);
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .remove(&id)
            .is_some()
    }

    /// Deliver an event to every listener, forgetting listeners that went away
    pub fn publish(&self, event: &NetworkEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .listeners
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }
}

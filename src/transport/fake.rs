//! Scriptable in-memory transport for tests

use super::traits::{
    Endpoint, EndpointCall, EventHub, MeshTransport, RemoveOptions, Subscription, SubscriptionId,
};
use crate::error::TransportError;
use async_trait::async_trait;
use meshcoord_shared::{
    BindTarget, JoinFilter, NetworkEvent, NodeType, RosterEntry, TopologyLink,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BindCall {
    pub source: String,
    pub source_endpoint: u8,
    pub cluster: String,
    pub target: BindTarget,
    pub bind: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    /// (address, endpoint) -> never responds
    endpoints: HashMap<(String, u8), bool>,
    response_delay: Duration,
    invoke_error: Option<String>,
    invocations: Vec<(String, EndpointCall)>,
    active: usize,
    max_active: usize,
    roster: Vec<RosterEntry>,
    links: Vec<TopologyLink>,
    coordinator: Option<String>,
    start_failures: u32,
    no_ready_on_start: bool,
    start_calls: u32,
    stop_calls: u32,
    close_calls: u32,
    permit_joins: Vec<(u8, JoinFilter)>,
    removed: Vec<(String, RemoveOptions)>,
    indicator: Vec<bool>,
    bindings: Vec<BindCall>,
}

type Shared = Arc<Mutex<FakeState>>;

fn lock(state: &Shared) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Roster entry with the fields tests care about
pub fn roster_entry(address: &str, model: &str, node_type: NodeType) -> RosterEntry {
    RosterEntry {
        address: address.into(),
        manufacturer: Some("LUMI".into()),
        model_id: Some(model.into()),
        node_type,
        power_source: Some("Battery".into()),
        status: Some("online".into()),
        endpoints: vec![1],
    }
}

#[derive(Debug, Default)]
pub struct FakeTransport {
    state: Shared,
    hub: EventHub,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(&self, address: &str, endpoint: u8) {
        lock(&self.state)
            .endpoints
            .insert((address.into(), endpoint), false);
    }

    /// Endpoint that accepts commands but never answers
    pub fn add_silent_endpoint(&self, address: &str, endpoint: u8) {
        lock(&self.state)
            .endpoints
            .insert((address.into(), endpoint), true);
    }

    pub fn set_response_delay(&self, delay: Duration) {
        lock(&self.state).response_delay = delay;
    }

    pub fn fail_invocations(&self, message: &str) {
        lock(&self.state).invoke_error = Some(message.into());
    }

    pub fn set_roster(&self, roster: Vec<RosterEntry>) {
        lock(&self.state).roster = roster;
    }

    pub fn set_links(&self, links: Vec<TopologyLink>) {
        lock(&self.state).links = links;
    }

    pub fn set_coordinator(&self, address: &str) {
        lock(&self.state).coordinator = Some(address.into());
    }

    /// Make the next `count` start attempts fail
    pub fn fail_starts(&self, count: u32) {
        lock(&self.state).start_failures = count;
    }

    /// Do not report ready after a successful start
    pub fn hold_ready(&self) {
        lock(&self.state).no_ready_on_start = true;
    }

    pub fn emit(&self, event: NetworkEvent) {
        self.hub.publish(&event);
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }

    pub fn invocations(&self) -> Vec<(String, EndpointCall)> {
        lock(&self.state).invocations.clone()
    }

    pub fn max_active_invocations(&self) -> usize {
        lock(&self.state).max_active
    }

    pub fn start_calls(&self) -> u32 {
        lock(&self.state).start_calls
    }

    pub fn stop_calls(&self) -> u32 {
        lock(&self.state).stop_calls
    }

    pub fn close_calls(&self) -> u32 {
        lock(&self.state).close_calls
    }

    pub fn permit_joins(&self) -> Vec<(u8, JoinFilter)> {
        lock(&self.state).permit_joins.clone()
    }

    pub fn removed(&self) -> Vec<(String, RemoveOptions)> {
        lock(&self.state).removed.clone()
    }

    pub fn indicator_calls(&self) -> Vec<bool> {
        lock(&self.state).indicator.clone()
    }

    pub fn bindings(&self) -> Vec<BindCall> {
        lock(&self.state).bindings.clone()
    }
}

#[async_trait]
impl MeshTransport for FakeTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let ready = {
            let mut state = lock(&self.state);
            state.start_calls += 1;
            if state.start_failures > 0 {
                state.start_failures -= 1;
                return Err(TransportError::Remote("radio did not respond".into()));
            }
            !state.no_ready_on_start
        };
        if ready {
            self.hub.publish(&NetworkEvent::Ready);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        lock(&self.state).stop_calls += 1;
        Ok(())
    }

    async fn close(&self) {
        lock(&self.state).close_calls += 1;
    }

    fn find_endpoint(&self, address: &str, endpoint: u8) -> Option<Arc<dyn Endpoint>> {
        let silent = *lock(&self.state)
            .endpoints
            .get(&(address.to_string(), endpoint))?;
        Some(Arc::new(FakeEndpoint {
            address: address.into(),
            endpoint,
            silent,
            state: self.state.clone(),
        }))
    }

    async fn roster(&self) -> Result<Vec<RosterEntry>, TransportError> {
        Ok(lock(&self.state).roster.clone())
    }

    fn coordinator_address(&self) -> Option<String> {
        lock(&self.state).coordinator.clone()
    }

    async fn lqi_scan(&self, _root: &str) -> Result<Vec<TopologyLink>, TransportError> {
        Ok(lock(&self.state).links.clone())
    }

    async fn permit_join(&self, seconds: u8, filter: JoinFilter) -> Result<(), TransportError> {
        lock(&self.state).permit_joins.push((seconds, filter));
        Ok(())
    }

    async fn remove_device(
        &self,
        address: &str,
        options: RemoveOptions,
    ) -> Result<(), TransportError> {
        lock(&self.state).removed.push((address.into(), options));
        Ok(())
    }

    async fn set_indicator(&self, enabled: bool) -> Result<(), TransportError> {
        lock(&self.state).indicator.push(enabled);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }
}

struct FakeEndpoint {
    address: String,
    endpoint: u8,
    silent: bool,
    state: Shared,
}

/// Counts an invocation as active until dropped
struct ActiveInvocation(Shared);

impl ActiveInvocation {
    fn begin(state: &Shared) -> Self {
        let mut guard = lock(state);
        guard.active += 1;
        guard.max_active = guard.max_active.max(guard.active);
        drop(guard);
        Self(state.clone())
    }
}

impl Drop for ActiveInvocation {
    fn drop(&mut self) {
        lock(&self.0).active -= 1;
    }
}

impl FakeEndpoint {
    fn record_binding(&self, cluster: &str, target: &BindTarget, bind: bool) {
        lock(&self.state).bindings.push(BindCall {
            source: self.address.clone(),
            source_endpoint: self.endpoint,
            cluster: cluster.into(),
            target: target.clone(),
            bind,
        });
    }
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    async fn invoke(&self, call: EndpointCall) -> Result<Value, TransportError> {
        let (delay, error) = {
            let mut state = lock(&self.state);
            state.invocations.push((self.address.clone(), call));
            (state.response_delay, state.invoke_error.clone())
        };
        let _active = ActiveInvocation::begin(&self.state);

        if self.silent {
            std::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match error {
            Some(message) => Err(TransportError::Remote(message)),
            None => Ok(json!({"status": 0})),
        }
    }

    async fn bind(&self, cluster: &str, target: &BindTarget) -> Result<(), TransportError> {
        self.record_binding(cluster, target, true);
        Ok(())
    }

    async fn unbind(&self, cluster: &str, target: &BindTarget) -> Result<(), TransportError> {
        self.record_binding(cluster, target, false);
        Ok(())
    }
}

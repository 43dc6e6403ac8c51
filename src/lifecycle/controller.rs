//! Coordinator lifecycle controller
//!
//! Owns start/stop of the transport, the network event listeners and the
//! periodic overdue check of one coordinator instance.

use crate::registry::{DeviceRegistry, OverdueMonitor, OverdueMonitorHandle};
use crate::transport::{MeshTransport, SubscriptionId};
use meshcoord_shared::state_machine::{LifecycleEvent, LifecycleStateMachine, TransitionResult};
use meshcoord_shared::{now_ms, CoordinatorStatus, Indication, JoinFilter, NetworkEvent};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Everything the controller needs to run one coordinator
pub struct LifecycleContext {
    pub transport: Arc<dyn MeshTransport>,
    pub registry: DeviceRegistry,
    /// Indicator LED state re-applied on every ready
    pub indicator_enabled: bool,
    pub start_retry_backoff: Duration,
    pub overdue_check_interval: Duration,
}

/// State shared between the controller and its tasks
struct LifecycleShared {
    transport: Arc<dyn MeshTransport>,
    registry: DeviceRegistry,
    indicator_enabled: bool,
    fsm: Mutex<LifecycleStateMachine>,
    status_tx: watch::Sender<CoordinatorStatus>,
    indications: broadcast::Sender<Indication>,
    join_time_left: AtomicI32,
}

impl LifecycleShared {
    /// Feed an event to the state machine and publish the resulting status
    fn apply(&self, event: LifecycleEvent) -> TransitionResult {
        let result = self
            .fsm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process_event(event);

        match &result {
            TransitionResult::Success(status) => {
                self.status_tx.send_replace(status.clone());
            }
            TransitionResult::Fatal { reason } => {
                self.status_tx
                    .send_replace(CoordinatorStatus::Failed(reason.clone()));
            }
            TransitionResult::RetryScheduled { .. } => {}
            TransitionResult::Invalid { from, event } => {
                trace!("ignoring {:?} while {}", event, from);
            }
        }
        result
    }

    async fn on_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Ready => self.on_ready().await,
            NetworkEvent::Error { message } => error!("{}", message),
            NetworkEvent::Indication(indication) => self.on_indication(indication).await,
            NetworkEvent::JoinWindowChanged { seconds_left } => {
                self.on_join_window(seconds_left).await
            }
        }
    }

    async fn on_ready(&self) {
        info!("ready");
        self.apply(LifecycleEvent::Ready);

        self.registry.reset_liveness(now_ms()).await;
        self.refresh_roster().await;

        if let Err(e) = self.transport.set_indicator(self.indicator_enabled).await {
            warn!("failed to set indicator: {}", e);
        }
    }

    async fn on_indication(&self, indication: Indication) {
        if indication.is_membership_change() {
            debug!("{:?}", indication);
            self.refresh_roster().await;
        }

        if let Some(address) = indication.address() {
            self.registry.mark_seen(address).await;
        }

        // Nobody listening is fine
        let _ = self.indications.send(indication);
    }

    async fn on_join_window(&self, seconds_left: i32) {
        if seconds_left < 0 {
            // Stack lost track of the window; close it properly
            if let Err(e) = self.transport.permit_join(1, JoinFilter::All).await {
                warn!("permit join failed: {}", e);
            }
        }
        self.join_time_left.store(seconds_left, Ordering::SeqCst);
    }

    async fn refresh_roster(&self) {
        match self.transport.roster().await {
            Ok(roster) => {
                self.registry.reconcile(&roster).await;
            }
            Err(e) => warn!("roster scan failed: {}", e),
        }
    }
}

/// Tasks owned by a running controller
struct LifecycleTasks {
    start: JoinHandle<()>,
    events: JoinHandle<()>,
    stop_events: oneshot::Sender<()>,
    overdue: OverdueMonitorHandle,
}

pub struct LifecycleController {
    shared: Arc<LifecycleShared>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    tasks: Mutex<Option<LifecycleTasks>>,
}

impl LifecycleController {
    /// Attach listeners, start the transport and the overdue check
    pub fn start(ctx: LifecycleContext) -> Self {
        let (status_tx, _) = watch::channel(CoordinatorStatus::Starting);
        let (indications, _) = broadcast::channel(64);

        let shared = Arc::new(LifecycleShared {
            transport: ctx.transport.clone(),
            registry: ctx.registry.clone(),
            indicator_enabled: ctx.indicator_enabled,
            fsm: Mutex::new(LifecycleStateMachine::new()),
            status_tx,
            indications,
            join_time_left: AtomicI32::new(0),
        });

        // Listen before starting so an early ready is not missed
        let subscription = ctx.transport.subscribe();
        let (stop_events, stop_rx) = oneshot::channel();
        let events = tokio::spawn(handle_network_events(
            shared.clone(),
            subscription.events,
            stop_rx,
        ));

        let start = tokio::spawn(start_with_retry(shared.clone(), ctx.start_retry_backoff));
        let overdue = OverdueMonitor::start(ctx.registry, ctx.overdue_check_interval);

        Self {
            shared,
            subscriptions: Mutex::new(vec![subscription.id]),
            tasks: Mutex::new(Some(LifecycleTasks {
                start,
                events,
                stop_events,
                overdue,
            })),
        }
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Indications re-broadcast after the registry has seen them
    pub fn subscribe_indications(&self) -> broadcast::Receiver<Indication> {
        self.shared.indications.subscribe()
    }

    /// Seconds left in the join window, as last reported by the network
    pub fn join_time_left(&self) -> i32 {
        self.shared.join_time_left.load(Ordering::SeqCst)
    }

    /// Stop the transport and detach every listener.
    ///
    /// Returns once no further network event can reach the registry.
    /// In-flight commands are left to resolve or time out on their own.
    pub async fn shutdown(&self) {
        let Some(tasks) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        debug!("stopping");
        self.shared.apply(LifecycleEvent::CloseRequested);
        tasks.overdue.stop();
        tasks.start.abort();

        if let Err(e) = self.shared.transport.stop().await {
            warn!("transport stop failed: {}", e);
        }

        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for id in ids {
            self.shared.transport.unsubscribe(id);
        }

        let _ = tasks.stop_events.send(());
        if let Err(e) = tasks.events.await {
            warn!("event loop ended abnormally: {}", e);
        }
        trace!("removed event listeners");

        self.shared.apply(LifecycleEvent::Closed);
        debug!("stopped");
    }
}

/// Start the transport, retrying once after the backoff
async fn start_with_retry(shared: Arc<LifecycleShared>, backoff: Duration) {
    loop {
        debug!("starting");
        match shared.transport.start().await {
            Ok(()) => {
                shared.apply(LifecycleEvent::Started);
                debug!("started");
                return;
            }
            Err(e) => {
                shared.transport.close().await;
                let reason = e.to_string();

                match shared.apply(LifecycleEvent::StartFailed {
                    reason: reason.clone(),
                }) {
                    TransitionResult::RetryScheduled { attempt, .. } => {
                        error!("{}, retrying in {:?} (attempt {})", reason, backoff, attempt);
                        tokio::time::sleep(backoff).await;
                    }
                    TransitionResult::Fatal { .. } => {
                        error!("{}", reason);
                        return;
                    }
                    _ => return,
                }
            }
        }
    }
}

/// Process network events in arrival order until told to stop
async fn handle_network_events(
    shared: Arc<LifecycleShared>,
    mut events: mpsc::UnboundedReceiver<NetworkEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            event = events.recv() => match event {
                Some(event) => shared.on_event(event).await,
                None => break,
            },
        }
    }
}

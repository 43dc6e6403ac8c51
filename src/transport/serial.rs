//! Serial bridge transport
//!
//! Talks to an external network-processor bridge over a serial port. Host
//! link frames use the shared length-prefixed JSON codec; the bridge owns
//! the radio frame format and the network database.

use super::traits::{
    Endpoint, EndpointCall, EventHub, MeshTransport, RemoveOptions, Subscription, SubscriptionId,
};
use crate::error::TransportError;
use async_trait::async_trait;
use meshcoord_shared::codec::{self, FrameDecoder};
use meshcoord_shared::{
    defaults, BindTarget, JoinFilter, NetworkEvent, NodeType, RosterEntry, TopologyLink,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_serial::{FlowControl, SerialPortBuilderExt};
use tracing::{debug, error, info, warn};

/// Frames exchanged with the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    Request {
        id: u64,
        op: BridgeOp,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        event: NetworkEvent,
    },
}

/// Operations the bridge executes on behalf of the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeOp {
    Start {
        pan_id: u16,
        network_key: Option<Vec<u8>>,
        channels: Vec<u8>,
        db_path: String,
    },
    Stop,
    Roster,
    Invoke {
        address: String,
        endpoint: u8,
        kind: String,
        cluster: String,
        command: String,
        payload: Map<String, Value>,
        disable_default_response: bool,
    },
    Bind {
        address: String,
        endpoint: u8,
        cluster: String,
        target: BindTarget,
    },
    Unbind {
        address: String,
        endpoint: u8,
        cluster: String,
        target: BindTarget,
    },
    Remove {
        address: String,
        rejoin: bool,
        remove_children: bool,
    },
    PermitJoin {
        seconds: u8,
        filter: JoinFilter,
    },
    LqiScan {
        root: String,
    },
    SetIndicator {
        enabled: bool,
    },
}

/// Serial bridge settings
#[derive(Debug, Clone)]
pub struct SerialBridgeConfig {
    pub path: String,
    pub baud_rate: u32,
    /// Hardware flow control
    pub rtscts: bool,
    pub pan_id: u16,
    pub network_key: Option<Vec<u8>>,
    pub channels: Vec<u8>,
    /// Network database file handed to the bridge
    pub db_path: PathBuf,
    /// Bound on requests other than command invocations
    pub request_timeout: Duration,
}

impl Default for SerialBridgeConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyACM0".into(),
            baud_rate: defaults::SERIAL_BAUD_RATE,
            rtscts: false,
            pan_id: defaults::PAN_ID,
            network_key: None,
            channels: vec![11],
            db_path: PathBuf::from("dev.db"),
            request_timeout: Duration::from_millis(defaults::BRIDGE_REQUEST_TIMEOUT_MS),
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>>;

/// An open host link to the bridge
struct BridgeLink {
    outbound: mpsc::Sender<BridgeFrame>,
    pending: Pending,
    next_id: AtomicU64,
    io_task: JoinHandle<()>,
}

/// Removes a pending request entry however the request ends
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl BridgeLink {
    /// Spawn the I/O loop over an already open stream
    fn open<S>(stream: S, hub: Arc<EventHub>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel::<BridgeFrame>(100);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let pending_clone = pending.clone();
        let io_task = tokio::spawn(async move {
            if let Err(e) = handle_link(stream, outbound_rx, &pending_clone, &hub).await {
                error!("bridge link failed: {}", e);
                hub.publish(&NetworkEvent::Error {
                    message: e.to_string(),
                });
            }
            // Wake every waiter with a closed link
            pending_clone
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        });

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(0),
            io_task,
        }
    }

    async fn request(&self, op: BridgeOp, limit: Option<Duration>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        self.outbound
            .send(BridgeFrame::Request { id, op })
            .await
            .map_err(|_| TransportError::Closed)?;

        let response = match limit {
            Some(limit) => timeout(limit, rx)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => rx.await,
        };
        response.map_err(|_| TransportError::Closed)?
    }
}

impl Drop for BridgeLink {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

/// Handle the host link until it closes
async fn handle_link<S>(
    stream: S,
    mut outbound_rx: mpsc::Receiver<BridgeFrame>,
    pending: &Pending,
    hub: &EventHub,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::<BridgeFrame>::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let encoded = codec::encode(&frame)?;
                writer.write_all(&encoded).await?;
            }

            read = reader.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    return Err(TransportError::Closed);
                }
                decoder.extend(&read_buf[..n]);

                while let Some(frame) = decoder.decode_next()? {
                    dispatch_inbound(frame, pending, hub);
                }
            }
        }
    }
}

fn dispatch_inbound(frame: BridgeFrame, pending: &Pending, hub: &EventHub) {
    match frame {
        BridgeFrame::Response { id, result, error } => {
            let waiter = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let outcome = match error {
                        Some(message) => Err(TransportError::Remote(message)),
                        None => Ok(result),
                    };
                    let _ = tx.send(outcome);
                }
                None => debug!("response {} has no waiter", id),
            }
        }
        BridgeFrame::Event { event } => hub.publish(&event),
        BridgeFrame::Request { id, .. } => warn!("ignoring request {} from bridge", id),
    }
}

/// Transport adapter backed by a serial network-processor bridge
pub struct SerialBridge {
    config: SerialBridgeConfig,
    link: Mutex<Option<Arc<BridgeLink>>>,
    /// Roster cache used to resolve endpoints without a round trip
    roster: Arc<RwLock<Vec<RosterEntry>>>,
    hub: Arc<EventHub>,
}

impl SerialBridge {
    pub fn new(config: SerialBridgeConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
            roster: Arc::new(RwLock::new(Vec::new())),
            hub: Arc::new(EventHub::new()),
        }
    }

    fn link(&self) -> Result<Arc<BridgeLink>, TransportError> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotStarted)
    }

    fn set_link(&self, link: Option<Arc<BridgeLink>>) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = link;
    }

    async fn request(&self, op: BridgeOp) -> Result<Value, TransportError> {
        self.link()?
            .request(op, Some(self.config.request_timeout))
            .await
    }

    fn open_port(&self) -> Result<tokio_serial::SerialStream, TransportError> {
        let flow_control = if self.config.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        let port = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .flow_control(flow_control)
            .open_native_async()?;
        Ok(port)
    }

    /// Start over an already open stream instead of the serial port
    async fn start_on<S>(&self, stream: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let link = Arc::new(BridgeLink::open(stream, self.hub.clone()));
        self.set_link(Some(link.clone()));

        link.request(
            BridgeOp::Start {
                pan_id: self.config.pan_id,
                network_key: self.config.network_key.clone(),
                channels: self.config.channels.clone(),
                db_path: self.config.db_path.display().to_string(),
            },
            Some(self.config.request_timeout),
        )
        .await?;
        Ok(())
    }

    fn roster_snapshot(&self) -> std::sync::RwLockReadGuard<'_, Vec<RosterEntry>> {
        self.roster.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MeshTransport for SerialBridge {
    async fn start(&self) -> Result<(), TransportError> {
        info!(
            "opening {} at {} baud (rtscts: {})",
            self.config.path, self.config.baud_rate, self.config.rtscts
        );
        let port = self.open_port()?;
        self.start_on(port).await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let result = match self.link() {
            Ok(link) => link
                .request(BridgeOp::Stop, Some(self.config.request_timeout))
                .await
                .map(|_| ()),
            Err(TransportError::NotStarted) => Ok(()),
            Err(e) => Err(e),
        };
        self.close().await;
        result
    }

    async fn close(&self) {
        self.set_link(None);
        self.roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn find_endpoint(&self, address: &str, endpoint: u8) -> Option<Arc<dyn Endpoint>> {
        let link = self.link().ok()?;
        let known = self
            .roster_snapshot()
            .iter()
            .any(|entry| entry.address == address && entry.endpoints.contains(&endpoint));
        if !known {
            return None;
        }
        Some(Arc::new(BridgeEndpoint {
            link,
            address: address.into(),
            endpoint,
            request_timeout: self.config.request_timeout,
        }))
    }

    async fn roster(&self) -> Result<Vec<RosterEntry>, TransportError> {
        let value = self.request(BridgeOp::Roster).await?;
        let roster: Vec<RosterEntry> = serde_json::from_value(value)
            .map_err(|e| TransportError::Remote(format!("malformed roster: {}", e)))?;
        *self.roster.write().unwrap_or_else(PoisonError::into_inner) = roster.clone();
        Ok(roster)
    }

    fn coordinator_address(&self) -> Option<String> {
        self.roster_snapshot()
            .iter()
            .find(|entry| entry.node_type == NodeType::Coordinator)
            .map(|entry| entry.address.clone())
    }

    async fn lqi_scan(&self, root: &str) -> Result<Vec<TopologyLink>, TransportError> {
        let value = self
            .request(BridgeOp::LqiScan { root: root.into() })
            .await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Remote(format!("malformed scan result: {}", e)))
    }

    async fn permit_join(&self, seconds: u8, filter: JoinFilter) -> Result<(), TransportError> {
        self.request(BridgeOp::PermitJoin { seconds, filter })
            .await
            .map(|_| ())
    }

    async fn remove_device(
        &self,
        address: &str,
        options: RemoveOptions,
    ) -> Result<(), TransportError> {
        self.request(BridgeOp::Remove {
            address: address.into(),
            rejoin: options.rejoin,
            remove_children: options.remove_children,
        })
        .await
        .map(|_| ())
    }

    async fn set_indicator(&self, enabled: bool) -> Result<(), TransportError> {
        self.request(BridgeOp::SetIndicator { enabled })
            .await
            .map(|_| ())
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }
}

/// Endpoint resolved from the bridge's roster
struct BridgeEndpoint {
    link: Arc<BridgeLink>,
    address: String,
    endpoint: u8,
    request_timeout: Duration,
}

#[async_trait]
impl Endpoint for BridgeEndpoint {
    async fn invoke(&self, call: EndpointCall) -> Result<Value, TransportError> {
        // Bounded by the dispatcher's own timeout
        self.link
            .request(
                BridgeOp::Invoke {
                    address: self.address.clone(),
                    endpoint: self.endpoint,
                    kind: call.kind.to_string(),
                    cluster: call.cluster,
                    command: call.command,
                    payload: call.payload,
                    disable_default_response: call.config.suppress_default_response,
                },
                None,
            )
            .await
    }

    async fn bind(&self, cluster: &str, target: &BindTarget) -> Result<(), TransportError> {
        let op = BridgeOp::Bind {
            address: self.address.clone(),
            endpoint: self.endpoint,
            cluster: cluster.into(),
            target: target.clone(),
        };
        self.link
            .request(op, Some(self.request_timeout))
            .await
            .map(|_| ())
    }

    async fn unbind(&self, cluster: &str, target: &BindTarget) -> Result<(), TransportError> {
        let op = BridgeOp::Unbind {
            address: self.address.clone(),
            endpoint: self.endpoint,
            cluster: cluster.into(),
            target: target.clone(),
        };
        self.link
            .request(op, Some(self.request_timeout))
            .await
            .map(|_| ())
    }
}

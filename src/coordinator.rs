//! One coordinator instance: transport, dispatcher, registry and lifecycle

use crate::command::{Command, CommandDispatcher, CommandTicket};
use crate::config::CoordinatorConfig;
use crate::error::{DispatchError, ManagementError, TransportError};
use crate::lifecycle::{LifecycleContext, LifecycleController};
use crate::registry::{DeviceRegistry, JsonFileStore, OverdueIntervals, RegistryEvent};
use crate::topology::export_graph;
use crate::transport::{MeshTransport, RemoveOptions, SerialBridge, SerialBridgeConfig};
use anyhow::{Context, Result};
use meshcoord_shared::{BindTarget, CoordinatorStatus, DeviceMap, Indication, JoinFilter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

pub struct Coordinator {
    instance_id: String,
    transport: Arc<dyn MeshTransport>,
    dispatcher: CommandDispatcher,
    registry: DeviceRegistry,
    lifecycle: LifecycleController,
}

impl Coordinator {
    /// Create the instance directory, load persisted devices and start the serial bridge
    pub async fn launch(config: &CoordinatorConfig) -> Result<Self> {
        let dir = config.instance_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        info!("persist path {}", dir.display());

        let bridge = SerialBridge::new(SerialBridgeConfig {
            path: config.serial.path.clone(),
            baud_rate: config.serial.baud_rate,
            rtscts: config.serial.rtscts,
            pan_id: config.network.pan_id()?,
            network_key: config.network.network_key()?,
            channels: config.network.channel_list.clone(),
            db_path: config.db_path(),
            ..Default::default()
        });

        let store = Arc::new(JsonFileStore::new(config.names_path()));
        let registry = DeviceRegistry::load(
            store,
            OverdueIntervals::with_overrides(&config.overdue_intervals),
        )
        .await;

        Ok(Self::start(config, Arc::new(bridge), registry))
    }

    /// Start an instance over the given transport and registry
    pub fn start(
        config: &CoordinatorConfig,
        transport: Arc<dyn MeshTransport>,
        registry: DeviceRegistry,
    ) -> Self {
        let dispatcher = CommandDispatcher::new(transport.clone(), config.dispatcher.clone());
        let lifecycle = LifecycleController::start(LifecycleContext {
            transport: transport.clone(),
            registry: registry.clone(),
            indicator_enabled: config.indicator_enabled,
            start_retry_backoff: config.lifecycle.start_retry_backoff(),
            overdue_check_interval: config.lifecycle.overdue_check_interval(),
        });

        Self {
            instance_id: config.instance_id.clone(),
            transport,
            dispatcher,
            registry,
            lifecycle,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.lifecycle.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.lifecycle.subscribe_status()
    }

    pub fn subscribe_devices(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn subscribe_indications(&self) -> broadcast::Receiver<Indication> {
        self.lifecycle.subscribe_indications()
    }

    pub async fn devices(&self) -> DeviceMap {
        self.registry.devices().await
    }

    /// Scan link quality from the coordinator and render the mesh as DOT
    pub async fn topology_graph(&self) -> Result<String, TransportError> {
        let root = self
            .transport
            .coordinator_address()
            .ok_or(TransportError::NotStarted)?;
        let links = self.transport.lqi_scan(&root).await?;
        Ok(export_graph(&self.registry.devices().await, &links))
    }

    /// Bulk rename; returns how many devices got a new name
    pub async fn rename_devices(&self, names: &BTreeMap<String, String>) -> usize {
        self.registry.rename_many(names).await
    }

    /// Remove a device from the network; it may join again later
    pub async fn remove_device(&self, address: &str) -> Result<(), ManagementError> {
        info!("remove {}", address);
        self.transport
            .remove_device(address, RemoveOptions::default())
            .await
            .map_err(|e| {
                error!("remove {} {}", address, e);
                e.into()
            })
    }

    /// Open the join window; zero seconds still opens it for one second
    pub async fn permit_join(&self, seconds: u32, filter: JoinFilter) -> Result<(), ManagementError> {
        let seconds = seconds.clamp(1, u8::MAX as u32) as u8;
        info!("permitJoin {} {:?}", seconds, filter);
        self.transport.permit_join(seconds, filter).await?;
        Ok(())
    }

    pub async fn bind(
        &self,
        source: &str,
        source_endpoint: u8,
        target: &BindTarget,
        cluster: &str,
    ) -> Result<(), ManagementError> {
        self.binding(source, source_endpoint, target, cluster, true)
            .await
    }

    pub async fn unbind(
        &self,
        source: &str,
        source_endpoint: u8,
        target: &BindTarget,
        cluster: &str,
    ) -> Result<(), ManagementError> {
        self.binding(source, source_endpoint, target, cluster, false)
            .await
    }

    async fn binding(
        &self,
        source: &str,
        source_endpoint: u8,
        target: &BindTarget,
        cluster: &str,
        bind: bool,
    ) -> Result<(), ManagementError> {
        let verb = if bind { "bind" } else { "unbind" };
        info!("{} {} ep {} -> {} cluster {}", verb, source, source_endpoint, target, cluster);

        let Some(endpoint) = self.transport.find_endpoint(source, source_endpoint) else {
            let err = ManagementError::UnknownSource {
                address: source.into(),
                endpoint: source_endpoint,
            };
            error!("{}", err);
            return Err(err);
        };

        if let BindTarget::Endpoint { address, endpoint: dest } = target {
            if self.transport.find_endpoint(address, *dest).is_none() {
                let err = ManagementError::UnknownDestination {
                    address: address.clone(),
                    endpoint: *dest,
                };
                error!("{}", err);
                return Err(err);
            }
        }

        let result = if bind {
            endpoint.bind(cluster, target).await
        } else {
            endpoint.unbind(cluster, target).await
        };

        match result {
            Ok(()) => {
                info!("{} successful", verb);
                Ok(())
            }
            Err(e) => {
                error!("{} failed: {}", verb, e);
                Err(e.into())
            }
        }
    }

    pub fn join_time_left(&self) -> i32 {
        self.lifecycle.join_time_left()
    }

    /// Queue a command for the radio
    pub fn send_command(&self, command: Command) -> Result<CommandTicket, DispatchError> {
        self.dispatcher.enqueue(command)
    }

    /// Stop the network and flush device names
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
        self.registry.save().await;
        info!("coordinator {} stopped", self.instance_id);
    }
}

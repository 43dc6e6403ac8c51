//! Coordinator instances by id, and admin request routing

use crate::command::Command;
use crate::coordinator::Coordinator;
use futures::future::join_all;
use meshcoord_shared::{AdminEnvelope, AdminReply, AdminRequest, AdminResponse, DeviceMap};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Tracks every running coordinator instance
#[derive(Default)]
pub struct CoordinatorDirectory {
    instances: RwLock<HashMap<String, Arc<Coordinator>>>,
}

impl CoordinatorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance under its id, replacing any previous one
    pub async fn register(&self, coordinator: Arc<Coordinator>) {
        let id = coordinator.instance_id().to_string();
        if self
            .instances
            .write()
            .await
            .insert(id.clone(), coordinator)
            .is_some()
        {
            warn!("replaced coordinator instance {}", id);
        }
    }

    pub async fn get(&self, instance_id: &str) -> Option<Arc<Coordinator>> {
        self.instances.read().await.get(instance_id).cloned()
    }

    /// Route a request to its instance and build the reply
    pub async fn handle(&self, envelope: AdminEnvelope) -> AdminReply {
        debug!(
            "admin request {} for {}: {:?}",
            envelope.request_id, envelope.instance_id, envelope.request
        );

        let response = match self.get(&envelope.instance_id).await {
            Some(coordinator) => handle_request(&coordinator, envelope.request).await,
            None => unknown_instance(&envelope.instance_id, &envelope.request),
        };

        AdminReply {
            request_id: envelope.request_id,
            response,
        }
    }

    /// Shut down every instance concurrently and empty the directory
    pub async fn shutdown_all(&self) {
        let instances: Vec<Arc<Coordinator>> = self
            .instances
            .write()
            .await
            .drain()
            .map(|(_, coordinator)| coordinator)
            .collect();

        join_all(instances.iter().map(|coordinator| coordinator.shutdown())).await;
    }
}

async fn handle_request(coordinator: &Coordinator, request: AdminRequest) -> AdminResponse {
    match request {
        AdminRequest::ListDevices => AdminResponse::Devices(coordinator.devices().await),
        AdminRequest::TopologyGraph => match coordinator.topology_graph().await {
            Ok(graph) => AdminResponse::Graph(graph),
            Err(e) => AdminResponse::error(format!("topology scan failed: {}", e)),
        },
        AdminRequest::RenameDevices { names } => {
            let renamed = coordinator.rename_devices(&names).await;
            debug!("renamed {} devices", renamed);
            AdminResponse::Ack
        }
        AdminRequest::RemoveDevice { address } => {
            ack_or_error(coordinator.remove_device(&address).await)
        }
        AdminRequest::PermitJoin { seconds, filter } => {
            ack_or_error(coordinator.permit_join(seconds, filter).await)
        }
        AdminRequest::Bind {
            source,
            source_endpoint,
            target,
            cluster,
        } => ack_or_error(
            coordinator
                .bind(&source, source_endpoint, &target, &cluster)
                .await,
        ),
        AdminRequest::Unbind {
            source,
            source_endpoint,
            target,
            cluster,
        } => ack_or_error(
            coordinator
                .unbind(&source, source_endpoint, &target, &cluster)
                .await,
        ),
        AdminRequest::JoinTimeLeft => AdminResponse::JoinTimeLeft {
            seconds: coordinator.join_time_left(),
        },
        AdminRequest::Status => AdminResponse::Status(coordinator.status()),
        AdminRequest::SendCommand(request) => {
            let command = match Command::try_from(request) {
                Ok(command) => command,
                Err(e) => return AdminResponse::error(e.to_string()),
            };
            let ticket = match coordinator.send_command(command) {
                Ok(ticket) => ticket,
                Err(e) => return AdminResponse::error(e.to_string()),
            };
            match ticket.outcome().await {
                Some(Ok(value)) => AdminResponse::CommandResult(value),
                Some(Err(e)) => AdminResponse::error(e.to_string()),
                None => AdminResponse::error("command dropped"),
            }
        }
    }
}

/// Replies for an id with no running instance: queries answer empty
fn unknown_instance(instance_id: &str, request: &AdminRequest) -> AdminResponse {
    match request {
        AdminRequest::ListDevices => AdminResponse::Devices(DeviceMap::new()),
        AdminRequest::JoinTimeLeft => AdminResponse::JoinTimeLeft { seconds: 0 },
        AdminRequest::TopologyGraph | AdminRequest::Status | AdminRequest::SendCommand(_) => {
            AdminResponse::error(format!("unknown coordinator instance {}", instance_id))
        }
        _ => {
            debug!("ignoring request for unknown instance {}", instance_id);
            AdminResponse::Ack
        }
    }
}

fn ack_or_error<E: std::fmt::Display>(result: Result<(), E>) -> AdminResponse {
    match result {
        Ok(()) => AdminResponse::Ack,
        Err(e) => AdminResponse::error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::connected_coordinator;
    use meshcoord_shared::{BindTarget, CommandRequest, CoordinatorStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn envelope(instance_id: &str, request: AdminRequest) -> AdminEnvelope {
        AdminEnvelope {
            instance_id: instance_id.into(),
            request_id: 42,
            request,
        }
    }

    fn toggle(target: &str) -> CommandRequest {
        CommandRequest {
            target: target.into(),
            endpoint: 1,
            kind: Some("functional".into()),
            cluster: "genOnOff".into(),
            command: "toggle".into(),
            payload: Default::default(),
            suppress_default_response: false,
            timeout_ms: None,
            blocks_queue: true,
        }
    }

    #[tokio::test]
    async fn test_unknown_instance_replies() {
        let directory = CoordinatorDirectory::new();

        let reply = directory.handle(envelope("nope", AdminRequest::ListDevices)).await;
        assert_eq!(reply.request_id, 42);
        assert_eq!(reply.response, AdminResponse::Devices(DeviceMap::new()));

        let reply = directory.handle(envelope("nope", AdminRequest::JoinTimeLeft)).await;
        assert_eq!(reply.response, AdminResponse::JoinTimeLeft { seconds: 0 });

        let reply = directory.handle(envelope("nope", AdminRequest::TopologyGraph)).await;
        assert!(matches!(reply.response, AdminResponse::Error { .. }));

        let reply = directory
            .handle(envelope(
                "nope",
                AdminRequest::RemoveDevice {
                    address: "0x01".into(),
                },
            ))
            .await;
        assert_eq!(reply.response, AdminResponse::Ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_to_instance() {
        let (coordinator, _transport, _store) = connected_coordinator("c1").await;
        let directory = CoordinatorDirectory::new();
        directory.register(Arc::new(coordinator)).await;
        assert!(directory.get("c1").await.is_some());

        let reply = directory.handle(envelope("c1", AdminRequest::ListDevices)).await;
        match reply.response {
            AdminResponse::Devices(devices) => assert_eq!(devices.len(), 2),
            other => panic!("unexpected response: {:?}", other),
        }

        let reply = directory.handle(envelope("c1", AdminRequest::Status)).await;
        assert_eq!(
            reply.response,
            AdminResponse::Status(CoordinatorStatus::Connected)
        );

        let names = BTreeMap::from([("0x01".to_string(), "hall".to_string())]);
        let reply = directory
            .handle(envelope("c1", AdminRequest::RenameDevices { names }))
            .await;
        assert_eq!(reply.response, AdminResponse::Ack);
        let device = directory
            .get("c1")
            .await
            .expect("instance")
            .devices()
            .await
            .remove("0x01")
            .expect("device");
        assert_eq!(device.name, "hall");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_outcomes() {
        let (coordinator, _transport, _store) = connected_coordinator("c1").await;
        let directory = CoordinatorDirectory::new();
        directory.register(Arc::new(coordinator)).await;

        let reply = directory
            .handle(envelope("c1", AdminRequest::SendCommand(toggle("0x01"))))
            .await;
        assert_eq!(reply.response, AdminResponse::CommandResult(json!({"status": 0})));

        let reply = directory
            .handle(envelope("c1", AdminRequest::SendCommand(toggle("0x09"))))
            .await;
        assert!(matches!(reply.response, AdminResponse::Error { .. }));

        let mut bad_kind = toggle("0x01");
        bad_kind.kind = Some("profile".into());
        let reply = directory
            .handle(envelope("c1", AdminRequest::SendCommand(bad_kind)))
            .await;
        assert_eq!(
            reply.response,
            AdminResponse::error("cmdType profile not supported")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_failure_is_reported() {
        let (coordinator, _transport, _store) = connected_coordinator("c1").await;
        let directory = CoordinatorDirectory::new();
        directory.register(Arc::new(coordinator)).await;

        let reply = directory
            .handle(envelope(
                "c1",
                AdminRequest::Bind {
                    source: "0x42".into(),
                    source_endpoint: 1,
                    target: BindTarget::Group(3),
                    cluster: "genOnOff".into(),
                },
            ))
            .await;
        assert!(matches!(reply.response, AdminResponse::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_empties_directory() {
        let (coordinator, transport, _store) = connected_coordinator("c1").await;
        let directory = CoordinatorDirectory::new();
        directory.register(Arc::new(coordinator)).await;

        directory.shutdown_all().await;

        assert!(directory.get("c1").await.is_none());
        assert_eq!(transport.stop_calls(), 1);
    }
}

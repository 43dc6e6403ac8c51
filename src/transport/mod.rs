//! Transport adapters for the coordinator radio

#[cfg(test)]
pub mod fake;
pub mod serial;
mod traits;

pub use serial::{SerialBridge, SerialBridgeConfig};
pub use traits::{
    Endpoint, EndpointCall, EventHub, MeshTransport, RemoveOptions, Subscription, SubscriptionId,
};

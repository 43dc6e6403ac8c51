//! Device registry
//!
//! Tracks which devices are part of the network, persists their names and
//! metadata, and flags devices that stopped reporting.

mod manager;
mod overdue;
mod store;

pub use manager::{DeviceRegistry, RegistryEvent};
pub use overdue::{OverdueIntervals, OverdueMonitor, OverdueMonitorHandle};
pub use store::{DeviceStore, JsonFileStore};

#[cfg(test)]
pub use store::MemoryStore;

//! Device registry - authoritative, persisted map of known devices

use super::overdue::OverdueIntervals;
use super::store::DeviceStore;
use meshcoord_shared::{now_ms, Device, DeviceMap, RosterEntry};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

/// Change notifications from the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// Observable device state changed; carries the new map
    DevicesChanged(DeviceMap),
}

struct RegistryInner {
    devices: RwLock<DeviceMap>,
    store: Arc<dyn DeviceStore>,
    intervals: OverdueIntervals,
    events: broadcast::Sender<RegistryEvent>,
    /// Serializes writes to the store
    save_lock: Mutex<()>,
}

/// Handle to the device registry; clones share the same map
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    /// Create an empty registry over `store` without reading it
    pub fn new(store: Arc<dyn DeviceStore>, intervals: OverdueIntervals) -> Self {
        Self::with_devices(store, intervals, DeviceMap::new())
    }

    /// Create a registry from the persisted map.
    ///
    /// An unreadable store is logged and treated as empty.
    pub async fn load(store: Arc<dyn DeviceStore>, intervals: OverdueIntervals) -> Self {
        let devices = match store.load().await {
            Ok(devices) => {
                debug!("loaded {} devices", devices.len());
                devices
            }
            Err(e) => {
                warn!("could not load device names: {}", e);
                DeviceMap::new()
            }
        };
        Self::with_devices(store, intervals, devices)
    }

    fn with_devices(
        store: Arc<dyn DeviceStore>,
        intervals: OverdueIntervals,
        devices: DeviceMap,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(RegistryInner {
                devices: RwLock::new(devices),
                store,
                intervals,
                events,
                save_lock: Mutex::new(()),
            }),
        }
    }

    pub async fn devices(&self) -> DeviceMap {
        self.inner.devices.read().await.clone()
    }

    pub async fn get(&self, address: &str) -> Option<Device> {
        self.inner.devices.read().await.get(address).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Merge a full roster snapshot into the map.
    ///
    /// New devices start unnamed, devices missing from the snapshot are
    /// dropped. Returns whether anything changed; only then is the map saved.
    pub async fn reconcile(&self, roster: &[RosterEntry]) -> bool {
        let now = now_ms();
        let mut devices = self.inner.devices.write().await;
        let mut changed = false;

        for entry in roster {
            match devices.get_mut(&entry.address) {
                Some(device) => changed |= device.merge(entry),
                None => {
                    let mut device = Device::from_roster(entry);
                    device.last_seen_ms = now;
                    devices.insert(entry.address.clone(), device);
                    changed = true;
                }
            }
        }

        let known: HashSet<&str> = roster.iter().map(|entry| entry.address.as_str()).collect();
        let before = devices.len();
        devices.retain(|address, _| known.contains(address.as_str()));
        changed |= devices.len() != before;

        if changed {
            debug!("list: changed!");
            self.changed(&devices);
        } else {
            debug!("list: no change");
        }
        changed
    }

    /// Record traffic from a device
    pub async fn mark_seen(&self, address: &str) -> bool {
        self.mark_seen_at(address, now_ms()).await
    }

    /// Record traffic at `now_ms`; returns whether the overdue flag flipped to false
    pub async fn mark_seen_at(&self, address: &str, now_ms: u64) -> bool {
        let mut devices = self.inner.devices.write().await;
        let Some(device) = devices.get_mut(address) else {
            return false;
        };

        device.last_seen_ms = now_ms;
        if device.overdue == Some(false) {
            return false;
        }

        debug!("overdue false {} {}", address, device.name);
        device.overdue = Some(false);
        self.changed(&devices);
        true
    }

    /// Flag devices not heard from within their model's interval.
    ///
    /// Returns whether any device became overdue. Devices whose model has
    /// no interval are never flagged.
    pub async fn check_overdue(&self, now: Option<u64>) -> bool {
        let now = now.unwrap_or_else(now_ms);
        let mut devices = self.inner.devices.write().await;
        let mut changed = false;

        for (address, device) in devices.iter_mut() {
            let Some(threshold) = device
                .model_id
                .as_deref()
                .and_then(|model| self.inner.intervals.threshold(model))
            else {
                continue;
            };

            let elapsed = Duration::from_millis(now.saturating_sub(device.last_seen_ms));
            if elapsed > threshold && device.overdue != Some(true) {
                debug!("overdue true {} {}", address, device.name);
                device.overdue = Some(true);
                changed = true;
            }
        }

        if changed {
            self.changed(&devices);
        }
        changed
    }

    /// Treat every device as just seen, with unknown liveness
    pub async fn reset_liveness(&self, now_ms: u64) {
        let mut devices = self.inner.devices.write().await;
        for device in devices.values_mut() {
            device.last_seen_ms = now_ms;
            device.overdue = None;
        }
        self.changed(&devices);
    }

    pub async fn rename(&self, address: &str, name: &str) -> bool {
        self.rename_many(&BTreeMap::from([(address.to_string(), name.to_string())]))
            .await
            == 1
    }

    /// Apply several renames with a single save; unknown addresses are skipped
    pub async fn rename_many(&self, names: &BTreeMap<String, String>) -> usize {
        let mut devices = self.inner.devices.write().await;
        let mut renamed = 0;

        for (address, name) in names {
            match devices.get_mut(address) {
                Some(device) if device.name != *name => {
                    device.name = name.clone();
                    renamed += 1;
                }
                Some(_) => {}
                None => warn!("rename: unknown device {}", address),
            }
        }

        if renamed > 0 {
            self.changed(&devices);
        }
        renamed
    }

    /// Write the current map to the store; failures are logged
    pub async fn save(&self) {
        let _guard = self.inner.save_lock.lock().await;
        let snapshot = self.inner.devices.read().await.clone();
        if let Err(e) = self.inner.store.save(&snapshot).await {
            warn!("failed to save device names: {}", e);
        }
    }

    /// Save in the background
    pub fn schedule_save(&self) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.save().await;
        });
    }

    fn changed(&self, devices: &DeviceMap) {
        // No subscribers is fine
        let _ = self
            .inner
            .events
            .send(RegistryEvent::DevicesChanged(devices.clone()));
        self.schedule_save();
    }
}

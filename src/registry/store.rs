//! Durable storage for the device map

use crate::error::PersistenceError;
use async_trait::async_trait;
use meshcoord_shared::DeviceMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Backing store of the device registry
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Read the persisted map; a store that was never written yields an empty map
    async fn load(&self) -> Result<DeviceMap, PersistenceError>;

    async fn save(&self, devices: &DeviceMap) -> Result<(), PersistenceError>;
}

/// Pretty-printed JSON object keyed by device address
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeviceStore for JsonFileStore {
    async fn load(&self) -> Result<DeviceMap, PersistenceError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DeviceMap::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    async fn save(&self, devices: &DeviceMap) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(devices)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!("saved {} devices to {}", devices.len(), self.path.display());
        Ok(())
    }
}

/// In-memory store for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: std::sync::Mutex<DeviceMap>,
    saves: std::sync::atomic::AtomicUsize,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_devices(devices: DeviceMap) -> Self {
        Self {
            devices: std::sync::Mutex::new(devices),
            ..Default::default()
        }
    }

    pub fn devices(&self) -> DeviceMap {
        self.devices.lock().expect("store lock").clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl DeviceStore for MemoryStore {
    async fn load(&self) -> Result<DeviceMap, PersistenceError> {
        Ok(self.devices())
    }

    async fn save(&self, devices: &DeviceMap) -> Result<(), PersistenceError> {
        use std::sync::atomic::Ordering;

        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(ErrorKind::PermissionDenied, "read-only").into());
        }
        *self.devices.lock().expect("store lock") = devices.clone();
        Ok(())
    }
}

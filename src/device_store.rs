//! Persistent Device Store
//!
//! Holds the configuration for each device that has been added,
//! so that `serve` can re-create the controllers after a restart
//! without logging in again.
//!
//! ## File Format
//!
//! The store is a pretty-printed JSON file at:
//! - `$PSMART_DEVICE_DB` (if set)
//! - `~/.config/psmart/devices.json` (default)
//!
//! Writes are atomic (write to temp file, then rename) to prevent corruption.

use crate::appliance::{CommandError, DeviceProfile};
use crate::classify::DeviceType;
use crate::cloud_api::DeviceAccess;
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The persistent device store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceStore {
    /// Schema version for future migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Map of device_id -> device configuration
    pub devices: BTreeMap<String, DeviceConfig>,
}

fn default_version() -> u32 {
    1
}

/// Everything needed to control a single device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub user_id: String,
    pub session_id: String,
    pub device_id: String,
    /// The derived control token
    pub token: String,
    pub device_type: DeviceType,
    pub name: String,

    /// Air conditioners only: the entity id of a temperature
    /// sensor that the host may use in place of the reading
    /// reported by the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<String>,

    /// Air conditioners only: selects the mode/fan code table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_model: Option<String>,

    pub added: DateTime<Utc>,
}

impl DeviceConfig {
    pub fn unique_id(&self) -> String {
        format!("panasonic_{}", self.device_id)
    }

    pub fn access(&self) -> DeviceAccess {
        DeviceAccess {
            usr_id: self.user_id.clone(),
            ssid: self.session_id.clone(),
            device_id: self.device_id.clone(),
            token: self.token.clone(),
        }
    }

    pub fn profile(&self) -> Result<DeviceProfile, CommandError> {
        DeviceProfile::new(self.device_type, self.controller_model.as_deref())
    }
}

impl DeviceStore {
    /// Load the store from disk, or create empty if not exists
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
            let store: DeviceStore =
                serde_json::from_str(&contents).with_context(|| format!("parsing {path:?}"))?;
            log::info!(
                "Loaded device store with {} devices from {:?}",
                store.len(),
                path
            );
            Ok(store)
        } else {
            log::info!("No device store found at {:?}, starting fresh", path);
            Ok(DeviceStore::default())
        }
    }

    /// Save the store atomically (write temp file, then rename)
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
        }

        let temp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(self)?;

        {
            let mut file = fs::File::create(&temp_path)
                .with_context(|| format!("creating {temp_path:?}"))?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, path)
            .with_context(|| format!("renaming {temp_path:?} -> {path:?}"))?;

        log::debug!(
            "Saved device store with {} devices to {:?}",
            self.len(),
            path
        );

        Ok(())
    }

    /// Get the default store path based on environment
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("PSMART_DEVICE_DB") {
            return PathBuf::from(path);
        }

        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("psmart")
            .join("devices.json")
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.get(device_id)
    }

    /// Inserts or replaces the configuration for a device,
    /// returning the prior configuration.
    pub fn insert(&mut self, config: DeviceConfig) -> Option<DeviceConfig> {
        self.devices.insert(config.device_id.clone(), config)
    }

    pub fn remove(&mut self, device_id: &str) -> Option<DeviceConfig> {
        self.devices.remove(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

/// Thread-safe handle to the device store
#[derive(Clone)]
pub struct DeviceStoreHandle {
    inner: Arc<RwLock<DeviceStore>>,
    path: PathBuf,
}

impl DeviceStoreHandle {
    /// Create a new handle by loading or creating the store
    pub fn open(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(DeviceStore::default_path);
        let store = DeviceStore::load(&path)?;

        Ok(Self {
            inner: Arc::new(RwLock::new(store)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = self.inner.read();
        store.save(&self.path)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.inner.read().contains(device_id)
    }

    pub fn get_device(&self, device_id: &str) -> Option<DeviceConfig> {
        self.inner.read().get(device_id).cloned()
    }

    pub fn list_devices(&self) -> Vec<DeviceConfig> {
        self.inner.read().devices.values().cloned().collect()
    }

    /// Records the device and persists the store
    pub fn add(&self, config: DeviceConfig) -> anyhow::Result<()> {
        let device_id = config.device_id.clone();
        if self.inner.write().insert(config).is_some() {
            log::info!("Replaced configuration for {device_id}");
        } else {
            log::info!("Added {device_id} to the device store");
        }
        self.save()
    }

    /// Forgets the device and persists the store
    pub fn remove(&self, device_id: &str) -> anyhow::Result<Option<DeviceConfig>> {
        let removed = self.inner.write().remove(device_id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }
}

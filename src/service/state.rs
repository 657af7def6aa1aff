use crate::cloud_api::{Credentials, PsmartCloudApi};
use crate::device_store::{DeviceConfig, DeviceStoreHandle};
use crate::service::controller::DeviceController;
use crate::service::poller::Poller;
use crate::session::SessionCache;
use crate::setup::{AddOptions, SetupFlow};
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

struct ManagedDevice {
    controller: Arc<DeviceController>,
    poller: Option<Poller>,
}

/// The registry of the devices that are being controlled,
/// along with what is needed to add more of them.
pub struct State {
    api: PsmartCloudApi,
    sessions: Arc<SessionCache>,
    store: DeviceStoreHandle,
    credentials: Option<Credentials>,
    poll_interval: Duration,
    devices_by_id: Mutex<HashMap<String, ManagedDevice>>,
}

pub type StateHandle = Arc<State>;

impl State {
    pub fn new(
        api: PsmartCloudApi,
        store: DeviceStoreHandle,
        credentials: Option<Credentials>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            sessions: Arc::new(SessionCache::new()),
            store,
            credentials,
            poll_interval,
            devices_by_id: Mutex::new(HashMap::new()),
        }
    }

    pub fn setup(&self) -> SetupFlow {
        SetupFlow::new(self.api.clone(), self.sessions.clone(), self.store.clone())
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn store(&self) -> &DeviceStoreHandle {
        &self.store
    }

    /// Creates the controller for a device without starting it.
    /// A controller that already exists for the same device is stopped.
    pub async fn create(&self, config: DeviceConfig) -> anyhow::Result<Arc<DeviceController>> {
        let device_id = config.device_id.clone();
        let controller = DeviceController::new(self.api.clone(), config)
            .with_context(|| format!("creating controller for {device_id}"))?;

        let prior = self.devices_by_id.lock().await.insert(
            device_id,
            ManagedDevice {
                controller: controller.clone(),
                poller: None,
            },
        );
        if let Some(prior) = prior {
            log::info!("{}: replacing existing controller", prior.controller);
            Self::teardown(prior).await;
        }

        Ok(controller)
    }

    /// Begins polling the device. Starting a device that is
    /// already being polled has no effect.
    pub async fn start(&self, device_id: &str) -> anyhow::Result<()> {
        let mut devices = self.devices_by_id.lock().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| anyhow::anyhow!("device '{device_id}' not found"))?;
        if !device.poller.as_ref().is_some_and(Poller::is_running) {
            log::info!("{}: polling every {:?}", device.controller, self.poll_interval);
            device.poller = Some(Poller::start(device.controller.clone(), self.poll_interval));
        }
        Ok(())
    }

    /// Cancels polling and releases the controller for the device
    pub async fn stop(&self, device_id: &str) -> anyhow::Result<()> {
        let device = self
            .devices_by_id
            .lock()
            .await
            .remove(device_id)
            .ok_or_else(|| anyhow::anyhow!("device '{device_id}' not found"))?;
        Self::teardown(device).await;
        Ok(())
    }

    async fn teardown(device: ManagedDevice) {
        device.controller.shutdown();
        if let Some(poller) = device.poller {
            poller.stop().await;
        }
        log::debug!("{}: stopped", device.controller);
    }

    /// Stops every device
    pub async fn shutdown(&self) {
        let devices: Vec<_> = self.devices_by_id.lock().await.drain().collect();
        for (_, device) in devices {
            Self::teardown(device).await;
        }
    }

    /// Creates and starts a controller for each device in the store
    pub async fn start_configured_devices(&self) -> anyhow::Result<usize> {
        let configs = self.store.list_devices();
        let count = configs.len();
        for config in configs {
            let device_id = config.device_id.clone();
            self.create(config).await?;
            self.start(&device_id).await?;
        }
        Ok(count)
    }

    pub async fn devices(&self) -> Vec<Arc<DeviceController>> {
        let mut devices: Vec<_> = self
            .devices_by_id
            .lock()
            .await
            .values()
            .map(|d| d.controller.clone())
            .collect();
        devices.sort_by(|a, b| a.config().name.cmp(&b.config().name));
        devices
    }

    /// Resolve a device using its id, unique id or name, ignoring case.
    pub async fn resolve_device(&self, label: &str) -> Option<Arc<DeviceController>> {
        let devices = self.devices_by_id.lock().await;

        if let Some(device) = devices.get(label) {
            return Some(device.controller.clone());
        }

        devices
            .values()
            .map(|d| &d.controller)
            .find(|c| {
                let config = c.config();
                config.device_id.eq_ignore_ascii_case(label)
                    || config.unique_id().eq_ignore_ascii_case(label)
                    || config.name.eq_ignore_ascii_case(label)
            })
            .cloned()
    }

    pub async fn resolve_device_for_control(
        &self,
        label: &str,
    ) -> anyhow::Result<Arc<DeviceController>> {
        self.resolve_device(label)
            .await
            .ok_or_else(|| anyhow::anyhow!("device '{label}' not found"))
    }

    /// Sets up the device, records it in the store and starts it
    pub async fn add_device(
        &self,
        device_id: &str,
        options: AddOptions,
    ) -> anyhow::Result<Arc<DeviceController>> {
        let config = self
            .setup()
            .add(self.credentials(), device_id, options)
            .await?;
        self.store.add(config.clone())?;
        let controller = self.create(config).await?;
        self.start(device_id).await?;
        Ok(controller)
    }

    /// Stops the device and removes it from the store
    pub async fn remove_device(&self, label: &str) -> anyhow::Result<DeviceConfig> {
        let controller = self.resolve_device_for_control(label).await?;
        let device_id = controller.config().device_id.clone();
        self.stop(&device_id).await?;
        Ok(self
            .store
            .remove(&device_id)?
            .unwrap_or_else(|| controller.config().clone()))
    }
}

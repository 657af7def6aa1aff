//! The data path of device setup: find the devices bound to an
//! account, and turn the one the user picked into a DeviceConfig.

use crate::appliance::{CommandError, DeviceProfile};
use crate::classify::{classify, DeviceType};
use crate::cloud_api::{CloudError, Credentials, PsmartCloudApi};
use crate::device_store::{DeviceConfig, DeviceStoreHandle};
use crate::session::{Session, SessionCache};
use crate::token::derive_token;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("cannot connect: {0}")]
    CannotConnect(#[source] CloudError),
    #[error(
        "account credentials are needed; set $PSMART_USERNAME and $PSMART_PASSWORD \
         or pass --psmart-username and --psmart-password"
    )]
    MissingCredentials,
    #[error("no devices are bound to this account")]
    NoDevicesFound,
    #[error("device {0} is not bound to this account")]
    UnknownDevice(String),
    #[error("device {0} is already configured")]
    AlreadyConfigured(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// A device bound to the account, as presented for selection
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub configured: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    /// Use this type rather than the classified type
    pub device_type: Option<DeviceType>,
    pub controller_model: Option<String>,
    pub sensor: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct SetupFlow {
    api: PsmartCloudApi,
    sessions: Arc<SessionCache>,
    store: DeviceStoreHandle,
}

impl SetupFlow {
    pub fn new(api: PsmartCloudApi, sessions: Arc<SessionCache>, store: DeviceStoreHandle) -> Self {
        Self {
            api,
            sessions,
            store,
        }
    }

    /// Returns a valid session, preferring the cached session over
    /// a fresh login
    pub async fn session(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<Session>, SetupError> {
        if let Some(session) = self.sessions.revalidate(&self.api).await {
            return Ok(session);
        }
        let credentials = credentials.ok_or(SetupError::MissingCredentials)?;
        log::info!("Logging in as {}", credentials.username);
        self.sessions
            .login(&self.api, credentials)
            .await
            .map_err(|err| {
                if err.is_auth() {
                    log::error!("Login as {} was rejected", credentials.username);
                }
                SetupError::CannotConnect(err)
            })
    }

    /// Lists the devices bound to the account along with their
    /// classification.
    pub async fn discover(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<DiscoveredDevice>, SetupError> {
        let session = self.session(credentials).await?;
        if session.devices.is_empty() {
            return Err(SetupError::NoDevicesFound);
        }

        Ok(session
            .devices
            .values()
            .map(|info| DiscoveredDevice {
                device_id: info.device_id.clone(),
                name: info.device_name.clone(),
                device_type: classify(&info.device_id, info),
                configured: self.store.contains(&info.device_id),
            })
            .collect())
    }

    /// Produces the configuration for `device_id`.
    /// The configuration is not persisted.
    pub async fn add(
        &self,
        credentials: Option<&Credentials>,
        device_id: &str,
        options: AddOptions,
    ) -> Result<DeviceConfig, SetupError> {
        if self.store.contains(device_id) {
            return Err(SetupError::AlreadyConfigured(device_id.to_string()));
        }

        let session = self.session(credentials).await?;
        if session.devices.is_empty() {
            return Err(SetupError::NoDevicesFound);
        }
        let info = session
            .devices
            .get(device_id)
            .ok_or_else(|| SetupError::UnknownDevice(device_id.to_string()))?;

        let detected = classify(device_id, info);
        let device_type = options.device_type.unwrap_or(detected);
        if device_type != detected {
            log::info!("{device_id}: using {device_type} rather than detected {detected}");
        }

        let (controller_model, sensor) = match device_type {
            DeviceType::AirConditioner => {
                let profile = DeviceProfile::new(device_type, options.controller_model.as_deref())?;
                let model = match profile {
                    DeviceProfile::AirConditioner(model) => Some(model.id.to_string()),
                    DeviceProfile::Humidifier => None,
                };
                (model, options.sensor)
            }
            DeviceType::Humidifier => (None, None),
        };

        Ok(DeviceConfig {
            user_id: session.user_id.clone(),
            session_id: session.session_id.clone(),
            device_id: device_id.to_string(),
            token: derive_token(device_id).into_string(),
            device_type,
            name: options.name.unwrap_or_else(|| info.device_name.clone()),
            sensor,
            controller_model,
            added: Utc::now(),
        })
    }
}

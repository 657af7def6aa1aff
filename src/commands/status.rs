use crate::device_store::{DeviceConfig, DeviceStoreHandle};
use crate::service::controller::DeviceController;
use std::sync::Arc;

#[derive(clap::Parser, Debug)]
pub struct StatusCommand {
    /// The id, unique id or name of a configured device
    device: String,
}

/// Finds a configured device by id, unique id or name, ignoring case
pub fn resolve_config(store: &DeviceStoreHandle, label: &str) -> anyhow::Result<DeviceConfig> {
    if let Some(config) = store.get_device(label) {
        return Ok(config);
    }
    store
        .list_devices()
        .into_iter()
        .find(|c| {
            c.device_id.eq_ignore_ascii_case(label)
                || c.unique_id().eq_ignore_ascii_case(label)
                || c.name.eq_ignore_ascii_case(label)
        })
        .ok_or_else(|| anyhow::anyhow!("device '{label}' is not configured"))
}

/// Creates a controller for a configured device
pub fn controller_for(args: &crate::Args, label: &str) -> anyhow::Result<Arc<DeviceController>> {
    let config = resolve_config(&args.device_store()?, label)?;
    Ok(DeviceController::new(args.cloud_args.api_client()?, config)?)
}

impl StatusCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let controller = controller_for(args, &self.device)?;

        let state = controller.refresh().await.ok_or_else(|| {
            if controller.session_expired() {
                anyhow::anyhow!("The session has expired; remove and add {controller} again")
            } else {
                anyhow::anyhow!("Unable to read the status of {controller}")
            }
        })?;

        if let Some(endpoints) = controller.endpoints() {
            eprintln!("get={} set={}", endpoints.get_url, endpoints.set_url);
        }
        println!("{}", serde_json::to_string_pretty(&state)?);
        Ok(())
    }
}

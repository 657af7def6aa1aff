use crate::classify::DeviceType;
use crate::session::SessionCache;
use crate::setup::{AddOptions, SetupFlow};
use std::sync::Arc;

#[derive(clap::Parser, Debug)]
pub struct AddCommand {
    /// The device id, as shown by the list subcommand
    device_id: String,

    /// Override the detected device type (ac or humidifier)
    #[arg(long = "type")]
    device_type: Option<DeviceType>,

    /// The wired controller model of an air conditioner
    #[arg(long)]
    controller_model: Option<String>,

    /// A temperature sensor entity to associate with an air conditioner
    #[arg(long)]
    sensor: Option<String>,

    /// Override the name reported by the account
    #[arg(long)]
    name: Option<String>,
}

impl AddCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let credentials = args.cloud_args.credentials()?;
        let store = args.device_store()?;
        let flow = SetupFlow::new(
            args.cloud_args.api_client()?,
            Arc::new(SessionCache::new()),
            store.clone(),
        );

        let config = flow
            .add(
                Some(&credentials),
                &self.device_id,
                AddOptions {
                    device_type: self.device_type,
                    controller_model: self.controller_model.clone(),
                    sensor: self.sensor.clone(),
                    name: self.name.clone(),
                },
            )
            .await?;

        let unique_id = config.unique_id();
        let kind = config.device_type.label();
        let name = config.name.clone();
        store.add(config)?;

        println!("Added {kind} {name} as {unique_id} to {:?}", store.path());
        Ok(())
    }
}

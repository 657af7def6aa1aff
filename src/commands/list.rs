use crate::appliance::aircon::controller_models;
use crate::classify::DeviceType;
use crate::session::SessionCache;
use crate::setup::SetupFlow;
use std::sync::Arc;

#[derive(clap::Parser, Debug)]
pub struct ListCommand {
    /// Print the list as JSON
    #[arg(long)]
    json: bool,
}

impl ListCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let credentials = args.cloud_args.credentials()?;
        let flow = SetupFlow::new(
            args.cloud_args.api_client()?,
            Arc::new(SessionCache::new()),
            args.device_store()?,
        );

        let devices = flow.discover(Some(&credentials)).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&devices)?);
            return Ok(());
        }

        for d in &devices {
            println!(
                "{kind:<15} {id} {name}{configured}",
                kind = d.device_type.label(),
                id = d.device_id,
                name = d.name,
                configured = if d.configured { " (configured)" } else { "" },
            );
        }

        if devices
            .iter()
            .any(|d| d.device_type == DeviceType::AirConditioner)
        {
            println!();
            println!("Air conditioner controller models (for add --controller-model):");
            for model in controller_models() {
                println!("  {:<15} {}", model.id, model.name);
            }
        }

        Ok(())
    }
}

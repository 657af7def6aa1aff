use crate::service::http::run_http_server;
use crate::service::poller::DEFAULT_POLL_INTERVAL;
use crate::service::state::State;
use crate::version_info::psmart_version;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(clap::Parser, Debug)]
pub struct ServeCommand {
    /// The port on which the HTTP API will listen
    #[arg(long, default_value_t = 8056)]
    http_port: u16,

    /// How often to poll each device, in seconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    poll_interval: u64,
}

impl ServeCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        log::info!("Starting service. version {}", psmart_version());

        let credentials = args.cloud_args.opt_credentials()?;
        if credentials.is_none() {
            log::warn!(
                "No account credentials are configured; \
                 devices can't be added via the HTTP API"
            );
        }

        let state = Arc::new(State::new(
            args.cloud_args.api_client()?,
            args.device_store()?,
            credentials,
            Duration::from_secs(self.poll_interval.max(1)),
        ));
        log::info!("Using device store {:?}", state.store().path());

        let count = state.start_configured_devices().await?;
        log::info!("Controlling {count} configured devices");
        for device in state.devices().await {
            let config = device.config();
            log::info!("{device}");
            log::info!(
                "  type={} unique_id={}",
                config.device_type.label(),
                config.unique_id()
            );
            if let Some(model) = &config.controller_model {
                log::info!("  controller_model={model}");
            }
            if let Some(sensor) = &config.sensor {
                log::info!("  sensor={sensor}");
            }
        }

        let result = run_http_server(state.clone(), self.http_port).await;
        state.shutdown().await;
        result
    }
}

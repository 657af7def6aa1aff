use crate::device_store::DeviceStoreHandle;
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

mod appliance;
mod classify;
mod cloud_api;
mod device_store;
mod endpoints;
mod session;
mod setup;
mod token;
mod version_info;

mod commands {
    pub mod add;
    pub mod control;
    pub mod list;
    pub mod remove;
    pub mod serve;
    pub mod status;
    pub mod token;
}

mod service {
    pub mod controller;
    pub mod http;
    pub mod poller;
    pub mod state;
}

#[derive(clap::Parser, Debug)]
#[command(version = version_info::psmart_version(), propagate_version = true)]
pub struct Args {
    #[command(flatten)]
    cloud_args: cloud_api::CloudArguments,

    /// Where to keep the configuration of added devices.
    /// Defaults to $PSMART_DEVICE_DB, or devices.json in
    /// the psmart directory under your config directory.
    #[arg(long, global = true)]
    device_db: Option<PathBuf>,

    #[command(subcommand)]
    cmd: SubCommand,
}

impl Args {
    pub fn device_store(&self) -> anyhow::Result<DeviceStoreHandle> {
        DeviceStoreHandle::open(self.device_db.clone())
    }
}

#[derive(clap::Parser, Debug)]
enum SubCommand {
    List(commands::list::ListCommand),
    Add(commands::add::AddCommand),
    Remove(commands::remove::RemoveCommand),
    Token(commands::token::TokenCommand),
    Status(commands::status::StatusCommand),
    Control(commands::control::ControlCommand),
    Serve(commands::serve::ServeCommand),
}

pub fn opt_env_var<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(p) => {
            Ok(Some(p.parse().map_err(|err| {
                anyhow::anyhow!("parsing ${name}: {err:#}")
            })?))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => anyhow::bail!("${name} is invalid: {err:#}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    color_backtrace::install();
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loading environment overrides from {path:?}");
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("psmart=info"))
        .init();

    let args = Args::parse();

    match &args.cmd {
        SubCommand::List(cmd) => cmd.run(&args).await,
        SubCommand::Add(cmd) => cmd.run(&args).await,
        SubCommand::Remove(cmd) => cmd.run(&args).await,
        SubCommand::Token(cmd) => cmd.run(&args).await,
        SubCommand::Status(cmd) => cmd.run(&args).await,
        SubCommand::Control(cmd) => cmd.run(&args).await,
        SubCommand::Serve(cmd) => cmd.run(&args).await,
    }
}

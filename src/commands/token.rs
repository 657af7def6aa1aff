use crate::token::{derive_token, split_identifier};

/// Derive the control token for a device id, without
/// contacting the service
#[derive(clap::Parser, Debug)]
pub struct TokenCommand {
    device_id: String,
}

impl TokenCommand {
    pub async fn run(&self, _args: &crate::Args) -> anyhow::Result<()> {
        match split_identifier(&self.device_id) {
            Some((separator, prefix, suffix)) => {
                eprintln!("separator={separator} prefix={prefix} suffix={suffix}");
            }
            None => {
                eprintln!("No known separator in {}; using a fallback hash", self.device_id);
            }
        }
        println!("{}", derive_token(&self.device_id).as_str());
        Ok(())
    }
}

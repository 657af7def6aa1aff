#[derive(clap::Parser, Debug)]
pub struct RemoveCommand {
    device_id: String,
}

impl RemoveCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let store = args.device_store()?;
        match store.remove(&self.device_id)? {
            Some(config) => println!("Removed {} ({})", config.name, config.device_id),
            None => anyhow::bail!("{} is not configured", self.device_id),
        }
        Ok(())
    }
}

use crate::commands::status::controller_for;

#[derive(clap::Parser, Debug)]
pub struct ControlCommand {
    /// The id, unique id or name of a configured device
    device: String,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(clap::Parser, Debug, PartialEq)]
enum SubCommand {
    On,
    Off,
    /// Humidifiers: auto, continuous, sleep, interval.
    /// Air conditioners: off, auto, cool, heat, dry.
    Mode {
        mode: String,
    },
    Humidity {
        percent: u8,
    },
    Temperature {
        celsius: f64,
    },
    /// auto, min, low, medium, high, max, quiet
    Fan {
        mode: String,
    },
}

impl ControlCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let controller = controller_for(args, &self.device)?;

        let state = match &self.cmd {
            SubCommand::On | SubCommand::Off => {
                controller.set_power(self.cmd == SubCommand::On).await
            }
            SubCommand::Mode { mode } => controller.set_mode(mode).await?,
            SubCommand::Humidity { percent } => controller.set_humidity(*percent).await?,
            SubCommand::Temperature { celsius } => controller.set_temperature(*celsius).await?,
            SubCommand::Fan { mode } => controller.set_fan_mode(mode).await?,
        };

        if controller.session_expired() {
            log::warn!("The session has expired; remove and add {controller} again");
        }
        println!("{}", serde_json::to_string_pretty(&state)?);
        Ok(())
    }
}

mod arg_parser;
mod logger;

use anyhow::{Context, Result, bail};
use zbus::{Connection, proxy};

use crate::arg_parser::ArgsOptions;

// The daemon's switch interface
#[proxy(
    interface = "com.github.Dgpud.Switch",
    default_service = "com.github.Dgpud",
    default_path = "/com/github/Dgpud/Switch"
)]
trait Switch {
    fn status(&self) -> zbus::Result<String>;
    fn set_state(&self, state: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn state(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    let connection = Connection::system()
        .await
        .with_context(|| "Failed to connect to the system bus")?;
    let switch = SwitchProxy::new(&connection)
        .await
        .with_context(|| "Failed to reach the dgpud service")?;

    match args_options.command.as_str() {
        "status" => println!("{}", switch.status().await?),
        "on" => switch
            .set_state("ON")
            .await
            .with_context(|| "Failed to enable the discrete card")?,
        "off" => switch
            .set_state("OFF")
            .await
            .with_context(|| "Failed to disable the discrete card")?,
        other => bail!("Unknown command \"{other}\", expected status, on or off"),
    }

    Ok(())
}

use std::sync::Arc;

use anyhow::Result;
use dgpud::{
    arg_parser::ArgsOptions, config::Config, dbus_service::DBusService,
    errors::DgpudError, logger, platform::sysfs::SysfsPlatform,
    pm_watcher::PmWatcher, switcher::GpuSwitch,
};
use tokio::{
    select,
    signal::{
        ctrl_c,
        unix::{SignalKind, signal},
    },
    sync::mpsc,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    info!("dgpud version {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args_options.config_file_path)?;

    // Find the discrete card and resolve its control protocol; the
    // daemon cannot do anything useful without them
    let platform = Arc::new(SysfsPlatform::new());
    let switch = match GpuSwitch::initialize(platform, &config).await {
        Ok(switch) => Arc::new(switch),
        Err(err) => {
            let err = DgpudError::from(err);

            error!("Initialization failed: {err}");
            return Err(err.into());
        }
    };

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Use a thin channel to move errors out of the running tasks
    let (tx_err, mut rx_err) = mpsc::channel(16);

    // Start the D-Bus control surface
    {
        let token = token.clone();
        let tx_err = tx_err.clone();
        let switch = switch.clone();

        tracker.spawn(async move {
            let mut dbus_service = DBusService::new(switch);
            dbus_service.run(token, tx_err).await;
        });
    }

    // Start the suspend/resume watcher
    {
        let token = token.clone();
        let tx_err = tx_err.clone();
        let switch = switch.clone();

        tracker.spawn(async move {
            let mut pm_watcher = PmWatcher::new(switch);
            pm_watcher.run(token, tx_err).await;
        });
    }

    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        select! {
            _ = ctrl_c() => { break; },
            _ = sigterm.recv() => { break; },
            err_msg = rx_err.recv() => {
                // Log the full error chain for each reported error
                if let Some(err) = err_msg {
                    let err = anyhow::Error::from(err);

                    for e in err.chain() {
                        error!("{e}");
                    }
                }
            }
        }
    }

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    // Leave the card in the configured unload state
    switch.apply_unload_state(&config).await;

    Ok(())
}

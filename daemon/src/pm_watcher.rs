use std::sync::Arc;

use futures_util::stream::StreamExt;
use thiserror::Error;
use tokio::{select, sync::mpsc::Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use zbus::{Connection, proxy};

use crate::{
    errors::DgpudError,
    platform::sysfs::SysfsPlatform,
    switcher::{GpuSwitch, PmEvent},
};

#[derive(Debug, Error)]
pub enum PmWatcherError {
    #[error("PM watcher D-Bus connection error: {reason}")]
    DBusConnection {
        reason: String,
        #[source]
        error: zbus::Error,
    },
}

// logind system sleep notifications
#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait LoginManager {
    #[zbus(signal)]
    fn prepare_for_sleep(&self, start: bool) -> zbus::Result<()>;
}

// Subscribes to the system sleep notifications and drives the
// suspend/resume policy of the switch
pub struct PmWatcher {
    switch: Arc<GpuSwitch<SysfsPlatform>>,
}

impl PmWatcher {
    pub fn new(switch: Arc<GpuSwitch<SysfsPlatform>>) -> Self {
        Self { switch }
    }

    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        tx_err: Sender<DgpudError>,
    ) {
        let mut stream = match self.sleep_signal_stream().await {
            Ok(stream) => stream,
            Err(err) => {
                if let Err(cerr) = tx_err.send(err.into()).await {
                    error!("Failed to send error over channel: {cerr}");
                }

                // Just return, there is nothing else to do
                return;
            }
        };

        debug!("Subscribed to logind sleep notifications");

        loop {
            select! {
                _ = run_token.cancelled() => {
                    info!("PM watcher: Quiting");

                    break;
                },
                signal = stream.next() => {
                    let Some(signal) = signal else {
                        error!("logind signal stream closed");
                        break;
                    };

                    match signal.args() {
                        Ok(args) => self.dispatch(*args.start()).await,
                        Err(err) => {
                            error!("Malformed PrepareForSleep signal: {err}");
                        }
                    }
                }
            }
        }
    }

    // logind does not distinguish suspend from hibernate, so the two
    // signal directions map onto the generic suspend pair of events
    async fn dispatch(&self, entering_sleep: bool) {
        let event = if entering_sleep {
            PmEvent::SuspendPrepare
        } else {
            PmEvent::PostSuspend
        };

        self.switch.handle_pm_event(event).await;
    }

    async fn sleep_signal_stream(
        &self,
    ) -> Result<PrepareForSleepStream, PmWatcherError> {
        let connection = Connection::system().await.map_err(|error| {
            PmWatcherError::DBusConnection {
                reason: "Failed to establish connection with the system bus"
                    .to_string(),
                error,
            }
        })?;

        let proxy = LoginManagerProxy::new(&connection).await.map_err(
            |error| PmWatcherError::DBusConnection {
                reason: "Failed to create the logind manager proxy"
                    .to_string(),
                error,
            },
        )?;

        proxy.receive_prepare_for_sleep().await.map_err(|error| {
            PmWatcherError::DBusConnection {
                reason: "Failed to subscribe to PrepareForSleep".to_string(),
                error,
            }
        })
    }
}

use std::sync::Arc;

use thiserror::Error;
use tokio::{select, sync::mpsc::Sender};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};
use zbus::{Connection, fdo, interface};

use crate::{
    config::CardState, errors::DgpudError, platform::sysfs::SysfsPlatform,
    switcher::{GpuSwitch, PowerState},
};

const SERVICE_NAME: &str = "com.github.Dgpud";
const SWITCH_PATH: &str = "/com/github/Dgpud/Switch";

#[derive(Debug, Error)]
pub enum DBusServiceError {
    #[error("D-Bus service connection error: {reason}")]
    DBusConnection {
        reason: String,
        #[source]
        error: zbus::Error,
    },
    #[error("D-Bus service object error: {reason}")]
    DBusObject {
        reason: String,
        #[source]
        error: zbus::Error,
    },
}

type Result<T> = std::result::Result<T, DBusServiceError>;

// Operator control surface: the D-Bus equivalent of the classic
// "echo OFF > /proc/acpi/bbswitch" interface
pub struct DBusService {
    switch: Arc<GpuSwitch<SysfsPlatform>>,
}

// Switch D-Bus interface
struct SwitchInterface {
    switch: Arc<GpuSwitch<SysfsPlatform>>,
}

#[interface(name = "com.github.Dgpud.Switch")]
impl SwitchInterface {
    // PCI address of the discrete card
    #[zbus(property)]
    async fn name(&self) -> String {
        self.switch.name().to_string()
    }

    #[zbus(property)]
    async fn state(&self) -> String {
        match self.switch.state().await {
            PowerState::Off => "OFF".to_string(),
            // A transitioning card has power
            PowerState::On | PowerState::Transitioning => "ON".to_string(),
        }
    }

    // Full status line, "<address> <ON|OFF>"
    async fn status(&self) -> String {
        self.switch.status().await
    }

    async fn set_state(&self, state: &str) -> fdo::Result<()> {
        let requested = match state {
            "ON" => CardState::On,
            "OFF" => CardState::Off,
            other => {
                return Err(fdo::Error::InvalidArgs(format!(
                    "unknown card state \"{other}\", expected ON or OFF"
                )));
            }
        };

        self.switch
            .set_state(requested)
            .await
            .map_err(|err| fdo::Error::Failed(err.to_string()))
    }
}

impl DBusService {
    pub fn new(switch: Arc<GpuSwitch<SysfsPlatform>>) -> Self {
        Self { switch }
    }

    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        tx_err: Sender<DgpudError>,
    ) {
        // Connect to the system D-Bus
        let connection = match Connection::system().await {
            Ok(conn) => conn,
            Err(error) => {
                let err = DBusServiceError::DBusConnection {
                    reason: "Failed to establish connection with the bus"
                        .to_string(),
                    error,
                };

                if let Err(cerr) = tx_err.send(err.into()).await {
                    error!("Failed to send error over channel: {cerr}");
                }

                // Just return, there is nothing else to do
                return;
            }
        };

        trace!("DBus connection enstablished");

        if let Err(err) = self.initialize_service(&connection).await {
            if let Err(cerr) = tx_err.send(err.into()).await {
                error!("Failed to send error over channel: {cerr}");
            }
        }

        loop {
            select! {
                _ = run_token.cancelled() => {
                    info!("DBus service: Quiting");
                    break;
                }
            }
        }
    }

    async fn initialize_service(&mut self, connection: &Connection) -> Result<()> {
        trace!("Creating D-Bus object for switch: {}", self.switch.name());

        let interface = SwitchInterface {
            switch: self.switch.clone(),
        };

        connection
            .object_server()
            .at(SWITCH_PATH, interface)
            .await
            .map_err(|error| DBusServiceError::DBusObject {
                reason: "Error while initializing the switch object"
                    .to_string(),
                error,
            })?;

        // Request the service name
        // NOTE:    The name request must happen AFTER setting up the
        //          server object or messages might be lost
        connection.request_name(SERVICE_NAME).await.map_err(|error| {
            DBusServiceError::DBusConnection {
                reason: "Failed to acquire service name".to_string(),
                error,
            }
        })?;

        Ok(())
    }
}

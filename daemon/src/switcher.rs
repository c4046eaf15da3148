use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    config::{CardState, Config},
    discovery::{self, DiscreteGpu, Discovery, DsmType, InitError,
        ProtocolDescriptor},
    dsm::{self, OPTIMUS_DSM_FUNC, OPTIMUS_ENABLE_ARGS},
    platform::{AcpiValue, FirmwareError, FirmwareHandle, PciDeviceInfo,
        Platform},
};

// Bounded re-enumeration policy after a power-on. Firmware powers the
// card up asynchronously relative to bus enumeration, so the card is
// polled back into visibility instead of assumed present
pub const REDISCOVER_ATTEMPTS: u32 = 5;
pub const REDISCOVER_INTERVAL: Duration = Duration::from_millis(500);

// Power-resource objects governing the discrete card
const STATUS_NODE: &str = "\\_SB.PCI0.GPP0.PEGP";
const STATUS_METHOD: &str = "SGST";
const POWER_RESOURCE_NODE: &str = "\\_SB.PCI0.GPP0.PG00";

// Per-operation failures. None of these take the subsystem down; the
// next status query is authoritative again
#[derive(Debug, Error)]
pub enum OpError {
    #[error("device is in use by driver '{driver}', refusing OFF")]
    DeviceBusy { driver: String },
    #[error(transparent)]
    FirmwareCallFailed(#[from] FirmwareError),
    #[error("device did not reappear on the bus after power-on")]
    DeviceNotReappeared,
}

// Derived per operation from the firmware status query combined with
// bus enumerability; never cached, both can change behind our back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    // Firmware reports power but the card is not enumerable yet.
    // The bus object must not be touched in this window
    Transitioning,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Transitioning => "transitioning",
        };

        write!(f, "{label}")
    }
}

// System sleep notifications driving the suspend/resume policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmEvent {
    SuspendPrepare,
    HibernatePrepare,
    RestorePrepare,
    PostSuspend,
    PostHibernation,
    PostRestore,
}

// Scoped hold on the parent bridge's runtime-power state, released on
// every exit path when the guard drops
struct BridgeGuard<P: Platform> {
    platform: Arc<P>,
    address: String,
}

impl<P: Platform> Drop for BridgeGuard<P> {
    fn drop(&mut self) {
        self.platform.bridge_power_put(&self.address);
    }
}

// Discovery state shared by the control surface and the PM watcher.
// All of it lives behind the one subsystem mutex: both callers
// read-modify the same device handle
struct SwitchInner {
    gpu: DiscreteGpu,
    protocol: ProtocolDescriptor,

    // Live bus object, present only while the card is enumerable.
    // Re-resolved through rescan() before every use; the underlying
    // object belongs to the bus and can vanish outside our control
    live: Option<PciDeviceInfo>,

    // Whether the card was off right before the last suspend request;
    // valid for one sleep cycle
    off_before_suspend: bool,
}

// The discrete GPU power-switch subsystem. Built once at startup and
// shared behind an Arc by every caller
pub struct GpuSwitch<P: Platform> {
    platform: Arc<P>,
    name: String,
    status_handle: FirmwareHandle,
    power_handle: FirmwareHandle,
    inner: Mutex<SwitchInner>,
}

impl<P: Platform> GpuSwitch<P> {
    // Discover the discrete card and its control protocol, notify the
    // firmware when the protocol is the Optimus variant and apply the
    // configured initial card state
    pub async fn initialize(
        platform: Arc<P>,
        config: &Config,
    ) -> Result<Self, InitError> {
        let Discovery { gpu, protocol } =
            discovery::discover(platform.as_ref(), config.skip_optimus_dsm)?;

        let switch = Self {
            name: gpu.address.clone(),
            status_handle: FirmwareHandle(STATUS_NODE.to_string()),
            power_handle: FirmwareHandle(POWER_RESOURCE_NODE.to_string()),
            inner: Mutex::new(SwitchInner {
                gpu,
                protocol,
                live: None,
                off_before_suspend: false,
            }),
            platform,
        };

        {
            let mut inner = switch.inner.lock().await;

            switch.optimus_enable(&inner);

            let _bridge = switch.acquire_bus(&mut inner).await;

            match config.load_state {
                CardState::On => {
                    if let Err(err) = switch.turn_on(&mut inner).await {
                        warn!("Failed to apply initial card state: {err}");
                    }
                }
                CardState::Off => {
                    if let Err(err) = switch.turn_off(&mut inner) {
                        warn!("Failed to apply initial card state: {err}");
                    }
                }
                CardState::Unchanged => {}
            }

            let state = switch.query_state(&mut inner);
            info!(
                "Successfully initialized. Discrete card {} is {state}",
                switch.name
            );
        }

        Ok(switch)
    }

    // PCI address of the discrete card, for display purposes
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> PowerState {
        let mut inner = self.inner.lock().await;

        self.query_state(&mut inner)
    }

    // Status line in the classic "<address> <ON|OFF>" format
    pub async fn status(&self) -> String {
        let mut inner = self.inner.lock().await;
        let _bridge = self.acquire_bus(&mut inner).await;
        let state = self.query_state(&mut inner);

        format!("{} {}", self.name, status_label(state))
    }

    pub async fn set_state(
        &self,
        requested: CardState,
    ) -> Result<(), OpError> {
        let mut inner = self.inner.lock().await;
        let _bridge = self.acquire_bus(&mut inner).await;

        match requested {
            CardState::On => self.turn_on(&mut inner).await,
            CardState::Off => self.turn_off(&mut inner),
            CardState::Unchanged => Ok(()),
        }
    }

    // Two-phase suspend/resume policy: remember whether the card was
    // off when sleep was requested, force it on across the sleep so
    // the platform saves a powered-up configuration space snapshot,
    // and restore the remembered state after wake
    pub async fn handle_pm_event(&self, event: PmEvent) {
        let mut inner = self.inner.lock().await;

        match event {
            PmEvent::SuspendPrepare | PmEvent::HibernatePrepare => {
                debug!("Detected suspend");

                let _bridge = self.acquire_bus(&mut inner).await;
                let was_off =
                    self.query_state(&mut inner) == PowerState::Off;
                inner.off_before_suspend = was_off;

                if was_off {
                    info!("Enabling GPU for suspend");

                    if let Err(err) = self.turn_on(&mut inner).await {
                        warn!("Failed to enable GPU before suspend: {err}");
                    }
                }
            }
            PmEvent::PostSuspend
            | PmEvent::PostHibernation
            | PmEvent::PostRestore => {
                debug!("Detected resume");

                // The card wakes up powered; put it back off if that
                // is how the sleep cycle started
                if inner.off_before_suspend {
                    info!("Restoring GPU to off");

                    let _bridge = self.acquire_bus(&mut inner).await;

                    if let Err(err) = self.turn_off(&mut inner) {
                        warn!(
                            "Failed to restore GPU state after resume: {err}"
                        );
                    }

                    inner.off_before_suspend = false;
                }
            }
            PmEvent::RestorePrepare => {
                // Fires before restoring a hibernation image, never
                // before suspend. A post-hibernation or post-restore
                // event always follows and does the real work
            }
        }
    }

    // Apply the configured final card state during shutdown
    pub async fn apply_unload_state(&self, config: &Config) {
        let mut inner = self.inner.lock().await;
        let _bridge = self.acquire_bus(&mut inner).await;

        match config.unload_state {
            CardState::On => {
                if let Err(err) = self.turn_on(&mut inner).await {
                    warn!("Failed to apply unload card state: {err}");
                }
            }
            CardState::Off => {
                if let Err(err) = self.turn_off(&mut inner) {
                    warn!("Failed to apply unload card state: {err}");
                }
            }
            CardState::Unchanged => {}
        }

        let state = self.query_state(&mut inner);
        info!("Shutting down. Discrete card {} is {state}", self.name);
    }

    // One-time best-effort notification defined by the Optimus
    // protocol; failures are logged and ignored
    fn optimus_enable(&self, inner: &SwitchInner) {
        if inner.protocol.dsm_type != DsmType::Optimus {
            return;
        }

        let result = dsm::call_dsm(
            self.platform.as_ref(),
            &inner.protocol.handle,
            &inner.protocol.muid,
            inner.protocol.revid,
            OPTIMUS_DSM_FUNC,
            Some(OPTIMUS_ENABLE_ARGS),
        );

        match result {
            Ok(value) => debug!("Result of Optimus _DSM call: {value:08X}"),
            Err(err) => warn!("Optimus enable notification failed: {err}"),
        }
    }

    // Tri-state power query: the firmware status call decides whether
    // the card has power, bus enumeration decides whether it is
    // reachable. A failed or unusable status result degrades to the
    // enumeration answer
    fn query_state(&self, inner: &mut SwitchInner) -> PowerState {
        let status = self.platform.evaluate(
            &self.status_handle,
            STATUS_METHOD,
            &[],
        );

        let powered = match status {
            Ok(AcpiValue::Integer(value)) => value > 0,
            Ok(_) => {
                warn!("Power status query yielded an unsupported result type");
                discovery::rescan(self.platform.as_ref(), &inner.gpu)
                    .is_some()
            }
            Err(err) => {
                warn!("Power status query failed: {err}");
                discovery::rescan(self.platform.as_ref(), &inner.gpu)
                    .is_some()
            }
        };

        if !powered {
            inner.live = None;
            return PowerState::Off;
        }

        match discovery::rescan(self.platform.as_ref(), &inner.gpu) {
            Some(dev) => {
                inner.live = Some(dev);
                PowerState::On
            }
            None => {
                inner.live = None;
                PowerState::Transitioning
            }
        }
    }

    fn turn_off(&self, inner: &mut SwitchInner) -> Result<(), OpError> {
        if self.query_state(inner) == PowerState::Off {
            info!("Discrete graphics already disabled");
            return Ok(());
        }

        // Never power down a card a driver is actively using
        if let Some(dev) =
            discovery::rescan(self.platform.as_ref(), &inner.gpu)
        {
            if let Some(driver) = self.platform.bound_driver(&dev.address) {
                warn!(
                    "Device {} is in use by driver '{driver}', refusing OFF",
                    dev.address
                );
                return Err(OpError::DeviceBusy { driver });
            }

            inner.live = Some(dev);
        }

        info!("Disabling discrete graphics");

        let result =
            self.platform.evaluate(&self.power_handle, "_OFF", &[]);

        // The card may disappear from enumeration entirely from here
        // on, whether or not the firmware reported success
        inner.live = None;

        if let Err(err) = result {
            warn!("The discrete card could not be disabled by an _OFF call");
            return Err(err.into());
        }

        Ok(())
    }

    async fn turn_on(&self, inner: &mut SwitchInner) -> Result<(), OpError> {
        if self.query_state(inner) == PowerState::On {
            return Ok(());
        }

        info!("Enabling discrete graphics");

        if let Err(err) =
            self.platform.evaluate(&self.power_handle, "_ON", &[])
        {
            warn!("The discrete card could not be enabled by an _ON call: {err}");
        }

        for attempt in 1..=REDISCOVER_ATTEMPTS {
            sleep(REDISCOVER_INTERVAL).await;

            if let Some(dev) =
                discovery::rescan(self.platform.as_ref(), &inner.gpu)
            {
                inner.live = Some(dev);
                return Ok(());
            }

            debug!(
                "Card not yet visible on the bus \
                 (attempt {attempt}/{REDISCOVER_ATTEMPTS})"
            );
        }

        // Not fatal: a later operation retries discovery
        warn!("Card did not reappear within {REDISCOVER_ATTEMPTS} rescans");
        Err(OpError::DeviceNotReappeared)
    }

    // Make the card reachable for configuration-space access: wait for
    // it to become enumerable when firmware reports power, then hold
    // the parent bridge awake for the lifetime of the returned guard
    async fn acquire_bus(
        &self,
        inner: &mut SwitchInner,
    ) -> Option<BridgeGuard<P>> {
        if self.query_state(inner) == PowerState::Off {
            return None;
        }

        for _ in 0..REDISCOVER_ATTEMPTS {
            if inner.live.is_some() {
                break;
            }

            sleep(REDISCOVER_INTERVAL).await;
            inner.live = discovery::rescan(self.platform.as_ref(), &inner.gpu);
        }

        let dev = inner.live.as_ref()?;

        self.platform.bridge_power_get(&dev.address);

        Some(BridgeGuard {
            platform: self.platform.clone(),
            address: dev.address.clone(),
        })
    }
}

fn status_label(state: PowerState) -> &'static str {
    match state {
        PowerState::Off => "OFF",
        // A transitioning card has power, report it as ON
        PowerState::On | PowerState::Transitioning => "ON",
    }
}

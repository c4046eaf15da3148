use thiserror::Error;
use tracing::{info, warn};

use crate::{
    dsm::{
        self, NVIDIA_DSM_FUNC, NVIDIA_DSM_MUID, NVIDIA_DSM_REVID,
        OPTIMUS_DSM_FUNC, OPTIMUS_DSM_MUID, OPTIMUS_DSM_REVID,
    },
    platform::{FirmwareHandle, PciDeviceInfo, Platform},
};

pub const PCI_VENDOR_ID_INTEL: u16 = 0x8086;

// Base class + subclass, compared against the top 16 bits of the 24-bit
// class code
const PCI_CLASS_DISPLAY_VGA: u32 = 0x0300;
const PCI_CLASS_DISPLAY_3D: u32 = 0x0302;

// Fatal initialization failures. The subsystem does not come up at all
// when one of these is reported
#[derive(Debug, Error)]
pub enum InitError {
    #[error("no discrete VGA device found")]
    NoDiscreteDeviceFound,
    #[error("no suitable _DSM call found")]
    NoSupportedProtocol,
    #[error(transparent)]
    Platform(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsmType {
    Optimus,
    Nvidia,
}

// The firmware power-control protocol resolved at initialization.
// Immutable afterwards: it selects which _DSM calls the switcher is
// allowed to issue
#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
    pub dsm_type: DsmType,
    pub muid: [u8; 16],
    pub revid: u32,
    // Node answering this protocol. On some Acer machines the legacy
    // protocol lives on the integrated GPU's node instead of the
    // discrete one
    pub handle: FirmwareHandle,
}

// Identity of the discrete card. The PCI device itself is not kept here:
// a powered-down card vanishes from the bus, so the live object is
// re-resolved through rescan() whenever it is needed
#[derive(Debug, Clone)]
pub struct DiscreteGpu {
    pub address: String,
    pub vendor: u16,
    pub device: u16,
    pub handle: FirmwareHandle,
}

pub struct Discovery {
    pub gpu: DiscreteGpu,
    pub protocol: ProtocolDescriptor,
}

// Scan the bus for display-class devices and classify them as
// integrated or discrete. The discrete card is recognized by its
// Optimus _DSM handshake; everything else, Intel or not, counts as an
// integrated candidate
pub fn discover<P: Platform>(
    platform: &P,
    skip_optimus_dsm: bool,
) -> Result<Discovery, InitError> {
    let mut discrete: Option<DiscreteGpu> = None;
    let mut igd_handle: Option<FirmwareHandle> = None;

    for dev in platform.pci_devices()? {
        let class = dev.class >> 8;

        if class != PCI_CLASS_DISPLAY_VGA && class != PCI_CLASS_DISPLAY_3D {
            continue;
        }

        let Some(handle) = platform.firmware_handle(&dev.address) else {
            warn!("Cannot find ACPI handle for VGA device {}", dev.address);
            continue;
        };

        if dev.vendor == PCI_VENDOR_ID_INTEL {
            info!("Found integrated VGA device {}: {handle}", dev.address);
            igd_handle = Some(handle);
        } else if dsm::has_dsm_func(
            platform,
            &handle,
            &OPTIMUS_DSM_MUID,
            OPTIMUS_DSM_REVID,
            OPTIMUS_DSM_FUNC,
        ) {
            info!("Found discrete VGA device {}: {handle}", dev.address);
            discrete = Some(DiscreteGpu {
                address: dev.address.clone(),
                vendor: dev.vendor,
                device: dev.device,
                handle,
            });
        } else {
            info!(
                "Found non-Intel integrated VGA device {}: {handle}",
                dev.address
            );
            igd_handle = Some(handle);
        }
    }

    let Some(gpu) = discrete else {
        return Err(InitError::NoDiscreteDeviceFound);
    };

    let protocol = resolve_protocol(platform, &gpu, igd_handle, skip_optimus_dsm)?;

    Ok(Discovery { gpu, protocol })
}

// Protocol preference order: Optimus on the discrete node (unless the
// probe is configured away), then the legacy protocol on the discrete
// node, then the legacy protocol on the integrated node
fn resolve_protocol<P: Platform>(
    platform: &P,
    gpu: &DiscreteGpu,
    igd_handle: Option<FirmwareHandle>,
    skip_optimus_dsm: bool,
) -> Result<ProtocolDescriptor, InitError> {
    if !skip_optimus_dsm
        && dsm::has_dsm_func(
            platform,
            &gpu.handle,
            &OPTIMUS_DSM_MUID,
            OPTIMUS_DSM_REVID,
            OPTIMUS_DSM_FUNC,
        )
    {
        info!("Detected an Optimus _DSM function");

        return Ok(ProtocolDescriptor {
            dsm_type: DsmType::Optimus,
            muid: OPTIMUS_DSM_MUID,
            revid: OPTIMUS_DSM_REVID,
            handle: gpu.handle.clone(),
        });
    }

    if dsm::has_dsm_func(
        platform,
        &gpu.handle,
        &NVIDIA_DSM_MUID,
        NVIDIA_DSM_REVID,
        NVIDIA_DSM_FUNC,
    ) {
        info!("Detected a nVidia _DSM function");

        return Ok(ProtocolDescriptor {
            dsm_type: DsmType::Nvidia,
            muid: NVIDIA_DSM_MUID,
            revid: NVIDIA_DSM_REVID,
            handle: gpu.handle.clone(),
        });
    }

    // At least two Acer machines are known to answer the legacy
    // protocol on the integrated GPU's node
    let legacy_on_igd = igd_handle.filter(|handle| {
        dsm::has_dsm_func(
            platform,
            handle,
            &NVIDIA_DSM_MUID,
            NVIDIA_DSM_REVID,
            NVIDIA_DSM_FUNC,
        )
    });

    match legacy_on_igd {
        Some(handle) => {
            info!(
                "Detected a nVidia _DSM function on the integrated video card"
            );

            Ok(ProtocolDescriptor {
                dsm_type: DsmType::Nvidia,
                muid: NVIDIA_DSM_MUID,
                revid: NVIDIA_DSM_REVID,
                handle,
            })
        }
        None => Err(InitError::NoSupportedProtocol),
    }
}

// Re-enumerate the bus and look the discrete card up again. None while
// the card is power-gated
pub fn rescan<P: Platform + ?Sized>(
    platform: &P,
    gpu: &DiscreteGpu,
) -> Option<PciDeviceInfo> {
    platform.find_by_id(gpu.vendor, gpu.device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{MockPlatform, MockState};

    const IGD_PATH: &str = "\\_SB.PCI0.GFX0";
    const DIS_PATH: &str = "\\_SB.PCI0.PEGP";

    fn optimus_bitmap() -> u32 {
        1 | (1 << OPTIMUS_DSM_FUNC)
    }

    fn nvidia_bitmap() -> u32 {
        1 | (1 << NVIDIA_DSM_FUNC)
    }

    fn igd() -> PciDeviceInfo {
        PciDeviceInfo {
            address: "0000:00:02.0".to_string(),
            vendor: PCI_VENDOR_ID_INTEL,
            device: 0x0126,
            class: 0x030000,
        }
    }

    fn dis() -> PciDeviceInfo {
        PciDeviceInfo {
            address: "0000:01:00.0".to_string(),
            vendor: 0x10DE,
            device: 0x0DF4,
            class: 0x030200,
        }
    }

    fn base_state() -> MockState {
        let mut state = MockState::default();
        state.devices = vec![igd(), dis()];
        state
            .handles
            .insert(igd().address, FirmwareHandle(IGD_PATH.to_string()));
        state
            .handles
            .insert(dis().address, FirmwareHandle(DIS_PATH.to_string()));
        state
    }

    #[test]
    fn resolves_optimus_on_the_discrete_node() {
        let mut state = base_state();
        state.bitmaps.insert(
            (DIS_PATH.to_string(), OPTIMUS_DSM_MUID, OPTIMUS_DSM_REVID),
            optimus_bitmap(),
        );

        let discovery =
            discover(&MockPlatform::new(state), false).unwrap();

        assert_eq!(discovery.gpu.address, dis().address);
        assert_eq!(discovery.protocol.dsm_type, DsmType::Optimus);
        assert_eq!(discovery.protocol.handle.0, DIS_PATH);
    }

    #[test]
    fn skip_probe_falls_back_to_the_legacy_protocol() {
        let mut state = base_state();
        state.bitmaps.insert(
            (DIS_PATH.to_string(), OPTIMUS_DSM_MUID, OPTIMUS_DSM_REVID),
            optimus_bitmap(),
        );
        state.bitmaps.insert(
            (DIS_PATH.to_string(), NVIDIA_DSM_MUID, NVIDIA_DSM_REVID),
            nvidia_bitmap(),
        );

        let discovery = discover(&MockPlatform::new(state), true).unwrap();

        assert_eq!(discovery.protocol.dsm_type, DsmType::Nvidia);
        assert_eq!(discovery.protocol.handle.0, DIS_PATH);
    }

    #[test]
    fn legacy_protocol_found_on_the_integrated_node() {
        let mut state = base_state();
        state.bitmaps.insert(
            (DIS_PATH.to_string(), OPTIMUS_DSM_MUID, OPTIMUS_DSM_REVID),
            optimus_bitmap(),
        );
        state.bitmaps.insert(
            (IGD_PATH.to_string(), NVIDIA_DSM_MUID, NVIDIA_DSM_REVID),
            nvidia_bitmap(),
        );

        let discovery = discover(&MockPlatform::new(state), true).unwrap();

        assert_eq!(discovery.protocol.dsm_type, DsmType::Nvidia);
        assert_eq!(discovery.protocol.handle.0, IGD_PATH);
    }

    #[test]
    fn no_display_device_fails_initialization() {
        let result = discover(&MockPlatform::new(MockState::default()), false);

        assert!(matches!(result, Err(InitError::NoDiscreteDeviceFound)));
    }

    #[test]
    fn device_without_handshake_counts_as_integrated() {
        // Non-Intel card that answers no Optimus _DSM at all
        let state = base_state();

        let result = discover(&MockPlatform::new(state), false);

        assert!(matches!(result, Err(InitError::NoDiscreteDeviceFound)));
    }

    #[test]
    fn no_usable_protocol_fails_initialization() {
        let mut state = base_state();
        state.bitmaps.insert(
            (DIS_PATH.to_string(), OPTIMUS_DSM_MUID, OPTIMUS_DSM_REVID),
            optimus_bitmap(),
        );

        let result = discover(&MockPlatform::new(state), true);

        assert!(matches!(result, Err(InitError::NoSupportedProtocol)));
    }

    #[test]
    fn non_display_devices_are_ignored() {
        let mut state = base_state();
        state.devices.push(PciDeviceInfo {
            address: "0000:00:1f.3".to_string(),
            vendor: PCI_VENDOR_ID_INTEL,
            device: 0x1C20,
            class: 0x040300,
        });
        state.bitmaps.insert(
            (DIS_PATH.to_string(), OPTIMUS_DSM_MUID, OPTIMUS_DSM_REVID),
            optimus_bitmap(),
        );

        let discovery = discover(&MockPlatform::new(state), false).unwrap();

        assert_eq!(discovery.gpu.vendor, 0x10DE);
    }
}

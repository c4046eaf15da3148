use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, trace, warn};

use crate::platform::{
    AcpiArg, AcpiValue, FirmwareError, FirmwareHandle, PciDeviceInfo, Platform,
};

const PCI_DEVICES_DIR: &str = "/sys/bus/pci/devices";
const PCI_RESCAN_PATH: &str = "/sys/bus/pci/rescan";

// Evaluation goes through the acpi_call kernel interface:
// write "\_SB.FOO.BAR 0x1 b0011" to the file, read the result back
const ACPI_CALL_PATH: &str = "/proc/acpi/call";

// Production platform backend on top of sysfs and /proc/acpi/call
pub struct SysfsPlatform {
    devices_dir: PathBuf,
    rescan_path: PathBuf,
    acpi_call_path: PathBuf,
}

impl SysfsPlatform {
    pub fn new() -> Self {
        Self {
            devices_dir: PathBuf::from(PCI_DEVICES_DIR),
            rescan_path: PathBuf::from(PCI_RESCAN_PATH),
            acpi_call_path: PathBuf::from(ACPI_CALL_PATH),
        }
    }

    fn device_dir(&self, address: &str) -> PathBuf {
        self.devices_dir.join(address)
    }

    // The parent directory of the resolved device path is the bridge the
    // device sits behind. The root bus directory ("pci0000:00") is not a
    // device and yields None
    fn parent_bridge(&self, address: &str) -> Option<String> {
        let resolved = fs::canonicalize(self.device_dir(address)).ok()?;
        let name = resolved.parent()?.file_name()?.to_string_lossy();

        if name.starts_with("pci") {
            None
        } else {
            Some(name.into_owned())
        }
    }
}

impl Default for SysfsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SysfsPlatform {
    fn pci_devices(&self) -> Result<Vec<PciDeviceInfo>> {
        let entries = fs::read_dir(&self.devices_dir)
            .with_context(|| {
                format!("Failed to enumerate {:?}", self.devices_dir)
            })?;

        let mut devices = Vec::new();

        for entry in entries {
            let entry = entry
                .with_context(|| "Failed to read PCI device entry")?;
            let address = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();

            // Skip entries with unreadable id files instead of failing
            // the whole scan
            let (Some(class), Some(vendor), Some(device)) = (
                read_hex(&dir.join("class")),
                read_hex(&dir.join("vendor")),
                read_hex(&dir.join("device")),
            ) else {
                debug!("Skipping PCI entry with unreadable ids: {address}");
                continue;
            };

            devices.push(PciDeviceInfo {
                address,
                vendor: vendor as u16,
                device: device as u16,
                class: class as u32,
            });
        }

        Ok(devices)
    }

    fn find_by_id(&self, vendor: u16, device: u16) -> Option<PciDeviceInfo> {
        // Ask the bus to re-enumerate first; a freshly powered-on card is
        // not visible until a rescan happens
        if let Err(err) = fs::write(&self.rescan_path, "1") {
            debug!("PCI rescan request failed: {err}");
        }

        let devices = match self.pci_devices() {
            Ok(devices) => devices,
            Err(err) => {
                warn!("PCI enumeration failed during rescan: {err}");
                return None;
            }
        };

        devices
            .into_iter()
            .find(|d| d.vendor == vendor && d.device == device)
    }

    fn bound_driver(&self, address: &str) -> Option<String> {
        let link = fs::read_link(self.device_dir(address).join("driver")).ok()?;
        Some(link.file_name()?.to_string_lossy().into_owned())
    }

    fn firmware_handle(&self, address: &str) -> Option<FirmwareHandle> {
        let path = self.device_dir(address).join("firmware_node/path");
        let name = fs::read_to_string(path).ok()?;

        Some(FirmwareHandle(name.trim().to_string()))
    }

    fn evaluate(
        &self,
        handle: &FirmwareHandle,
        method: &str,
        args: &[AcpiArg],
    ) -> Result<AcpiValue, FirmwareError> {
        let mut command = format!("{}.{}", handle.0, method);

        for arg in args {
            match arg {
                AcpiArg::Integer(value) => {
                    command.push_str(&format!(" {:#x}", value));
                }
                AcpiArg::Buffer(bytes) => {
                    command.push_str(" b");
                    for byte in bytes {
                        command.push_str(&format!("{:02x}", byte));
                    }
                }
            }
        }

        trace!("acpi_call: {command}");

        fs::write(&self.acpi_call_path, &command).map_err(|err| {
            FirmwareError::EvaluationFailed(format!(
                "writing \"{command}\" to {:?}: {err}",
                self.acpi_call_path
            ))
        })?;

        let raw = fs::read_to_string(&self.acpi_call_path).map_err(|err| {
            FirmwareError::EvaluationFailed(format!(
                "reading result of \"{command}\": {err}"
            ))
        })?;

        parse_call_result(raw.trim_end_matches('\0').trim())
    }

    fn bridge_power_get(&self, address: &str) {
        if let Some(bridge) = self.parent_bridge(address) {
            let control = self.device_dir(&bridge).join("power/control");

            if let Err(err) = fs::write(&control, "on") {
                debug!("Failed to hold bridge {bridge} powered: {err}");
            }
        }
    }

    fn bridge_power_put(&self, address: &str) {
        if let Some(bridge) = self.parent_bridge(address) {
            let control = self.device_dir(&bridge).join("power/control");

            if let Err(err) = fs::write(&control, "auto") {
                debug!("Failed to release bridge {bridge}: {err}");
            }
        }
    }
}

fn read_hex(path: &Path) -> Option<u64> {
    let text = fs::read_to_string(path).ok()?;
    let text = text.trim();
    let text = text.strip_prefix("0x").unwrap_or(text);

    u64::from_str_radix(text, 16).ok()
}

// acpi_call reports results as "0x..." integers, "{0xAA, 0xBB, ...}"
// buffers, or an "Error: ..." / "not called" line on failure
fn parse_call_result(raw: &str) -> Result<AcpiValue, FirmwareError> {
    if raw.starts_with("Error") || raw.starts_with("not called") {
        return Err(FirmwareError::EvaluationFailed(raw.to_string()));
    }

    if let Some(body) = raw.strip_prefix('{').and_then(|r| r.strip_suffix('}'))
    {
        let mut bytes = Vec::new();

        for part in body.split(',') {
            let Some(value) = parse_int(part.trim()) else {
                return Ok(AcpiValue::Other);
            };

            bytes.push(value as u8);
        }

        return Ok(AcpiValue::Buffer(bytes));
    }

    match parse_int(raw) {
        Some(value) => Ok(AcpiValue::Integer(value)),
        None => Ok(AcpiValue::Other),
    }
}

fn parse_int(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

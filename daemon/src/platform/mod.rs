use std::fmt;

use anyhow::Result;
use thiserror::Error;

pub mod sysfs;

#[cfg(test)]
pub mod mock;

// Recoverable firmware call failures. These always degrade to
// "capability absent" or "no usable value" at the call site and
// must never take the subsystem down.
#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("firmware evaluation failed: {0}")]
    EvaluationFailed(String),
    #[error("firmware call yielded an unsupported result type")]
    UnsupportedResultType,
}

// An ACPI namespace node, identified by its full pathname
// (e.g. "\_SB.PCI0.GPP0.PEGP")
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirmwareHandle(pub String);

impl fmt::Display for FirmwareHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Argument to an ACPI method evaluation
#[derive(Debug, Clone)]
pub enum AcpiArg {
    Integer(u64),
    Buffer(Vec<u8>),
}

// Result of an ACPI method evaluation.
// Other covers result objects this subsystem cannot use
// (packages, strings, ...)
#[derive(Debug, Clone)]
pub enum AcpiValue {
    Integer(u64),
    Buffer(Vec<u8>),
    Other,
}

// One enumerated PCI device.
// The address is the geographic name ("0000:01:00.0"), the class is the
// 24-bit class code as exposed by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub address: String,
    pub vendor: u16,
    pub device: u16,
    pub class: u32,
}

// Host platform seam: PCI enumeration, ACPI object evaluation and
// runtime power management on the parent bridge.
//
// A device returned by enumeration is only a snapshot. A powered-down
// discrete card can be absent from the bus entirely, so callers must
// re-resolve through find_by_id() immediately before touching one.
pub trait Platform: Send + Sync + 'static {
    // Enumerate every device currently visible on the PCI bus
    fn pci_devices(&self) -> Result<Vec<PciDeviceInfo>>;

    // Trigger a bus re-enumeration and look a device up by id pair.
    // None is the expected answer while the device is power-gated
    fn find_by_id(&self, vendor: u16, device: u16) -> Option<PciDeviceInfo>;

    // Name of the driver currently bound to the device, if any
    fn bound_driver(&self, address: &str) -> Option<String>;

    // Resolve the ACPI companion node of a PCI device
    fn firmware_handle(&self, address: &str) -> Option<FirmwareHandle>;

    // Evaluate a method on a firmware node
    fn evaluate(
        &self,
        handle: &FirmwareHandle,
        method: &str,
        args: &[AcpiArg],
    ) -> Result<AcpiValue, FirmwareError>;

    // Hold the parent bus bridge powered so the device's configuration
    // space stays readable, and release that hold again. Both are
    // best-effort reference-count style operations
    fn bridge_power_get(&self, address: &str);
    fn bridge_power_put(&self, address: &str);
}

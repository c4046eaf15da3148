use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::Result;

use crate::platform::{
    AcpiArg, AcpiValue, FirmwareError, FirmwareHandle, PciDeviceInfo, Platform,
};

// Scriptable platform used by the test modules. Every interaction with
// the bus and the firmware is recorded so tests can assert ordering
#[derive(Default)]
pub struct MockState {
    // Devices currently visible on the bus
    pub devices: Vec<PciDeviceInfo>,
    pub handles: HashMap<String, FirmwareHandle>,
    pub drivers: HashMap<String, String>,

    // (handle path, muid, revid) -> function 0 capability bitmap
    pub bitmaps: HashMap<(String, [u8; 16], u32), u32>,
    // When set, any _DSM evaluation yields this value verbatim
    pub dsm_result_override: Option<AcpiValue>,

    // Firmware power-resource state
    pub powered: bool,
    pub status_broken: bool,
    // The device governed by the power resource: it vanishes from the
    // bus on _OFF and reappears this many rescans after _ON
    // (None = never reappears)
    pub discrete: Option<PciDeviceInfo>,
    pub reappear_delay: Option<u32>,
    pending_rescans: Option<u32>,

    pub power_calls: Vec<String>,
    pub dsm_calls: Vec<(String, u32, u32, [u8; 4])>,
    pub rescan_count: u32,
    pub bridge_refs: i32,
}

pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new(state: MockState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Platform for MockPlatform {
    fn pci_devices(&self) -> Result<Vec<PciDeviceInfo>> {
        Ok(self.state().devices.clone())
    }

    fn find_by_id(&self, vendor: u16, device: u16) -> Option<PciDeviceInfo> {
        let mut state = self.state();
        state.rescan_count += 1;

        // Advance the reappearance countdown started by _ON
        if let Some(remaining) = state.pending_rescans {
            if remaining <= 1 {
                state.pending_rescans = None;

                if let Some(discrete) = state.discrete.clone() {
                    if !state.devices.contains(&discrete) {
                        state.devices.push(discrete);
                    }
                }
            } else {
                state.pending_rescans = Some(remaining - 1);
            }
        }

        state
            .devices
            .iter()
            .find(|d| d.vendor == vendor && d.device == device)
            .cloned()
    }

    fn bound_driver(&self, address: &str) -> Option<String> {
        self.state().drivers.get(address).cloned()
    }

    fn firmware_handle(&self, address: &str) -> Option<FirmwareHandle> {
        self.state().handles.get(address).cloned()
    }

    fn evaluate(
        &self,
        handle: &FirmwareHandle,
        method: &str,
        args: &[AcpiArg],
    ) -> Result<AcpiValue, FirmwareError> {
        let mut state = self.state();

        match method {
            "_DSM" => {
                let (muid, revid, func, func_args) = decode_dsm_args(args);

                if let Some(value) = state.dsm_result_override.clone() {
                    return Ok(value);
                }

                if func == 0 {
                    let key = (handle.0.clone(), muid, revid);

                    return match state.bitmaps.get(&key) {
                        Some(bitmap) => Ok(AcpiValue::Integer(*bitmap as u64)),
                        None => Err(FirmwareError::EvaluationFailed(
                            format!("no _DSM at {handle}"),
                        )),
                    };
                }

                state.dsm_calls.push((handle.0.clone(), revid, func, func_args));
                Ok(AcpiValue::Integer(1))
            }
            "SGST" => {
                if state.status_broken {
                    return Err(FirmwareError::EvaluationFailed(
                        "SGST unavailable".to_string(),
                    ));
                }

                Ok(AcpiValue::Integer(state.powered as u64))
            }
            "_ON" => {
                state.powered = true;
                state.power_calls.push("_ON".to_string());

                let visible = match (&state.discrete, &state.devices) {
                    (Some(discrete), devices) => devices.contains(discrete),
                    (None, _) => true,
                };

                if !visible {
                    match state.reappear_delay {
                        Some(0) => {
                            if let Some(discrete) = state.discrete.clone() {
                                state.devices.push(discrete);
                            }
                        }
                        delay => state.pending_rescans = delay,
                    }
                }

                Ok(AcpiValue::Integer(0))
            }
            "_OFF" => {
                state.powered = false;
                state.power_calls.push("_OFF".to_string());
                state.pending_rescans = None;

                if let Some(discrete) = state.discrete.clone() {
                    state.devices.retain(|d| d != &discrete);
                }

                Ok(AcpiValue::Integer(0))
            }
            other => Err(FirmwareError::EvaluationFailed(format!(
                "unknown method {other}"
            ))),
        }
    }

    fn bridge_power_get(&self, _address: &str) {
        self.state().bridge_refs += 1;
    }

    fn bridge_power_put(&self, _address: &str) {
        self.state().bridge_refs -= 1;
    }
}

fn decode_dsm_args(args: &[AcpiArg]) -> ([u8; 16], u32, u32, [u8; 4]) {
    let mut muid = [0u8; 16];
    let mut revid = 0;
    let mut func = 0;
    let mut func_args = [0u8; 4];

    if let Some(AcpiArg::Buffer(bytes)) = args.first() {
        if bytes.len() == 16 {
            muid.copy_from_slice(bytes);
        }
    }
    if let Some(AcpiArg::Integer(value)) = args.get(1) {
        revid = *value as u32;
    }
    if let Some(AcpiArg::Integer(value)) = args.get(2) {
        func = *value as u32;
    }
    if let Some(AcpiArg::Buffer(bytes)) = args.get(3) {
        if bytes.len() == 4 {
            func_args.copy_from_slice(bytes);
        }
    }

    (muid, revid, func, func_args)
}

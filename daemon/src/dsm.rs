use tracing::warn;

use crate::platform::{AcpiArg, AcpiValue, FirmwareError, FirmwareHandle, Platform};

// _DSM protocol id used by Optimus firmware on the discrete GPU
pub const OPTIMUS_DSM_MUID: [u8; 16] = [
    0xF8, 0xD8, 0x86, 0xA4, 0xDA, 0x0B, 0x1B, 0x47,
    0xA7, 0x2B, 0x60, 0x42, 0xA6, 0xB5, 0xBE, 0xE0,
];

// Legacy NVIDIA _DSM protocol id, found on older dual-GPU platforms
pub const NVIDIA_DSM_MUID: [u8; 16] = [
    0xA0, 0xA0, 0x95, 0x9D, 0x60, 0x00, 0x48, 0x4D,
    0xB3, 0x4D, 0x7E, 0x5F, 0xEA, 0x12, 0x9F, 0xD4,
];

pub const OPTIMUS_DSM_REVID: u32 = 0x100;
pub const OPTIMUS_DSM_FUNC: u32 = 0x1A;

pub const NVIDIA_DSM_REVID: u32 = 0x102;
pub const NVIDIA_DSM_FUNC: u32 = 0x3;

// Argument buffer for the auxiliary Optimus enable notification
pub const OPTIMUS_ENABLE_ARGS: [u8; 4] = [1, 0, 0, 3];

// Evaluate a _DSM function on a firmware node and decode the result as a
// 32-bit value. The parameter list always carries all four arguments:
// some firmware implementations (Asus U36SD) validate the argument
// buffer before looking at the function index, so a zero buffer is
// supplied when the caller has none.
pub fn call_dsm<P: Platform + ?Sized>(
    platform: &P,
    handle: &FirmwareHandle,
    muid: &[u8; 16],
    revid: u32,
    func: u32,
    args: Option<[u8; 4]>,
) -> Result<u32, FirmwareError> {
    let params = [
        AcpiArg::Buffer(muid.to_vec()),
        AcpiArg::Integer(revid as u64),
        AcpiArg::Integer(func as u64),
        AcpiArg::Buffer(args.unwrap_or([0; 4]).to_vec()),
    ];

    let result = platform.evaluate(handle, "_DSM", &params);

    match result {
        Ok(AcpiValue::Integer(value)) => Ok(value as u32),
        Ok(AcpiValue::Buffer(bytes)) if bytes.len() == 4 => {
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        Ok(_) => {
            warn!("{handle}._DSM call yields an unsupported result type");
            Err(FirmwareError::UnsupportedResultType)
        }
        Err(err) => {
            warn!(
                "Failed to evaluate {handle}._DSM rev {revid:#X} \
                 func {func:#X}: {err}"
            );
            Err(err)
        }
    }
}

// Whether a _DSM function index is implemented on the given node.
// Function 0 returns the supported-function bitmap; per ACPI spec v4
// 9.14.1 bit 0 must be set for any function to be available and bit n
// covers function n
pub fn has_dsm_func<P: Platform + ?Sized>(
    platform: &P,
    handle: &FirmwareHandle,
    muid: &[u8; 16],
    revid: u32,
    func: u32,
) -> bool {
    match call_dsm(platform, handle, muid, revid, 0, None) {
        Ok(bitmap) => bitmap & 1 != 0 && bitmap & (1 << func) != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{MockPlatform, MockState};

    fn node() -> FirmwareHandle {
        FirmwareHandle("\\_SB.PCI0.PEGP".to_string())
    }

    fn platform_with_bitmap(bitmap: u32) -> MockPlatform {
        let mut state = MockState::default();
        state
            .bitmaps
            .insert((node().0, OPTIMUS_DSM_MUID, OPTIMUS_DSM_REVID), bitmap);

        MockPlatform::new(state)
    }

    fn supports(bitmap: u32, func: u32) -> bool {
        let platform = platform_with_bitmap(bitmap);

        has_dsm_func(
            &platform,
            &node(),
            &OPTIMUS_DSM_MUID,
            OPTIMUS_DSM_REVID,
            func,
        )
    }

    #[test]
    fn bitmap_semantics() {
        // No function enumerable at all
        assert!(!supports(0b0, 1));
        // Bit 0 alone only says "enumerable", function 1 still missing
        assert!(!supports(0b1, 1));
        assert!(supports(0b11, 1));
        // Function 5 unset
        assert!(!supports(0b1, 5));
        // Function bit without bit 0 does not count
        assert!(!supports(0b10_0000, 5));
        assert!(supports(0b10_0001, 5));
    }

    #[test]
    fn failed_call_means_unsupported() {
        let platform = MockPlatform::new(MockState::default());

        assert!(!has_dsm_func(
            &platform,
            &node(),
            &OPTIMUS_DSM_MUID,
            OPTIMUS_DSM_REVID,
            OPTIMUS_DSM_FUNC,
        ));
    }

    #[test]
    fn buffer_result_is_composed_little_endian() {
        let platform = platform_with_bitmap(0);
        platform.state().dsm_result_override =
            Some(crate::platform::AcpiValue::Buffer(vec![
                0x03, 0x00, 0x00, 0x01,
            ]));

        let value = call_dsm(
            &platform,
            &node(),
            &OPTIMUS_DSM_MUID,
            OPTIMUS_DSM_REVID,
            0,
            None,
        )
        .unwrap();

        assert_eq!(value, 0x0100_0003);
    }

    #[test]
    fn unusable_result_shape_is_an_error() {
        let platform = platform_with_bitmap(0);
        platform.state().dsm_result_override =
            Some(crate::platform::AcpiValue::Other);

        let result = call_dsm(
            &platform,
            &node(),
            &OPTIMUS_DSM_MUID,
            OPTIMUS_DSM_REVID,
            0,
            None,
        );

        assert!(matches!(
            result,
            Err(FirmwareError::UnsupportedResultType)
        ));
    }

    #[test]
    fn zero_buffer_supplied_when_args_absent() {
        let platform = platform_with_bitmap(0b11);

        // Function 1 call without explicit arguments
        call_dsm(
            &platform,
            &node(),
            &OPTIMUS_DSM_MUID,
            OPTIMUS_DSM_REVID,
            1,
            None,
        )
        .unwrap();

        let state = platform.state();
        let (_, _, func, args) = state.dsm_calls[0].clone();
        assert_eq!(func, 1);
        assert_eq!(args, [0, 0, 0, 0]);
    }
}

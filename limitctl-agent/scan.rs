//! MCHBAR window scan for power-limit-shaped values
//!
//! Walks the mapped window in 8-byte steps looking for values whose PL1/PL2
//! unit fields match the requested limits. Useful for locating the
//! power-limit register on a platform where the known offset is in doubt,
//! or for confirming which offsets echo a value just written.

use limitctl_raw::rapl::{PL_ENABLE_BIT, PL_UNITS_MASK};

use crate::common::MmioRegion;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanMatch {
    pub offset: u32,
    pub value: u64,
}

/// Whether a raw value carries the requested PL1/PL2 units
///
/// With `require_enable`, both tier enable bits must also be set; disabled
/// copies of the same units are skipped.
pub fn matches(value: u64, pl1_units: u16, pl2_units: u16, require_enable: bool) -> bool {
    let lo = (value & 0xFFFF_FFFF) as u32;
    let hi = (value >> 32) as u32;

    if lo & PL_UNITS_MASK != pl1_units as u32 {
        return false;
    }
    if hi & PL_UNITS_MASK != pl2_units as u32 {
        return false;
    }
    if require_enable && (lo & PL_ENABLE_BIT == 0 || hi & PL_ENABLE_BIT == 0) {
        return false;
    }
    true
}

/// Scan the whole mapped window for matching values
pub fn scan_window(
    mmio: &MmioRegion,
    pl1_units: u16,
    pl2_units: u16,
    require_enable: bool,
) -> Result<Vec<ScanMatch>> {
    let mut found = Vec::new();

    let mut offset = 0u32;
    while offset as usize + 8 <= mmio.len() {
        let value = mmio.read64(offset)?;
        if matches(value, pl1_units, pl2_units, require_enable) {
            tracing::info!("scan match at +{offset:#07x}: {value:#018x}");
            found.push(ScanMatch { offset, value });
        }
        offset += 8;
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_units() {
        // PL1 = 0x1B8 enabled, PL2 = 0x4E8 enabled
        let value = 0x0000_84E8_0000_81B8u64;
        assert!(matches(value, 0x1B8, 0x4E8, true));
        assert!(matches(value, 0x1B8, 0x4E8, false));
        assert!(!matches(value, 0x1B8, 0x4E9, true));
        assert!(!matches(value, 0x1B9, 0x4E8, true));
    }

    #[test]
    fn test_matches_enable_requirement() {
        // Same units, PL2 enable clear
        let value = 0x0000_04E8_0000_81B8u64;
        assert!(!matches(value, 0x1B8, 0x4E8, true));
        assert!(matches(value, 0x1B8, 0x4E8, false));
    }

    #[test]
    fn test_matches_ignores_opaque_bits() {
        let value = 0xFFFF_84E8_00DF_81B8u64;
        assert!(matches(value, 0x1B8, 0x4E8, true));
    }
}

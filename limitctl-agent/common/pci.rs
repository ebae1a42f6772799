use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use limitctl_raw::mchbar::{self, HOST_BRIDGE_CLASS, INTEL_VENDOR_ID};

use crate::error::{io_error, LimitctlError, Result};

const PCI_DEVICES_DIR: &str = "/sys/bus/pci/devices";

/// Conventional address of the host bridge: bus 0, device 0, function 0
const CONVENTIONAL_HOST_BRIDGE: &str = "/sys/bus/pci/devices/0000:00:00.0";

/// Handle on the Intel host bridge's PCI configuration space
///
/// Located fresh on every run; the MCHBAR base it points at is not stable
/// across boots and is never persisted.
pub struct HostBridge {
    device_path: PathBuf,
}

impl HostBridge {
    /// Locate the Intel host bridge
    ///
    /// Checks the conventional 00:00.0 address first, then scans every
    /// enumerated PCI device for vendor 0x8086 with host-bridge class code.
    pub fn find() -> Result<Self> {
        let conventional = Path::new(CONVENTIONAL_HOST_BRIDGE);
        if is_intel_host_bridge(conventional) {
            tracing::debug!("Host bridge found at conventional address 00:00.0");
            return Ok(Self {
                device_path: conventional.to_path_buf(),
            });
        }

        let entries = std::fs::read_dir(PCI_DEVICES_DIR)
            .map_err(|e| io_error(&format!("open {PCI_DEVICES_DIR}"), &e))?;

        for entry in entries.flatten() {
            let device_path = entry.path();
            if is_intel_host_bridge(&device_path) {
                tracing::info!("Host bridge found at {}", device_path.display());
                return Ok(Self { device_path });
            }
        }

        Err(LimitctlError::DeviceNotFound(format!(
            "no Intel host bridge (vendor {INTEL_VENDOR_ID:#06x}, class {HOST_BRIDGE_CLASS:#08x}) in {PCI_DEVICES_DIR}"
        )))
    }

    /// Path of the device's configuration-space file
    pub fn config_path(&self) -> PathBuf {
        self.device_path.join("config")
    }

    /// Read 8 bytes of configuration space at `offset`
    pub fn read_config_u64(&self, offset: u64) -> Result<u64> {
        let path = self.config_path();
        let context = format!("PCI config {} +{offset:#x}", path.display());

        let mut file = File::open(&path).map_err(|e| io_error(&context, &e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_error(&context, &e))?;

        let mut buffer = [0u8; 8];
        file.read_exact(&mut buffer)
            .map_err(|e| io_error(&context, &e))?;

        Ok(u64::from_le_bytes(buffer))
    }

    /// Resolve the physical base of the MCHBAR window
    ///
    /// Reads the MCHBAR register from configuration space and validates the
    /// enable bit and non-zero base. Called once per run, never cached.
    pub fn resolve_mmio_base(&self) -> Result<u64> {
        let raw = self.read_config_u64(mchbar::MCHBAR_PCI_OFFSET)?;
        let base = mchbar::decode_base(raw)?;
        tracing::info!("MCHBAR base {base:#x} (config 0x48 = {raw:#018x})");
        Ok(base)
    }
}

fn is_intel_host_bridge(device_path: &Path) -> bool {
    let vendor = read_sysfs_hex(&device_path.join("vendor"));
    let class = read_sysfs_hex(&device_path.join("class"));

    match (vendor, class) {
        (Some(vendor), Some(class)) => {
            vendor == INTEL_VENDOR_ID && (class & 0xFF_FF00) == HOST_BRIDGE_CLASS
        }
        _ => false,
    }
}

fn read_sysfs_hex(path: &Path) -> Option<u32> {
    let text = std::fs::read_to_string(path).ok()?;
    parse_hex_attr(&text)
}

fn parse_hex_attr(text: &str) -> Option<u32> {
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).ok()
}

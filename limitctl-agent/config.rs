use std::path::PathBuf;

use limitctl_raw::mchbar;

use crate::powercap::DEFAULT_POWERCAP_DIR;

/// Session parameters, normally populated from the command line
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Logical CPU whose MSR interface is used. Package-scoped registers
    /// read the same from every CPU of the package; the first one suffices.
    pub cpu: u32,

    /// Directory holding the kernel power-cap constraint files
    pub powercap_dir: PathBuf,

    /// Size of the MCHBAR mapping
    pub mmio_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cpu: 0,
            powercap_dir: PathBuf::from(DEFAULT_POWERCAP_DIR),
            mmio_len: mchbar::MAP_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn with_cpu(cpu: u32) -> Self {
        Self {
            cpu,
            ..Self::default()
        }
    }
}

//! Kernel power-cap mirror (intel-rapl constraint files)
//!
//! The kernel enforces its own software copy of the package limits through
//! the powercap class. Keeping it in agreement with the registers prevents
//! the next daemon pass from quietly reverting an override. Values are
//! written as decimal microwatts, one constraint file per tier.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{io_error, LimitctlError, Result};

pub const DEFAULT_POWERCAP_DIR: &str = "/sys/class/powercap/intel-rapl:0";

const PL1_CONSTRAINT: &str = "constraint_0_power_limit_uw";
const PL2_CONSTRAINT: &str = "constraint_1_power_limit_uw";

/// Convert watts to the microwatt integers the powercap files take
pub fn watts_to_microwatts(watts: f64) -> Result<u64> {
    let uw = (watts * 1_000_000.0).round();
    if uw <= 0.0 || !uw.is_finite() {
        return Err(LimitctlError::InvalidConfiguration(format!(
            "{watts} W is not a usable power-cap value"
        )));
    }
    Ok(uw as u64)
}

/// Writer for the two per-tier constraint files
pub struct PowercapWriter {
    dir: PathBuf,
}

impl PowercapWriter {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_POWERCAP_DIR),
        }
    }

    pub fn with_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Write both tiers; PL1 first, failing out before PL2 on error
    pub fn write_limits_uw(&self, pl1_uw: u64, pl2_uw: u64) -> Result<()> {
        self.write_value(PL1_CONSTRAINT, pl1_uw)?;
        self.write_value(PL2_CONSTRAINT, pl2_uw)?;
        tracing::info!("Wrote power-cap PL1={pl1_uw}uW PL2={pl2_uw}uW");
        Ok(())
    }

    fn write_value(&self, name: &str, value: u64) -> Result<()> {
        let path = self.dir.join(name);
        write_text_file(&path, &value.to_string())
    }
}

impl Default for PowercapWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_text_file(path: &Path, text: &str) -> Result<()> {
    let context = format!("write {}", path.display());
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| io_error(&context, &e))?;
    file.write_all(text.as_bytes())
        .map_err(|e| io_error(&context, &e))
}

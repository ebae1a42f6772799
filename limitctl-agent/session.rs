//! Hardware-backed session owning both register transports
//!
//! One session is constructed at the start of a bounded operation and torn
//! down when it ends; the MCHBAR base is re-resolved on every construction
//! and the mapping and descriptors are released on drop on every exit path.
//! Register access is not internally synchronized beyond the handles
//! themselves: exactly one operation is assumed in flight at a time, and a
//! concurrent writer elsewhere on the system is an external hazard.

use limitctl_raw::mchbar;
use limitctl_raw::rapl::{self, RaplPowerUnit};
use limitctl_raw::RegisterLayout;

use crate::common::{HostBridge, MmioRegion, MsrHandle};
use crate::config::SessionConfig;
use crate::error::{LimitctlError, Result};
use crate::powercap::PowercapWriter;
use crate::workflow::{LimitState, PowerLimitAccess, RegisterTarget};

pub struct PowerSession {
    msr: MsrHandle,
    mmio: MmioRegion,
    powercap: PowercapWriter,
    power_unit: u8,
    unit_watts: f64,
}

impl PowerSession {
    /// Locate the host bridge, map the MCHBAR window, open the MSR device,
    /// and read the unit scale
    pub fn open(config: &SessionConfig) -> Result<Self> {
        let bridge = HostBridge::find()?;
        let base = bridge.resolve_mmio_base()?;
        let mmio = MmioRegion::map(base, config.mmio_len)?;
        let msr = MsrHandle::open(config.cpu)?;

        let unit_raw = msr.read(rapl::msr::MSR_RAPL_POWER_UNIT)?;
        let unit = RaplPowerUnit::from_raw(unit_raw);
        if unit.power_units == 0 {
            return Err(LimitctlError::InconsistentRead(format!(
                "power-unit scale is indeterminate (MSR {:#x} = {unit_raw:#018x})",
                rapl::msr::MSR_RAPL_POWER_UNIT
            )));
        }
        let unit_watts = unit.unit_watts();

        tracing::info!(
            "Power unit 2^-{} W = {unit_watts:.6} W",
            unit.power_units
        );

        Ok(Self {
            msr,
            mmio,
            powercap: PowercapWriter::with_dir(config.powercap_dir.clone()),
            power_unit: unit.power_units,
            unit_watts,
        })
    }

    pub fn power_unit(&self) -> u8 {
        self.power_unit
    }

    pub fn unit_watts(&self) -> f64 {
        self.unit_watts
    }

    pub fn mmio(&self) -> &MmioRegion {
        &self.mmio
    }
}

impl PowerLimitAccess for PowerSession {
    fn read_state(&self) -> Result<LimitState> {
        Ok(LimitState {
            power_unit: self.power_unit,
            unit_watts: self.unit_watts,
            msr: self.read_register(RegisterTarget::Msr)?,
            mmio: self.read_register(RegisterTarget::Mmio)?,
        })
    }

    fn read_register(&self, target: RegisterTarget) -> Result<u64> {
        match target {
            RegisterTarget::Msr => self.msr.read(rapl::msr::MSR_PKG_POWER_LIMIT),
            RegisterTarget::Mmio => self.mmio.read64(mchbar::PL_OFFSET),
        }
    }

    fn write_register(&self, target: RegisterTarget, value: u64) -> Result<()> {
        match target {
            RegisterTarget::Msr => self.msr.write(rapl::msr::MSR_PKG_POWER_LIMIT, value),
            RegisterTarget::Mmio => self.mmio.write64(mchbar::PL_OFFSET, value),
        }
    }

    fn write_powercap(&self, pl1_uw: u64, pl2_uw: u64) -> Result<()> {
        self.powercap.write_limits_uw(pl1_uw, pl2_uw)
    }
}

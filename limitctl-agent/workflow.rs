//! Read/convert/confirm/write workflow for the package power limits
//!
//! All steps run against a [`PowerLimitAccess`] capability instead of the
//! hardware directly, so the planning and reporting logic is testable
//! without privileged register access. Planning is pure: the values shown
//! in a confirmation preview are exactly the values later written.

use std::fmt;

use limitctl_raw::rapl::{set_pl_units, watts_to_units};

use crate::error::Result;
use crate::powercap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterTarget {
    Msr,
    Mmio,
}

impl fmt::Display for RegisterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterTarget::Msr => write!(f, "MSR"),
            RegisterTarget::Mmio => write!(f, "MMIO"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyTarget {
    Msr,
    Mmio,
    Both,
}

impl ApplyTarget {
    pub fn includes(self, target: RegisterTarget) -> bool {
        match self {
            ApplyTarget::Msr => target == RegisterTarget::Msr,
            ApplyTarget::Mmio => target == RegisterTarget::Mmio,
            ApplyTarget::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    MsrToMmio,
    MmioToMsr,
}

impl SyncDirection {
    pub fn source(self) -> RegisterTarget {
        match self {
            SyncDirection::MsrToMmio => RegisterTarget::Msr,
            SyncDirection::MmioToMsr => RegisterTarget::Mmio,
        }
    }

    pub fn destination(self) -> RegisterTarget {
        match self {
            SyncDirection::MsrToMmio => RegisterTarget::Mmio,
            SyncDirection::MmioToMsr => RegisterTarget::Msr,
        }
    }
}

/// One consistent snapshot of the power-limit state
///
/// The two raw values come from independent registers and are never assumed
/// equal; each write is computed against its own register's snapshot.
#[derive(Debug, Clone, Copy)]
pub struct LimitState {
    pub power_unit: u8,
    pub unit_watts: f64,
    pub msr: u64,
    pub mmio: u64,
}

/// Privileged register access capability
///
/// Implemented by the hardware-backed session; tests substitute an
/// in-memory fake.
pub trait PowerLimitAccess {
    /// Read the unit scale and both registers. Any missing piece fails the
    /// whole read: a write planned against a partial state is untrustworthy.
    fn read_state(&self) -> Result<LimitState>;

    fn read_register(&self, target: RegisterTarget) -> Result<u64>;

    fn write_register(&self, target: RegisterTarget, value: u64) -> Result<()>;

    /// Mirror the limits into the kernel power-cap layer, in microwatts
    fn write_powercap(&self, pl1_uw: u64, pl2_uw: u64) -> Result<()>;
}

/// Operator request: watts per tier, which register(s), kernel mirror or not
#[derive(Debug, Clone, Copy)]
pub struct LimitRequest {
    pub pl1_watts: f64,
    pub pl2_watts: f64,
    pub target: ApplyTarget,
    pub powercap: bool,
}

/// Exact values a subsequent [`execute_plan`] will write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyPlan {
    pub pl1_units: u16,
    pub pl2_units: u16,
    pub msr_next: Option<u64>,
    pub mmio_next: Option<u64>,
    pub powercap_uw: Option<(u64, u64)>,
}

/// Convert the request and compute post-write register values
///
/// Pure. Fails on out-of-range conversion before anything is written.
/// Each target's next value is computed against that target's own
/// last-read raw value.
pub fn plan_limits(state: &LimitState, request: &LimitRequest) -> Result<ApplyPlan> {
    let pl1_units = watts_to_units(request.pl1_watts, state.unit_watts)?;
    let pl2_units = watts_to_units(request.pl2_watts, state.unit_watts)?;

    let msr_next = request
        .target
        .includes(RegisterTarget::Msr)
        .then(|| set_pl_units(state.msr, pl1_units, pl2_units));
    let mmio_next = request
        .target
        .includes(RegisterTarget::Mmio)
        .then(|| set_pl_units(state.mmio, pl1_units, pl2_units));

    let powercap_uw = if request.powercap {
        Some((
            powercap::watts_to_microwatts(request.pl1_watts)?,
            powercap::watts_to_microwatts(request.pl2_watts)?,
        ))
    } else {
        None
    };

    Ok(ApplyPlan {
        pl1_units,
        pl2_units,
        msr_next,
        mmio_next,
        powercap_uw,
    })
}

/// Per-target outcome of an apply
///
/// `None` means the target was not selected. Partial success stays visible:
/// outcomes are never merged into a single verdict.
pub struct ApplyReport {
    pub msr: Option<Result<u64>>,
    pub mmio: Option<Result<u64>>,
    pub powercap: Option<Result<(u64, u64)>>,
}

impl ApplyReport {
    pub fn fully_applied(&self) -> bool {
        let ok_u64 = |r: &Option<Result<u64>>| r.as_ref().map_or(true, |r| r.is_ok());
        ok_u64(&self.msr)
            && ok_u64(&self.mmio)
            && self.powercap.as_ref().map_or(true, |r| r.is_ok())
    }
}

/// Write each planned target, best-effort
///
/// A failed register write does not stop the other target's write; the
/// power-cap mirror is attempted independently and its failure does not
/// undo register writes already performed. Nothing is retried: a replayed
/// half-written MMIO transfer could leave the register in an unknown
/// intermediate state.
pub fn execute_plan<A: PowerLimitAccess>(access: &A, plan: &ApplyPlan) -> ApplyReport {
    let msr = plan.msr_next.map(|value| {
        let result = access.write_register(RegisterTarget::Msr, value);
        if let Err(e) = &result {
            tracing::warn!("MSR write of {value:#018x} failed: {e}");
        }
        result.map(|()| value)
    });

    let mmio = plan.mmio_next.map(|value| {
        let result = access.write_register(RegisterTarget::Mmio, value);
        if let Err(e) = &result {
            tracing::warn!("MMIO write of {value:#018x} failed: {e}");
        }
        result.map(|()| value)
    });

    let powercap = plan.powercap_uw.map(|(pl1_uw, pl2_uw)| {
        let result = access.write_powercap(pl1_uw, pl2_uw);
        if let Err(e) = &result {
            tracing::warn!("power-cap mirror of {pl1_uw}/{pl2_uw} uW failed: {e}");
        }
        result.map(|()| (pl1_uw, pl2_uw))
    });

    ApplyReport { msr, mmio, powercap }
}

/// Read the raw value a sync would copy from the source register
pub fn plan_sync<A: PowerLimitAccess>(access: &A, direction: SyncDirection) -> Result<u64> {
    access.read_register(direction.source())
}

/// Copy a raw value verbatim into the destination register
///
/// No per-field encode/decode: the whole value, opaque bits included, is
/// transplanted so the two registers agree exactly.
pub fn execute_sync<A: PowerLimitAccess>(
    access: &A,
    direction: SyncDirection,
    raw: u64,
) -> Result<()> {
    access.write_register(direction.destination(), raw)
}

/// Per-register snapshot for display
///
/// Inspection is read-only; one register failing to read does not hide
/// the other.
pub struct Inspection {
    pub msr: Result<u64>,
    pub mmio: Result<u64>,
}

pub fn inspect<A: PowerLimitAccess>(access: &A) -> Inspection {
    Inspection {
        msr: access.read_register(RegisterTarget::Msr),
        mmio: access.read_register(RegisterTarget::Mmio),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimitctlError;
    use std::cell::RefCell;

    struct FakeAccess {
        unit_watts: f64,
        msr: RefCell<u64>,
        mmio: RefCell<u64>,
        fail_msr_reads: bool,
        fail_msr_writes: bool,
        fail_powercap: bool,
        powercap: RefCell<Option<(u64, u64)>>,
    }

    impl FakeAccess {
        fn new(msr: u64, mmio: u64) -> Self {
            Self {
                unit_watts: 0.125,
                msr: RefCell::new(msr),
                mmio: RefCell::new(mmio),
                fail_msr_reads: false,
                fail_msr_writes: false,
                fail_powercap: false,
                powercap: RefCell::new(None),
            }
        }

        fn state(&self) -> LimitState {
            LimitState {
                power_unit: 3,
                unit_watts: self.unit_watts,
                msr: *self.msr.borrow(),
                mmio: *self.mmio.borrow(),
            }
        }
    }

    impl PowerLimitAccess for FakeAccess {
        fn read_state(&self) -> Result<LimitState> {
            Ok(self.state())
        }

        fn read_register(&self, target: RegisterTarget) -> Result<u64> {
            match target {
                RegisterTarget::Msr if self.fail_msr_reads => {
                    Err(LimitctlError::IoError("MSR read refused".into()))
                }
                RegisterTarget::Msr => Ok(*self.msr.borrow()),
                RegisterTarget::Mmio => Ok(*self.mmio.borrow()),
            }
        }

        fn write_register(&self, target: RegisterTarget, value: u64) -> Result<()> {
            match target {
                RegisterTarget::Msr if self.fail_msr_writes => {
                    Err(LimitctlError::IoError("MSR write refused".into()))
                }
                RegisterTarget::Msr => {
                    *self.msr.borrow_mut() = value;
                    Ok(())
                }
                RegisterTarget::Mmio => {
                    *self.mmio.borrow_mut() = value;
                    Ok(())
                }
            }
        }

        fn write_powercap(&self, pl1_uw: u64, pl2_uw: u64) -> Result<()> {
            if self.fail_powercap {
                return Err(LimitctlError::IoError("powercap write refused".into()));
            }
            *self.powercap.borrow_mut() = Some((pl1_uw, pl2_uw));
            Ok(())
        }
    }

    fn request(target: ApplyTarget, powercap: bool) -> LimitRequest {
        LimitRequest {
            pl1_watts: 55.0,
            pl2_watts: 157.0,
            target,
            powercap,
        }
    }

    #[test]
    fn test_plan_computes_per_register_values() {
        // Different opaque bits per register must survive independently
        let access = FakeAccess::new(0x8042_8328_00DF_8280, 0x0042_84E8_00DF_81B8);
        let plan = plan_limits(&access.state(), &request(ApplyTarget::Both, false)).unwrap();

        assert_eq!(plan.pl1_units, 440);
        assert_eq!(plan.pl2_units, 1256);
        assert_eq!(plan.msr_next, Some(0x8042_84E8_00DF_81B8));
        assert_eq!(plan.mmio_next, Some(0x0042_84E8_00DF_81B8));
    }

    #[test]
    fn test_plan_single_target() {
        let access = FakeAccess::new(0, 0);
        let plan = plan_limits(&access.state(), &request(ApplyTarget::Mmio, false)).unwrap();
        assert_eq!(plan.msr_next, None);
        assert_eq!(plan.mmio_next, Some(0x0000_0004_E800_01B8));
    }

    #[test]
    fn test_plan_rejects_out_of_range_before_any_write() {
        let access = FakeAccess::new(0x1111, 0x2222);
        let bad = LimitRequest {
            pl1_watts: 0.01,
            pl2_watts: 157.0,
            target: ApplyTarget::Both,
            powercap: true,
        };
        assert!(matches!(
            plan_limits(&access.state(), &bad),
            Err(LimitctlError::OutOfRange(_))
        ));
        assert_eq!(*access.msr.borrow(), 0x1111);
        assert_eq!(*access.mmio.borrow(), 0x2222);
    }

    #[test]
    fn test_execute_both_continues_after_one_failure() {
        let mut access = FakeAccess::new(0, 0);
        access.fail_msr_writes = true;
        let plan = plan_limits(&access.state(), &request(ApplyTarget::Both, false)).unwrap();

        let report = execute_plan(&access, &plan);

        assert!(matches!(report.msr, Some(Err(_))));
        assert!(matches!(report.mmio, Some(Ok(_))));
        assert!(!report.fully_applied());
        assert_eq!(*access.mmio.borrow(), 0x0000_0004_E800_01B8);
    }

    #[test]
    fn test_powercap_failure_does_not_undo_register_writes() {
        let mut access = FakeAccess::new(0, 0);
        access.fail_powercap = true;
        let plan = plan_limits(&access.state(), &request(ApplyTarget::Both, true)).unwrap();
        assert_eq!(plan.powercap_uw, Some((55_000_000, 157_000_000)));

        let report = execute_plan(&access, &plan);

        assert!(matches!(report.msr, Some(Ok(_))));
        assert!(matches!(report.mmio, Some(Ok(_))));
        assert!(matches!(report.powercap, Some(Err(_))));
        assert_eq!(*access.msr.borrow(), 0x0000_0004_E800_01B8);
    }

    #[test]
    fn test_powercap_mirror_values() {
        let access = FakeAccess::new(0, 0);
        let plan = plan_limits(&access.state(), &request(ApplyTarget::Both, true)).unwrap();
        let report = execute_plan(&access, &plan);

        assert!(report.fully_applied());
        assert_eq!(*access.powercap.borrow(), Some((55_000_000, 157_000_000)));
    }

    #[test]
    fn test_sync_copies_raw_value_verbatim() {
        let access = FakeAccess::new(0x8042_8328_00DF_8280, 0x0000_0004_E800_01B8);

        let raw = plan_sync(&access, SyncDirection::MsrToMmio).unwrap();
        execute_sync(&access, SyncDirection::MsrToMmio, raw).unwrap();
        assert_eq!(*access.mmio.borrow(), 0x8042_8328_00DF_8280);
    }

    #[test]
    fn test_sync_is_idempotent() {
        let access = FakeAccess::new(0x8042_8328_00DF_8280, 0);

        let raw = plan_sync(&access, SyncDirection::MsrToMmio).unwrap();
        execute_sync(&access, SyncDirection::MsrToMmio, raw).unwrap();
        let after_once = *access.mmio.borrow();

        let raw = plan_sync(&access, SyncDirection::MsrToMmio).unwrap();
        execute_sync(&access, SyncDirection::MsrToMmio, raw).unwrap();
        assert_eq!(*access.mmio.borrow(), after_once);
    }

    #[test]
    fn test_inspect_reports_each_register_independently() {
        let mut access = FakeAccess::new(0x1111, 0x2222);
        access.fail_msr_reads = true;

        let inspection = inspect(&access);
        assert!(inspection.msr.is_err());
        assert_eq!(inspection.mmio.unwrap(), 0x2222);
    }
}

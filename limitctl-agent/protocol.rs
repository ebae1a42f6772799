//! Line protocol spoken across the privileged-helper boundary
//!
//! Requests are single lines; a state read answers with newline-delimited
//! `KEY=VALUE` pairs. The parser refuses to default anything: a required
//! key that is missing or malformed fails the whole read, because a partial
//! state means the unit scale or register values cannot be trusted for any
//! subsequent write.

use std::collections::HashMap;

use crate::error::{LimitctlError, Result};
use crate::workflow::{LimitState, PowerLimitAccess, RegisterTarget};

pub const KEY_POWER_UNIT: &str = "POWER_UNIT";
pub const KEY_UNIT_WATTS: &str = "UNIT_WATTS";
pub const KEY_MSR: &str = "MSR";
pub const KEY_MMIO: &str = "MMIO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadState,
    WriteRegister { target: RegisterTarget, value: u64 },
    WritePowercap { pl1_uw: u64, pl2_uw: u64 },
}

impl Request {
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| LimitctlError::ParseError("empty request".into()))?;

        let request = match verb {
            "read-state" => Request::ReadState,
            "write-register" => {
                let target = match parts.next() {
                    Some("msr") => RegisterTarget::Msr,
                    Some("mmio") => RegisterTarget::Mmio,
                    other => {
                        return Err(LimitctlError::ParseError(format!(
                            "write-register target must be msr or mmio, got {other:?}"
                        )))
                    }
                };
                let value = parse_hex_u64(parts.next().ok_or_else(|| {
                    LimitctlError::ParseError("write-register needs a hex value".into())
                })?)?;
                Request::WriteRegister { target, value }
            }
            "write-powercap" => {
                let pl1_uw = parse_decimal_u64(parts.next().ok_or_else(|| {
                    LimitctlError::ParseError("write-powercap needs PL1 microwatts".into())
                })?)?;
                let pl2_uw = parse_decimal_u64(parts.next().ok_or_else(|| {
                    LimitctlError::ParseError("write-powercap needs PL2 microwatts".into())
                })?)?;
                Request::WritePowercap { pl1_uw, pl2_uw }
            }
            other => {
                return Err(LimitctlError::ParseError(format!(
                    "unknown request {other:?}"
                )))
            }
        };

        if let Some(extra) = parts.next() {
            return Err(LimitctlError::ParseError(format!(
                "trailing token {extra:?} in request"
            )));
        }
        Ok(request)
    }

    pub fn to_line(&self) -> String {
        match self {
            Request::ReadState => "read-state".to_string(),
            Request::WriteRegister { target, value } => {
                let target = match target {
                    RegisterTarget::Msr => "msr",
                    RegisterTarget::Mmio => "mmio",
                };
                format!("write-register {target} {value:#018x}")
            }
            Request::WritePowercap { pl1_uw, pl2_uw } => {
                format!("write-powercap {pl1_uw} {pl2_uw}")
            }
        }
    }
}

/// Render a state snapshot as the `KEY=VALUE` response body
pub fn render_state(state: &LimitState) -> String {
    format!(
        "{KEY_POWER_UNIT}={}\n{KEY_UNIT_WATTS}={:.6}\n{KEY_MSR}={:#018x}\n{KEY_MMIO}={:#018x}\n",
        state.power_unit, state.unit_watts, state.msr, state.mmio
    )
}

/// Parse a `KEY=VALUE` response body back into a state snapshot
pub fn parse_state(text: &str) -> Result<LimitState> {
    let mut values = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim(), value.trim());
        }
    }

    let power_unit = required(&values, KEY_POWER_UNIT)?
        .parse::<u8>()
        .map_err(|e| bad_value(KEY_POWER_UNIT, &e.to_string()))?;
    let unit_watts = required(&values, KEY_UNIT_WATTS)?
        .parse::<f64>()
        .map_err(|e| bad_value(KEY_UNIT_WATTS, &e.to_string()))?;
    let msr = parse_u64_auto(required(&values, KEY_MSR)?)
        .map_err(|e| bad_value(KEY_MSR, &e.to_string()))?;
    let mmio = parse_u64_auto(required(&values, KEY_MMIO)?)
        .map_err(|e| bad_value(KEY_MMIO, &e.to_string()))?;

    if power_unit == 0 || unit_watts <= 0.0 {
        return Err(LimitctlError::InconsistentRead(format!(
            "unit scale is indeterminate ({KEY_POWER_UNIT}={power_unit}, {KEY_UNIT_WATTS}={unit_watts})"
        )));
    }

    Ok(LimitState {
        power_unit,
        unit_watts,
        msr,
        mmio,
    })
}

/// Execute one request against a register-access capability
///
/// `read-state` answers with a response body; writes answer with nothing.
pub fn serve_request<A: PowerLimitAccess>(access: &A, request: &Request) -> Result<Option<String>> {
    match request {
        Request::ReadState => Ok(Some(render_state(&access.read_state()?))),
        Request::WriteRegister { target, value } => {
            access.write_register(*target, *value)?;
            Ok(None)
        }
        Request::WritePowercap { pl1_uw, pl2_uw } => {
            access.write_powercap(*pl1_uw, *pl2_uw)?;
            Ok(None)
        }
    }
}

fn required<'a>(values: &HashMap<&str, &'a str>, key: &str) -> Result<&'a str> {
    values.get(key).copied().ok_or_else(|| {
        LimitctlError::InconsistentRead(format!("missing {key} from state read"))
    })
}

fn bad_value(key: &str, detail: &str) -> LimitctlError {
    LimitctlError::InconsistentRead(format!("unusable {key} in state read: {detail}"))
}

/// Parse a register value, hex with or without the 0x prefix
pub fn parse_hex_u64(text: &str) -> Result<u64> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|e| LimitctlError::ParseError(format!("bad hex value {text:?}: {e}")))
}

fn parse_decimal_u64(text: &str) -> Result<u64> {
    text.parse::<u64>()
        .map_err(|e| LimitctlError::ParseError(format!("bad integer {text:?}: {e}")))
}

/// Parse 0x-prefixed values as hex, everything else as decimal
pub fn parse_u64_auto(text: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    if let Some(digits) = text.strip_prefix("0x") {
        u64::from_str_radix(digits, 16)
    } else {
        text.parse::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_request_line_round_trip() {
        let requests = [
            Request::ReadState,
            Request::WriteRegister {
                target: RegisterTarget::Msr,
                value: 0x0042_84E8_00DF_81B8,
            },
            Request::WriteRegister {
                target: RegisterTarget::Mmio,
                value: 0,
            },
            Request::WritePowercap {
                pl1_uw: 55_000_000,
                pl2_uw: 157_000_000,
            },
        ];
        for request in requests {
            assert_eq!(Request::parse_line(&request.to_line()).unwrap(), request);
        }
    }

    #[test]
    fn test_request_parse_rejects_garbage() {
        assert!(Request::parse_line("").is_err());
        assert!(Request::parse_line("reboot").is_err());
        assert!(Request::parse_line("write-register cmos 0x1").is_err());
        assert!(Request::parse_line("write-register msr").is_err());
        assert!(Request::parse_line("write-register msr 0xZZ").is_err());
        assert!(Request::parse_line("write-powercap 100").is_err());
        assert!(Request::parse_line("read-state now").is_err());
    }

    #[test]
    fn test_state_round_trip() {
        let state = LimitState {
            power_unit: 3,
            unit_watts: 0.125,
            msr: 0x0042_84E8_00DF_81B8,
            mmio: 0x0000_0004_E800_01B8,
        };
        let parsed = parse_state(&render_state(&state)).unwrap();
        assert_eq!(parsed.power_unit, 3);
        assert_eq!(parsed.unit_watts, 0.125);
        assert_eq!(parsed.msr, state.msr);
        assert_eq!(parsed.mmio, state.mmio);
    }

    #[test]
    fn test_parse_state_missing_key_is_hard_failure() {
        let text = "POWER_UNIT=3\nUNIT_WATTS=0.125000\nMSR=0x1\n";
        assert!(matches!(
            parse_state(text),
            Err(LimitctlError::InconsistentRead(_))
        ));
    }

    #[test]
    fn test_parse_state_malformed_value_is_hard_failure() {
        let text = "POWER_UNIT=three\nUNIT_WATTS=0.125\nMSR=0x1\nMMIO=0x2\n";
        assert!(matches!(
            parse_state(text),
            Err(LimitctlError::InconsistentRead(_))
        ));
    }

    #[test]
    fn test_parse_state_zero_unit_is_hard_failure() {
        let text = "POWER_UNIT=0\nUNIT_WATTS=1.0\nMSR=0x1\nMMIO=0x2\n";
        assert!(matches!(
            parse_state(text),
            Err(LimitctlError::InconsistentRead(_))
        ));
    }

    #[test]
    fn test_parse_state_ignores_extra_keys() {
        let text = "POWER_UNIT=3\nUNIT_WATTS=0.125\nMSR=0x1\nMMIO=0x2\nP_CPUS=0-7\n";
        let parsed = parse_state(text).unwrap();
        assert_eq!(parsed.msr, 1);
        assert_eq!(parsed.mmio, 2);
    }

    struct FakeAccess {
        msr: RefCell<u64>,
        mmio: RefCell<u64>,
        powercap: RefCell<Option<(u64, u64)>>,
    }

    impl PowerLimitAccess for FakeAccess {
        fn read_state(&self) -> crate::error::Result<LimitState> {
            Ok(LimitState {
                power_unit: 3,
                unit_watts: 0.125,
                msr: *self.msr.borrow(),
                mmio: *self.mmio.borrow(),
            })
        }

        fn read_register(&self, target: RegisterTarget) -> crate::error::Result<u64> {
            Ok(match target {
                RegisterTarget::Msr => *self.msr.borrow(),
                RegisterTarget::Mmio => *self.mmio.borrow(),
            })
        }

        fn write_register(&self, target: RegisterTarget, value: u64) -> crate::error::Result<()> {
            match target {
                RegisterTarget::Msr => *self.msr.borrow_mut() = value,
                RegisterTarget::Mmio => *self.mmio.borrow_mut() = value,
            }
            Ok(())
        }

        fn write_powercap(&self, pl1_uw: u64, pl2_uw: u64) -> crate::error::Result<()> {
            *self.powercap.borrow_mut() = Some((pl1_uw, pl2_uw));
            Ok(())
        }
    }

    #[test]
    fn test_serve_requests() {
        let access = FakeAccess {
            msr: RefCell::new(0x1),
            mmio: RefCell::new(0x2),
            powercap: RefCell::new(None),
        };

        let body = serve_request(&access, &Request::ReadState).unwrap().unwrap();
        assert!(body.contains("MSR=0x0000000000000001"));

        let none = serve_request(
            &access,
            &Request::WriteRegister {
                target: RegisterTarget::Mmio,
                value: 0xABCD,
            },
        )
        .unwrap();
        assert!(none.is_none());
        assert_eq!(*access.mmio.borrow(), 0xABCD);

        serve_request(
            &access,
            &Request::WritePowercap {
                pl1_uw: 10,
                pl2_uw: 20,
            },
        )
        .unwrap();
        assert_eq!(*access.powercap.borrow(), Some((10, 20)));
    }
}

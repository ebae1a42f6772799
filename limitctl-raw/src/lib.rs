//! # limitctl-raw
//!
//! Register definitions and codecs for Intel package power-limit control.
//!
//! The package power limit (PL1 sustained / PL2 short-term) is exposed twice
//! on client platforms: as MSR `IA32_PKG_POWER_LIMIT` (0x610) and as a
//! memory-mapped register inside the MCHBAR window. Both carry the same
//! 64-bit layout. This crate provides the bit-exact encode/decode for that
//! layout, the watt/hardware-unit conversion driven by `MSR_RAPL_POWER_UNIT`,
//! the MCHBAR base-address decoding, and the core voltage-offset
//! quantization step. No I/O happens here; transports live in the agent.
//!
//! The bit layout is the one verified on the tested platform family.
//! Correctness on other hardware is not guaranteed.

pub mod mchbar;
pub mod rapl;
pub mod register;
pub mod voltage;

// Re-export for convenience
pub use mchbar::{decode_base, MchbarError};
pub use rapl::{pl_units, set_pl_units, units_to_watts, watts_to_units, CodecError};
pub use register::RegisterLayout;

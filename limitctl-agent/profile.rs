//! Operator profiles: power limits, ratio targets, core voltage offset
//!
//! Stored as versioned JSON. Loading validates every field up front; the
//! apply path only consumes the wattages, while the ratio and voltage
//! fields travel with the profile for the controls that own them. The
//! voltage offset is snapped to the hardware step on display so the
//! operator sees the value that would actually land.

use std::path::Path;

use serde::{Deserialize, Serialize};

use limitctl_raw::voltage;

use crate::error::{io_error, LimitctlError, Result};

pub const PROFILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub version: u32,
    pub pl1_w: f64,
    pub pl2_w: f64,
    pub p_ratio: u32,
    pub e_ratio: u32,
    pub core_uv_mv: f64,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| io_error(&format!("read profile {}", path.display()), &e))?;
        let profile: Profile = serde_json::from_str(&text).map_err(|e| {
            LimitctlError::ParseError(format!("profile {}: {e}", path.display()))
        })?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self).map_err(|e| {
            LimitctlError::ParseError(format!("serialize profile: {e}"))
        })?;
        std::fs::write(path, text)
            .map_err(|e| io_error(&format!("write profile {}", path.display()), &e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != PROFILE_VERSION {
            return Err(LimitctlError::InvalidConfiguration(format!(
                "unsupported profile version {}",
                self.version
            )));
        }
        if !(self.pl1_w > 0.0) || !(self.pl2_w > 0.0) {
            return Err(LimitctlError::InvalidConfiguration(format!(
                "profile watts must be positive (pl1_w={}, pl2_w={})",
                self.pl1_w, self.pl2_w
            )));
        }
        if self.p_ratio == 0 || self.e_ratio == 0 {
            return Err(LimitctlError::InvalidConfiguration(format!(
                "profile ratios must be positive (p_ratio={}, e_ratio={})",
                self.p_ratio, self.e_ratio
            )));
        }
        Ok(())
    }

    /// The voltage offset after hardware quantization
    pub fn quantized_core_uv_mv(&self) -> f64 {
        voltage::quantize_offset_mv(self.core_uv_mv)
    }

    /// Whether the quantized offset must be reported alongside the request
    pub fn core_uv_needs_report(&self) -> bool {
        voltage::offset_differs(self.core_uv_mv, self.quantized_core_uv_mv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Profile {
        Profile {
            version: 1,
            pl1_w: 55.0,
            pl2_w: 157.0,
            p_ratio: 42,
            e_ratio: 33,
            core_uv_mv: -50.0,
        }
    }

    #[test]
    fn test_profile_json_round_trip() {
        let dir = std::env::temp_dir().join(format!("limitctl-profile-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("profile.json");

        let profile = sample();
        profile.save(&path).unwrap();
        let loaded = Profile::load(&path).unwrap();
        assert_eq!(loaded, profile);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_profile_rejects_unknown_version() {
        let profile = Profile {
            version: 2,
            ..sample()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_profile_rejects_nonpositive_fields() {
        assert!(Profile { pl1_w: 0.0, ..sample() }.validate().is_err());
        assert!(Profile { pl2_w: -1.0, ..sample() }.validate().is_err());
        assert!(Profile { p_ratio: 0, ..sample() }.validate().is_err());
        assert!(Profile { e_ratio: 0, ..sample() }.validate().is_err());
    }

    #[test]
    fn test_profile_rejects_missing_field() {
        let text = r#"{"version":1,"pl1_w":55.0,"pl2_w":157.0,"p_ratio":42,"e_ratio":33}"#;
        assert!(serde_json::from_str::<Profile>(text).is_err());
    }

    #[test]
    fn test_quantized_offset_report() {
        let profile = sample();
        assert!((profile.quantized_core_uv_mv() - (-49.8046875)).abs() < 1e-9);
        assert!(profile.core_uv_needs_report());
    }
}

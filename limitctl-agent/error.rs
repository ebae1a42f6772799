use std::io;

use thiserror::Error;

use limitctl_raw::mchbar::MchbarError;
use limitctl_raw::rapl::CodecError;

#[derive(Error, Debug)]
pub enum LimitctlError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("MCHBAR appears disabled (config 0x48 = {raw:#018x})")]
    Disabled { raw: u64 },

    #[error("MCHBAR base resolved to zero (config 0x48 = {raw:#018x})")]
    ZeroBase { raw: u64 },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error(transparent)]
    OutOfRange(#[from] CodecError),

    #[error("inconsistent state read: {0}")]
    InconsistentRead(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<MchbarError> for LimitctlError {
    fn from(err: MchbarError) -> Self {
        match err {
            MchbarError::Disabled { raw } => LimitctlError::Disabled { raw },
            MchbarError::ZeroBase { raw } => LimitctlError::ZeroBase { raw },
        }
    }
}

/// Map an I/O failure to the taxonomy, keeping permission problems distinct:
/// they are actionable for the operator (run as root, load the msr module)
/// where a short or failed transfer on a permitted resource is not.
pub fn io_error(context: &str, err: &io::Error) -> LimitctlError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        LimitctlError::AccessDenied(format!("{context}: {err}"))
    } else {
        LimitctlError::IoError(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, LimitctlError>;

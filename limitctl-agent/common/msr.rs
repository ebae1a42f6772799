use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use crate::error::{io_error, LimitctlError, Result};

/// Handle on one logical CPU's MSR device
///
/// Register numbers are used as file offsets; every transfer is a
/// positioned 8-byte read or write.
pub struct MsrHandle {
    file: parking_lot::Mutex<File>,
    cpu: u32,
}

impl MsrHandle {
    pub fn open(cpu: u32) -> Result<Self> {
        let path = format!("/dev/cpu/{cpu}/msr");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LimitctlError::DeviceNotFound(format!(
                    "{path} missing; load the msr kernel module (modprobe msr)"
                )),
                _ => io_error(&format!("open {path}"), &e),
            })?;

        tracing::info!("Opened MSR handle {} for CPU {}", file.as_raw_fd(), cpu);

        Ok(Self {
            file: parking_lot::Mutex::new(file),
            cpu,
        })
    }

    pub fn read(&self, reg: u64) -> Result<u64> {
        let mut file = self.file.lock();
        let context = format!("MSR {reg:#x} on CPU {}", self.cpu);

        file.seek(SeekFrom::Start(reg))
            .map_err(|e| io_error(&context, &e))?;

        let mut buffer = [0u8; 8];
        file.read_exact(&mut buffer)
            .map_err(|e| io_error(&context, &e))?;

        let value = u64::from_ne_bytes(buffer);
        tracing::debug!("MSR read: CPU {} MSR {reg:#010x} = {value:#018x}", self.cpu);
        Ok(value)
    }

    pub fn write(&self, reg: u64, value: u64) -> Result<()> {
        let mut file = self.file.lock();
        let context = format!("MSR {reg:#x} on CPU {}", self.cpu);

        file.seek(SeekFrom::Start(reg))
            .map_err(|e| io_error(&context, &e))?;

        file.write_all(&value.to_ne_bytes())
            .map_err(|e| io_error(&context, &e))?;

        tracing::debug!("MSR write: CPU {} MSR {reg:#010x} = {value:#018x}", self.cpu);
        Ok(())
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }
}

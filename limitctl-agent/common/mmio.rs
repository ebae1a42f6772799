use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{io_error, LimitctlError, Result};

const DEV_MEM: &str = "/dev/mem";

/// Shared read-write mapping of a physical register window
///
/// 64-bit registers behind this window do not support atomic 64-bit
/// transfers; accesses are composed from two 32-bit volatile halves, low
/// word first on write. The mapping is released on drop, on every exit
/// path.
pub struct MmioRegion {
    base: NonNull<libc::c_void>,
    len: usize,
    phys_base: u64,
}

impl MmioRegion {
    /// Map `len` bytes of physical memory starting at `phys_base`
    pub fn map(phys_base: u64, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(DEV_MEM)
            .map_err(|e| io_error(&format!("open {DEV_MEM}"), &e))?;

        let length = NonZeroUsize::new(len).ok_or_else(|| {
            LimitctlError::InvalidConfiguration("MMIO mapping length is zero".into())
        })?;

        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                phys_base as libc::off_t,
            )
        }
        .map_err(|e| {
            LimitctlError::IoError(format!("mmap {len:#x} bytes at {phys_base:#x}: {e}"))
        })?;

        tracing::info!("Mapped MMIO window {phys_base:#x}..{:#x}", phys_base + len as u64);

        // The fd is no longer needed once the mapping exists
        Ok(Self {
            base,
            len,
            phys_base,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn word_ptr(&self, offset: u32) -> Result<*mut u32> {
        if offset as usize + 8 > self.len {
            return Err(LimitctlError::InvalidConfiguration(format!(
                "offset {offset:#x} outside mapped window of {:#x} bytes",
                self.len
            )));
        }
        // offset is bounds-checked above; the window is at least 8 bytes wide
        Ok(unsafe { self.base.as_ptr().cast::<u8>().add(offset as usize) }.cast::<u32>())
    }

    /// Read a 64-bit register as two 32-bit halves, low word first
    pub fn read64(&self, offset: u32) -> Result<u64> {
        let p32 = self.word_ptr(offset)?;
        let value = unsafe {
            let lo = p32.read_volatile() as u64;
            let hi = p32.add(1).read_volatile() as u64;
            lo | (hi << 32)
        };
        tracing::debug!(
            "MMIO read: {:#x}+{offset:#06x} = {value:#018x}",
            self.phys_base
        );
        Ok(value)
    }

    /// Write a 64-bit register as two 32-bit halves, low word first,
    /// followed by a readback of the high word to post the write
    pub fn write64(&self, offset: u32, value: u64) -> Result<()> {
        let p32 = self.word_ptr(offset)?;
        unsafe {
            p32.write_volatile((value & 0xFFFF_FFFF) as u32);
            p32.add(1).write_volatile((value >> 32) as u32);
            let _ = p32.add(1).read_volatile();
        }
        tracing::debug!(
            "MMIO write: {:#x}+{offset:#06x} = {value:#018x}",
            self.phys_base
        );
        Ok(())
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            tracing::warn!("munmap of MMIO window failed: {e}");
        }
    }
}

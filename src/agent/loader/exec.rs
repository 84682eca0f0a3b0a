//! Executable Memory Regions
//!
//! A loaded module's code lives in an anonymous mapping owned by exactly one
//! `LoadedModule`. The region follows a strict W^X lifecycle: it is writable
//! while the artifact is copied in, then sealed read+execute before the
//! first call. On release the pages are scrubbed back to zero before the
//! mapping is torn down, so stale code can never be observed through a
//! recycled mapping.

use std::io;
use std::ptr;

use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("cannot map an empty region")]
    Empty,
    #[error("mmap failed: {0}")]
    Alloc(io::Error),
    #[error("mprotect failed: {0}")]
    Protect(io::Error),
    #[error("region already sealed")]
    Sealed,
    #[error("artifact of {got} bytes does not fit region of {capacity}")]
    Oversize { got: usize, capacity: usize },
}

/// An owned, page-aligned memory region with an execute lifecycle.
pub struct ExecRegion {
    ptr: *mut u8,
    len: usize,
    map_len: usize,
    sealed: bool,
}

impl ExecRegion {
    /// Map a writable anonymous region large enough for `len` bytes.
    pub fn new(len: usize) -> Result<Self, ExecError> {
        if len == 0 {
            return Err(ExecError::Empty);
        }
        let page = page_size();
        let map_len = len.div_ceil(page) * page;

        // SAFETY: anonymous private mapping with no fixed address; the
        // kernel picks placement and the result is checked against
        // MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ExecError::Alloc(io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
            map_len,
            sealed: false,
        })
    }

    /// Copy the artifact into the region. Only valid before `seal`.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<(), ExecError> {
        if self.sealed {
            return Err(ExecError::Sealed);
        }
        if bytes.len() > self.len {
            return Err(ExecError::Oversize {
                got: bytes.len(),
                capacity: self.len,
            });
        }
        // SAFETY: the region is mapped RW, at least `bytes.len()` long, and
        // the source slice cannot overlap a fresh anonymous mapping.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, bytes.len());
        }
        Ok(())
    }

    /// Drop write permission, gain execute permission, and synchronize the
    /// instruction cache. Must be called before the entry point is invoked.
    pub fn seal(&mut self) -> Result<(), ExecError> {
        if self.sealed {
            return Err(ExecError::Sealed);
        }
        // SAFETY: `ptr`/`map_len` describe a mapping this region owns.
        let rc = unsafe { libc::mprotect(self.ptr.cast(), self.map_len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(ExecError::Protect(io::Error::last_os_error()));
        }
        // SAFETY: the range was just written and remapped; required on
        // targets with split I/D caches before the first instruction fetch.
        unsafe {
            sync_icache(self.ptr, self.len);
        }
        self.sealed = true;
        Ok(())
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether `ptr` points inside this region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr as usize;
        (start..start + self.len).contains(&(ptr as usize))
    }
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by this region and no entry into it
        // can be live once the owner is dropped (`deinitialize` is the last
        // call, made before the registry drops the record). The pages are
        // made writable again, scrubbed, then unmapped.
        unsafe {
            if libc::mprotect(
                self.ptr.cast(),
                self.map_len,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
            {
                ptr::write_bytes(self.ptr, 0, self.map_len);
            } else {
                warn!("failed to unprotect code region for scrubbing");
            }
            if libc::munmap(self.ptr.cast(), self.map_len) != 0 {
                warn!("munmap of code region failed: {}", io::Error::last_os_error());
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Instruction-cache synchronization after writing code.
///
/// # Safety
///
/// `start..start+len` must be a valid, mapped range.
#[cfg(target_arch = "aarch64")]
unsafe fn sync_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    // Cache line geometry from CTR_EL0 (readable at EL0 on Linux).
    let ctr: u64;
    asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack));
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);

    let end = start as usize + len;

    let mut addr = (start as usize) & !(dline - 1);
    while addr < end {
        asm!("dc cvau, {}", in(reg) addr, options(nostack));
        addr += dline;
    }
    asm!("dsb ish", options(nostack));

    let mut addr = (start as usize) & !(iline - 1);
    while addr < end {
        asm!("ic ivau, {}", in(reg) addr, options(nostack));
        addr += iline;
    }
    asm!("dsb ish", "isb", options(nostack));
}

/// x86 keeps instruction and data caches coherent; nothing to do.
#[cfg(not(target_arch = "aarch64"))]
unsafe fn sync_icache(_start: *const u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_lifecycle() {
        let mut region = ExecRegion::new(64).unwrap();
        assert!(!region.is_sealed());
        region.fill(&[0u8; 64]).unwrap();
        region.seal().unwrap();
        assert!(region.is_sealed());
        assert!(matches!(region.fill(&[0u8; 1]), Err(ExecError::Sealed)));
        assert!(matches!(region.seal(), Err(ExecError::Sealed)));
    }

    #[test]
    fn test_empty_and_oversize() {
        assert!(matches!(ExecRegion::new(0), Err(ExecError::Empty)));
        let mut region = ExecRegion::new(8).unwrap();
        assert!(matches!(
            region.fill(&[0u8; 9]),
            Err(ExecError::Oversize { got: 9, capacity: 8 })
        ));
    }

    #[test]
    fn test_contains() {
        let region = ExecRegion::new(16).unwrap();
        assert!(region.contains(region.as_ptr()));
        // SAFETY: pointer arithmetic only, never dereferenced.
        assert!(region.contains(unsafe { region.as_ptr().add(15) }));
        assert!(!region.contains(unsafe { region.as_ptr().add(16) }));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_sealed_region_executes() {
        // mov eax, 42; ret
        let code = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let mut region = ExecRegion::new(code.len()).unwrap();
        region.fill(&code).unwrap();
        region.seal().unwrap();

        // SAFETY: the region holds a complete function with the C calling
        // convention and has just been sealed read+execute.
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(region.as_ptr()) };
        assert_eq!(f(), 42);
    }
}

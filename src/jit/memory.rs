//! Executable memory management using mmap.
//!
//! Compiled bodies are appended to page-aligned slabs. Each install is
//! rounded up to whole pages so that flipping its pages to read+execute
//! never touches code that another thread may be running.

use std::ptr::NonNull;

use thiserror::Error;
use tracing::debug;

/// Pages reserved per slab unless a single body needs more.
const SLAB_PAGES: usize = 16;

/// Error type for memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("executable memory allocation of {size} bytes failed: {source}")]
    AllocationFailed {
        size: usize,
        source: std::io::Error,
    },
    #[error("memory protection change failed: {0}")]
    ProtectionFailed(std::io::Error),
    #[error("invalid memory size {0}")]
    InvalidSize(usize),
    #[error("executable memory is not supported on this platform")]
    Unsupported,
}

/// One mmap'd region. Pages below `used` hold installed code and are
/// read+execute; the rest are still writable.
struct Slab {
    ptr: NonNull<u8>,
    size: usize,
    used: usize,
}

impl Slab {
    #[cfg(unix)]
    fn new(size: usize) -> Result<Self, MemoryError> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed {
                size,
                source: std::io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed {
            size,
            source: std::io::Error::other("mmap returned null"),
        })?;
        Ok(Self { ptr, size, used: 0 })
    }

    #[cfg(not(unix))]
    fn new(_size: usize) -> Result<Self, MemoryError> {
        Err(MemoryError::Unsupported)
    }

    fn remaining(&self) -> usize {
        self.size - self.used
    }

    /// Copies `code` to the next free pages and makes them executable.
    #[cfg(unix)]
    fn install(&mut self, code: &[u8], span: usize) -> Result<*const u8, MemoryError> {
        // SAFETY: `used + span <= size`, checked by the caller.
        let dest = unsafe { self.ptr.as_ptr().add(self.used) };
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), dest, code.len());
        }
        // SAFETY: `dest` is page aligned and the range lies in this mapping.
        let result =
            unsafe { libc::mprotect(dest as *mut libc::c_void, span, libc::PROT_READ | libc::PROT_EXEC) };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed(std::io::Error::last_os_error()));
        }
        flush_icache(dest, code.len());
        self.used += span;
        Ok(dest)
    }

    #[cfg(not(unix))]
    fn install(&mut self, _code: &[u8], _span: usize) -> Result<*const u8, MemoryError> {
        Err(MemoryError::Unsupported)
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: the mapping was created by `Slab::new` with this size.
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
    }
}

/// Makes freshly written instructions visible to instruction fetch.
#[cfg(target_arch = "aarch64")]
fn flush_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from user space on the supported systems.
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr) };
    let dline = 4usize << ((ctr >> 16) & 0xF);
    let iline = 4usize << (ctr & 0xF);
    let end = start as usize + len;

    let mut addr = start as usize & !(dline - 1);
    while addr < end {
        // SAFETY: cache maintenance on an address inside our mapping.
        unsafe { asm!("dc cvau, {}", in(reg) addr) };
        addr += dline;
    }
    // SAFETY: barriers have no memory operands.
    unsafe { asm!("dsb ish") };
    let mut addr = start as usize & !(iline - 1);
    while addr < end {
        // SAFETY: cache maintenance on an address inside our mapping.
        unsafe { asm!("ic ivau, {}", in(reg) addr) };
        addr += iline;
    }
    unsafe { asm!("dsb ish", "isb") };
}

/// x86-64 keeps instruction and data caches coherent.
#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: *const u8, _len: usize) {}

/// Owner of every slab holding compiled code. Slabs live until the manager
/// is dropped at runtime shutdown.
pub struct PageManager {
    slabs: Vec<Slab>,
    page_size: usize,
}

impl PageManager {
    pub fn new() -> Self {
        Self {
            slabs: Vec::new(),
            page_size: page_size(),
        }
    }

    /// Copies `code` into executable memory and returns its address.
    pub fn install(&mut self, code: &[u8]) -> Result<*const u8, MemoryError> {
        if code.is_empty() {
            return Err(MemoryError::InvalidSize(0));
        }
        let span = code.len().div_ceil(self.page_size) * self.page_size;

        let slab = match self.slabs.iter().position(|s| s.remaining() >= span) {
            Some(i) => &mut self.slabs[i],
            None => {
                let size = span.max(SLAB_PAGES * self.page_size);
                self.slabs.push(Slab::new(size)?);
                debug!(target: "jit", size, slabs = self.slabs.len(), "new code slab");
                let last = self.slabs.len() - 1;
                &mut self.slabs[last]
            }
        };
        slab.install(code, span)
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Bytes handed out to compiled bodies, including page padding.
    pub fn bytes_used(&self) -> usize {
        self.slabs.iter().map(|s| s.used).sum()
    }
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

// Slabs are only mutated through `&mut PageManager`, which the runtime keeps
// behind a mutex.
unsafe impl Send for PageManager {}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

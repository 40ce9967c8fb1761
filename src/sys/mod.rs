//! Address-space reservation below the 2GB ceiling.
//!
//! Loaded images and everything passed to them by address must live in a
//! window of `[base, base + 2GB)`, where `base` is 0 for plain 32-bit mode or
//! a discovered free region next to the host module in pointer-offset mode.
//! The [`AddressSpace`] capability hides how a platform finds room in that
//! window; the image formats only ever talk to the trait.
//!
//! POSIX hosts share one `mmap` backend (`unix`) and differ only in how the
//! used regions are enumerated (`linux`, `darwin`). Windows has its own
//! backend over `VirtualQuery`/`VirtualAlloc`.

#[cfg(target_os = "macos")]
pub mod darwin;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(unix)]
mod unix;

#[cfg(windows)]
pub mod windows;

pub(crate) mod placement;

#[cfg(target_os = "macos")]
use darwin as os;

#[cfg(target_os = "linux")]
use linux as os;

#[cfg(unix)]
pub use unix::HostAddressSpace;

#[cfg(windows)]
pub use windows::HostAddressSpace;

use crate::mmap::MappedFile;
use crate::{Error, Result};
use std::sync::{Arc, OnceLock};
use tracing::trace;

/// Size of the low address window.
pub const WINDOW_SIZE: u64 = 0x8000_0000;

/// Lowest window-relative address handed out; the first 1MB+64KB are left
/// alone so that small integers never alias mapped memory.
pub const WINDOW_FLOOR: u64 = 1024 * 1024 + 65536;

/// Page protection, in the loader's own encoding. Each backend translates
/// it to the host's flags.
pub type Prot = u32;

pub const PROT_NONE: Prot = 0;
pub const PROT_READ: Prot = 1;
pub const PROT_WRITE: Prot = 2;
pub const PROT_EXEC: Prot = 4;

/// Reservation and mapping primitives for the low address window.
pub trait AddressSpace: Send + Sync {
    /// Host page size.
    fn page_size(&self) -> u64;

    /// Alignment of reservation start addresses.
    fn allocation_granularity(&self) -> u64 {
        self.page_size()
    }

    /// Start of the 2GB window; 0 in plain 32-bit mode.
    fn window_base(&self) -> u64;

    /// Find and map `size` bytes inside the window. With `reserve_only` the
    /// pages are inaccessible and not backed; otherwise they are read/write.
    fn map_low(&self, size: u64, reserve_only: bool) -> Result<u64>;

    /// Reserve `[addr, addr + size)` exactly, failing if any of it is in use.
    fn reserve_at(&self, addr: u64, size: u64) -> Result<u64>;

    /// Back reserved pages with zeroed read/write memory.
    fn commit(&self, addr: u64, size: u64) -> Result<()>;

    /// Map file contents over reserved pages with final protection.
    fn map_file(&self, addr: u64, size: u64, prot: Prot, file: &MappedFile, offset: u64)
    -> Result<()>;

    /// Change protection of committed pages.
    fn protect(&self, addr: u64, size: u64, prot: Prot) -> Result<()>;

    /// Drop the backing of committed pages, keeping the reservation.
    fn decommit(&self, addr: u64, size: u64) -> Result<()>;

    /// Return a range to the system. Null or empty ranges are ignored.
    fn release(&self, addr: u64, size: u64);

    /// End of the window (exclusive).
    fn window_end(&self) -> u64 {
        self.window_base() + WINDOW_SIZE
    }

    /// Fail unless `[addr, addr + size)` lies inside the window.
    fn check_window(&self, addr: u64, size: u64) -> Result<()> {
        match addr.checked_add(size) {
            Some(end) if addr >= self.window_base() && end <= self.window_end() => Ok(()),
            _ => Err(Error::MemoryMapping(format!(
                "address range 0x{:x}+0x{:x} is outside the window 0x{:x}-0x{:x}",
                addr,
                size,
                self.window_base(),
                self.window_end()
            ))),
        }
    }

    /// Translate a host address inside the window to the 32-bit value
    /// loaded code uses for it.
    fn to_guest(&self, addr: u64) -> Result<u32> {
        let base = self.window_base();
        match addr.checked_sub(base) {
            Some(offset) if offset < WINDOW_SIZE => Ok(offset as u32),
            _ => Err(Error::Bridge(format!(
                "address 0x{:x} is outside the low window at 0x{:x}",
                addr, base
            ))),
        }
    }

    /// Translate a 32-bit value used by loaded code back to a host address.
    fn from_guest(&self, value: u32) -> u64 {
        self.window_base() + u64::from(value)
    }
}

pub(crate) fn round_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

pub(crate) fn round_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// The process-wide plain 32-bit address space.
pub fn host() -> Arc<dyn AddressSpace> {
    static HOST: OnceLock<Arc<HostAddressSpace>> = OnceLock::new();
    HOST.get_or_init(|| Arc::new(HostAddressSpace::new())).clone()
}

/// An owned range of the low window, released on drop.
pub struct Region {
    space: Arc<dyn AddressSpace>,
    addr: u64,
    size: u64,
}

impl Region {
    /// Reserve or commit `size` bytes somewhere in the window.
    pub fn map(space: &Arc<dyn AddressSpace>, size: u64, reserve_only: bool) -> Result<Self> {
        let addr = space.map_low(size, reserve_only)?;
        Ok(Self {
            space: space.clone(),
            addr,
            size: round_up(size, space.page_size()),
        })
    }

    /// Reserve exactly `[addr, addr + size)`.
    pub fn reserve_at(space: &Arc<dyn AddressSpace>, addr: u64, size: u64) -> Result<Self> {
        space.check_window(addr, size)?;
        let addr = space.reserve_at(addr, size)?;
        Ok(Self {
            space: space.clone(),
            addr,
            size,
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        trace!("Releasing 0x{:x} bytes at 0x{:016x}", self.size, self.addr);
        self.space.release(self.addr, self.size);
    }
}

/// Committed read/write memory inside the low window.
///
/// Anything the loaded image receives by address (settings, data file,
/// MIDI buffers, output samples) has to be allocated here.
pub struct LowMemory {
    region: Region,
    len: usize,
    committed: bool,
}

impl LowMemory {
    pub fn new(space: &Arc<dyn AddressSpace>, len: usize) -> Result<Self> {
        Self::map(space, len, false)
    }

    fn map(space: &Arc<dyn AddressSpace>, len: usize, reserve_only: bool) -> Result<Self> {
        let region = Region::map(space, len as u64, reserve_only)?;
        Ok(Self {
            region,
            len,
            committed: !reserve_only,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.region.addr() as *const u8
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.region.addr() as *mut u8
    }

    pub fn addr(&self) -> u64 {
        self.region.addr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// The value loaded code uses to refer to this memory.
    pub fn guest_addr(&self) -> Result<u32> {
        self.region.space().to_guest(self.region.addr())
    }

    pub fn as_slice(&self) -> &[u8] {
        if !self.committed {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if !self.committed {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }
}

/// Reserve (`reserve_only`) or commit `size` bytes below 2GB in the
/// process-wide window.
pub fn map_memory(size: u32, reserve_only: bool) -> Result<LowMemory> {
    LowMemory::map(&host(), size as usize, reserve_only)
}

/// Release memory obtained from [`map_memory`].
pub fn unmap_memory(memory: LowMemory) {
    drop(memory);
}

/// Flush the instruction cache for the given range
pub fn flush_icache_range(start: *const u8, size: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    unsafe {
        sys_icache_invalidate(start as *mut libc::c_void, size);
    }

    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    unsafe {
        __clear_cache(start as *mut libc::c_char, start.add(size) as *mut libc::c_char);
    }

    #[cfg(windows)]
    windows::flush_icache(start, size);

    #[cfg(all(not(target_arch = "aarch64"), unix))]
    {
        // x86-64 has coherent I-cache
        let _ = (start, size);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, size: libc::size_t);
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
unsafe extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

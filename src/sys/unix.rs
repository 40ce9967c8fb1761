//! POSIX backend of the low window: `mmap`, `mprotect` and `munmap` over a
//! free-region search supplied by the Linux or macOS submodule.

use super::{
    AddressSpace, PROT_EXEC, PROT_READ, PROT_WRITE, Prot, WINDOW_FLOOR, WINDOW_SIZE, os,
    placement, round_up,
};
use crate::mmap::MappedFile;
use crate::{Error, Result};
use tracing::{debug, error, trace};

fn posix_prot(prot: Prot) -> libc::c_int {
    let mut out = libc::PROT_NONE;
    if prot & PROT_READ != 0 {
        out |= libc::PROT_READ;
    }
    if prot & PROT_WRITE != 0 {
        out |= libc::PROT_WRITE;
    }
    if prot & PROT_EXEC != 0 {
        out |= libc::PROT_EXEC;
    }
    out
}

fn host_page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as u64 }
}

/// Load address of the module containing this crate's code.
fn host_module_base() -> Result<u64> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let this_fn = host_module_base as *const libc::c_void;
    if unsafe { libc::dladdr(this_fn, &mut info) } == 0 || info.dli_fbase.is_null() {
        return Err(Error::MemoryMapping(
            "cannot locate the host module".to_string(),
        ));
    }
    Ok(info.dli_fbase as u64)
}

/// Outcome of a single placement attempt.
enum Placement {
    Exact(u64),
    Failed,
    Elsewhere,
}

/// The host operating system's view of the low window.
pub struct HostAddressSpace {
    window_base: u64,
    page_size: u64,
    /// Guard reservation at the bottom of a pointer-offset window.
    guard: Option<(u64, u64)>,
}

impl Default for HostAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAddressSpace {
    /// Plain 32-bit mode: the window starts at address zero.
    pub fn new() -> Self {
        Self {
            window_base: 0,
            page_size: host_page_size(),
            guard: None,
        }
    }

    /// Pointer-offset mode: the window starts at a free region found below
    /// the module containing this crate.
    pub fn with_pointer_offset() -> Result<Self> {
        let page_size = host_page_size();
        let min_length = round_up(WINDOW_FLOOR, page_size);
        let module_base = host_module_base()?;

        let used = os::used_regions(0, u64::MAX)?;
        let base = placement::pointer_offset(&used, module_base, min_length).ok_or_else(|| {
            Error::MemoryMapping("no free region below the host module".to_string())
        })?;

        let mut space = Self {
            window_base: base,
            page_size,
            guard: None,
        };
        if base != 0 {
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            if let Placement::Exact(addr) =
                space.place(base, min_length, libc::PROT_NONE, flags | os::FIXED_FLAGS)
            {
                space.guard = Some((addr, min_length));
            }
        }
        debug!(
            "Pointer offset 0x{:016x} (module at 0x{:016x})",
            space.window_base, module_base
        );
        Ok(space)
    }

    /// Try to map exactly at `addr`; a mapping that lands elsewhere is undone.
    fn place(&self, addr: u64, size: u64, prot: libc::c_int, flags: libc::c_int) -> Placement {
        let mem = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size as usize,
                prot,
                flags,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Placement::Failed;
        }
        if mem as u64 == addr {
            return Placement::Exact(addr);
        }
        unsafe {
            libc::munmap(mem, size as usize);
        }
        Placement::Elsewhere
    }

}

impl Drop for HostAddressSpace {
    fn drop(&mut self) {
        if let Some((addr, size)) = self.guard.take() {
            self.release(addr, size);
        }
    }
}

impl AddressSpace for HostAddressSpace {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn window_base(&self) -> u64 {
        self.window_base
    }

    fn map_low(&self, size: u64, reserve_only: bool) -> Result<u64> {
        if size == 0 {
            return Err(Error::MemoryMapping("zero-sized mapping".to_string()));
        }
        if size > WINDOW_SIZE {
            return Err(Error::MemoryMapping(format!(
                "mapping of 0x{:x} bytes does not fit below 2GB",
                size
            )));
        }
        let size = round_up(size, self.page_size);

        let prot = if reserve_only {
            libc::PROT_NONE
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if reserve_only {
            flags |= libc::MAP_NORESERVE;
        }

        if self.window_base == 0
            && let Some(addr) = os::map_32bit(size, prot, flags)
        {
            trace!("Mapped 0x{:x} bytes at 0x{:016x} (32-bit hint)", size, addr);
            return Ok(addr);
        }

        let used = os::used_regions(self.window_base, self.window_end())?;
        let floor = os::search_floor(self.window_base, &used, self.page_size);
        let candidates =
            placement::candidates(&used, floor, self.window_end(), size, self.page_size);
        for addr in candidates {
            match self.place(addr, size, prot, flags | os::FIXED_FLAGS) {
                Placement::Exact(addr) => {
                    trace!("Mapped 0x{:x} bytes at 0x{:016x}", size, addr);
                    return Ok(addr);
                }
                Placement::Failed => continue,
                Placement::Elsewhere => {
                    error!("memory mapped at different address");
                    return Err(Error::MemoryMapping(
                        "memory mapped at different address".to_string(),
                    ));
                }
            }
        }
        Err(Error::MemoryMapping(format!(
            "no free region of 0x{:x} bytes below 2GB",
            size
        )))
    }

    fn reserve_at(&self, addr: u64, size: u64) -> Result<u64> {
        self.check_window(addr, size)?;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        match self.place(addr, size, libc::PROT_NONE, flags | os::EXCLUSIVE_FLAGS) {
            Placement::Exact(addr) => Ok(addr),
            _ => Err(Error::MemoryMapping(format!(
                "address range 0x{:x}-0x{:x} is not available",
                addr,
                addr.saturating_add(size)
            ))),
        }
    }

    fn commit(&self, addr: u64, size: u64) -> Result<()> {
        let mem = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn map_file(
        &self,
        addr: u64,
        size: u64,
        prot: Prot,
        file: &MappedFile,
        offset: u64,
    ) -> Result<()> {
        let mem = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size as usize,
                posix_prot(prot),
                libc::MAP_PRIVATE | libc::MAP_FIXED,
                file.fd(),
                offset as libc::off_t,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn protect(&self, addr: u64, size: u64, prot: Prot) -> Result<()> {
        let ret =
            unsafe { libc::mprotect(addr as *mut libc::c_void, size as usize, posix_prot(prot)) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn decommit(&self, addr: u64, size: u64) -> Result<()> {
        let mem = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn release(&self, addr: u64, size: u64) {
        if addr != 0 && size != 0 {
            unsafe {
                libc::munmap(addr as *mut libc::c_void, size as usize);
            }
        }
    }
}


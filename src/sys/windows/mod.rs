//! Windows backend of the low window.
//!
//! Free regions are found by walking `VirtualQuery` from the window base
//! upward. Reservations must start on the allocation granularity (64KB), so
//! used regions are widened to it before the gap search; pages are then
//! reserved and committed with `VirtualAlloc`.

use super::{
    AddressSpace, PROT_EXEC, PROT_READ, PROT_WRITE, Prot, WINDOW_FLOOR, WINDOW_SIZE, placement,
    round_up,
};
use crate::mmap::MappedFile;
use crate::{Error, Result};
use core::ffi::c_void;
use std::ops::Range;
use tracing::{debug, error, trace};
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::LibraryLoader::{
    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    GetModuleHandleExW,
};
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_FREE, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION,
    PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, VIRTUAL_ALLOCATION_TYPE, VirtualAlloc,
    VirtualFree, VirtualProtect, VirtualQuery,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

fn page_protection(prot: Prot) -> PAGE_PROTECTION_FLAGS {
    match (prot & PROT_EXEC != 0, prot & PROT_WRITE != 0, prot & PROT_READ != 0) {
        (true, true, _) => PAGE_EXECUTE_READWRITE,
        (true, false, true) => PAGE_EXECUTE_READ,
        (true, false, false) => PAGE_EXECUTE,
        (false, true, _) => PAGE_READWRITE,
        (false, false, true) => PAGE_READONLY,
        (false, false, false) => PAGE_NOACCESS,
    }
}

/// `(page size, allocation granularity)`
fn system_info() -> (u64, u64) {
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    let page = if info.dwPageSize == 0 { 4096 } else { u64::from(info.dwPageSize) };
    let granularity = u64::from(info.dwAllocationGranularity).max(page);
    (page, granularity)
}

/// Load address of the module containing this crate's code.
fn host_module_base() -> Result<u64> {
    let mut module: HMODULE = std::ptr::null_mut();
    let this_fn = host_module_base as *const u16;
    let ok = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            this_fn,
            &mut module,
        )
    };
    if ok == 0 || module.is_null() {
        return Err(Error::MemoryMapping(
            "cannot locate the host module".to_string(),
        ));
    }
    Ok(module as u64)
}

/// Regions in `[lo, hi)` that are reserved or committed, widened to
/// `granularity`, in ascending order.
fn used_regions(lo: u64, hi: u64, granularity: u64) -> Vec<Range<u64>> {
    let mut regions: Vec<Range<u64>> = Vec::new();
    let mut addr = lo;
    while addr < hi {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let len = unsafe {
            VirtualQuery(
                addr as *const c_void,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if len == 0 || info.RegionSize == 0 {
            break;
        }
        let start = info.BaseAddress as u64;
        let end = start.saturating_add(info.RegionSize as u64);
        if info.State != MEM_FREE {
            let widened = round_up(end, granularity);
            match regions.last_mut() {
                Some(last) if last.end >= start => last.end = last.end.max(widened),
                _ => regions.push(start..widened),
            }
        }
        addr = end;
    }
    regions
}

pub(super) fn flush_icache(start: *const u8, size: usize) {
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), start as *const c_void, size);
    }
}

/// The host operating system's view of the low window.
pub struct HostAddressSpace {
    window_base: u64,
    page_size: u64,
    granularity: u64,
    /// Guard reservation at the bottom of a pointer-offset window.
    guard: Option<u64>,
}

impl Default for HostAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAddressSpace {
    /// Plain 32-bit mode: the window starts at address zero.
    pub fn new() -> Self {
        let (page_size, granularity) = system_info();
        Self {
            window_base: 0,
            page_size,
            granularity,
            guard: None,
        }
    }

    /// Pointer-offset mode: the window starts at a free region found below
    /// the module containing this crate.
    pub fn with_pointer_offset() -> Result<Self> {
        let (page_size, granularity) = system_info();
        let min_length = round_up(WINDOW_FLOOR, granularity);
        let module_base = host_module_base()?;

        let used = used_regions(0, module_base.saturating_add(1), granularity);
        let base = placement::pointer_offset(&used, module_base, min_length).ok_or_else(|| {
            Error::MemoryMapping("no free region below the host module".to_string())
        })?;

        let mut space = Self {
            window_base: base,
            page_size,
            granularity,
            guard: None,
        };
        if base != 0 && space.allocate(base, min_length, MEM_RESERVE, PAGE_NOACCESS) == Some(base) {
            space.guard = Some(base);
        }
        debug!(
            "Pointer offset 0x{:016x} (module at 0x{:016x})",
            space.window_base, module_base
        );
        Ok(space)
    }

    /// `VirtualAlloc` at `addr`; `None` if nothing could be allocated there.
    fn allocate(
        &self,
        addr: u64,
        size: u64,
        kind: VIRTUAL_ALLOCATION_TYPE,
        protect: PAGE_PROTECTION_FLAGS,
    ) -> Option<u64> {
        let mem = unsafe { VirtualAlloc(addr as *const c_void, size as usize, kind, protect) };
        if mem.is_null() { None } else { Some(mem as u64) }
    }
}

impl Drop for HostAddressSpace {
    fn drop(&mut self) {
        if let Some(addr) = self.guard.take() {
            self.release(addr, 1);
        }
    }
}

impl AddressSpace for HostAddressSpace {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn allocation_granularity(&self) -> u64 {
        self.granularity
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
        let (kind, protect) = if reserve_only {
            (MEM_RESERVE, PAGE_NOACCESS)
        } else {
            (MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
        };

        let used = used_regions(self.window_base, self.window_end(), self.granularity);
        let floor = round_up(self.window_base + WINDOW_FLOOR, self.granularity);
        let candidates =
            placement::candidates(&used, floor, self.window_end(), size, self.granularity);
        for addr in candidates {
            match self.allocate(addr, size, kind, protect) {
                Some(mem) if mem == addr => {
                    trace!("Mapped 0x{:x} bytes at 0x{:016x}", size, addr);
                    return Ok(addr);
                }
                Some(mem) => {
                    self.release(mem, size);
                    error!("memory mapped at different address");
                    return Err(Error::MemoryMapping(
                        "memory mapped at different address".to_string(),
                    ));
                }
                None => continue,
            }
        }
        Err(Error::MemoryMapping(format!(
            "no free region of 0x{:x} bytes below 2GB",
            size
        )))
    }

    fn reserve_at(&self, addr: u64, size: u64) -> Result<u64> {
        self.check_window(addr, size)?;
        match self.allocate(addr, size, MEM_RESERVE, PAGE_NOACCESS) {
            Some(mem) if mem == addr => Ok(addr),
            other => {
                if let Some(mem) = other {
                    self.release(mem, size);
                }
                Err(Error::MemoryMapping(format!(
                    "address range 0x{:x}-0x{:x} is not available",
                    addr,
                    addr.saturating_add(size)
                )))
            }
        }
    }

    fn commit(&self, addr: u64, size: u64) -> Result<()> {
        match self.allocate(addr, size, MEM_COMMIT, PAGE_READWRITE) {
            Some(_) => Ok(()),
            None => Err(std::io::Error::last_os_error().into()),
        }
    }

    /// Sections cannot be mapped into an existing reservation, so the file
    /// bytes are copied into committed pages instead.
    fn map_file(
        &self,
        addr: u64,
        size: u64,
        prot: Prot,
        file: &MappedFile,
        offset: u64,
    ) -> Result<()> {
        self.commit(addr, size)?;
        let data = file.data();
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        let bytes = &data[start..end];
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        self.protect(addr, size, prot)
    }

    fn protect(&self, addr: u64, size: u64, prot: Prot) -> Result<()> {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        let ok = unsafe {
            VirtualProtect(addr as *const c_void, size as usize, page_protection(prot), &mut old)
        };
        if ok == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn decommit(&self, addr: u64, size: u64) -> Result<()> {
        let ok = unsafe { VirtualFree(addr as *mut c_void, size as usize, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Releases the whole allocation starting at `addr`.
    fn release(&self, addr: u64, size: u64) {
        if addr != 0 && size != 0 {
            unsafe {
                VirtualFree(addr as *mut c_void, 0, MEM_RELEASE);
            }
        }
    }
}

//! Read-only memory-mapped image files.
//!
//! Loaders parse headers straight out of the mapping. On Unix the descriptor
//! is kept so that page-aligned segments can be mapped from the file directly
//! instead of copied.

use crate::Result;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A memory-mapped file.
pub struct MappedFile {
    #[cfg_attr(windows, allow(dead_code))]
    file: File,
    path: PathBuf,
    addr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is private and read-only for its whole lifetime.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Open a regular file and map it read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<MappedFile> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )
            .into());
        }
        let len = usize::try_from(metadata.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "file too large")
        })?;
        let addr = if len == 0 {
            std::ptr::null_mut()
        } else {
            map_view(&file, len)?
        };
        Ok(Self {
            file,
            path: path.to_path_buf(),
            addr,
            len,
        })
    }

    pub fn data(&self) -> &[u8] {
        if self.addr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    pub(crate) fn fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.file.as_raw_fd()
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            unmap_view(self.addr, self.len);
        }
    }
}

#[cfg(unix)]
fn map_view(file: &File, len: usize) -> Result<*mut u8> {
    use std::os::fd::AsRawFd;
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(addr as *mut u8)
}

#[cfg(unix)]
fn unmap_view(addr: *mut u8, len: usize) {
    unsafe {
        libc::munmap(addr as *mut libc::c_void, len);
    }
}

#[cfg(windows)]
fn map_view(file: &File, _len: usize) -> Result<*mut u8> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, FILE_MAP_READ, MapViewOfFile, PAGE_READONLY,
    };

    let mapping = unsafe {
        CreateFileMappingW(
            file.as_raw_handle() as _,
            std::ptr::null(),
            PAGE_READONLY,
            0,
            0,
            std::ptr::null(),
        )
    };
    if mapping.is_null() {
        return Err(std::io::Error::last_os_error().into());
    }
    let view = unsafe { MapViewOfFile(mapping, FILE_MAP_READ, 0, 0, 0) };
    let err = std::io::Error::last_os_error();
    // The view keeps the section alive on its own.
    unsafe {
        CloseHandle(mapping);
    }
    if view.Value.is_null() {
        return Err(err.into());
    }
    Ok(view.Value as *mut u8)
}

#[cfg(windows)]
fn unmap_view(addr: *mut u8, _len: usize) {
    use windows_sys::Win32::System::Memory::{MEMORY_MAPPED_VIEW_ADDRESS, UnmapViewOfFile};
    unsafe {
        UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
            Value: addr as *mut core::ffi::c_void,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_maps_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x7fELF\x02\x01").unwrap();
        let mapped = MappedFile::open(file.path()).unwrap();
        assert_eq!(mapped.data(), b"\x7fELF\x02\x01");
        assert_eq!(mapped.path(), file.path());
        #[cfg(unix)]
        assert!(mapped.fd() >= 0);
    }

    #[test]
    fn test_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mapped = MappedFile::open(file.path()).unwrap();
        assert!(mapped.is_empty());
        assert!(mapped.data().is_empty());
    }

    #[test]
    fn test_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MappedFile::open(dir.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            MappedFile::open("/nonexistent/websynth/image"),
            Err(crate::Error::Io(_))
        ));
    }
}

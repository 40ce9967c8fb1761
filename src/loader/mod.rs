//! Foreign image loader.
//!
//! Maps an ELF, PE or Mach-O shared image into the low address window,
//! applies its relocations, binds its imports against the host symbol table
//! and runs its constructors. There is no system dynamic linker involved and
//! no transitive loading: anything the image imports must be a host symbol.
//!
//! Each format implements [`ObjectImage`]; the pipeline in [`Loader::load`]
//! is the same for all of them:
//!
//! 1. map: validate headers, reserve the footprint, place segments
//! 2. relocate: apply base-relative fixups
//! 3. bind: resolve imports
//! 4. finalize: apply final page protections
//! 5. run constructors
//!
//! A failure at any step releases everything mapped so far.

pub mod elf;
mod image;
pub mod macho;
pub mod pe;

pub use image::Segment;

use crate::mmap::MappedFile;
use crate::sys::{self, AddressSpace};
use crate::{ObjectFormatError, Result};
use image::ImageMemory;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Elf,
    Pe,
    MachO,
}

impl ImageFormat {
    /// Identify an image by its leading magic.
    pub fn detect(data: &[u8]) -> Option<ImageFormat> {
        if data.starts_with(b"\x7fELF") {
            Some(ImageFormat::Elf)
        } else if data.starts_with(b"MZ") {
            Some(ImageFormat::Pe)
        } else if data.starts_with(&macho::MH_MAGIC_64.to_le_bytes()) {
            Some(ImageFormat::MachO)
        } else {
            None
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Elf => write!(f, "ELF"),
            ImageFormat::Pe => write!(f, "PE"),
            ImageFormat::MachO => write!(f, "Mach-O"),
        }
    }
}

/// Per-format load steps after mapping.
pub(crate) trait ObjectImage: Send + Sync {
    fn format(&self) -> ImageFormat;

    /// Apply base-relative fixups.
    fn relocate(&mut self, image: &mut ImageMemory) -> Result<()>;

    /// Resolve imports against the host symbol table.
    fn bind(&mut self, image: &mut ImageMemory) -> Result<()>;

    /// Final page protections once all writes are done.
    fn finalize(&mut self, _image: &mut ImageMemory) -> Result<()> {
        Ok(())
    }

    /// Constructor addresses in execution order.
    fn constructors(&self, image: &ImageMemory) -> Result<Vec<u64>>;

    /// Destructor addresses in execution order.
    fn destructors(&self, image: &ImageMemory) -> Result<Vec<u64>>;

    /// Address of an exported symbol.
    fn find_symbol(&self, image: &ImageMemory, name: &str) -> Result<Option<u64>>;
}

/// A loaded image. Dropping it runs the destructors and releases the
/// reservation.
pub struct Library {
    path: PathBuf,
    object: Box<dyn ObjectImage>,
    image: ImageMemory,
}

impl Library {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.object.format()
    }

    /// Host address of the start of the reservation.
    pub fn base(&self) -> u64 {
        self.image.base()
    }

    /// Host address corresponding to link address zero.
    pub fn load_bias(&self) -> u64 {
        self.image.bias()
    }

    pub fn size(&self) -> u64 {
        self.image.size()
    }

    pub fn segments(&self) -> &[Segment] {
        self.image.segments()
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base() && addr < self.base() + self.size()
    }

    /// The address window the image lives in.
    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        self.image.space()
    }

    /// Read a 32-bit variable from a readable segment of the image.
    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        self.image.read_u32(addr)
    }

    /// Host address of an exported symbol, or `None` if it is not exported.
    pub fn find_symbol(&self, name: &str) -> Option<u64> {
        match self.object.find_symbol(&self.image, name) {
            Ok(addr) => addr,
            Err(err) => {
                error!("{}: {}", self.path.display(), err);
                None
            }
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        match self.object.destructors(&self.image) {
            Ok(dtors) => {
                for dtor in dtors {
                    if self.image.is_code(dtor) {
                        debug!("Running destructor at 0x{:016x}", dtor);
                        unsafe { call_initializer(dtor) };
                    } else {
                        warn!("Skipping destructor outside code at 0x{:016x}", dtor);
                    }
                }
            }
            Err(err) => error!("{}: {}", self.path.display(), err),
        }
        debug!(
            "Unloaded {} (0x{:x} bytes at 0x{:016x})",
            self.path.display(),
            self.image.size(),
            self.image.base()
        );
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("path", &self.path)
            .field("format", &self.format())
            .field("base", &format_args!("0x{:x}", self.base()))
            .field("size", &format_args!("0x{:x}", self.size()))
            .finish()
    }
}

unsafe fn call_initializer(addr: u64) {
    let func: extern "C" fn() = unsafe { std::mem::transmute(addr as usize) };
    func();
}

/// Loads images into one address space.
#[derive(Clone)]
pub struct Loader {
    space: Arc<dyn AddressSpace>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new(sys::host())
    }
}

impl Loader {
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        Self { space }
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    /// Load, relocate, bind and initialize the image at `path`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Library> {
        let path = path.as_ref();
        self.load_image(path).inspect_err(|err| {
            error!("{}: {}", path.display(), err);
        })
    }

    fn load_image(&self, path: &Path) -> Result<Library> {
        let file = MappedFile::open(path)?;
        let format =
            ImageFormat::detect(file.data()).ok_or(ObjectFormatError::InvalidFormat)?;
        debug!("Loading {} image {}", format, path.display());

        let (mut object, mut image) = match format {
            ImageFormat::Elf => elf::map(&file, &self.space)?,
            ImageFormat::Pe => pe::map(&file, &self.space)?,
            ImageFormat::MachO => macho::map(&file, &self.space)?,
        };
        object.relocate(&mut image)?;
        object.bind(&mut image)?;
        object.finalize(&mut image)?;

        let ctors = object.constructors(&image)?;
        if let Some(&bad) = ctors.iter().find(|&&addr| !image.is_code(addr)) {
            return Err(ObjectFormatError::OutsideImage { addr: bad }.into());
        }

        let library = Library {
            path: path.to_path_buf(),
            object,
            image,
        };
        for ctor in ctors {
            debug!("Running constructor at 0x{:016x}", ctor);
            unsafe { call_initializer(ctor) };
        }
        debug!(
            "Loaded {} at 0x{:016x} (0x{:x} bytes)",
            path.display(),
            library.base(),
            library.size()
        );
        Ok(library)
    }
}

/// Load an image into the process-wide low window.
pub fn load_library(path: impl AsRef<Path>) -> Result<Library> {
    Loader::default().load(path)
}

/// Look up an exported symbol of a loaded image.
pub fn find_symbol(library: &Library, name: &str) -> Option<u64> {
    library.find_symbol(name)
}

/// Run destructors and release the image. `None` is a no-op.
pub fn unload_library(library: Option<Library>) {
    drop(library);
}

//! websynth - host for a 32-bit-semantics MIDI synthesizer library.
//!
//! The synthesizer engine ships as a foreign ELF, PE or Mach-O image whose
//! code only works with addresses below 2GB. This crate maps such an image
//! into the low address window of a 64-bit process without the system
//! dynamic linker, binds its imports against a fixed host symbol table, and
//! calls its entry points through a per-thread emulated register and stack
//! context.
//!
//! # Modules
//!
//! - [`sys`] - Address-space reservation below the 2GB ceiling (Linux, macOS, Windows)
//! - [`loader`] - ELF/PE/Mach-O mapping, relocation, binding and lifecycle
//! - [`symbols`] - The compiled-in host symbol table
//! - [`runtime`] - Per-thread execution context and x87 helper symbols
//! - [`d77`] - The synthesizer facade, start-up session and C ABI
//! - [`wav`] - WAV output for rendered audio
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type, which provides specific
//! error variants for different failure modes (format rejection, unresolved
//! imports, address-space exhaustion, I/O, etc.).

pub mod d77;
pub mod loader;
pub mod mmap;
pub mod reader;
pub mod runtime;
pub mod symbols;
pub mod sys;
pub mod wav;

/// Consolidated error type for all websynth operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object format error: {0}")]
    ObjectFormat(#[from] ObjectFormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("memory mapping error: {0}")]
    MemoryMapping(String),

    #[error("execution bridge error: {0}")]
    Bridge(String),

    #[error("library does not export {0}")]
    MissingExport(&'static str),

    #[error("synthesizer rejected {0}")]
    Rejected(&'static str),

    #[error("invalid setting {name}: {value}")]
    InvalidSetting { name: &'static str, value: u32 },
}

/// Error type for object file format parsing and loading
#[derive(Debug, thiserror::Error)]
pub enum ObjectFormatError {
    #[error("not a valid object file")]
    InvalidFormat,

    #[error("truncated read of {len} bytes at offset 0x{offset:x}")]
    Truncated { offset: u64, len: u64 },

    #[error("invalid string at offset 0x{offset:x}")]
    InvalidString { offset: u64 },

    #[error("address 0x{addr:x} is outside the mapped image")]
    OutsideImage { addr: u64 },

    #[error("address 0x{addr:x} is not writable")]
    NotWritable { addr: u64 },

    #[error("elf error: {0}")]
    Elf(#[from] loader::elf::ElfError),

    #[error("pe error: {0}")]
    Pe(#[from] loader::pe::PeError),

    #[error("mach-o error: {0}")]
    Mach(#[from] loader::macho::MachError),
}

impl From<loader::elf::ElfError> for Error {
    fn from(err: loader::elf::ElfError) -> Self {
        Error::ObjectFormat(err.into())
    }
}

impl From<loader::pe::PeError> for Error {
    fn from(err: loader::pe::PeError) -> Self {
        Error::ObjectFormat(err.into())
    }
}

impl From<loader::macho::MachError> for Error {
    fn from(err: loader::macho::MachError) -> Self {
        Error::ObjectFormat(err.into())
    }
}

pub type Result<T> = core::result::Result<T, Error>;

pub use d77::{Effect, Parameters, Session, Settings, SettingsBuilder, Synth};
pub use loader::{ImageFormat, Library, Loader, find_symbol, load_library, unload_library};
pub use mmap::MappedFile;
pub use runtime::{CpuState, ExecutionContext};
pub use sys::{AddressSpace, HostAddressSpace, LowMemory, map_memory, unmap_memory};

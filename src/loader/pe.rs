//! PE32+ DLLs.
//!
//! The synthesizer's Windows builds are plain DLLs with no entry point, no
//! TLS and no imports from named libraries: every import lives in a single
//! descriptor with a null module name and is bound against the host symbol
//! table. Images without base relocations must be placed at their preferred
//! image base.

use super::image::ImageMemory;
use super::{ImageFormat, ObjectImage};
use crate::mmap::MappedFile;
use crate::reader::ByteReader;
use crate::sys::{
    AddressSpace, PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE, Prot, Region, flush_icache_range,
    round_down, round_up,
};
use crate::{Error, Result, symbols};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum PeError {
    #[error("not a PE file")]
    NotPe,
    #[error("missing PE signature")]
    BadSignature,
    #[error("unsupported machine 0x{0:x}")]
    UnsupportedMachine(u16),
    #[error("no sections")]
    NoSections,
    #[error("optional header too small")]
    OptionalHeaderTooSmall,
    #[error("image is not an executable DLL")]
    NotDll,
    #[error("relocations stripped")]
    RelocsStripped,
    #[error("unsupported optional header magic 0x{0:x}")]
    UnsupportedMagic(u16),
    #[error("unsupported subsystem {0}")]
    UnsupportedSubsystem(u16),
    #[error("too few data directories")]
    TooFewDataDirectories,
    #[error("insufficient space for headers")]
    InsufficientHeaderSpace,
    #[error("image has an entry point")]
    EntryPoint,
    #[error("unsupported base relocation type {0}")]
    UnsupportedBaseRelocation(u16),
    #[error("forwarded imports are not supported")]
    ForwarderChain,
    #[error("import from library {0} is not supported")]
    ImportFromLibrary(String),
    #[error("import by ordinal is not supported")]
    OrdinalImport,
    #[error("export ordinal {0} out of range")]
    ExportOrdinal(u16),
}

const DOS_MAGIC: u16 = 0x5a4d;
const DOS_LFANEW: u64 = 0x3c;
const PE_SIGNATURE: u32 = 0x0000_4550;

const MACHINE_AMD64: u16 = 0x8664;
const MACHINE_ARM64: u16 = 0xaa64;

const FILE_RELOCS_STRIPPED: u16 = 0x0001;
const FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const FILE_DLL: u16 = 0x2000;

const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20b;
const SUBSYSTEM_WINDOWS_CUI: u16 = 3;

const FILE_HEADER_SIZE: u64 = 20;
const OPTIONAL_HEADER_SIZE: u64 = 240;
/// Signature, file header and a 16-entry optional header.
const NT_HEADERS_SIZE: u64 = 4 + FILE_HEADER_SIZE + OPTIONAL_HEADER_SIZE;
const SECTION_HEADER_SIZE: u64 = 40;
const NUM_DATA_DIRECTORIES: u32 = 16;

const OPT_ENTRY_POINT: u64 = 16;
const OPT_IMAGE_BASE: u64 = 24;
const OPT_SUBSYSTEM: u64 = 68;
const OPT_NUM_RVA_AND_SIZES: u64 = 108;
const OPT_DATA_DIRECTORY: u64 = 112;

const DIR_EXPORT: u64 = 0;
const DIR_IMPORT: u64 = 1;
const DIR_BASERELOC: u64 = 5;
const DIR_IAT: u64 = 12;
/// Unused slot that records the reservation of the loaded image.
const DIR_RESERVED: u64 = 15;

const SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const SCN_MEM_READ: u32 = 0x4000_0000;
const SCN_MEM_WRITE: u32 = 0x8000_0000;

const REL_BASED_ABSOLUTE: u16 = 0;
const REL_BASED_HIGHLOW: u16 = 3;
const REL_BASED_DIR64: u16 = 10;

const IMPORT_DESCRIPTOR_SIZE: u64 = 20;
const IMPORT_ORDINAL_FLAG: u64 = 1 << 63;

#[derive(Clone, Copy, Debug, Default)]
struct DataDirectory {
    rva: u32,
    size: u32,
}

#[derive(Clone, Debug)]
struct Section {
    name: String,
    virtual_size: u32,
    virtual_address: u32,
    raw_size: u32,
    raw_offset: u32,
    characteristics: u32,
}

impl Section {
    fn parse(r: &ByteReader<'_>, offset: u64) -> Result<Self> {
        let raw_name = r.bytes(offset, 8)?;
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(8);
        Ok(Self {
            name: String::from_utf8_lossy(&raw_name[..end]).into_owned(),
            virtual_size: r.u32(offset + 8)?,
            virtual_address: r.u32(offset + 12)?,
            raw_size: r.u32(offset + 16)?,
            raw_offset: r.u32(offset + 20)?,
            characteristics: r.u32(offset + 36)?,
        })
    }

    fn prot(&self) -> Prot {
        let c = self.characteristics;
        let exec = c & SCN_MEM_EXECUTE != 0;
        let write = c & SCN_MEM_WRITE != 0;
        let read = c & SCN_MEM_READ != 0;
        match (exec, write, read) {
            (true, true, _) => PROT_READ | PROT_WRITE | PROT_EXEC,
            (true, false, true) => PROT_READ | PROT_EXEC,
            (true, false, false) => PROT_EXEC,
            (false, true, _) => PROT_READ | PROT_WRITE,
            (false, false, true) => PROT_READ,
            (false, false, false) => PROT_NONE,
        }
    }
}

pub(crate) struct PeImage {
    image_base: u64,
    sections: Vec<Section>,
    directories: [DataDirectory; 16],
}

/// Validate and map a PE image.
pub(crate) fn map(
    file: &MappedFile,
    space: &Arc<dyn AddressSpace>,
) -> Result<(Box<dyn ObjectImage>, ImageMemory)> {
    let r = ByteReader::new(file.data());
    if r.u16(0).map_err(|_| PeError::NotPe)? != DOS_MAGIC {
        return Err(PeError::NotPe.into());
    }
    let nt = u64::from(r.u32(DOS_LFANEW)?);
    if r.u32(nt)? != PE_SIGNATURE {
        return Err(PeError::BadSignature.into());
    }
    let fh = nt + 4;
    let machine = r.u16(fh)?;
    if machine != MACHINE_AMD64 && machine != MACHINE_ARM64 {
        return Err(PeError::UnsupportedMachine(machine).into());
    }
    let nsections = r.u16(fh + 2)?;
    if nsections == 0 {
        return Err(PeError::NoSections.into());
    }
    let optional_size = u64::from(r.u16(fh + 16)?);
    if optional_size < OPTIONAL_HEADER_SIZE {
        return Err(PeError::OptionalHeaderTooSmall.into());
    }
    let characteristics = r.u16(fh + 18)?;
    if characteristics & FILE_EXECUTABLE_IMAGE == 0 || characteristics & FILE_DLL == 0 {
        return Err(PeError::NotDll.into());
    }
    if characteristics & FILE_RELOCS_STRIPPED != 0 {
        return Err(PeError::RelocsStripped.into());
    }
    let oh = fh + FILE_HEADER_SIZE;
    let magic = r.u16(oh)?;
    if magic != OPTIONAL_MAGIC_PE32_PLUS {
        return Err(PeError::UnsupportedMagic(magic).into());
    }
    let subsystem = r.u16(oh + OPT_SUBSYSTEM)?;
    if subsystem != SUBSYSTEM_WINDOWS_CUI {
        return Err(PeError::UnsupportedSubsystem(subsystem).into());
    }
    if r.u32(oh + OPT_NUM_RVA_AND_SIZES)? < NUM_DATA_DIRECTORIES {
        return Err(PeError::TooFewDataDirectories.into());
    }
    if r.u32(oh + OPT_ENTRY_POINT)? != 0 {
        return Err(PeError::EntryPoint.into());
    }
    let image_base = r.u64(oh + OPT_IMAGE_BASE)?;

    let mut directories = [DataDirectory::default(); 16];
    for (i, dir) in directories.iter_mut().enumerate() {
        let at = oh + OPT_DATA_DIRECTORY + i as u64 * 8;
        *dir = DataDirectory {
            rva: r.u32(at)?,
            size: r.u32(at + 4)?,
        };
    }

    let table = oh + optional_size;
    let sections = (0..u64::from(nsections))
        .map(|i| Section::parse(&r, table + i * SECTION_HEADER_SIZE))
        .collect::<Result<Vec<_>>>()?;

    let mut min = u64::MAX;
    let mut max = 0;
    for s in &sections {
        min = min.min(u64::from(s.virtual_address));
        max = max.max(u64::from(s.virtual_address) + u64::from(s.virtual_size));
    }
    let headers_size = NT_HEADERS_SIZE + u64::from(nsections) * SECTION_HEADER_SIZE;
    if min < headers_size {
        return Err(PeError::InsufficientHeaderSpace.into());
    }
    let page = space.page_size();
    let first = min;
    let min = round_down(min - headers_size, space.allocation_granularity());
    let max = round_up(max, page);

    let region = if directories[DIR_BASERELOC as usize].size == 0 {
        let at = image_base
            .checked_add(min)
            .and_then(|addr| addr.checked_add(space.window_base()))
            .ok_or_else(|| {
                Error::MemoryMapping(format!("image base 0x{:x} is out of range", image_base))
            })?;
        Region::reserve_at(space, at, max - min)?
    } else {
        Region::map(space, max - min, true)?
    };
    let mapped = region.addr();
    let bias = mapped - min;
    let mut image = ImageMemory::new(region, bias);

    for s in &sections {
        if s.virtual_size == 0 {
            continue;
        }
        let addr = bias + u64::from(s.virtual_address);
        let start = round_down(addr, page);
        let end = round_up(addr + u64::from(s.virtual_size), page);
        debug!(
            "Loading section {} at 0x{:016x} ({} bytes)",
            s.name, addr, s.virtual_size
        );
        image.commit(start, end - start)?;
        let copy = s.raw_size.min(s.virtual_size);
        if copy != 0 {
            let bytes = r.bytes(u64::from(s.raw_offset), u64::from(copy))?;
            image.copy_in(addr, bytes)?;
        }
    }

    let header_pages = round_down(bias + first, page) - mapped;
    if header_pages != 0 {
        image.commit(mapped, header_pages)?;
    }
    image.copy_in(mapped, r.bytes(nt, NT_HEADERS_SIZE)?)?;
    image.copy_in(
        mapped + NT_HEADERS_SIZE,
        r.bytes(table, u64::from(nsections) * SECTION_HEADER_SIZE)?,
    )?;
    let copy_oh = mapped + 4 + FILE_HEADER_SIZE;
    image.copy_in(mapped + 4 + 16, &(OPTIONAL_HEADER_SIZE as u16).to_le_bytes())?;
    image.write_u32(copy_oh + OPT_NUM_RVA_AND_SIZES, NUM_DATA_DIRECTORIES)?;
    let reserved = copy_oh + OPT_DATA_DIRECTORY + DIR_RESERVED * 8;
    image.write_u32(reserved, min as u32)?;
    image.write_u32(reserved + 4, (max - min) as u32)?;
    if header_pages != 0 {
        image.protect(mapped, header_pages, PROT_READ)?;
    }

    let object = PeImage {
        image_base,
        sections,
        directories,
    };
    Ok((Box::new(object), image))
}

impl PeImage {
    fn directory(&self, index: u64) -> DataDirectory {
        self.directories[index as usize]
    }

    fn bind_descriptor(&self, image: &mut ImageMemory, desc: u64) -> Result<bool> {
        let bias = image.bias();
        let lookup_rva = image.read_u32(desc)?;
        if lookup_rva == 0 {
            return Ok(false);
        }
        if image.read_u32(desc + 8)? != 0 {
            return Err(PeError::ForwarderChain.into());
        }
        let name_rva = image.read_u32(desc + 12)?;
        let dll = if name_rva == 0 {
            ""
        } else {
            image.cstr(bias + u64::from(name_rva))?
        };
        if !matches!(dll, "" | "(null)" | ".(null)") {
            return Err(PeError::ImportFromLibrary(dll.to_string()).into());
        }
        let mut lookup = bias + u64::from(lookup_rva);
        let mut iat = bias + u64::from(image.read_u32(desc + 16)?);
        loop {
            let entry = image.read_u64(lookup)?;
            if entry == 0 {
                return Ok(true);
            }
            if entry & IMPORT_ORDINAL_FLAG != 0 {
                return Err(PeError::OrdinalImport.into());
            }
            let name = image.cstr(bias + (entry & 0x7fff_ffff) + 2)?;
            let value = symbols::resolve(name)?;
            trace!("Bound {} to 0x{:016x}", name, value);
            image.write_u64(iat, value)?;
            lookup += 8;
            iat += 8;
        }
    }
}

impl ObjectImage for PeImage {
    fn format(&self) -> ImageFormat {
        ImageFormat::Pe
    }

    fn relocate(&mut self, image: &mut ImageMemory) -> Result<()> {
        let dir = self.directory(DIR_BASERELOC);
        if dir.size == 0 {
            return Ok(());
        }
        let bias = image.bias();
        let delta = bias.wrapping_sub(self.image_base);
        debug!("Applying base relocations with delta 0x{:x}", delta);
        let table = bias + u64::from(dir.rva);
        let mut offset = 0u64;
        while offset < u64::from(dir.size) {
            let block = table + offset;
            let page_rva = image.read_u32(block)?;
            let block_size = u64::from(image.read_u32(block + 4)?);
            if block_size == 0 {
                break;
            }
            let count = block_size.saturating_sub(8) / 2;
            for i in 0..count {
                let entry = image.reader(block + 8 + i * 2)?.u16(0)?;
                let kind = entry >> 12;
                let target = bias + u64::from(page_rva) + u64::from(entry & 0xfff);
                match kind {
                    REL_BASED_ABSOLUTE => {}
                    REL_BASED_HIGHLOW => {
                        let value = image.read_u32(target)?;
                        image.write_u32(target, value.wrapping_add(delta as u32))?;
                    }
                    REL_BASED_DIR64 => {
                        let value = image.read_u64(target)?;
                        image.write_u64(target, value.wrapping_add(delta))?;
                    }
                    other => return Err(PeError::UnsupportedBaseRelocation(other).into()),
                }
            }
            offset += block_size;
        }
        Ok(())
    }

    fn bind(&mut self, image: &mut ImageMemory) -> Result<()> {
        let imports = self.directory(DIR_IMPORT);
        if imports.size == 0 || self.directory(DIR_IAT).size == 0 {
            return Ok(());
        }
        let mut desc = image.bias() + u64::from(imports.rva);
        while self.bind_descriptor(image, desc)? {
            desc += IMPORT_DESCRIPTOR_SIZE;
        }
        Ok(())
    }

    fn finalize(&mut self, image: &mut ImageMemory) -> Result<()> {
        let page = image.page_size();
        let bias = image.bias();
        for s in &self.sections {
            if s.virtual_size == 0 {
                continue;
            }
            let addr = bias + u64::from(s.virtual_address);
            let start = round_down(addr, page);
            let size = round_up(addr + u64::from(s.virtual_size), page) - start;
            if s.characteristics & SCN_MEM_DISCARDABLE != 0 {
                debug!("Discarding section {}", s.name);
                image.decommit(start, size)?;
                continue;
            }
            let prot = s.prot();
            if prot & PROT_EXEC != 0 {
                flush_icache_range(start as *const u8, size as usize);
            }
            image.protect(start, size, prot)?;
        }
        Ok(())
    }

    fn constructors(&self, _image: &ImageMemory) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }

    fn destructors(&self, _image: &ImageMemory) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }

    fn find_symbol(&self, image: &ImageMemory, name: &str) -> Result<Option<u64>> {
        let dir = self.directory(DIR_EXPORT);
        if dir.size == 0 {
            return Ok(None);
        }
        let bias = image.bias();
        let exports = bias + u64::from(dir.rva);
        let nfunctions = image.read_u32(exports + 20)?;
        let nnames = image.read_u32(exports + 24)?;
        let functions = bias + u64::from(image.read_u32(exports + 28)?);
        let names = bias + u64::from(image.read_u32(exports + 32)?);
        let ordinals = bias + u64::from(image.read_u32(exports + 36)?);
        for i in 0..u64::from(nnames) {
            let name_rva = image.read_u32(names + i * 4)?;
            if image.cstr(bias + u64::from(name_rva))? != name {
                continue;
            }
            let ordinal = image.reader(ordinals + i * 2)?.u16(0)?;
            if u32::from(ordinal) >= nfunctions {
                return Err(PeError::ExportOrdinal(ordinal).into());
            }
            let rva = image.read_u32(functions + u64::from(ordinal) * 4)?;
            return Ok(Some(bias + u64::from(rva)));
        }
        Ok(None)
    }
}

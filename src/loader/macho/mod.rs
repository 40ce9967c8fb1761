//! Mach-O 64-bit bundles.
//!
//! The synthesizer's macOS builds are `MH_BUNDLE` images linked at address
//! zero that use classic (non-chained) dyld info: a rebase stream, a bind
//! stream and a lazy bind stream. All binds use flat lookup and are resolved
//! eagerly against the host symbol table.

mod opcodes;

use super::image::{ImageMemory, SegmentLoad};
use super::{ImageFormat, ObjectImage};
use crate::mmap::MappedFile;
use crate::reader::ByteReader;
use crate::sys::{
    AddressSpace, PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE, Prot, Region, round_down, round_up,
};
use crate::{Error, Result, symbols};
use opcodes::{
    BIND_SPECIAL_DYLIB_FLAT_LOOKUP, BIND_TYPE_POINTER, BindOp, BindState, Location,
    REBASE_TYPE_POINTER, RebaseOp, RebaseState, bind_step, decode_bind, decode_rebase,
    rebase_step,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum MachError {
    #[error("bad Mach-O magic")]
    BadMagic,
    #[error("unsupported file type {0} (expected bundle)")]
    NotBundle(u32),
    #[error("no load commands")]
    NoCommands,
    #[error("unsupported header flags 0x{0:x}")]
    UnsupportedFlags(u32),
    #[error("reserved header field is not zero")]
    NonzeroReserved,
    #[error("unsupported cpu type 0x{0:x}")]
    UnsupportedCpu(u32),
    #[error("image is not linked at address zero")]
    NonzeroMinAddress,
    #[error("missing load command {0}")]
    MissingCommand(&'static str),
    #[error("unsupported load command 0x{0:x}")]
    UnsupportedCommand(u32),
    #[error("unsupported rebase opcode 0x{0:x}")]
    UnknownRebaseOpcode(u8),
    #[error("unsupported bind opcode 0x{0:x}")]
    UnknownBindOpcode(u8),
    #[error("unsupported rebase type {0}")]
    RebaseType(u8),
    #[error("unsupported bind type {0}")]
    BindType(u8),
    #[error("unsupported bind flags 0x{0:x}")]
    BindFlags(u8),
    #[error("unsupported bind lookup {0}")]
    BindOrdinal(i64),
    #[error("bind without a symbol")]
    MissingSymbolName,
    #[error("fixup without a segment address")]
    ZeroAddress,
    #[error("segment {0} address range overflows")]
    SegmentOverflow(String),
    #[error("segment index {0} out of range")]
    SegmentIndex(u8),
    #[error("file offset 0x{0:x} is not inside a segment")]
    FileOffset(u64),
    #[error("section index {0} out of range")]
    SectionIndex(u8),
    #[error("unsupported symbol type 0x{0:x}")]
    UnsupportedSymbolType(u8),
}

pub(crate) const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_BUNDLE: u32 = 0x8;
const MH_NOUNDEFS: u32 = 0x1;
const MH_DYLDLINK: u32 = 0x4;
const MH_TWOLEVEL: u32 = 0x80;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const MACH_HEADER_SIZE: u64 = 32;

const LC_REQ_DYLD: u32 = 0x8000_0000;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_SEGMENT_64: u32 = 0x19;
const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;

const SEGMENT_COMMAND_SIZE: u64 = 72;
const SECTION_SIZE: u64 = 80;
const SG_READ_ONLY: u32 = 0x10;

const SECTION_TYPE: u32 = 0xff;
const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
const S_MOD_TERM_FUNC_POINTERS: u32 = 0xa;

const VM_PROT_READ: u32 = 0x1;
const VM_PROT_WRITE: u32 = 0x2;
const VM_PROT_EXECUTE: u32 = 0x4;

const NLIST_SIZE: u64 = 16;
const N_STAB: u8 = 0xe0;
const N_TYPE: u8 = 0x0e;
const N_EXT: u8 = 0x01;
const N_ABS: u8 = 0x2;
const N_SECT: u8 = 0xe;

#[derive(Clone, Debug)]
struct Section64 {
    name: String,
    addr: u64,
    size: u64,
    flags: u32,
}

#[derive(Clone, Debug)]
struct Segment64 {
    name: String,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    initprot: u32,
    flags: u32,
    sections: Vec<Section64>,
}

#[derive(Clone, Copy, Debug)]
struct SymtabCommand {
    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct DyldInfo {
    rebase_off: u32,
    rebase_size: u32,
    bind_off: u32,
    bind_size: u32,
    lazy_bind_off: u32,
    lazy_bind_size: u32,
}

fn fixed_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn vm_prot(prot: u32) -> Prot {
    let mut out = PROT_NONE;
    if prot & VM_PROT_READ != 0 {
        out |= PROT_READ;
    }
    if prot & VM_PROT_WRITE != 0 {
        out |= PROT_WRITE;
    }
    if prot & VM_PROT_EXECUTE != 0 {
        out |= PROT_EXEC;
    }
    out
}

impl Segment64 {
    fn parse(r: &ByteReader<'_>, at: u64) -> Result<Self> {
        let nsects = r.u32(at + 64)?;
        let sections = (0..u64::from(nsects))
            .map(|i| -> Result<Section64> {
                let s = at + SEGMENT_COMMAND_SIZE + i * SECTION_SIZE;
                Ok(Section64 {
                    name: fixed_name(r.bytes(s, 16)?),
                    addr: r.u64(s + 32)?,
                    size: r.u64(s + 40)?,
                    flags: r.u32(s + 64)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let segment = Self {
            name: fixed_name(r.bytes(at + 8, 16)?),
            vmaddr: r.u64(at + 24)?,
            vmsize: r.u64(at + 32)?,
            fileoff: r.u64(at + 40)?,
            filesize: r.u64(at + 48)?,
            initprot: r.u32(at + 60)?,
            flags: r.u32(at + 68)?,
            sections,
        };
        // Every later use adds these pairs unchecked.
        if segment.vmaddr.checked_add(segment.vmsize).is_none()
            || segment.fileoff.checked_add(segment.filesize).is_none()
        {
            return Err(MachError::SegmentOverflow(segment.name).into());
        }
        Ok(segment)
    }
}

pub(crate) struct MachImage {
    segments: Vec<Segment64>,
    symtabs: Vec<SymtabCommand>,
    dyld_info: DyldInfo,
}

/// Validate and map a Mach-O bundle.
pub(crate) fn map(
    file: &MappedFile,
    space: &Arc<dyn AddressSpace>,
) -> Result<(Box<dyn ObjectImage>, ImageMemory)> {
    let r = ByteReader::new(file.data());
    if r.u32(0).map_err(|_| MachError::BadMagic)? != MH_MAGIC_64 {
        return Err(MachError::BadMagic.into());
    }
    let cputype = r.u32(4)?;
    let filetype = r.u32(12)?;
    let ncmds = r.u32(16)?;
    let sizeofcmds = r.u32(20)?;
    let flags = r.u32(24)?;
    let reserved = r.u32(28)?;
    if filetype != MH_BUNDLE {
        return Err(MachError::NotBundle(filetype).into());
    }
    if ncmds == 0 || sizeofcmds == 0 {
        return Err(MachError::NoCommands.into());
    }
    if flags != (MH_NOUNDEFS | MH_DYLDLINK | MH_TWOLEVEL) && flags != MH_DYLDLINK {
        return Err(MachError::UnsupportedFlags(flags).into());
    }
    if reserved != 0 {
        return Err(MachError::NonzeroReserved.into());
    }
    if cputype != CPU_TYPE_X86_64 {
        return Err(MachError::UnsupportedCpu(cputype).into());
    }

    let commands = r.sub(MACH_HEADER_SIZE, u64::from(sizeofcmds))?;
    let mut segments = Vec::new();
    let mut symtabs = Vec::new();
    let mut dyld_info = None;
    let mut has_dysymtab = false;
    let mut at = 0u64;
    for _ in 0..ncmds {
        let cmd = commands.u32(at)?;
        let cmdsize = u64::from(commands.u32(at + 4)?);
        let body = commands.sub(at, cmdsize)?;
        match cmd {
            LC_SEGMENT_64 => segments.push(Segment64::parse(&body, 0)?),
            LC_SYMTAB => symtabs.push(SymtabCommand {
                symoff: body.u32(8)?,
                nsyms: body.u32(12)?,
                stroff: body.u32(16)?,
                strsize: body.u32(20)?,
            }),
            LC_DYSYMTAB => has_dysymtab = true,
            LC_DYLD_INFO_ONLY => {
                dyld_info = Some(DyldInfo {
                    rebase_off: body.u32(8)?,
                    rebase_size: body.u32(12)?,
                    bind_off: body.u32(16)?,
                    bind_size: body.u32(20)?,
                    lazy_bind_off: body.u32(32)?,
                    lazy_bind_size: body.u32(36)?,
                })
            }
            other if other & LC_REQ_DYLD != 0 || other < LC_SEGMENT_64 => {
                return Err(MachError::UnsupportedCommand(other).into());
            }
            other => trace!("Ignoring load command 0x{:x}", other),
        }
        if cmdsize == 0 {
            return Err(MachError::NoCommands.into());
        }
        at += cmdsize;
    }
    let dyld_info = dyld_info.ok_or(MachError::MissingCommand("LC_DYLD_INFO_ONLY"))?;
    if symtabs.is_empty() {
        return Err(MachError::MissingCommand("LC_SYMTAB").into());
    }
    if !has_dysymtab {
        return Err(MachError::MissingCommand("LC_DYSYMTAB").into());
    }

    let page = space.page_size();
    let mut min = u64::MAX;
    let mut max = 0;
    for seg in segments.iter().filter(|s| s.vmsize != 0) {
        min = min.min(seg.vmaddr);
        max = max.max(seg.vmaddr + seg.vmsize);
    }
    if max == 0 {
        return Err(MachError::MissingCommand("LC_SEGMENT_64").into());
    }
    if round_down(min, page) != 0 {
        return Err(MachError::NonzeroMinAddress.into());
    }
    let max = round_up(max, page);
    let region = Region::map(space, max, true)?;
    let bias = region.addr();
    let mut image = ImageMemory::new(region, bias);

    for seg in segments.iter().filter(|s| s.vmsize != 0) {
        debug!("Segment {} at vmaddr 0x{:x}", seg.name, seg.vmaddr);
        let page_offset = seg.vmaddr & (page - 1);
        image.load_segment(
            file,
            &SegmentLoad {
                addr: bias + seg.vmaddr - page_offset,
                page_offset,
                file_offset: seg.fileoff,
                file_size: seg.filesize,
                mem_size: seg.vmsize,
                prot: vm_prot(seg.initprot),
            },
        )?;
    }

    let object = MachImage {
        segments,
        symtabs,
        dyld_info,
    };
    Ok((Box::new(object), image))
}

impl MachImage {
    /// Host address of `offset` into the `index`th segment.
    fn segment_address(&self, image: &ImageMemory, location: Location) -> Result<u64> {
        let seg = self
            .segments
            .get(usize::from(location.segment))
            .ok_or(MachError::SegmentIndex(location.segment))?;
        Ok(image.bias() + seg.vmaddr + location.offset)
    }

    /// Host address where file offset `offset` is mapped.
    fn file_address(&self, image: &ImageMemory, offset: u64) -> Result<u64> {
        self.segments
            .iter()
            .find(|s| offset >= s.fileoff && offset < s.fileoff + s.filesize)
            .map(|s| image.bias() + s.vmaddr + (offset - s.fileoff))
            .ok_or_else(|| MachError::FileOffset(offset).into())
    }

    fn stream(&self, image: &ImageMemory, offset: u32, size: u32) -> Result<Vec<u8>> {
        let addr = self.file_address(image, u64::from(offset))?;
        Ok(image.bytes(addr, u64::from(size))?.to_vec())
    }

    fn rebase(&self, image: &mut ImageMemory, stream: &[u8]) -> Result<()> {
        let r = ByteReader::new(stream);
        let mut state = RebaseState::default();
        let mut offset = 0;
        while offset < r.len() as u64 {
            let (op, next) = decode_rebase(&r, offset)?;
            offset = next;
            if op == RebaseOp::Done {
                break;
            }
            let (next_state, run) = rebase_step(state, op);
            if let Some(run) = run {
                for slot in run.slots() {
                    let location = slot.ok_or(MachError::ZeroAddress)?;
                    if state.kind != REBASE_TYPE_POINTER {
                        return Err(MachError::RebaseType(state.kind).into());
                    }
                    let addr = self.segment_address(image, location)?;
                    let value = image.read_u64(addr)?;
                    image.write_u64(addr, value.wrapping_add(image.bias()))?;
                }
            }
            state = next_state;
        }
        Ok(())
    }

    fn bind_stream(&self, image: &mut ImageMemory, stream: &[u8]) -> Result<()> {
        let r = ByteReader::new(stream);
        let mut state = BindState::default();
        let mut offset = 0;
        while offset < r.len() as u64 {
            let (op, next) = decode_bind(&r, offset)?;
            offset = next;
            if op == BindOp::Done {
                continue;
            }
            let (next_state, bind) = bind_step(state, op);
            if let Some((with, run)) = bind {
                for slot in run.slots() {
                    self.bind_at(image, &with, slot)?;
                }
            }
            state = next_state;
        }
        Ok(())
    }

    fn bind_at(
        &self,
        image: &mut ImageMemory,
        bind: &BindState<'_>,
        slot: Option<Location>,
    ) -> Result<()> {
        let symbol = bind.symbol.ok_or(MachError::MissingSymbolName)?;
        if bind.flags != 0 {
            return Err(MachError::BindFlags(bind.flags).into());
        }
        if bind.ordinal != BIND_SPECIAL_DYLIB_FLAT_LOOKUP {
            return Err(MachError::BindOrdinal(bind.ordinal).into());
        }
        let location = slot.ok_or(MachError::ZeroAddress)?;
        if bind.kind != BIND_TYPE_POINTER {
            return Err(MachError::BindType(bind.kind).into());
        }
        let Some(name) = symbol.strip_prefix('_') else {
            // Lazy binding never runs, so the stub helper's binder is unused.
            if symbol == "dyld_stub_binder" {
                return Ok(());
            }
            return Err(Error::SymbolNotFound(symbol.to_string()));
        };
        let value = symbols::resolve(name)?;
        let addr = self.segment_address(image, location)?;
        trace!("Bound {} to 0x{:016x}", symbol, value);
        image.write_u64(addr, value.wrapping_add(bind.addend as u64))
    }

    fn section_pointers(&self, image: &ImageMemory, kind: u32) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for section in self.segments.iter().flat_map(|s| &s.sections) {
            if section.flags & SECTION_TYPE != kind {
                continue;
            }
            let base = image.bias() + section.addr;
            for i in 0..section.size / 8 {
                out.push(image.read_u64(base + i * 8)?);
            }
        }
        Ok(out)
    }

    fn section_by_number(&self, number: u8) -> Option<&Section64> {
        let index = usize::from(number).checked_sub(1)?;
        self.segments.iter().flat_map(|s| &s.sections).nth(index)
    }
}

impl ObjectImage for MachImage {
    fn format(&self) -> ImageFormat {
        ImageFormat::MachO
    }

    fn relocate(&mut self, image: &mut ImageMemory) -> Result<()> {
        let info = self.dyld_info;
        if info.rebase_size == 0 {
            return Ok(());
        }
        let stream = self.stream(image, info.rebase_off, info.rebase_size)?;
        self.rebase(image, &stream)
    }

    fn bind(&mut self, image: &mut ImageMemory) -> Result<()> {
        let info = self.dyld_info;
        if info.bind_size != 0 {
            let stream = self.stream(image, info.bind_off, info.bind_size)?;
            self.bind_stream(image, &stream)?;
        }
        if info.lazy_bind_size != 0 {
            let stream = self.stream(image, info.lazy_bind_off, info.lazy_bind_size)?;
            self.bind_stream(image, &stream)?;
        }
        Ok(())
    }

    fn finalize(&mut self, image: &mut ImageMemory) -> Result<()> {
        let page = image.page_size();
        for seg in self.segments.iter().filter(|s| s.flags & SG_READ_ONLY != 0) {
            let start = round_down(image.bias() + seg.vmaddr, page);
            let end = round_up(image.bias() + seg.vmaddr + seg.vmsize, page);
            let prot = vm_prot(seg.initprot) & !PROT_WRITE;
            debug!("Write-protecting segment {}", seg.name);
            image.protect(start, end - start, prot)?;
        }
        Ok(())
    }

    fn constructors(&self, image: &ImageMemory) -> Result<Vec<u64>> {
        self.section_pointers(image, S_MOD_INIT_FUNC_POINTERS)
    }

    fn destructors(&self, image: &ImageMemory) -> Result<Vec<u64>> {
        let mut dtors = self.section_pointers(image, S_MOD_TERM_FUNC_POINTERS)?;
        dtors.reverse();
        Ok(dtors)
    }

    fn find_symbol(&self, image: &ImageMemory, name: &str) -> Result<Option<u64>> {
        for symtab in &self.symtabs {
            if symtab.nsyms == 0 {
                continue;
            }
            let syms = self.file_address(image, u64::from(symtab.symoff))?;
            let strs = self.file_address(image, u64::from(symtab.stroff))?;
            for i in 0..u64::from(symtab.nsyms) {
                let nlist = image.reader(syms + i * NLIST_SIZE)?;
                let n_strx = nlist.u32(0)?;
                let n_type = nlist.u8(4)?;
                if n_strx == 0 || n_type & N_STAB != 0 || n_type & N_EXT == 0 {
                    continue;
                }
                if u64::from(n_strx) >= u64::from(symtab.strsize) {
                    continue;
                }
                let symbol = image.cstr(strs + u64::from(n_strx))?;
                if symbol.strip_prefix('_') != Some(name) {
                    continue;
                }
                let n_sect = nlist.u8(5)?;
                let n_value = nlist.u64(8)?;
                return match n_type & N_TYPE {
                    N_ABS => Ok(Some(image.bias() + n_value)),
                    N_SECT => {
                        let section = self
                            .section_by_number(n_sect)
                            .ok_or(MachError::SectionIndex(n_sect))?;
                        if n_value < section.addr || n_value >= section.addr + section.size {
                            return Err(MachError::SectionIndex(n_sect).into());
                        }
                        trace!("{} is in section {}", name, section.name);
                        Ok(Some(image.bias() + n_value))
                    }
                    other => Err(MachError::UnsupportedSymbolType(other).into()),
                };
            }
        }
        Ok(None)
    }
}

//! ELF64 shared objects and static executables.
//!
//! Shared objects (`ET_DYN`) must be linked at address zero and are placed
//! anywhere in the window. Executables (`ET_EXEC`) are placed at their link
//! address; since they carry no dynamic symbol table, the static
//! `SHT_SYMTAB`/`SHT_STRTAB` pair is copied into pages appended after the
//! image so exports can still be looked up.
//!
//! Only the relocation vocabulary the synthesizer builds use is supported:
//! `RELATIVE` and `JUMP_SLOT` from `DT_RELA` and `DT_JMPREL`.

use super::image::{ImageMemory, SegmentLoad};
use super::{ImageFormat, ObjectImage};
use crate::mmap::MappedFile;
use crate::reader::ByteReader;
use crate::sys::{
    AddressSpace, PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE, Prot, Region, round_down, round_up,
};
use crate::{Result, symbols};
use goblin::container::Ctx;
use goblin::elf::Elf;
use goblin::elf::dynamic::{
    DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_HASH, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ,
    DT_JMPREL, DT_NULL, DT_PLTRELSZ, DT_RELA, DT_RELAENT, DT_RELASZ, DT_RELSZ, DT_STRSZ,
    DT_STRTAB, DT_SYMENT, DT_SYMTAB,
};
use goblin::elf::header::{
    EI_CLASS, EI_VERSION, ELFCLASS64, ELFMAG, EM_AARCH64, EM_RISCV, EM_X86_64, ET_DYN, ET_EXEC,
    EV_CURRENT, SELFMAG,
};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD, ProgramHeader};
use goblin::elf::reloc::{
    R_AARCH64_JUMP_SLOT, R_AARCH64_RELATIVE, R_X86_64_JUMP_SLOT, R_X86_64_RELATIVE,
};
use goblin::elf::section_header::{SHT_STRTAB, SHT_SYMTAB, SectionHeader};
use goblin::elf::sym::{STB_GLOBAL, st_bind};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("not an ELF file")]
    NotElf,
    #[error("not a 64-bit ELF file")]
    UnsupportedClass,
    #[error("unsupported ELF version")]
    UnsupportedVersion,
    #[error("unsupported ELF type {0}")]
    UnsupportedType(u16),
    #[error("missing program headers")]
    MissingProgramHeaders,
    #[error("unsupported machine {0}")]
    UnsupportedMachine(u16),
    #[error("no loadable segments")]
    NoLoadableSegments,
    #[error("segment file size exceeds memory size")]
    FileSizeExceedsMemSize,
    #[error("segment address range overflows")]
    AddressOverflow,
    #[error("executable does not start at its image base")]
    ExecutableBase,
    #[error("shared object is not linked at address zero")]
    SharedObjectBase,
    #[error("missing symbol table")]
    MissingSymbolTable,
    #[error("REL relocations are not supported")]
    RelRelocations,
    #[error("missing dynamic entry {0}")]
    MissingDynamic(&'static str),
    #[error("unsupported relocation type {0}")]
    UnsupportedRelocation(u32),
    #[error("goblin parse error: {0}")]
    GoblinError(#[from] goblin::error::Error),
}

/// Dynamic tags at or above this are not recorded.
const DT_TABLE_LEN: usize = 39;

const R_RISCV_RELATIVE: u32 = 3;
const R_RISCV_JUMP_SLOT: u32 = 5;

/// `[symtab, syment, strtab, strsz]` in front of the appended tables.
const SYMTAB_HEADER_SIZE: u64 = 32;

const DYN_SIZE: u64 = 16;
const SYM_NAME: u64 = 0;
const SYM_INFO: u64 = 4;
const SYM_SHNDX: u64 = 6;
const SYM_VALUE: u64 = 8;

#[derive(Clone, Copy, Debug)]
struct RelocTypes {
    relative: u32,
    jump_slot: u32,
}

impl RelocTypes {
    fn for_machine(machine: u16) -> core::result::Result<Self, ElfError> {
        match machine {
            EM_X86_64 => Ok(Self {
                relative: R_X86_64_RELATIVE,
                jump_slot: R_X86_64_JUMP_SLOT,
            }),
            EM_AARCH64 => Ok(Self {
                relative: R_AARCH64_RELATIVE,
                jump_slot: R_AARCH64_JUMP_SLOT,
            }),
            EM_RISCV => Ok(Self {
                relative: R_RISCV_RELATIVE,
                jump_slot: R_RISCV_JUMP_SLOT,
            }),
            other => Err(ElfError::UnsupportedMachine(other)),
        }
    }
}

pub(crate) struct ElfImage {
    executable: bool,
    relocs: RelocTypes,
    dynamic: [u64; DT_TABLE_LEN],
    /// Host address of the appended symbol table header (executables only).
    symtab_header: u64,
}

/// Validate and map an ELF image.
pub(crate) fn map(
    file: &MappedFile,
    space: &Arc<dyn AddressSpace>,
) -> Result<(Box<dyn ObjectImage>, ImageMemory)> {
    let data = file.data();
    let ident = ByteReader::new(data).bytes(0, 16).map_err(|_| ElfError::NotElf)?;
    if &ident[..SELFMAG] != ELFMAG {
        return Err(ElfError::NotElf.into());
    }
    if ident[EI_CLASS] != ELFCLASS64 {
        return Err(ElfError::UnsupportedClass.into());
    }
    if ident[EI_VERSION] != EV_CURRENT {
        return Err(ElfError::UnsupportedVersion.into());
    }
    let header = Elf::parse_header(data).map_err(ElfError::from)?;
    if header.e_type != ET_DYN && header.e_type != ET_EXEC {
        return Err(ElfError::UnsupportedType(header.e_type).into());
    }
    if header.e_phentsize == 0 || header.e_phnum == 0 {
        return Err(ElfError::MissingProgramHeaders.into());
    }
    let relocs = RelocTypes::for_machine(header.e_machine)?;
    let ctx = Ctx::new(
        header.container().map_err(ElfError::from)?,
        header.endianness().map_err(ElfError::from)?,
    );
    let phdrs = ProgramHeader::parse(data, header.e_phoff as usize, header.e_phnum as usize, ctx)
        .map_err(ElfError::from)?;

    let loads: Vec<&ProgramHeader> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
    if loads.is_empty() {
        return Err(ElfError::NoLoadableSegments.into());
    }
    let mut min = u64::MAX;
    let mut max = 0;
    let mut image_base = 0;
    for ph in &loads {
        if ph.p_filesz > ph.p_memsz {
            return Err(ElfError::FileSizeExceedsMemSize.into());
        }
        min = min.min(ph.p_vaddr);
        let end = ph
            .p_vaddr
            .checked_add(ph.p_memsz)
            .ok_or(ElfError::AddressOverflow)?;
        max = max.max(end);
        if ph.p_offset == 0 {
            image_base = ph.p_vaddr;
        }
    }
    let page = space.page_size();
    let min = round_down(min, page);
    let mut max = round_up(max, page);
    let executable = header.e_type == ET_EXEC;

    let mut tables = None;
    let region = if executable {
        if image_base == 0 || min != image_base {
            return Err(ElfError::ExecutableBase.into());
        }
        let shdrs = SectionHeader::parse(
            data,
            header.e_shoff as usize,
            header.e_shnum as usize,
            ctx,
        )
        .map_err(ElfError::from)?;
        let symtab = shdrs.iter().find(|s| s.sh_type == SHT_SYMTAB);
        let strtab = shdrs
            .iter()
            .enumerate()
            .find(|(i, s)| s.sh_type == SHT_STRTAB && *i != usize::from(header.e_shstrndx))
            .map(|(_, s)| s);
        let (Some(symtab), Some(strtab)) = (symtab, strtab) else {
            return Err(ElfError::MissingSymbolTable.into());
        };
        let orig_max = max;
        let tables_end = [SYMTAB_HEADER_SIZE, symtab.sh_size, strtab.sh_size]
            .into_iter()
            .try_fold(max, u64::checked_add)
            .ok_or(ElfError::AddressOverflow)?;
        max = round_up(tables_end, page);
        tables = Some((orig_max, symtab.clone(), strtab.clone()));
        Region::reserve_at(space, space.window_base() + min, max - min)?
    } else {
        if min != 0 {
            return Err(ElfError::SharedObjectBase.into());
        }
        Region::map(space, max, true)?
    };
    let bias = region.addr() - min;
    let mut image = ImageMemory::new(region, bias);

    for ph in &loads {
        let page_offset = ph.p_vaddr & (page - 1);
        image.load_segment(
            file,
            &SegmentLoad {
                addr: bias + ph.p_vaddr - page_offset,
                page_offset,
                file_offset: ph.p_offset,
                file_size: ph.p_filesz,
                mem_size: ph.p_memsz,
                prot: segment_prot(ph.p_flags),
            },
        )?;
    }

    let mut symtab_header = 0;
    if let Some((orig_max, symtab, strtab)) = tables {
        let reader = ByteReader::new(data);
        let syms = reader.bytes(symtab.sh_offset, symtab.sh_size)?;
        let strs = reader.bytes(strtab.sh_offset, strtab.sh_size)?;
        let at = bias + orig_max;
        image.commit(at, bias + max - at)?;
        let sym_addr = at + SYMTAB_HEADER_SIZE;
        let str_addr = sym_addr + symtab.sh_size;
        image.write_u64(at, sym_addr)?;
        image.write_u64(at + 8, symtab.sh_entsize)?;
        image.write_u64(at + 16, str_addr)?;
        image.write_u64(at + 24, strtab.sh_size)?;
        image.copy_in(sym_addr, syms)?;
        image.copy_in(str_addr, strs)?;
        image.protect(at, bias + max - at, PROT_READ)?;
        symtab_header = at;
        debug!(
            "Preserved {} bytes of symbols at 0x{:016x}",
            symtab.sh_size + strtab.sh_size,
            at
        );
    }

    let mut dynamic = [0u64; DT_TABLE_LEN];
    if let Some(ph) = phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) {
        let mut addr = bias + ph.p_vaddr;
        loop {
            let tag = image.read_u64(addr)?;
            if tag == DT_NULL {
                break;
            }
            let value = image.read_u64(addr + 8)?;
            if let Some(slot) = usize::try_from(tag).ok().and_then(|t| dynamic.get_mut(t)) {
                *slot = value;
            }
            addr += DYN_SIZE;
        }
    }

    let object = ElfImage {
        executable,
        relocs,
        dynamic,
        symtab_header,
    };
    Ok((Box::new(object), image))
}

fn segment_prot(flags: u32) -> Prot {
    let mut prot = PROT_NONE;
    if flags & PF_R != 0 {
        prot |= PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= PROT_EXEC;
    }
    prot
}

impl ElfImage {
    fn dynamic(&self, tag: u64) -> u64 {
        self.dynamic[tag as usize]
    }

    fn require(&self, tag: u64, name: &'static str) -> core::result::Result<u64, ElfError> {
        match self.dynamic(tag) {
            0 => Err(ElfError::MissingDynamic(name)),
            value => Ok(value),
        }
    }

    fn apply_relocations(
        &self,
        image: &mut ImageMemory,
        table: u64,
        size: u64,
        entsize: u64,
    ) -> Result<()> {
        let bias = image.bias();
        let count = size / entsize;
        debug!("Applying {} relocations at 0x{:016x}", count, bias + table);
        for i in 0..count {
            let entry = bias + table + i * entsize;
            let r_offset = image.read_u64(entry)?;
            let r_info = image.read_u64(entry + 8)?;
            let r_addend = image.read_u64(entry + 16)?;
            let r_type = (r_info & 0xffff_ffff) as u32;
            let r_sym = r_info >> 32;
            let target = bias + r_offset;

            if r_type == self.relocs.relative {
                image.write_u64(target, bias.wrapping_add(r_addend))?;
            } else if r_type == self.relocs.jump_slot {
                if let Some(value) = self.resolve_import(image, r_sym)? {
                    image.write_u64(target, value)?;
                }
            } else {
                return Err(ElfError::UnsupportedRelocation(r_type).into());
            }
        }
        Ok(())
    }

    /// Value for a `JUMP_SLOT` against symbol `index`; `None` for the null
    /// symbol.
    fn resolve_import(&self, image: &ImageMemory, index: u64) -> Result<Option<u64>> {
        let bias = image.bias();
        let symtab = self.require(DT_SYMTAB, "DT_SYMTAB")?;
        let syment = self.require(DT_SYMENT, "DT_SYMENT")?;
        let sym = bias + symtab + index * syment;
        let st_name = image.read_u32(sym + SYM_NAME)?;
        let st_shndx = image.reader(sym)?.u16(SYM_SHNDX)?;
        let st_value = image.read_u64(sym + SYM_VALUE)?;

        if st_shndx != 0 {
            return Ok(Some(bias + st_value));
        }
        if st_name == 0 {
            return Ok(None);
        }
        let strtab = self.require(DT_STRTAB, "DT_STRTAB")?;
        let name = image.cstr(bias + strtab + u64::from(st_name))?;
        let value = symbols::resolve(name)?;
        trace!("Bound {} to 0x{:016x}", name, value);
        Ok(Some(value))
    }
}

/// A symbol table as mapped in the image.
struct SymbolTable {
    syms: u64,
    count: Option<u64>,
    entsize: u64,
    strs: u64,
    strsz: u64,
}

impl SymbolTable {
    /// Scan for a defined global named `name`.
    fn find(&self, image: &ImageMemory, name: &str) -> Result<Option<u64>> {
        let mut index = 0;
        loop {
            if self.count.is_some_and(|n| index >= n) {
                return Ok(None);
            }
            let sym = self.syms + index * self.entsize;
            let Ok(reader) = image.reader(sym) else {
                return Ok(None);
            };
            let Ok(st_name) = reader.u32(SYM_NAME) else {
                return Ok(None);
            };
            if u64::from(st_name) >= self.strsz {
                return Ok(None);
            }
            index += 1;
            let st_info = reader.u8(SYM_INFO)?;
            let st_value = reader.u64(SYM_VALUE)?;
            if st_value == 0 || st_bind(st_info) != STB_GLOBAL {
                continue;
            }
            if image.cstr(self.strs + u64::from(st_name))? == name {
                return Ok(Some(image.bias() + st_value));
            }
        }
    }
}

impl ObjectImage for ElfImage {
    fn format(&self) -> ImageFormat {
        ImageFormat::Elf
    }

    fn relocate(&mut self, image: &mut ImageMemory) -> Result<()> {
        if self.dynamic(DT_RELSZ) != 0 {
            return Err(ElfError::RelRelocations.into());
        }
        let size = self.dynamic(DT_RELASZ);
        if size == 0 {
            return Ok(());
        }
        let table = self.require(DT_RELA, "DT_RELA")?;
        let entsize = self.require(DT_RELAENT, "DT_RELAENT")?;
        self.apply_relocations(image, table, size, entsize)
    }

    fn bind(&mut self, image: &mut ImageMemory) -> Result<()> {
        let size = self.dynamic(DT_PLTRELSZ);
        if size == 0 {
            return Ok(());
        }
        let table = self.require(DT_JMPREL, "DT_JMPREL")?;
        let entsize = self.require(DT_RELAENT, "DT_RELAENT")?;
        self.apply_relocations(image, table, size, entsize)
    }

    fn constructors(&self, image: &ImageMemory) -> Result<Vec<u64>> {
        let bias = image.bias();
        let mut ctors = Vec::new();
        if self.dynamic(DT_INIT) != 0 {
            ctors.push(bias + self.dynamic(DT_INIT));
        }
        let size = self.dynamic(DT_INIT_ARRAYSZ);
        if size != 0 {
            let array = bias + self.require(DT_INIT_ARRAY, "DT_INIT_ARRAY")?;
            for i in 0..size / 8 {
                match image.read_u64(array + i * 8)? {
                    0 => {}
                    addr => ctors.push(addr),
                }
            }
        }
        Ok(ctors)
    }

    fn destructors(&self, image: &ImageMemory) -> Result<Vec<u64>> {
        let bias = image.bias();
        let mut dtors = Vec::new();
        let size = self.dynamic(DT_FINI_ARRAYSZ);
        if size != 0 {
            let array = bias + self.require(DT_FINI_ARRAY, "DT_FINI_ARRAY")?;
            for i in (0..size / 8).rev() {
                match image.read_u64(array + i * 8)? {
                    0 => {}
                    addr => dtors.push(addr),
                }
            }
        }
        if self.dynamic(DT_FINI) != 0 {
            dtors.push(bias + self.dynamic(DT_FINI));
        }
        Ok(dtors)
    }

    fn find_symbol(&self, image: &ImageMemory, name: &str) -> Result<Option<u64>> {
        if self.executable {
            let header = self.symtab_header;
            let syms = image.read_u64(header)?;
            let entsize = image.read_u64(header + 8)?;
            let strs = image.read_u64(header + 16)?;
            let strsz = image.read_u64(header + 24)?;
            if entsize == 0 {
                return Ok(None);
            }
            let table = SymbolTable {
                syms,
                count: Some(strs.saturating_sub(syms) / entsize),
                entsize,
                strs,
                strsz,
            };
            return table.find(image, name);
        }

        let bias = image.bias();
        let strtab = self.require(DT_STRTAB, "DT_STRTAB")?;
        let symtab = self.require(DT_SYMTAB, "DT_SYMTAB")?;
        let strsz = self.require(DT_STRSZ, "DT_STRSZ")?;
        let syment = self.require(DT_SYMENT, "DT_SYMENT")?;
        let count = if self.dynamic(DT_HASH) != 0 {
            Some(u64::from(image.read_u32(bias + self.dynamic(DT_HASH) + 4)?))
        } else if strtab > symtab {
            Some((strtab - symtab) / syment)
        } else {
            None
        };
        let table = SymbolTable {
            syms: bias + symtab,
            count,
            entsize: syment,
            strs: bias + strtab,
            strsz,
        };
        table.find(image, name)
    }
}

//! Minimal image builders for the loader tests.
//!
//! Every builder produces an x86-64 image with the same shape: a block of
//! machine code stubs, a writable data area holding 32-bit variables and
//! absolute pointer slots, and a list of imports bound against the host
//! symbol table. Stubs follow the translated calling convention on SysV
//! hosts: the `CpuState` pointer arrives in RDI. Tests that run them are
//! limited to x86-64 Unix.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// `mov eax, [rdi+4]; mov [rdi], eax; ret` (EAX = ECX)
pub const RETURN_ECX: &[u8] = &[0x8b, 0x47, 0x04, 0x89, 0x07, 0xc3];

/// `mov eax, [rdi+8]; mov [rdi], eax; ret` (EAX = EDX)
pub const RETURN_EDX: &[u8] = &[0x8b, 0x47, 0x08, 0x89, 0x07, 0xc3];

/// `mov eax, [rdi+16]; mov eax, [rax]; mov [rdi], eax; ret` (EAX = [ESP])
pub const RETURN_STACK_ARG: &[u8] = &[0x8b, 0x47, 0x10, 0x8b, 0x00, 0x89, 0x07, 0xc3];

/// `mov dword [rdi], 1; ret`
pub const RETURN_ONE: &[u8] = &[0xc7, 0x07, 0x01, 0x00, 0x00, 0x00, 0xc3];

/// `mov dword [rdi], 0; ret`
pub const RETURN_ZERO: &[u8] = &[0xc7, 0x07, 0x00, 0x00, 0x00, 0x00, 0xc3];

/// `mov eax, [rdi+4]; mov dword [rax], 0x00020001; mov dword [rdi], 1; ret`
///
/// Writes the samples 1 and 2 to the buffer in ECX and reports success.
pub const RENDER_ONE_TWO: &[u8] = &[
    0x8b, 0x47, 0x04, 0xc7, 0x00, 0x01, 0x00, 0x02, 0x00, 0xc7, 0x07, 0x01, 0x00, 0x00, 0x00, 0xc3,
];

/// Body of a function.
#[derive(Clone, Debug)]
pub enum Code {
    Bytes(Vec<u8>),
    /// `jmp [rip+slot]` through the import slot of the named host symbol.
    JumpTo(String),
}

/// Contents shared by all three formats.
#[derive(Clone, Debug, Default)]
pub struct Image {
    pub functions: Vec<(String, Code)>,
    pub variables: Vec<(String, u32)>,
    /// Exported 8-byte slots holding the address of the named function.
    pub pointers: Vec<(String, String)>,
    /// Exported 4-byte slots holding the low half of the named function's
    /// address (PE only).
    pub words: Vec<(String, String)>,
    pub imports: Vec<String>,
    /// Functions registered as constructors, in order.
    pub init: Vec<String>,
    /// Functions registered as destructors, in order.
    pub fini: Vec<String>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, name: &str, code: &[u8]) -> Self {
        self.functions.push((name.to_string(), Code::Bytes(code.to_vec())));
        self
    }

    pub fn thunk(mut self, name: &str, import: &str) -> Self {
        self.functions
            .push((name.to_string(), Code::JumpTo(import.to_string())));
        self.import(import)
    }

    pub fn variable(mut self, name: &str, value: u32) -> Self {
        self.variables.push((name.to_string(), value));
        self
    }

    pub fn pointer(mut self, name: &str, target: &str) -> Self {
        self.pointers.push((name.to_string(), target.to_string()));
        self
    }

    pub fn word(mut self, name: &str, target: &str) -> Self {
        self.words.push((name.to_string(), target.to_string()));
        self
    }

    pub fn import(mut self, name: &str) -> Self {
        if !self.imports.iter().any(|i| i == name) {
            self.imports.push(name.to_string());
        }
        self
    }

    pub fn init(mut self, function: &str) -> Self {
        self.init.push(function.to_string());
        self
    }

    pub fn fini(mut self, function: &str) -> Self {
        self.fini.push(function.to_string());
        self
    }

    /// A stand-in synthesizer exporting every entry point the host needs.
    pub fn synth() -> Self {
        Self::new()
            .function("c_ValidateSettings_asm", RETURN_ECX)
            .function("c_InitializeDataFile_asm", RETURN_ONE)
            .function("c_InitializeSynth_asm", RETURN_ONE)
            .function("c_InitializeUnknown_asm", RETURN_ZERO)
            .function("c_InitializeEffect_asm", RETURN_ZERO)
            .function("c_InitializeCpuLoad_asm", RETURN_ZERO)
            .function("c_InitializeParameters_asm", RETURN_ZERO)
            .function("c_InitializeMasterVolume_asm", RETURN_ZERO)
            .function("c_MidiMessageShort_asm", RETURN_ECX)
            .function("c_MidiMessageLong_asm", RETURN_EDX)
            .function("c_RenderSamples_asm", RENDER_ONE_TWO)
            .variable("dwRenderedSamplesPerCall_asm", 64)
    }

    /// Offset of every function inside the code block, and the block.
    fn layout_code(&self, code_at: u64, slot_of: impl Fn(&str) -> u64) -> (Vec<u64>, Vec<u8>) {
        let mut offsets = Vec::new();
        let mut code = Vec::new();
        for (_, body) in &self.functions {
            while code.len() % 16 != 0 {
                code.push(0xcc);
            }
            offsets.push(code.len() as u64);
            match body {
                Code::Bytes(bytes) => code.extend_from_slice(bytes),
                Code::JumpTo(import) => {
                    let next = code_at + code.len() as u64 + 6;
                    let rel = slot_of(import).wrapping_sub(next) as i64 as i32;
                    code.extend_from_slice(&[0xff, 0x25]);
                    code.extend_from_slice(&rel.to_le_bytes());
                }
            }
        }
        (offsets, code)
    }

    fn function_index(&self, name: &str) -> usize {
        self.functions
            .iter()
            .position(|(n, _)| n == name)
            .unwrap_or_else(|| panic!("no function {name}"))
    }

    fn import_index(&self, name: &str) -> usize {
        self.imports
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("no import {name}"))
    }
}

/// Little-endian writer over a growable buffer.
#[derive(Default)]
pub struct Buf(pub Vec<u8>);

impl Buf {
    fn reserve(&mut self, end: usize) {
        if self.0.len() < end {
            self.0.resize(end, 0);
        }
    }

    pub fn bytes(&mut self, at: u64, bytes: &[u8]) {
        let at = at as usize;
        self.reserve(at + bytes.len());
        self.0[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn u8(&mut self, at: u64, value: u8) {
        self.bytes(at, &[value]);
    }

    pub fn u16(&mut self, at: u64, value: u16) {
        self.bytes(at, &value.to_le_bytes());
    }

    pub fn u32(&mut self, at: u64, value: u32) {
        self.bytes(at, &value.to_le_bytes());
    }

    pub fn u64(&mut self, at: u64, value: u64) {
        self.bytes(at, &value.to_le_bytes());
    }

    pub fn pad_to(&mut self, len: u64) {
        self.reserve(len as usize);
    }
}

/// String table with a leading NUL.
fn string_table<'a>(names: impl Iterator<Item = &'a str>, prefix: &str) -> (Vec<u8>, Vec<u32>) {
    let mut table = vec![0u8];
    let mut offsets = Vec::new();
    for name in names {
        offsets.push(table.len() as u32);
        table.extend_from_slice(prefix.as_bytes());
        table.extend_from_slice(name.as_bytes());
        table.push(0);
    }
    (table, offsets)
}

fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write fixture");
    path
}

// ELF

const ELF_DATA: u64 = 0x10000;
const ELF_GOT: u64 = ELF_DATA + 0x100;
const ELF_INIT_ARRAY: u64 = ELF_DATA + 0x400;
const ELF_FINI_ARRAY: u64 = ELF_DATA + 0x500;
const ELF_POINTERS: u64 = ELF_DATA + 0x600;
const ELF_VARIABLES: u64 = ELF_DATA + 0x800;
const ELF_DATA_SIZE: u64 = 0x1000;
const ELF_DYNSYM: u64 = 0x200;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;

const R_X86_64_JUMP_SLOT: u64 = 7;
const R_X86_64_RELATIVE: u64 = 8;

/// An `ET_DYN` shared object linked at zero. Text and data are separate
/// `PT_LOAD` segments 64KB apart; the file offsets equal the link addresses.
pub fn elf(image: &Image) -> Vec<u8> {
    let mut f = Buf::default();

    // .dynsym: null, imports, functions, variables, pointers
    let names = image
        .imports
        .iter()
        .chain(image.functions.iter().map(|(n, _)| n))
        .chain(image.variables.iter().map(|(n, _)| n))
        .chain(image.pointers.iter().map(|(n, _)| n));
    let (strtab, name_offsets) = string_table(names.map(String::as_str), "");
    let nsyms = 1 + name_offsets.len() as u64;
    let dynstr = ELF_DYNSYM + nsyms * SYM_SIZE;
    let rela_dyn = (dynstr + strtab.len() as u64 + 7) & !7;
    let nrelative = (image.init.len() + image.fini.len() + image.pointers.len()) as u64;
    let rela_plt = rela_dyn + nrelative * RELA_SIZE;
    let code_at = (rela_plt + image.imports.len() as u64 * RELA_SIZE + 15) & !15;

    let got = |import: &str| ELF_GOT + image.import_index(import) as u64 * 8;
    let (offsets, code) = image.layout_code(code_at, got);
    let func_addr = |name: &str| code_at + offsets[image.function_index(name)];
    let text_size = (code_at + code.len() as u64 + 0xfff) & !0xfff;
    assert!(text_size <= ELF_DATA, "text does not fit below the data segment");

    let mut sym = ELF_DYNSYM + SYM_SIZE;
    let mut name_iter = name_offsets.iter();
    let mut put_sym = |f: &mut Buf, info: u8, shndx: u16, value: u64| {
        let name = *name_iter.next().expect("symbol name");
        f.u32(sym, name);
        f.u8(sym + 4, info);
        f.u16(sym + 6, shndx);
        f.u64(sym + 8, value);
        sym += SYM_SIZE;
    };
    for _ in &image.imports {
        put_sym(&mut f, 0x12, 0, 0);
    }
    for (name, _) in &image.functions {
        put_sym(&mut f, 0x12, 1, func_addr(name));
    }
    for i in 0..image.variables.len() {
        put_sym(&mut f, 0x11, 2, ELF_VARIABLES + i as u64 * 4);
    }
    for i in 0..image.pointers.len() {
        put_sym(&mut f, 0x11, 2, ELF_POINTERS + i as u64 * 8);
    }
    f.bytes(dynstr, &strtab);

    // .rela.dyn
    let mut rela = rela_dyn;
    let mut relative = |f: &mut Buf, slot: u64, target: u64| {
        f.u64(rela, slot);
        f.u64(rela + 8, R_X86_64_RELATIVE);
        f.u64(rela + 16, target);
        rela += RELA_SIZE;
    };
    for (i, name) in image.init.iter().enumerate() {
        relative(&mut f, ELF_INIT_ARRAY + i as u64 * 8, func_addr(name));
    }
    for (i, name) in image.fini.iter().enumerate() {
        relative(&mut f, ELF_FINI_ARRAY + i as u64 * 8, func_addr(name));
    }
    for (i, (_, target)) in image.pointers.iter().enumerate() {
        relative(&mut f, ELF_POINTERS + i as u64 * 8, func_addr(target));
    }

    // .rela.plt
    for (i, _) in image.imports.iter().enumerate() {
        let at = rela_plt + i as u64 * RELA_SIZE;
        f.u64(at, ELF_GOT + i as u64 * 8);
        f.u64(at + 8, ((1 + i as u64) << 32) | R_X86_64_JUMP_SLOT);
        f.u64(at + 16, 0);
    }

    f.bytes(code_at, &code);

    // .dynamic
    let dynamic = [
        (5, dynstr),
        (6, ELF_DYNSYM),
        (10, strtab.len() as u64),
        (11, SYM_SIZE),
        (7, rela_dyn),
        (8, nrelative * RELA_SIZE),
        (9, RELA_SIZE),
        (23, rela_plt),
        (2, image.imports.len() as u64 * RELA_SIZE),
        (25, ELF_INIT_ARRAY),
        (27, image.init.len() as u64 * 8),
        (26, ELF_FINI_ARRAY),
        (28, image.fini.len() as u64 * 8),
        (0, 0),
    ];
    for (i, (tag, value)) in dynamic.iter().enumerate() {
        f.u64(ELF_DATA + i as u64 * 16, *tag);
        f.u64(ELF_DATA + i as u64 * 16 + 8, *value);
    }
    for (i, (_, value)) in image.variables.iter().enumerate() {
        f.u32(ELF_VARIABLES + i as u64 * 4, *value);
    }
    f.pad_to(ELF_DATA + ELF_DATA_SIZE);

    // ELF header
    f.bytes(0, b"\x7fELF");
    f.u8(4, 2); // ELFCLASS64
    f.u8(5, 1); // little endian
    f.u8(6, 1); // EV_CURRENT
    f.u16(16, 3); // ET_DYN
    f.u16(18, 62); // EM_X86_64
    f.u32(20, 1);
    f.u64(32, 64); // e_phoff
    f.u16(52, 64); // e_ehsize
    f.u16(54, 56); // e_phentsize
    f.u16(56, 3); // e_phnum
    f.u16(58, 64); // e_shentsize

    let phdr = |f: &mut Buf, i: u64, kind: u32, flags: u32, addr: u64, size: u64| {
        let at = 64 + i * 56;
        f.u32(at, kind);
        f.u32(at + 4, flags);
        f.u64(at + 8, addr);
        f.u64(at + 16, addr);
        f.u64(at + 24, addr);
        f.u64(at + 32, size);
        f.u64(at + 40, size);
        f.u64(at + 48, 0x1000);
    };
    phdr(&mut f, 0, 1, 5, 0, text_size);
    phdr(&mut f, 1, 1, 6, ELF_DATA, ELF_DATA_SIZE);
    phdr(&mut f, 2, 2, 6, ELF_DATA, dynamic.len() as u64 * 16);
    f.0
}

/// An `ET_EXEC` executable linked at `link_base` with no `PT_DYNAMIC`.
///
/// Text sits at file offset zero, data 64KB above it; exports are only
/// reachable through the `.symtab`/`.strtab` section headers at the end of
/// the file. Imports, pointers and constructors are not supported.
pub fn elf_exec(image: &Image, link_base: u64) -> Vec<u8> {
    assert!(image.imports.is_empty() && image.pointers.is_empty());
    assert!(image.init.is_empty() && image.fini.is_empty());
    let mut f = Buf::default();
    let code_at = 0x100;
    let (offsets, code) = image.layout_code(link_base + code_at, |_| 0);
    assert!(code_at + (code.len() as u64) <= 0x1000);
    f.bytes(code_at, &code);
    let data_file = 0x1000;
    let data_addr = link_base + ELF_DATA;
    for (i, (_, value)) in image.variables.iter().enumerate() {
        f.u32(data_file + i as u64 * 4, *value);
    }
    f.pad_to(data_file + 0x1000);

    // .symtab: null, a local, functions, variables
    let names = std::iter::once("local_helper")
        .chain(image.functions.iter().map(|(n, _)| n.as_str()))
        .chain(image.variables.iter().map(|(n, _)| n.as_str()));
    let (strtab, name_offsets) = string_table(names, "");
    let symtab_off = data_file + 0x1000;
    let mut sym = symtab_off + SYM_SIZE;
    let mut name_iter = name_offsets.iter();
    let mut put_sym = |f: &mut Buf, info: u8, shndx: u16, value: u64| {
        f.u32(sym, *name_iter.next().expect("symbol name"));
        f.u8(sym + 4, info);
        f.u16(sym + 6, shndx);
        f.u64(sym + 8, value);
        sym += SYM_SIZE;
    };
    f.pad_to(symtab_off + SYM_SIZE);
    put_sym(&mut f, 0x02, 1, link_base + code_at); // STB_LOCAL
    for (i, _) in image.functions.iter().enumerate() {
        put_sym(&mut f, 0x12, 1, link_base + code_at + offsets[i]);
    }
    for i in 0..image.variables.len() {
        put_sym(&mut f, 0x11, 2, data_addr + i as u64 * 4);
    }
    let symtab_size = sym - symtab_off;
    let strtab_off = sym;
    f.bytes(strtab_off, &strtab);
    let shstrtab_off = strtab_off + strtab.len() as u64;
    let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0";
    f.bytes(shstrtab_off, shstrtab);
    let shoff = (shstrtab_off + shstrtab.len() as u64 + 7) & !7;

    // section headers: null, .symtab, .strtab, .shstrtab
    let shdr = |f: &mut Buf, i: u64, name: u32, kind: u32, off: u64, size: u64, link: u32, entsize: u64| {
        let at = shoff + i * 64;
        f.u32(at, name);
        f.u32(at + 4, kind);
        f.u64(at + 24, off);
        f.u64(at + 32, size);
        f.u32(at + 40, link);
        f.u64(at + 56, entsize);
    };
    shdr(&mut f, 0, 0, 0, 0, 0, 0, 0);
    shdr(&mut f, 1, 1, 2, symtab_off, symtab_size, 2, SYM_SIZE);
    shdr(&mut f, 2, 9, 3, strtab_off, strtab.len() as u64, 0, 0);
    shdr(&mut f, 3, 17, 3, shstrtab_off, shstrtab.len() as u64, 0, 0);

    f.bytes(0, b"\x7fELF");
    f.u8(4, 2); // ELFCLASS64
    f.u8(5, 1); // little endian
    f.u8(6, 1); // EV_CURRENT
    f.u16(16, 2); // ET_EXEC
    f.u16(18, 62); // EM_X86_64
    f.u32(20, 1);
    f.u64(32, 64); // e_phoff
    f.u64(40, shoff); // e_shoff
    f.u16(52, 64); // e_ehsize
    f.u16(54, 56); // e_phentsize
    f.u16(56, 2); // e_phnum
    f.u16(58, 64); // e_shentsize
    f.u16(60, 4); // e_shnum
    f.u16(62, 3); // e_shstrndx

    let phdr = |f: &mut Buf, i: u64, flags: u32, offset: u64, addr: u64| {
        let at = 64 + i * 56;
        f.u32(at, 1); // PT_LOAD
        f.u32(at + 4, flags);
        f.u64(at + 8, offset);
        f.u64(at + 16, addr);
        f.u64(at + 24, addr);
        f.u64(at + 32, 0x1000);
        f.u64(at + 40, 0x1000);
        f.u64(at + 48, 0x1000);
    };
    phdr(&mut f, 0, 5, 0, link_base);
    phdr(&mut f, 1, 6, data_file, data_addr);
    f.0
}

// PE

const PE_NT: u64 = 0x40;
const PE_OPTIONAL: u64 = PE_NT + 24;
const PE_SECTIONS: u64 = PE_OPTIONAL + 240;
const PE_TEXT_RVA: u64 = 0x10000;
const PE_DATA_RVA: u64 = 0x20000;
const PE_TEXT_RAW: u64 = 0x400;
const PE_DATA_RAW: u64 = 0x1400;
const PE_SECTION_SIZE: u64 = 0x1000;

// offsets into .data
const PE_EXPORTS: u64 = 0x000;
const PE_EXPORT_FUNCTIONS: u64 = 0x040;
const PE_EXPORT_NAMES: u64 = 0x140;
const PE_EXPORT_ORDINALS: u64 = 0x240;
const PE_STRINGS: u64 = 0x300;
const PE_IMPORTS: u64 = 0x900;
const PE_LOOKUP: u64 = 0x940;
const PE_IAT: u64 = 0xa00;
const PE_RELOCS: u64 = 0xb00;
const PE_POINTERS: u64 = 0xc00;
const PE_WORDS: u64 = 0xd00;
const PE_VARIABLES: u64 = 0xe00;

/// Preferred base of PE fixtures.
pub const PE_IMAGE_BASE: u64 = 0x1000_0000;

/// A PE32+ DLL with a `.text` and a `.data` section. With `relocatable` the
/// pointer slots get `DIR64` base relocations, the word slots `HIGHLOW` ones
/// and every variable an `ABSOLUTE` entry, and the image may be placed
/// anywhere; without, it must land at `image_base`.
pub fn pe(image: &Image, image_base: u64, relocatable: bool) -> Vec<u8> {
    assert!(image.init.is_empty() && image.fini.is_empty());
    let mut f = Buf::default();
    let data = |offset: u64| PE_DATA_RVA + offset;
    let iat = |import: &str| data(PE_IAT) + image.import_index(import) as u64 * 8;
    let (offsets, code) = image.layout_code(PE_TEXT_RVA, iat);
    assert!(code.len() as u64 <= PE_SECTION_SIZE);
    let func_rva = |name: &str| PE_TEXT_RVA + offsets[image.function_index(name)];

    // .data contents, assembled at their file offsets
    let d = |offset: u64| PE_DATA_RAW + offset;
    let mut strings = PE_STRINGS;
    let mut string = |f: &mut Buf, prefix: &[u8], s: &str| {
        let at = strings;
        f.bytes(d(at), prefix);
        f.bytes(d(at) + prefix.len() as u64, s.as_bytes());
        strings += (prefix.len() + s.len() + 1) as u64;
        data(at)
    };

    let mut exports: Vec<(String, u64)> = Vec::new();
    for (name, _) in &image.functions {
        exports.push((name.clone(), func_rva(name)));
    }
    for (i, (name, value)) in image.variables.iter().enumerate() {
        let at = PE_VARIABLES + i as u64 * 4;
        f.u32(d(at), *value);
        exports.push((name.clone(), data(at)));
    }
    for (i, (name, target)) in image.pointers.iter().enumerate() {
        let at = PE_POINTERS + i as u64 * 8;
        f.u64(d(at), image_base + func_rva(target));
        exports.push((name.clone(), data(at)));
    }
    for (i, (name, target)) in image.words.iter().enumerate() {
        let at = PE_WORDS + i as u64 * 4;
        f.u32(d(at), (image_base + func_rva(target)) as u32);
        exports.push((name.clone(), data(at)));
    }
    f.u32(d(PE_EXPORTS) + 20, exports.len() as u32);
    f.u32(d(PE_EXPORTS) + 24, exports.len() as u32);
    f.u32(d(PE_EXPORTS) + 28, data(PE_EXPORT_FUNCTIONS) as u32);
    f.u32(d(PE_EXPORTS) + 32, data(PE_EXPORT_NAMES) as u32);
    f.u32(d(PE_EXPORTS) + 36, data(PE_EXPORT_ORDINALS) as u32);
    for (i, (name, rva)) in exports.iter().enumerate() {
        let i = i as u64;
        f.u32(d(PE_EXPORT_FUNCTIONS) + i * 4, *rva as u32);
        let name_rva = string(&mut f, b"", name);
        f.u32(d(PE_EXPORT_NAMES) + i * 4, name_rva as u32);
        f.u16(d(PE_EXPORT_ORDINALS) + i * 2, i as u16);
    }

    if !image.imports.is_empty() {
        f.u32(d(PE_IMPORTS), data(PE_LOOKUP) as u32);
        f.u32(d(PE_IMPORTS) + 16, data(PE_IAT) as u32);
        for (i, name) in image.imports.iter().enumerate() {
            let hint_name = string(&mut f, b"\0\0", name);
            f.u64(d(PE_LOOKUP) + i as u64 * 8, hint_name);
            f.u64(d(PE_IAT) + i as u64 * 8, hint_name);
        }
    }
    assert!(strings <= PE_IMPORTS);

    let mut reloc_size = 0;
    if relocatable {
        let dir64 = (0..image.pointers.len() as u64).map(|i| (10 << 12) | (PE_POINTERS + i * 8));
        let highlow = (0..image.words.len() as u64).map(|i| (3 << 12) | (PE_WORDS + i * 4));
        let absolute = (0..image.variables.len() as u64).map(|i| PE_VARIABLES + i * 4);
        let mut entries: Vec<u16> = dir64.chain(highlow).chain(absolute).map(|e| e as u16).collect();
        if entries.len() % 2 != 0 {
            entries.push(0);
        }
        reloc_size = 8 + entries.len() as u64 * 2;
        f.u32(d(PE_RELOCS), data(0) as u32);
        f.u32(d(PE_RELOCS) + 4, reloc_size as u32);
        for (i, entry) in entries.iter().enumerate() {
            f.u16(d(PE_RELOCS) + 8 + i as u64 * 2, *entry);
        }
    }

    f.bytes(PE_TEXT_RAW, &code);
    f.pad_to(PE_DATA_RAW + PE_SECTION_SIZE);

    // headers
    f.bytes(0, b"MZ");
    f.u32(0x3c, PE_NT as u32);
    f.bytes(PE_NT, b"PE\0\0");
    let fh = PE_NT + 4;
    f.u16(fh, 0x8664);
    f.u16(fh + 2, 2);
    f.u16(fh + 16, 240);
    f.u16(fh + 18, 0x2022); // EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE | DLL

    let oh = PE_OPTIONAL;
    f.u16(oh, 0x20b);
    f.u64(oh + 24, image_base);
    f.u32(oh + 32, 0x1000); // SectionAlignment
    f.u32(oh + 36, 0x200); // FileAlignment
    f.u32(oh + 56, (PE_DATA_RVA + PE_SECTION_SIZE) as u32); // SizeOfImage
    f.u32(oh + 60, PE_TEXT_RAW as u32); // SizeOfHeaders
    f.u16(oh + 68, 3);
    f.u32(oh + 108, 16);
    let dir = |f: &mut Buf, index: u64, rva: u64, size: u64| {
        f.u32(oh + 112 + index * 8, rva as u32);
        f.u32(oh + 112 + index * 8 + 4, size as u32);
    };
    dir(&mut f, 0, data(PE_EXPORTS), 40);
    if !image.imports.is_empty() {
        dir(&mut f, 1, data(PE_IMPORTS), 40);
        dir(&mut f, 12, data(PE_IAT), (image.imports.len() as u64 + 1) * 8);
    }
    if relocatable {
        dir(&mut f, 5, data(PE_RELOCS), reloc_size);
    }

    let section = |f: &mut Buf, i: u64, name: &[u8], rva: u64, raw: u64, flags: u32| {
        let at = PE_SECTIONS + i * 40;
        f.bytes(at, name);
        f.u32(at + 8, PE_SECTION_SIZE as u32);
        f.u32(at + 12, rva as u32);
        f.u32(at + 16, PE_SECTION_SIZE as u32);
        f.u32(at + 20, raw as u32);
        f.u32(at + 36, flags);
    };
    section(&mut f, 0, b".text", PE_TEXT_RVA, PE_TEXT_RAW, 0x6000_0020);
    section(&mut f, 1, b".data", PE_DATA_RVA, PE_DATA_RAW, 0xc000_0040);
    f.0
}

// Mach-O

const MACHO_DATA: u64 = 0x10000;
const MACHO_LINKEDIT: u64 = 0x20000;
const MACHO_SEGMENT: u64 = 0x10000;
const MACHO_FILE_SEGMENT: u64 = 0x1000;
const MACHO_CODE: u64 = 0x800;
// offsets into __DATA
const MACHO_VARIABLES: u64 = 0x000;
const MACHO_POINTERS: u64 = 0x200;
const MACHO_INIT: u64 = 0x400;
const MACHO_TERM: u64 = 0x500;
const MACHO_GOT: u64 = 0x600;

/// Link address of the first `__got` slot; bind `i` targets slot `i`.
pub const MACHO_GOT_ADDR: u64 = MACHO_DATA + MACHO_GOT;

/// One entry of a Mach-O bind stream.
#[derive(Clone, Debug)]
pub struct MachBind {
    /// Name as spelled in the image, underscore included.
    pub symbol: String,
    /// Opcode selecting the library ordinal.
    pub dylib: u8,
    pub flags: u8,
}

impl MachBind {
    /// A flat-lookup bind (`SET_DYLIB_SPECIAL_IMM -2`).
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            dylib: 0x3e,
            flags: 0,
        }
    }
}

/// An `MH_BUNDLE` linked at zero with `__TEXT`, `__DATA` and `__LINKEDIT`
/// segments 64KB apart, classic dyld info and flat-lookup binds.
pub fn macho(image: &Image) -> Vec<u8> {
    let binds: Vec<MachBind> = image
        .imports
        .iter()
        .map(|name| MachBind::flat(&format!("_{name}")))
        .collect();
    macho_with_binds(image, &binds)
}

/// Like [`macho`], with the bind stream spelled out by the caller.
pub fn macho_with_binds(image: &Image, binds: &[MachBind]) -> Vec<u8> {
    assert!(image.imports.len() <= binds.len());
    let mut f = Buf::default();
    let got = |import: &str| MACHO_DATA + MACHO_GOT + image.import_index(import) as u64 * 8;
    let (offsets, code) = image.layout_code(MACHO_CODE, got);
    assert!(MACHO_CODE + code.len() as u64 <= MACHO_FILE_SEGMENT);
    let func_addr = |name: &str| MACHO_CODE + offsets[image.function_index(name)];

    let text_file = 0;
    let data_file = MACHO_FILE_SEGMENT;
    let link_file = 2 * MACHO_FILE_SEGMENT;
    f.bytes(text_file + MACHO_CODE, &code);

    // __DATA: variables, pointers and constructors hold link addresses
    for (i, (_, value)) in image.variables.iter().enumerate() {
        f.u32(data_file + MACHO_VARIABLES + i as u64 * 4, *value);
    }
    for (i, (_, target)) in image.pointers.iter().enumerate() {
        f.u64(data_file + MACHO_POINTERS + i as u64 * 8, func_addr(target));
    }
    for (i, name) in image.init.iter().enumerate() {
        f.u64(data_file + MACHO_INIT + i as u64 * 8, func_addr(name));
    }
    for (i, name) in image.fini.iter().enumerate() {
        f.u64(data_file + MACHO_TERM + i as u64 * 8, func_addr(name));
    }

    // rebase: segment 1, every pointer, constructor and destructor slot
    let mut rebase = vec![0x11]; // SET_TYPE_IMM pointer
    for (start, count) in [
        (MACHO_POINTERS, image.pointers.len()),
        (MACHO_INIT, image.init.len()),
        (MACHO_TERM, image.fini.len()),
    ] {
        if count == 0 {
            continue;
        }
        rebase.push(0x21); // SET_SEGMENT_AND_OFFSET_ULEB segment 1
        uleb(&mut rebase, start);
        rebase.push(0x60); // DO_REBASE_ULEB_TIMES
        uleb(&mut rebase, count as u64);
    }
    rebase.push(0x00);

    // bind: one DO_BIND per entry
    let mut bind = Vec::new();
    for (i, entry) in binds.iter().enumerate() {
        bind.push(entry.dylib);
        bind.push(0x40 | entry.flags); // SET_SYMBOL_TRAILING_FLAGS_IMM
        bind.extend_from_slice(entry.symbol.as_bytes());
        bind.push(0);
        bind.push(0x51); // SET_TYPE_IMM pointer
        bind.push(0x71); // SET_SEGMENT_AND_OFFSET_ULEB segment 1
        uleb(&mut bind, MACHO_GOT + i as u64 * 8);
        bind.push(0x90); // DO_BIND
    }
    bind.push(0x00);

    // symbols: functions in section 1, variables and pointers in section 2
    let names = image
        .functions
        .iter()
        .map(|(n, _)| n)
        .chain(image.variables.iter().map(|(n, _)| n))
        .chain(image.pointers.iter().map(|(n, _)| n));
    let (strtab, name_offsets) = string_table(names.map(String::as_str), "_");
    let mut values = Vec::new();
    for (name, _) in &image.functions {
        values.push((1u8, func_addr(name)));
    }
    for i in 0..image.variables.len() {
        values.push((2, MACHO_DATA + MACHO_VARIABLES + i as u64 * 4));
    }
    for i in 0..image.pointers.len() {
        values.push((2, MACHO_DATA + MACHO_POINTERS + i as u64 * 8));
    }

    let rebase_off = link_file;
    let bind_off = rebase_off + rebase.len() as u64;
    let symoff = (bind_off + bind.len() as u64 + 7) & !7;
    let stroff = symoff + values.len() as u64 * 16;
    assert!(stroff + strtab.len() as u64 <= link_file + MACHO_FILE_SEGMENT);
    f.bytes(rebase_off, &rebase);
    f.bytes(bind_off, &bind);
    for (i, ((sect, value), strx)) in values.iter().zip(&name_offsets).enumerate() {
        let at = symoff + i as u64 * 16;
        f.u32(at, *strx);
        f.u8(at + 4, 0x0f); // N_SECT | N_EXT
        f.u8(at + 5, *sect);
        f.u64(at + 8, *value);
    }
    f.bytes(stroff, &strtab);
    f.pad_to(link_file + MACHO_FILE_SEGMENT);

    // load commands
    let mut cmds = Buf::default();
    let mut at = 0u64;
    let mut ncmds = 0;
    let mut segment = |cmds: &mut Buf,
                       at: &mut u64,
                       name: &[u8],
                       vmaddr: u64,
                       fileoff: u64,
                       prot: u32,
                       sections: &[(&[u8], u64, u64, u32)]| {
        let size = 72 + sections.len() as u64 * 80;
        cmds.u32(*at, 0x19);
        cmds.u32(*at + 4, size as u32);
        cmds.bytes(*at + 8, name);
        cmds.u64(*at + 24, vmaddr);
        cmds.u64(*at + 32, MACHO_SEGMENT);
        cmds.u64(*at + 40, fileoff);
        cmds.u64(*at + 48, MACHO_FILE_SEGMENT);
        cmds.u32(*at + 56, prot);
        cmds.u32(*at + 60, prot);
        cmds.u32(*at + 64, sections.len() as u32);
        for (i, (sectname, addr, len, flags)) in sections.iter().enumerate() {
            let s = *at + 72 + i as u64 * 80;
            cmds.bytes(s, sectname);
            cmds.bytes(s + 16, name);
            cmds.u64(s + 32, *addr);
            cmds.u64(s + 40, *len);
            cmds.u32(s + 48, (fileoff + addr - vmaddr) as u32);
            cmds.u32(s + 64, *flags);
        }
        *at += size;
        ncmds += 1;
    };
    segment(
        &mut cmds,
        &mut at,
        b"__TEXT",
        0,
        text_file,
        5,
        &[(&b"__text"[..], MACHO_CODE, code.len().max(1) as u64, 0x8000_0400)],
    );
    segment(
        &mut cmds,
        &mut at,
        b"__DATA",
        MACHO_DATA,
        data_file,
        3,
        &[
            (&b"__data"[..], MACHO_DATA + MACHO_VARIABLES, 0x400, 0),
            (&b"__mod_init_func"[..], MACHO_DATA + MACHO_INIT, image.init.len() as u64 * 8, 0x9),
            (&b"__mod_term_func"[..], MACHO_DATA + MACHO_TERM, image.fini.len() as u64 * 8, 0xa),
            (&b"__got"[..], MACHO_DATA + MACHO_GOT, binds.len() as u64 * 8, 0x6),
        ],
    );
    segment(&mut cmds, &mut at, b"__LINKEDIT", MACHO_LINKEDIT, link_file, 1, &[]);

    // LC_DYLD_INFO_ONLY
    cmds.u32(at, 0x8000_0022);
    cmds.u32(at + 4, 48);
    cmds.u32(at + 8, rebase_off as u32);
    cmds.u32(at + 12, rebase.len() as u32);
    cmds.u32(at + 16, bind_off as u32);
    cmds.u32(at + 20, bind.len() as u32);
    at += 48;
    // LC_SYMTAB
    cmds.u32(at, 0x2);
    cmds.u32(at + 4, 24);
    cmds.u32(at + 8, symoff as u32);
    cmds.u32(at + 12, values.len() as u32);
    cmds.u32(at + 16, stroff as u32);
    cmds.u32(at + 20, strtab.len() as u32);
    at += 24;
    // LC_DYSYMTAB
    cmds.u32(at, 0xb);
    cmds.u32(at + 4, 80);
    at += 80;
    let ncmds = ncmds + 3;

    assert!(32 + at <= MACHO_CODE);
    f.bytes(32, &cmds.0);
    f.u32(0, 0xfeed_facf);
    f.u32(4, 0x0100_0007);
    f.u32(8, 3);
    f.u32(12, 0x8); // MH_BUNDLE
    f.u32(16, ncmds);
    f.u32(20, at as u32);
    f.u32(24, 0x85); // NOUNDEFS | DYLDLINK | TWOLEVEL
    f.0
}

//! ELF parser for Linux/Android IL2CPP binaries (libil2cpp.so)
//!
//! Handles ELF32 and ELF64 in one parser, branching on the class byte.
//! Address mapping is driven by the program headers, symbols come from
//! the dynamic segment (sized via the SysV or GNU hash table), and
//! dynamic relocations are applied to the owned buffer so every
//! downstream read observes the relocated image.

use metadump_core::Version;
use tracing::{debug, warn};

use crate::common::{BinaryFormat, Il2CppBinary, SearchSection, SectionClassification};
use crate::error::{ParseError, ParseResult};
use crate::pattern::search_pattern;
use crate::stream::BinaryStream;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PF_X: u32 = 1;

const DT_NULL: i64 = 0;
const DT_PLTGOT: i64 = 3;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_INIT: i64 = 12;
const DT_FINI: i64 = 13;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_JMPREL: i64 = 23;
const DT_INIT_ARRAY: i64 = 25;
const DT_FINI_ARRAY: i64 = 26;
const DT_GNU_HASH: i64 = 0x6FFF_FEF5;

const SHT_LOUSER: u32 = 0x8000_0000;

const R_386_32: u32 = 1;
const R_ARM_ABS32: u32 = 2;
const R_AARCH64_ABS64: u32 = 257;
const R_AARCH64_RELATIVE: u32 = 1027;
const R_X86_64_64: u32 = 1;
const R_X86_64_RELATIVE: u32 = 8;

/// Dynamic-entry tags whose values are VAs and must be rebased when the
/// file is a memory dump loaded at a non-zero image base.
const REBASED_TAGS: [i64; 11] = [
    DT_PLTGOT,
    DT_HASH,
    DT_STRTAB,
    DT_SYMTAB,
    DT_RELA,
    DT_INIT,
    DT_FINI,
    DT_REL,
    DT_JMPREL,
    DT_INIT_ARRAY,
    DT_FINI_ARRAY,
];

/// Feature bytes of the il2cpp init thunk on 32-bit ARM; `?` bytes are
/// register-dependent.
const ARM_FEATURE_BYTES: &str = "? 10 ? E7 ? 00 ? E0 ? 20 ? E0";

#[derive(Debug, Clone, Copy, Default)]
struct ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

#[derive(Debug, Clone, Copy)]
struct DynamicEntry {
    d_tag: i64,
    d_un: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ElfSymbol {
    st_name: u32,
    st_value: u64,
}

pub struct ElfFile {
    data: Vec<u8>,
    is_64bit: bool,
    machine: u16,
    e_phoff: u64,
    e_phnum: u16,
    e_shoff: u64,
    e_shnum: u16,
    e_shstrndx: u16,
    image_base: u64,
    is_dumped: bool,
    segments: Vec<ProgramHeader>,
    dynamic: Vec<DynamicEntry>,
    symbol_table: Vec<ElfSymbol>,
}

impl ElfFile {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 0x40 {
            return Err(ParseError::truncated(0x40, data.len()));
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u32::from_le_bytes(ELF_MAGIC),
                actual: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            });
        }

        let is_64bit = match data[4] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            class => {
                return Err(ParseError::invalid_header(format!(
                    "invalid ELF class: {class}"
                )))
            }
        };
        if data[5] != ELFDATA2LSB {
            return Err(ParseError::invalid_header(
                "big-endian ELF is not supported",
            ));
        }

        let mut elf = Self {
            data: data.to_vec(),
            is_64bit,
            machine: 0,
            e_phoff: 0,
            e_phnum: 0,
            e_shoff: 0,
            e_shnum: 0,
            e_shstrndx: 0,
            image_base: 0,
            is_dumped: false,
            segments: Vec::new(),
            dynamic: Vec::new(),
            symbol_table: Vec::new(),
        };
        elf.load()?;
        Ok(elf)
    }

    fn stream(&self) -> BinaryStream<'_> {
        BinaryStream::new(&self.data, Version::MIN, !self.is_64bit)
    }

    fn load(&mut self) -> ParseResult<()> {
        self.read_header()?;
        self.read_program_headers()?;
        self.load_after_headers()
    }

    fn load_after_headers(&mut self) -> ParseResult<()> {
        if self.is_dumped {
            self.fix_program_headers();
            self.fix_dynamic_entries()?;
        } else {
            self.read_dynamic_entries()?;
        }

        self.read_symbols()?;

        if !self.is_dumped {
            self.apply_relocations()?;
            self.check_protection();
        }
        Ok(())
    }

    fn read_header(&mut self) -> ParseResult<()> {
        let mut r = self.stream();
        r.set_position(16);
        let _e_type = r.read_u16()?;
        let machine = r.read_u16()?;
        let _e_version = r.read_u32()?;
        let (e_phoff, e_shoff) = if self.is_64bit {
            let _e_entry = r.read_u64()?;
            let e_phoff = r.read_u64()?;
            let e_shoff = r.read_u64()?;
            (e_phoff, e_shoff)
        } else {
            let _e_entry = r.read_u32()?;
            let e_phoff = r.read_u32()? as u64;
            let e_shoff = r.read_u32()? as u64;
            (e_phoff, e_shoff)
        };
        let _e_flags = r.read_u32()?;
        let _e_ehsize = r.read_u16()?;
        let _e_phentsize = r.read_u16()?;
        let e_phnum = r.read_u16()?;
        let _e_shentsize = r.read_u16()?;
        let e_shnum = r.read_u16()?;
        let e_shstrndx = r.read_u16()?;
        self.machine = machine;
        self.e_phoff = e_phoff;
        self.e_shoff = e_shoff;
        self.e_phnum = e_phnum;
        self.e_shnum = e_shnum;
        self.e_shstrndx = e_shstrndx;
        Ok(())
    }

    fn read_program_headers(&mut self) -> ParseResult<()> {
        let mut r = self.stream();
        r.set_position(self.e_phoff as usize);
        let mut segments = Vec::with_capacity(self.e_phnum as usize);
        for _ in 0..self.e_phnum {
            let phdr = if self.is_64bit {
                let p_type = r.read_u32()?;
                let p_flags = r.read_u32()?;
                let p_offset = r.read_u64()?;
                let p_vaddr = r.read_u64()?;
                let _p_paddr = r.read_u64()?;
                let p_filesz = r.read_u64()?;
                let p_memsz = r.read_u64()?;
                let _p_align = r.read_u64()?;
                ProgramHeader {
                    p_type,
                    p_flags,
                    p_offset,
                    p_vaddr,
                    p_filesz,
                    p_memsz,
                }
            } else {
                let p_type = r.read_u32()?;
                let p_offset = r.read_u32()? as u64;
                let p_vaddr = r.read_u32()? as u64;
                let _p_paddr = r.read_u32()?;
                let p_filesz = r.read_u32()? as u64;
                let p_memsz = r.read_u32()? as u64;
                let p_flags = r.read_u32()?;
                let _p_align = r.read_u32()?;
                ProgramHeader {
                    p_type,
                    p_flags,
                    p_offset,
                    p_vaddr,
                    p_filesz,
                    p_memsz,
                }
            };
            segments.push(phdr);
        }
        self.segments = segments;
        Ok(())
    }

    fn pt_dynamic(&self) -> ParseResult<ProgramHeader> {
        self.segments
            .iter()
            .copied()
            .find(|seg| seg.p_type == PT_DYNAMIC)
            .ok_or_else(|| ParseError::invalid_header("no PT_DYNAMIC segment"))
    }

    fn read_dynamic_entries(&mut self) -> ParseResult<()> {
        let dynamic = self.pt_dynamic()?;
        let entry_size = if self.is_64bit { 16 } else { 8 };
        let count = (dynamic.p_filesz / entry_size) as usize;
        let mut r = self.stream();
        r.set_position(dynamic.p_offset as usize);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let (d_tag, d_un) = if self.is_64bit {
                (r.read_i64()?, r.read_u64()?)
            } else {
                (r.read_i32()? as i64, r.read_u32()? as u64)
            };
            entries.push(DynamicEntry { d_tag, d_un });
            if d_tag == DT_NULL {
                break;
            }
        }
        self.dynamic = entries;
        Ok(())
    }

    fn find_dynamic(&self, tag: i64) -> Option<DynamicEntry> {
        self.dynamic.iter().copied().find(|e| e.d_tag == tag)
    }

    /// Symbol-table length: SysV hash gives it as `nchain`; for GNU
    /// hash the last bucketed symbol's chain is walked to a terminator.
    fn symbol_count(&self) -> ParseResult<usize> {
        if let Some(hash) = self.find_dynamic(DT_HASH) {
            let offset = self.va_to_offset(hash.d_un)? as usize;
            let mut r = self.stream();
            r.set_position(offset);
            let _nbucket = r.read_u32()?;
            let nchain = r.read_u32()?;
            return Ok(nchain as usize);
        }

        if let Some(hash) = self.find_dynamic(DT_GNU_HASH) {
            let offset = self.va_to_offset(hash.d_un)? as usize;
            let mut r = self.stream();
            r.set_position(offset);
            let nbuckets = r.read_u32()? as usize;
            let symoffset = r.read_u32()?;
            let bloom_size = r.read_u32()? as usize;
            let _bloom_shift = r.read_u32()?;
            let bloom_word = if self.is_64bit { 8 } else { 4 };
            let buckets_offset = offset + 16 + bloom_word * bloom_size;
            r.set_position(buckets_offset);
            let buckets = r.read_u32_array(nbuckets)?;
            let mut last_symbol = buckets.iter().copied().max().unwrap_or(0);
            if last_symbol < symoffset {
                return Ok(symoffset as usize);
            }
            let chains_offset = buckets_offset + 4 * nbuckets;
            r.set_position(chains_offset + (last_symbol - symoffset) as usize * 4);
            loop {
                let chain_entry = r.read_u32()?;
                last_symbol += 1;
                if chain_entry & 1 != 0 {
                    break;
                }
            }
            return Ok(last_symbol as usize);
        }

        Ok(0)
    }

    fn read_symbols(&mut self) -> ParseResult<()> {
        self.symbol_table.clear();
        let count = match self.symbol_count() {
            Ok(count) => count,
            Err(_) => return Ok(()),
        };
        let Some(symtab) = self.find_dynamic(DT_SYMTAB) else {
            return Ok(());
        };
        let Ok(offset) = self.va_to_offset(symtab.d_un) else {
            return Ok(());
        };

        let mut r = self.stream();
        r.set_position(offset as usize);
        let mut symbols = Vec::with_capacity(count);
        for _ in 0..count {
            let sym = if self.is_64bit {
                let st_name = r.read_u32()?;
                let _st_info = r.read_u8()?;
                let _st_other = r.read_u8()?;
                let _st_shndx = r.read_u16()?;
                let st_value = r.read_u64()?;
                let _st_size = r.read_u64()?;
                ElfSymbol { st_name, st_value }
            } else {
                let st_name = r.read_u32()?;
                let st_value = r.read_u32()? as u64;
                let _st_size = r.read_u32()?;
                let _st_info = r.read_u8()?;
                let _st_other = r.read_u8()?;
                let _st_shndx = r.read_u16()?;
                ElfSymbol { st_name, st_value }
            };
            symbols.push(sym);
        }
        self.symbol_table = symbols;
        Ok(())
    }

    fn symbol_name(&self, strtab_offset: u64, sym: &ElfSymbol) -> Option<String> {
        let mut r = self.stream();
        r.set_position(strtab_offset as usize + sym.st_name as usize);
        r.read_string_to_null().ok()
    }

    /// Apply `DT_REL`/`DT_RELA` relocations by rewriting the owned
    /// image, so the registration scan sees resolved pointers.
    fn apply_relocations(&mut self) -> ParseResult<()> {
        debug!("applying ELF relocations");
        let seg_map: Vec<(u64, u64, u64)> = self
            .segments
            .iter()
            .filter(|seg| seg.p_type == PT_LOAD)
            .map(|seg| (seg.p_vaddr, seg.p_vaddr + seg.p_memsz, seg.p_offset))
            .collect();
        let map_va = |va: u64| -> Option<usize> {
            seg_map
                .iter()
                .find(|(start, end, _)| *start <= va && va < *end)
                .map(|(start, _, offset)| (va - start + offset) as usize)
        };

        if self.is_64bit {
            let (Some(rela), Some(relasz)) =
                (self.find_dynamic(DT_RELA), self.find_dynamic(DT_RELASZ))
            else {
                return Ok(());
            };
            let offset = match self.va_to_offset(rela.d_un) {
                Ok(offset) => offset as usize,
                Err(_) => return Ok(()),
            };
            let count = (relasz.d_un / 24) as usize;

            let mut writes = Vec::new();
            {
                let mut r = self.stream();
                r.set_position(offset);
                for _ in 0..count {
                    let r_offset = r.read_u64()?;
                    let r_info = r.read_u64()?;
                    let r_addend = r.read_i64()?;
                    let rel_type = (r_info & 0xFFFF_FFFF) as u32;
                    let sym = (r_info >> 32) as usize;

                    let value = match (self.machine, rel_type) {
                        (EM_AARCH64, R_AARCH64_ABS64) | (EM_X86_64, R_X86_64_64) => self
                            .symbol_table
                            .get(sym)
                            .map(|s| s.st_value.wrapping_add(r_addend as u64)),
                        (EM_AARCH64, R_AARCH64_RELATIVE) | (EM_X86_64, R_X86_64_RELATIVE) => {
                            Some(r_addend as u64)
                        }
                        _ => None,
                    };
                    if let (Some(value), Some(pos)) = (value, map_va(r_offset)) {
                        writes.push((pos, value));
                    }
                }
            }
            for (pos, value) in writes {
                if pos + 8 <= self.data.len() {
                    self.data[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
                }
            }
        } else {
            let (Some(rel), Some(relsz)) =
                (self.find_dynamic(DT_REL), self.find_dynamic(DT_RELSZ))
            else {
                return Ok(());
            };
            let offset = match self.va_to_offset(rel.d_un) {
                Ok(offset) => offset as usize,
                Err(_) => return Ok(()),
            };
            let count = (relsz.d_un / 8) as usize;
            let is_x86 = self.machine == EM_386;

            let mut writes = Vec::new();
            {
                let mut r = self.stream();
                r.set_position(offset);
                for _ in 0..count {
                    let r_offset = r.read_u32()? as u64;
                    let r_info = r.read_u32()?;
                    let rel_type = r_info & 0xFF;
                    let sym = (r_info >> 8) as usize;

                    let matches = (rel_type == R_386_32 && is_x86)
                        || (rel_type == R_ARM_ABS32 && !is_x86);
                    if !matches {
                        continue;
                    }
                    if let (Some(symbol), Some(pos)) = (self.symbol_table.get(sym), map_va(r_offset))
                    {
                        writes.push((pos, symbol.st_value as u32));
                    }
                }
            }
            for (pos, value) in writes {
                if pos + 4 <= self.data.len() {
                    self.data[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Non-fatal packer/obfuscator heuristics.
    fn check_protection(&self) {
        if self.find_dynamic(DT_INIT).is_some() {
            warn!("binary has an .init_proc entry; it may be protected");
        }
        if let Some(strtab) = self.find_dynamic(DT_STRTAB) {
            if let Ok(strtab_offset) = self.va_to_offset(strtab.d_un) {
                for sym in &self.symbol_table {
                    if self.symbol_name(strtab_offset, sym).as_deref() == Some("JNI_OnLoad") {
                        warn!("binary exports JNI_OnLoad; it may be protected");
                        break;
                    }
                }
            }
        }
        if self
            .section_types()
            .iter()
            .any(|&sh_type| sh_type >= SHT_LOUSER)
        {
            warn!("binary has an SHT_LOUSER section; it may be protected");
        }
    }

    fn section_types(&self) -> Vec<u32> {
        let mut types = Vec::new();
        let entry_size = if self.is_64bit { 64 } else { 40 };
        let mut r = self.stream();
        for i in 0..self.e_shnum as usize {
            r.set_position(self.e_shoff as usize + i * entry_size + 4);
            match r.read_u32() {
                Ok(sh_type) => types.push(sh_type),
                Err(_) => break,
            }
        }
        types
    }

    /// Resolve section names through the section-header string table;
    /// a dump has usually lost this table.
    fn section_names(&self) -> Option<Vec<String>> {
        if self.e_shnum == 0 || self.e_shoff == 0 {
            return None;
        }
        let entry_size: usize = if self.is_64bit { 64 } else { 40 };
        let mut headers = Vec::with_capacity(self.e_shnum as usize);
        let mut r = self.stream();
        for i in 0..self.e_shnum as usize {
            r.set_position(self.e_shoff as usize + i * entry_size);
            let sh_name = r.read_u32().ok()?;
            let _sh_type = r.read_u32().ok()?;
            let sh_offset = if self.is_64bit {
                let _sh_flags = r.read_u64().ok()?;
                let _sh_addr = r.read_u64().ok()?;
                r.read_u64().ok()?
            } else {
                let _sh_flags = r.read_u32().ok()?;
                let _sh_addr = r.read_u32().ok()?;
                r.read_u32().ok()? as u64
            };
            headers.push((sh_name, sh_offset));
        }
        let strtab = headers.get(self.e_shstrndx as usize)?.1;
        let mut names = Vec::with_capacity(headers.len());
        for (sh_name, _) in &headers {
            r.set_position(strtab as usize + *sh_name as usize);
            names.push(r.read_string_to_null().ok()?);
        }
        Some(names)
    }

    fn fix_program_headers(&mut self) {
        for seg in &mut self.segments {
            seg.p_offset = seg.p_vaddr;
            seg.p_vaddr = seg.p_vaddr.wrapping_add(self.image_base);
            seg.p_filesz = seg.p_memsz;
        }
    }

    /// Dumps carry VAs in the dynamic entries that predate relocation to
    /// the capture base; rebase the address-valued tags.
    fn fix_dynamic_entries(&mut self) -> ParseResult<()> {
        let dynamic = self.pt_dynamic()?;
        let entry_size = if self.is_64bit { 16 } else { 8 };
        let count = (dynamic.p_filesz / entry_size) as usize;
        let mut r = self.stream();
        r.set_position(self.va_to_offset(dynamic.p_vaddr)? as usize);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let (d_tag, mut d_un) = if self.is_64bit {
                (r.read_i64()?, r.read_u64()?)
            } else {
                (r.read_i32()? as i64, r.read_u32()? as u64)
            };
            if REBASED_TAGS.contains(&d_tag) {
                d_un = d_un.wrapping_add(self.image_base);
            }
            entries.push(DynamicEntry { d_tag, d_un });
            if d_tag == DT_NULL {
                break;
            }
        }
        self.dynamic = entries;
        Ok(())
    }

    /// Locate the registration pair through the 32-bit ARM init thunk.
    /// Returns `(code_registration, metadata_registration)` VAs.
    fn arm_pattern_scan(&self, version: Version) -> Option<(u64, u64)> {
        if self.is_64bit {
            return None;
        }
        let global_offset_table = self.find_dynamic(DT_PLTGOT)?.d_un;

        let mut hits = Vec::new();
        for seg in &self.segments {
            if seg.p_type != PT_LOAD || seg.p_flags & PF_X == 0 {
                continue;
            }
            let start = seg.p_offset as usize;
            let end = (seg.p_offset + seg.p_filesz) as usize;
            if end > self.data.len() {
                continue;
            }
            let buff = &self.data[start..end];
            for hit in search_pattern(buff, ARM_FEATURE_BYTES) {
                // The third byte distinguishes LDR from STR forms.
                if buff.get(hit + 2).is_some_and(|b| b >> 4 & 1 == 1) {
                    hits.push(start + hit);
                }
            }
        }
        if hits.len() != 1 || self.machine != EM_ARM {
            return None;
        }
        let hit = hits[0];

        let read_u32_at = |offset: usize| -> Option<u64> {
            let mut r = self.stream();
            r.set_position(offset);
            r.read_u32().ok().map(u64::from)
        };

        if version < Version::new(24, 0) {
            let code_registration = read_u32_at(hit + 0x14)? + global_offset_table;
            let ptr = read_u32_at(hit + 0x18)? + global_offset_table;
            let ptr_offset = self.va_to_offset(ptr).ok()?;
            let metadata_registration = read_u32_at(ptr_offset as usize)?;
            Some((code_registration, metadata_registration))
        } else {
            let code_registration =
                read_u32_at(hit + 0x14)? + hit as u64 + 0xC + self.image_base;
            let ptr = read_u32_at(hit + 0x10)? + hit as u64 + 0x8;
            let ptr_offset = self.va_to_offset(ptr + self.image_base).ok()?;
            let metadata_registration = read_u32_at(ptr_offset as usize)?;
            Some((code_registration, metadata_registration))
        }
    }
}

impl Il2CppBinary for ElfFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Elf
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn is_32bit(&self) -> bool {
        !self.is_64bit
    }

    fn image_base(&self) -> u64 {
        self.image_base
    }

    fn set_image_base(&mut self, base: u64) {
        self.image_base = base;
    }

    fn is_dumped(&self) -> bool {
        self.is_dumped
    }

    fn set_dumped(&mut self, dumped: bool) {
        self.is_dumped = dumped;
    }

    fn check_dump(&self) -> bool {
        !self
            .section_names()
            .is_some_and(|names| names.iter().any(|n| n == ".text"))
    }

    fn reload(&mut self) -> ParseResult<()> {
        self.load()
    }

    fn va_to_offset(&self, va: u64) -> ParseResult<u64> {
        for seg in &self.segments {
            if seg.p_type == PT_LOAD && seg.p_vaddr <= va && va <= seg.p_vaddr + seg.p_memsz {
                return Ok(va - seg.p_vaddr + seg.p_offset);
            }
        }
        Err(ParseError::AddressOutOfRange(va))
    }

    fn offset_to_va(&self, offset: u64) -> u64 {
        for seg in &self.segments {
            if seg.p_type == PT_LOAD
                && seg.p_offset <= offset
                && offset <= seg.p_offset + seg.p_filesz
            {
                return offset - seg.p_offset + seg.p_vaddr;
            }
        }
        0
    }

    fn symbols(&self) -> Vec<(String, u64)> {
        let Some(strtab) = self.find_dynamic(DT_STRTAB) else {
            return Vec::new();
        };
        let Ok(strtab_offset) = self.va_to_offset(strtab.d_un) else {
            return Vec::new();
        };
        self.symbol_table
            .iter()
            .filter_map(|sym| {
                let name = self.symbol_name(strtab_offset, sym)?;
                if name.is_empty() {
                    None
                } else {
                    Some((name, sym.st_value))
                }
            })
            .collect()
    }

    fn classify_sections(&self) -> SectionClassification {
        let mut exec = Vec::new();
        let mut data = Vec::new();
        for seg in &self.segments {
            if seg.p_type != PT_LOAD || seg.p_memsz == 0 {
                continue;
            }
            let section = SearchSection {
                offset: seg.p_offset,
                offset_end: seg.p_offset + seg.p_filesz,
                address: seg.p_vaddr,
                address_end: seg.p_vaddr + seg.p_memsz,
            };
            if seg.p_flags & PF_X != 0 {
                exec.push(section);
            } else {
                data.push(section);
            }
        }
        // The zero-initialized tails of the data segments are the BSS.
        SectionClassification {
            exec,
            bss: data.clone(),
            data,
        }
    }

    fn pattern_registration_scan(&self, version: Version) -> Option<(u64, u64)> {
        self.arm_pattern_scan(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ELF64 with an executable and a data PT_LOAD segment plus
    /// an empty PT_DYNAMIC.
    fn build_elf64() -> Vec<u8> {
        let mut data = vec![0u8; 0x3000];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS64;
        data[5] = ELFDATA2LSB;
        data[0x12..0x14].copy_from_slice(&EM_AARCH64.to_le_bytes());
        // e_phoff = 0x40, e_phnum = 3
        data[0x20..0x28].copy_from_slice(&0x40u64.to_le_bytes());
        data[0x38..0x3A].copy_from_slice(&3u16.to_le_bytes());

        let mut phdr = |index: usize, p_type: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64| {
            let base = 0x40 + index * 56;
            data[base..base + 4].copy_from_slice(&p_type.to_le_bytes());
            data[base + 4..base + 8].copy_from_slice(&flags.to_le_bytes());
            data[base + 8..base + 16].copy_from_slice(&offset.to_le_bytes());
            data[base + 16..base + 24].copy_from_slice(&vaddr.to_le_bytes());
            data[base + 32..base + 40].copy_from_slice(&filesz.to_le_bytes());
            data[base + 40..base + 48].copy_from_slice(&memsz.to_le_bytes());
        };
        phdr(0, PT_LOAD, 5, 0x0, 0x0, 0x1000, 0x1000);
        phdr(1, PT_LOAD, 6, 0x1000, 0x2000, 0x1000, 0x1800);
        phdr(2, PT_DYNAMIC, 6, 0x1000, 0x2000, 16, 16);
        data
    }

    #[test]
    fn va_offset_round_trip() {
        let elf = ElfFile::parse(&build_elf64()).unwrap();
        assert!(!elf.is_32bit());
        // Segment boundaries map exactly (start and last file byte).
        assert_eq!(elf.va_to_offset(0x2000).unwrap(), 0x1000);
        assert_eq!(elf.va_to_offset(0x2FFF).unwrap(), 0x1FFF);
        assert_eq!(elf.offset_to_va(0x1000), 0x2000);
        assert_eq!(elf.offset_to_va(0x1FFF), 0x2FFF);
        assert!(matches!(
            elf.va_to_offset(0x9_0000),
            Err(ParseError::AddressOutOfRange(_))
        ));
    }

    #[test]
    fn classification_splits_exec_and_data() {
        let elf = ElfFile::parse(&build_elf64()).unwrap();
        let sections = elf.classify_sections();
        assert_eq!(sections.exec.len(), 1);
        assert_eq!(sections.data.len(), 1);
        assert_eq!(sections.exec[0].address, 0);
        assert_eq!(sections.data[0].address, 0x2000);
        // memsz > filesz leaves a BSS tail on the data segment.
        assert_eq!(sections.data[0].address_end, 0x3800);
        assert_eq!(sections.data[0].offset_end, 0x2000);
    }

    #[test]
    fn missing_section_names_flags_dump() {
        let elf = ElfFile::parse(&build_elf64()).unwrap();
        assert!(elf.check_dump());
    }

    #[test]
    fn dump_reload_rebases_segments() {
        let mut elf = ElfFile::parse(&build_elf64()).unwrap();
        elf.set_image_base(0x7000_0000);
        elf.set_dumped(true);
        elf.reload().unwrap();
        // After the rebase, p_offset mirrors the pre-base vaddr and the
        // VA range starts at the image base.
        assert_eq!(elf.va_to_offset(0x7000_2000).unwrap(), 0x2000);
        assert_eq!(elf.va_to_offset(0x7000_0000).unwrap(), 0x0);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut data = build_elf64();
        data[0] = 0x00;
        assert!(matches!(
            ElfFile::parse(&data),
            Err(ParseError::InvalidMagic { .. })
        ));
    }
}

//! Mach-O parser for macOS/iOS IL2CPP binaries
//!
//! One parser covers the 32-bit and 64-bit thin formats; universal
//! ("FAT") containers carry a big-endian architecture table and are
//! unpacked by [`MachoFat`], preferring the 64-bit slice. A non-zero
//! `cryptid` in the encryption-info command is reported as a warning
//! only.

use metadump_core::Version;
use tracing::warn;

use crate::common::{BinaryFormat, Il2CppBinary, SearchSection, SectionClassification};
use crate::error::{ParseError, ParseResult};
use crate::stream::BinaryStream;

pub const MH_MAGIC: u32 = 0xFEED_FACE;
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
pub const FAT_MAGIC: u32 = 0xCAFE_BABE;

const LC_SEGMENT: u32 = 0x1;
const LC_SYMTAB: u32 = 0x2;
const LC_SEGMENT_64: u32 = 0x19;
const LC_ENCRYPTION_INFO: u32 = 0x21;
const LC_ENCRYPTION_INFO_64: u32 = 0x2C;

const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

#[derive(Debug, Clone, Copy, Default)]
struct MachoSegment {
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct MachoSection {
    addr: u64,
    size: u64,
    offset: u32,
    flags: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct SymtabCommand {
    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,
}

pub struct MachoFile {
    data: Vec<u8>,
    is_64bit: bool,
    is_dumped: bool,
    segments: Vec<MachoSegment>,
    sections: Vec<MachoSection>,
    symtab: Option<SymtabCommand>,
}

impl MachoFile {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut r = BinaryStream::new(data, Version::MIN, true);
        let magic = r.read_u32()?;
        let is_64bit = match magic {
            MH_MAGIC => false,
            MH_MAGIC_64 => true,
            other => {
                return Err(ParseError::InvalidMagic {
                    expected: MH_MAGIC_64,
                    actual: other,
                })
            }
        };

        let _cputype = r.read_i32()?;
        let _cpusubtype = r.read_i32()?;
        let _filetype = r.read_u32()?;
        let ncmds = r.read_u32()?;
        let _sizeofcmds = r.read_u32()?;
        let _flags = r.read_u32()?;
        if is_64bit {
            let _reserved = r.read_u32()?;
        }

        let mut segments = Vec::new();
        let mut sections = Vec::new();
        let mut symtab = None;
        let mut cryptid = 0u32;

        for _ in 0..ncmds {
            let cmd_pos = r.position();
            let cmd = r.read_u32()?;
            let cmdsize = r.read_u32()?;

            match cmd {
                c if (c == LC_SEGMENT && !is_64bit) || (c == LC_SEGMENT_64 && is_64bit) => {
                    let _segname = r.read_bytes(16)?;
                    let (vmaddr, vmsize, fileoff, filesize) = if is_64bit {
                        (r.read_u64()?, r.read_u64()?, r.read_u64()?, r.read_u64()?)
                    } else {
                        (
                            r.read_u32()? as u64,
                            r.read_u32()? as u64,
                            r.read_u32()? as u64,
                            r.read_u32()? as u64,
                        )
                    };
                    let _maxprot = r.read_i32()?;
                    let _initprot = r.read_i32()?;
                    let nsects = r.read_u32()?;
                    let _flags = r.read_u32()?;
                    segments.push(MachoSegment {
                        vmaddr,
                        vmsize,
                        fileoff,
                        filesize,
                    });

                    for _ in 0..nsects {
                        let _sectname = r.read_bytes(16)?;
                        let _segname = r.read_bytes(16)?;
                        let (addr, size) = if is_64bit {
                            (r.read_u64()?, r.read_u64()?)
                        } else {
                            (r.read_u32()? as u64, r.read_u32()? as u64)
                        };
                        let offset = r.read_u32()?;
                        let _align = r.read_u32()?;
                        let _reloff = r.read_u32()?;
                        let _nreloc = r.read_u32()?;
                        let flags = r.read_u32()?;
                        let _reserved1 = r.read_u32()?;
                        let _reserved2 = r.read_u32()?;
                        if is_64bit {
                            let _reserved3 = r.read_u32()?;
                        }
                        sections.push(MachoSection {
                            addr,
                            size,
                            offset,
                            flags,
                        });
                    }
                }
                c if c == LC_SYMTAB => {
                    symtab = Some(SymtabCommand {
                        symoff: r.read_u32()?,
                        nsyms: r.read_u32()?,
                        stroff: r.read_u32()?,
                        strsize: r.read_u32()?,
                    });
                }
                c if (c == LC_ENCRYPTION_INFO && !is_64bit)
                    || (c == LC_ENCRYPTION_INFO_64 && is_64bit) =>
                {
                    let _cryptoff = r.read_u32()?;
                    let _cryptsize = r.read_u32()?;
                    cryptid = r.read_u32()?;
                }
                _ => {}
            }
            r.set_position(cmd_pos + cmdsize as usize);
        }

        if cryptid != 0 {
            warn!("Mach-O binary is encrypted (cryptid = {cryptid})");
        }

        Ok(Self {
            data: data.to_vec(),
            is_64bit,
            is_dumped: false,
            segments,
            sections,
            symtab,
        })
    }
}

impl Il2CppBinary for MachoFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::MachO
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn is_32bit(&self) -> bool {
        !self.is_64bit
    }

    fn is_dumped(&self) -> bool {
        self.is_dumped
    }

    fn set_dumped(&mut self, dumped: bool) {
        self.is_dumped = dumped;
    }

    fn va_to_offset(&self, va: u64) -> ParseResult<u64> {
        for seg in &self.segments {
            if seg.vmaddr <= va && va < seg.vmaddr + seg.vmsize {
                return Ok(va - seg.vmaddr + seg.fileoff);
            }
        }
        Err(ParseError::AddressOutOfRange(va))
    }

    fn offset_to_va(&self, offset: u64) -> u64 {
        for seg in &self.segments {
            if seg.fileoff <= offset && offset < seg.fileoff + seg.filesize {
                return offset - seg.fileoff + seg.vmaddr;
            }
        }
        0
    }

    /// Walk the nlist symbol table, resolving names through the string
    /// table. Exported registration globals carry a leading underscore.
    fn symbols(&self) -> Vec<(String, u64)> {
        let Some(symtab) = self.symtab else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut r = BinaryStream::new(&self.data, Version::MIN, !self.is_64bit);
        let string_table_start = symtab.stroff as usize;
        let string_table_end = string_table_start + symtab.strsize as usize;
        if string_table_end > self.data.len() {
            return Vec::new();
        }

        r.set_position(symtab.symoff as usize);
        for _ in 0..symtab.nsyms {
            let entry = || -> ParseResult<(u32, u64)> {
                let n_strx = r.read_u32()?;
                let _n_type = r.read_u8()?;
                let _n_sect = r.read_u8()?;
                let _n_desc = r.read_u16()?;
                let n_value = if self.is_64bit {
                    r.read_u64()?
                } else {
                    r.read_u32()? as u64
                };
                Ok((n_strx, n_value))
            }();
            let Ok((n_strx, n_value)) = entry else { break };

            let name_start = string_table_start + n_strx as usize;
            if name_start >= string_table_end {
                continue;
            }
            let name_bytes = &self.data[name_start..string_table_end];
            let Some(nul) = name_bytes.iter().position(|&b| b == 0) else {
                continue;
            };
            if nul == 0 {
                continue;
            }
            let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
            out.push((name, n_value));
        }
        out
    }

    /// Sections whose attribute bits mark instructions are executable;
    /// everything else counts as data.
    fn classify_sections(&self) -> SectionClassification {
        let mut exec = Vec::new();
        let mut data = Vec::new();
        for section in &self.sections {
            let search = SearchSection {
                offset: section.offset as u64,
                offset_end: section.offset as u64 + section.size,
                address: section.addr,
                address_end: section.addr + section.size,
            };
            if section.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0 {
                exec.push(search);
            } else {
                data.push(search);
            }
        }
        SectionClassification {
            exec,
            bss: data.clone(),
            data,
        }
    }
}

/// Universal (FAT) Mach-O container. The architecture table is
/// big-endian; each slice is a thin Mach-O.
pub struct MachoFat {
    slices: Vec<(u32, std::ops::Range<usize>)>,
}

impl MachoFat {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 8 {
            return Err(ParseError::truncated(8, data.len()));
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != FAT_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: FAT_MAGIC,
                actual: magic,
            });
        }
        let nfat_arch = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let mut slices = Vec::with_capacity(nfat_arch);
        for i in 0..nfat_arch {
            let entry = 8 + i * 20;
            if entry + 20 > data.len() {
                return Err(ParseError::truncated(entry + 20, data.len()));
            }
            let offset = u32::from_be_bytes(data[entry + 8..entry + 12].try_into().unwrap())
                as usize;
            let size =
                u32::from_be_bytes(data[entry + 12..entry + 16].try_into().unwrap()) as usize;
            if offset + size > data.len() || size < 4 {
                return Err(ParseError::invalid_header("FAT slice out of range"));
            }
            let slice_magic = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            slices.push((slice_magic, offset..offset + size));
        }
        Ok(Self { slices })
    }

    /// Pick the 64-bit slice when present, the first slice otherwise.
    pub fn preferred_slice<'a>(&self, data: &'a [u8]) -> ParseResult<&'a [u8]> {
        let chosen = self
            .slices
            .iter()
            .find(|(magic, _)| *magic == MH_MAGIC_64)
            .or_else(|| self.slices.first())
            .ok_or_else(|| ParseError::invalid_header("FAT container has no slices"))?;
        Ok(&data[chosen.1.clone()])
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Thin 64-bit Mach-O with one segment holding one instruction
    /// section and one data section, plus a symtab.
    fn build_macho64() -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];
        data[0..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        data[16..20].copy_from_slice(&2u32.to_le_bytes()); // ncmds

        // LC_SEGMENT_64 with 2 sections
        let seg = 32;
        data[seg..seg + 4].copy_from_slice(&LC_SEGMENT_64.to_le_bytes());
        let seg_size = 72 + 2 * 80;
        data[seg + 4..seg + 8].copy_from_slice(&(seg_size as u32).to_le_bytes());
        data[seg + 24..seg + 32].copy_from_slice(&0x1_0000u64.to_le_bytes()); // vmaddr
        data[seg + 32..seg + 40].copy_from_slice(&0x1000u64.to_le_bytes()); // vmsize
        data[seg + 40..seg + 48].copy_from_slice(&0x100u64.to_le_bytes()); // fileoff
        data[seg + 48..seg + 56].copy_from_slice(&0x1000u64.to_le_bytes()); // filesize
        data[seg + 64..seg + 68].copy_from_slice(&2u32.to_le_bytes()); // nsects

        let mut sect = |index: usize, addr: u64, size: u64, offset: u32, flags: u32| {
            let base = seg + 72 + index * 80;
            data[base + 32..base + 40].copy_from_slice(&addr.to_le_bytes());
            data[base + 40..base + 48].copy_from_slice(&size.to_le_bytes());
            data[base + 48..base + 52].copy_from_slice(&offset.to_le_bytes());
            data[base + 64..base + 68].copy_from_slice(&flags.to_le_bytes());
        };
        sect(0, 0x1_0000, 0x200, 0x100, S_ATTR_PURE_INSTRUCTIONS);
        sect(1, 0x1_0200, 0x200, 0x300, 0);

        // LC_SYMTAB with one symbol: "_g_CodeRegistration"
        let sym = seg + seg_size;
        data[sym..sym + 4].copy_from_slice(&LC_SYMTAB.to_le_bytes());
        data[sym + 4..sym + 8].copy_from_slice(&24u32.to_le_bytes());
        data[sym + 8..sym + 12].copy_from_slice(&0x800u32.to_le_bytes()); // symoff
        data[sym + 12..sym + 16].copy_from_slice(&1u32.to_le_bytes()); // nsyms
        data[sym + 16..sym + 20].copy_from_slice(&0x900u32.to_le_bytes()); // stroff
        data[sym + 20..sym + 24].copy_from_slice(&0x40u32.to_le_bytes()); // strsize

        // nlist_64: n_strx=1, n_value=0x10010
        data[0x800..0x804].copy_from_slice(&1u32.to_le_bytes());
        data[0x808..0x810].copy_from_slice(&0x1_0010u64.to_le_bytes());
        data[0x901..0x901 + 19].copy_from_slice(b"_g_CodeRegistration");
        data
    }

    #[test]
    fn parses_thin_macho() {
        let macho = MachoFile::parse(&build_macho64()).unwrap();
        assert!(!macho.is_32bit());
        assert_eq!(macho.va_to_offset(0x1_0000).unwrap(), 0x100);
        assert_eq!(macho.offset_to_va(0x100), 0x1_0000);
        let sections = macho.classify_sections();
        assert_eq!(sections.exec.len(), 1);
        assert_eq!(sections.data.len(), 1);
    }

    #[test]
    fn symbol_lookup_finds_underscored_globals() {
        let macho = MachoFile::parse(&build_macho64()).unwrap();
        assert_eq!(macho.find_symbol("_g_CodeRegistration"), Some(0x1_0010));
        assert_eq!(macho.find_symbol("_g_MetadataRegistration"), None);
    }

    #[test]
    fn fat_prefers_64bit_slice() {
        let thin = build_macho64();
        let mut fat = vec![0u8; 0x40];
        fat[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
        fat[4..8].copy_from_slice(&2u32.to_be_bytes());
        // slice 0: bogus 32-bit thin at 0x40 (just a magic)
        let slice0_offset = 0x40u32;
        let mut thin32 = vec![0u8; 0x20];
        thin32[0..4].copy_from_slice(&MH_MAGIC.to_le_bytes());
        // slice 1: the 64-bit thin after it
        let slice1_offset = slice0_offset + 0x20;
        fat[8 + 8..8 + 12].copy_from_slice(&slice0_offset.to_be_bytes());
        fat[8 + 12..8 + 16].copy_from_slice(&(thin32.len() as u32).to_be_bytes());
        fat[28 + 8..28 + 12].copy_from_slice(&slice1_offset.to_be_bytes());
        fat[28 + 12..28 + 16].copy_from_slice(&(thin.len() as u32).to_be_bytes());
        fat.extend_from_slice(&thin32);
        fat.extend_from_slice(&thin);

        let container = MachoFat::parse(&fat).unwrap();
        assert_eq!(container.slice_count(), 2);
        let slice = container.preferred_slice(&fat).unwrap();
        let macho = MachoFile::parse(slice).unwrap();
        assert!(!macho.is_32bit());
    }
}

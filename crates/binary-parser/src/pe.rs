//! PE parser for Windows IL2CPP binaries (GameAssembly.dll)
//!
//! Supports PE32 and PE32+ (the optional-header magic selects the
//! pointer width). The export directory is walked for symbol lookup;
//! a file whose sections are all mapped 1:1 (raw pointer == RVA) is
//! flagged as a memory dump.

use bitflags::bitflags;
use metadump_core::Version;

use crate::common::{BinaryFormat, Il2CppBinary, SearchSection, SectionClassification};
use crate::error::{ParseError, ParseResult};
use crate::stream::BinaryStream;

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // MZ
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
const OPTIONAL_MAGIC_PE32: u16 = 0x10B;
const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20B;
const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionCharacteristics: u32 {
        const CNT_CODE = 0x0000_0020;
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

#[derive(Debug, Clone, Default)]
struct PeSection {
    name: String,
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    characteristics: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

pub struct PeFile {
    data: Vec<u8>,
    is_32bit: bool,
    image_base: u64,
    is_dumped: bool,
    sections: Vec<PeSection>,
    data_directories: Vec<DataDirectory>,
}

impl PeFile {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut r = BinaryStream::new(data, Version::MIN, true);

        let e_magic = r.read_u16()?;
        if e_magic != IMAGE_DOS_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: IMAGE_DOS_SIGNATURE as u32,
                actual: e_magic as u32,
            });
        }
        r.set_position(0x3C);
        let e_lfanew = r.read_u32()?;

        r.set_position(e_lfanew as usize);
        let nt_signature = r.read_u32()?;
        if nt_signature != IMAGE_NT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: IMAGE_NT_SIGNATURE,
                actual: nt_signature,
            });
        }

        // COFF file header
        let _machine = r.read_u16()?;
        let number_of_sections = r.read_u16()?;
        let _time_date_stamp = r.read_u32()?;
        let _pointer_to_symbol_table = r.read_u32()?;
        let _number_of_symbols = r.read_u32()?;
        let size_of_optional_header = r.read_u16()?;
        let _characteristics = r.read_u16()?;

        let optional_start = r.position();
        let magic = r.read_u16()?;
        let is_32bit = match magic {
            OPTIONAL_MAGIC_PE32 => true,
            OPTIONAL_MAGIC_PE32_PLUS => false,
            other => {
                return Err(ParseError::invalid_header(format!(
                    "unknown optional-header magic {other:#x}"
                )))
            }
        };

        let _linker = r.read_u16()?;
        let _size_of_code = r.read_u32()?;
        let _size_of_initialized_data = r.read_u32()?;
        let _size_of_uninitialized_data = r.read_u32()?;
        let _address_of_entry_point = r.read_u32()?;
        let _base_of_code = r.read_u32()?;
        let image_base = if is_32bit {
            let _base_of_data = r.read_u32()?;
            r.read_u32()? as u64
        } else {
            r.read_u64()?
        };
        let _section_alignment = r.read_u32()?;
        let _file_alignment = r.read_u32()?;
        // OS / image / subsystem versions, Win32VersionValue
        for _ in 0..4 {
            let _ = r.read_u32()?;
        }
        let _size_of_image = r.read_u32()?;
        let _size_of_headers = r.read_u32()?;
        let _check_sum = r.read_u32()?;
        let _subsystem = r.read_u16()?;
        let _dll_characteristics = r.read_u16()?;
        if is_32bit {
            for _ in 0..4 {
                let _ = r.read_u32()?;
            }
        } else {
            for _ in 0..4 {
                let _ = r.read_u64()?;
            }
        }
        let _loader_flags = r.read_u32()?;
        let number_of_rva_and_sizes = r.read_u32()?;

        let mut data_directories = Vec::new();
        for _ in 0..number_of_rva_and_sizes.min(16) {
            data_directories.push(DataDirectory {
                virtual_address: r.read_u32()?,
                size: r.read_u32()?,
            });
        }

        r.set_position(optional_start + size_of_optional_header as usize);
        let mut sections = Vec::with_capacity(number_of_sections as usize);
        for _ in 0..number_of_sections {
            let name_bytes = r.read_bytes(8)?;
            let name = String::from_utf8_lossy(name_bytes)
                .trim_end_matches('\0')
                .to_string();
            let virtual_size = r.read_u32()?;
            let virtual_address = r.read_u32()?;
            let size_of_raw_data = r.read_u32()?;
            let pointer_to_raw_data = r.read_u32()?;
            let _pointer_to_relocations = r.read_u32()?;
            let _pointer_to_linenumbers = r.read_u32()?;
            let _number_of_relocations = r.read_u16()?;
            let _number_of_linenumbers = r.read_u16()?;
            let characteristics = r.read_u32()?;
            sections.push(PeSection {
                name,
                virtual_size,
                virtual_address,
                size_of_raw_data,
                pointer_to_raw_data,
                characteristics,
            });
        }

        Ok(Self {
            data: data.to_vec(),
            is_32bit,
            image_base,
            is_dumped: false,
            sections,
            data_directories,
        })
    }

    fn stream(&self) -> BinaryStream<'_> {
        BinaryStream::new(&self.data, Version::MIN, self.is_32bit)
    }

    fn read_string_at_rva(&self, rva: u32) -> Option<String> {
        let offset = self.va_to_offset(rva as u64).ok()?;
        let mut r = self.stream();
        r.set_position(offset as usize);
        r.read_string_to_null().ok()
    }
}

impl Il2CppBinary for PeFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Pe
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn is_32bit(&self) -> bool {
        self.is_32bit
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
        !self.sections.is_empty()
            && self
                .sections
                .iter()
                .all(|s| s.pointer_to_raw_data == s.virtual_address)
    }

    fn va_to_offset(&self, va: u64) -> ParseResult<u64> {
        let rva = if va >= self.image_base {
            va - self.image_base
        } else {
            va
        };
        for section in &self.sections {
            let start = section.virtual_address as u64;
            let end = start + section.virtual_size as u64;
            if start <= rva && rva < end {
                return Ok(rva - start + section.pointer_to_raw_data as u64);
            }
        }
        Err(ParseError::AddressOutOfRange(va))
    }

    fn offset_to_va(&self, offset: u64) -> u64 {
        for section in &self.sections {
            let start = section.pointer_to_raw_data as u64;
            let end = start + section.size_of_raw_data as u64;
            if start <= offset && offset < end {
                return offset - start + section.virtual_address as u64 + self.image_base;
            }
        }
        0
    }

    /// Enumerate the export directory as (name, VA) pairs.
    fn symbols(&self) -> Vec<(String, u64)> {
        let Some(export_dir) = self.data_directories.get(IMAGE_DIRECTORY_ENTRY_EXPORT) else {
            return Vec::new();
        };
        if export_dir.virtual_address == 0 {
            return Vec::new();
        }
        let Ok(offset) = self.va_to_offset(export_dir.virtual_address as u64) else {
            return Vec::new();
        };

        let mut exports = Vec::new();
        let mut r = self.stream();
        r.set_position(offset as usize);
        let mut parse = || -> ParseResult<()> {
            let _characteristics = r.read_u32()?;
            let _time_date_stamp = r.read_u32()?;
            let _version = r.read_u32()?;
            let _name = r.read_u32()?;
            let _base = r.read_u32()?;
            let _number_of_functions = r.read_u32()?;
            let number_of_names = r.read_u32()?;
            let address_of_functions = r.read_u32()?;
            let address_of_names = r.read_u32()?;
            let address_of_name_ordinals = r.read_u32()?;

            let names_offset = self.va_to_offset(address_of_names as u64)?;
            let ordinals_offset = self.va_to_offset(address_of_name_ordinals as u64)?;
            let functions_offset = self.va_to_offset(address_of_functions as u64)?;

            for i in 0..number_of_names as usize {
                let mut r = self.stream();
                r.set_position(names_offset as usize + i * 4);
                let name_rva = r.read_u32()?;
                let Some(name) = self.read_string_at_rva(name_rva) else {
                    continue;
                };
                r.set_position(ordinals_offset as usize + i * 2);
                let ordinal = r.read_u16()?;
                r.set_position(functions_offset as usize + ordinal as usize * 4);
                let func_rva = r.read_u32()?;
                exports.push((name, func_rva as u64 + self.image_base));
            }
            Ok(())
        };
        let _ = parse();
        exports
    }

    fn classify_sections(&self) -> SectionClassification {
        let mut exec = Vec::new();
        let mut data = Vec::new();
        for section in &self.sections {
            if section.virtual_size == 0 {
                continue;
            }
            let search = SearchSection {
                offset: section.pointer_to_raw_data as u64,
                offset_end: (section.pointer_to_raw_data + section.size_of_raw_data) as u64,
                address: section.virtual_address as u64 + self.image_base,
                address_end: (section.virtual_address + section.virtual_size) as u64
                    + self.image_base,
            };
            let flags = SectionCharacteristics::from_bits_truncate(section.characteristics);
            if flags.intersects(
                SectionCharacteristics::CNT_CODE | SectionCharacteristics::MEM_EXECUTE,
            ) {
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

//! Executable format parsers for IL2CPP analysis
//!
//! Five formats behind one contract: ELF32/64 (Android, Linux),
//! PE32/PE32+ (Windows), Mach-O thin and universal (iOS, macOS), NSO
//! (Switch) and WebAssembly (WebGL). The format is selected once from
//! the leading magic bytes; the rest of the pipeline talks to the
//! [`Il2CppBinary`] trait.

pub mod common;
pub mod elf;
pub mod error;
pub mod macho;
pub mod nso;
pub mod pattern;
pub mod pe;
pub mod stream;
pub mod versioned;
pub mod wasm;

pub use common::{BinaryFormat, Il2CppBinary, SearchSection, SectionClassification};
pub use error::{ParseError, ParseResult};
pub use stream::BinaryStream;
pub use versioned::{cached_size_of, StructRead};

use std::path::Path;
use tracing::info;

/// Detect the container format from the leading magic bytes.
pub fn detect_format(data: &[u8]) -> Option<BinaryFormat> {
    if data.len() < 8 {
        return None;
    }
    if data.starts_with(b"MZ") {
        return Some(BinaryFormat::Pe);
    }
    if data.starts_with(b"\x7FELF") {
        return Some(BinaryFormat::Elf);
    }
    if data.starts_with(b"NSO0") {
        return Some(BinaryFormat::Nso);
    }
    if data.starts_with(b"\0asm") {
        return Some(BinaryFormat::Wasm);
    }
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let magic_be = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if magic == macho::MH_MAGIC || magic == macho::MH_MAGIC_64 || magic_be == macho::FAT_MAGIC {
        return Some(BinaryFormat::MachO);
    }
    None
}

/// Parse binary data into the matching format parser. Universal Mach-O
/// containers are unpacked here, preferring the 64-bit slice.
pub fn parse_binary(data: &[u8]) -> ParseResult<Box<dyn Il2CppBinary>> {
    match detect_format(data).ok_or(ParseError::UnknownFormat)? {
        BinaryFormat::Elf => {
            let elf = elf::ElfFile::parse(data)?;
            info!(
                "detected ELF{} format",
                if elf.is_32bit() { 32 } else { 64 }
            );
            Ok(Box::new(elf))
        }
        BinaryFormat::Pe => {
            info!("detected PE format");
            Ok(Box::new(pe::PeFile::parse(data)?))
        }
        BinaryFormat::MachO => {
            let magic_be = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            if magic_be == macho::FAT_MAGIC {
                let fat = macho::MachoFat::parse(data)?;
                info!(
                    "detected universal Mach-O with {} slices",
                    fat.slice_count()
                );
                let slice = fat.preferred_slice(data)?;
                Ok(Box::new(macho::MachoFile::parse(slice)?))
            } else {
                info!("detected Mach-O format");
                Ok(Box::new(macho::MachoFile::parse(data)?))
            }
        }
        BinaryFormat::Nso => {
            info!("detected NSO format");
            Ok(Box::new(nso::NsoFile::parse(data)?))
        }
        BinaryFormat::Wasm => {
            info!("detected WebAssembly format");
            Ok(Box::new(wasm::WasmFile::parse(data)?))
        }
    }
}

/// Memory-map a file and parse it.
pub fn load_binary(path: &Path) -> ParseResult<Box<dyn Il2CppBinary>> {
    let file = std::fs::File::open(path)?;
    // The parsers own (and the ELF one mutates) their buffer, so the
    // mapping is copied rather than held.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    parse_binary(&mmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_formats_by_magic() {
        assert_eq!(detect_format(b"MZ\0\0\0\0\0\0"), Some(BinaryFormat::Pe));
        assert_eq!(
            detect_format(b"\x7FELF\x02\x01\x01\x00"),
            Some(BinaryFormat::Elf)
        );
        assert_eq!(detect_format(b"NSO0\0\0\0\0"), Some(BinaryFormat::Nso));
        assert_eq!(detect_format(b"\0asm\x01\0\0\0"), Some(BinaryFormat::Wasm));
        let fat = 0xCAFE_BABEu32.to_be_bytes();
        let mut data = fat.to_vec();
        data.extend_from_slice(&[0; 4]);
        assert_eq!(detect_format(&data), Some(BinaryFormat::MachO));
        assert_eq!(detect_format(b"garbage!"), None);
        assert_eq!(detect_format(b"MZ"), None);
    }
}

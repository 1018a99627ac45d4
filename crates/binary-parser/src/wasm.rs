//! WebAssembly parser for Unity WebGL IL2CPP builds
//!
//! Walks the LEB128-sized section chain. The CODE section is the
//! executable region; active DATA segments carry an `i32.const` init
//! expression giving each segment's linear-memory base, which drives
//! the address mapping.

use metadump_core::Version;

use crate::common::{BinaryFormat, Il2CppBinary, SearchSection, SectionClassification};
use crate::error::{ParseError, ParseResult};
use crate::stream::BinaryStream;

pub const WASM_MAGIC: u32 = 0x6D73_6100; // "\0asm"
const WASM_VERSION: u32 = 1;

const SECTION_CODE: u8 = 10;
const SECTION_DATA: u8 = 11;

const OP_I32_CONST: u8 = 0x41;
const OP_END: u8 = 0x0B;

#[derive(Debug, Clone, Copy, Default)]
struct WasmSection {
    id: u8,
    size: u64,
    /// File offset where the section content starts.
    offset: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct DataSegment {
    /// Linear-memory base from the init expression.
    memory_offset: u64,
    size: u64,
    /// File offset of the segment payload.
    file_offset: u64,
}

pub struct WasmFile {
    data: Vec<u8>,
    code_section: Option<WasmSection>,
    data_segments: Vec<DataSegment>,
    is_dumped: bool,
}

impl WasmFile {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut r = BinaryStream::new(data, Version::MIN, true);
        let magic = r.read_u32()?;
        if magic != WASM_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: WASM_MAGIC,
                actual: magic,
            });
        }
        let version = r.read_u32()?;
        if version != WASM_VERSION {
            return Err(ParseError::invalid_header(format!(
                "unsupported WASM version {version}"
            )));
        }

        let mut code_section = None;
        let mut data_segments = Vec::new();
        while r.position() < data.len() {
            let id = r.read_u8()?;
            let size = r.read_uleb128()?;
            let offset = r.position() as u64;
            let section = WasmSection { id, size, offset };

            match id {
                SECTION_CODE => code_section = Some(section),
                SECTION_DATA => {
                    data_segments = Self::parse_data_section(&mut r, &section)?;
                }
                _ => {}
            }
            r.set_position((offset + size) as usize);
        }

        Ok(Self {
            data: data.to_vec(),
            code_section,
            data_segments,
            is_dumped: false,
        })
    }

    fn parse_data_section(
        r: &mut BinaryStream<'_>,
        section: &WasmSection,
    ) -> ParseResult<Vec<DataSegment>> {
        r.set_position(section.offset as usize);
        let count = r.read_uleb128()?;
        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let flags = r.read_uleb128()?;
            let mut memory_offset = 0u64;
            match flags {
                0 | 2 => {
                    if flags == 2 {
                        let _memory_index = r.read_uleb128()?;
                    }
                    let opcode = r.read_u8()?;
                    if opcode == OP_I32_CONST {
                        memory_offset = r.read_sleb128()? as u64;
                    }
                    // Init expressions end with the 0x0B terminator.
                    let end = r.read_u8()?;
                    if end != OP_END {
                        return Err(ParseError::invalid_header(
                            "unterminated data-segment init expression",
                        ));
                    }
                }
                1 => {} // passive segment, no linear-memory placement
                other => {
                    return Err(ParseError::invalid_header(format!(
                        "unknown data-segment flags {other}"
                    )))
                }
            }
            let size = r.read_uleb128()?;
            let file_offset = r.position() as u64;
            r.set_position((file_offset + size) as usize);
            segments.push(DataSegment {
                memory_offset,
                size,
                file_offset,
            });
        }
        Ok(segments)
    }
}

impl Il2CppBinary for WasmFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Wasm
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn is_32bit(&self) -> bool {
        // 32-bit linear memory model
        true
    }

    fn is_dumped(&self) -> bool {
        self.is_dumped
    }

    fn set_dumped(&mut self, dumped: bool) {
        self.is_dumped = dumped;
    }

    fn va_to_offset(&self, va: u64) -> ParseResult<u64> {
        for seg in &self.data_segments {
            if seg.memory_offset <= va && va < seg.memory_offset + seg.size {
                return Ok(seg.file_offset + (va - seg.memory_offset));
            }
        }
        // Addresses outside every data segment are taken verbatim; the
        // code section is addressed by file offset.
        if va < self.data.len() as u64 {
            Ok(va)
        } else {
            Err(ParseError::AddressOutOfRange(va))
        }
    }

    fn offset_to_va(&self, offset: u64) -> u64 {
        for seg in &self.data_segments {
            if seg.file_offset <= offset && offset < seg.file_offset + seg.size {
                return seg.memory_offset + (offset - seg.file_offset);
            }
        }
        offset
    }

    fn classify_sections(&self) -> SectionClassification {
        let mut exec = Vec::new();
        if let Some(code) = self.code_section {
            exec.push(SearchSection {
                offset: code.offset,
                offset_end: code.offset + code.size,
                address: code.offset,
                address_end: code.offset + code.size,
            });
        }
        let data: Vec<SearchSection> = self
            .data_segments
            .iter()
            .map(|seg| SearchSection {
                offset: seg.file_offset,
                offset_end: seg.file_offset + seg.size,
                address: seg.memory_offset,
                address_end: seg.memory_offset + seg.size,
            })
            .collect();
        SectionClassification {
            exec,
            bss: data.clone(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    fn build_wasm() -> Vec<u8> {
        let mut file = Vec::new();
        file.extend_from_slice(b"\0asm");
        file.extend_from_slice(&1u32.to_le_bytes());

        // CODE section with 16 bytes of payload
        file.push(SECTION_CODE);
        uleb(16, &mut file);
        file.extend_from_slice(&[0x90; 16]);

        // DATA section: one active segment at linear address 0x400
        let mut body = Vec::new();
        uleb(1, &mut body); // segment count
        uleb(0, &mut body); // flags: active, memory 0
        body.push(OP_I32_CONST);
        body.extend_from_slice(&[0x80, 0x08]); // sleb128 0x400
        body.push(OP_END);
        uleb(8, &mut body); // payload size
        body.extend_from_slice(b"ABCDEFGH");

        file.push(SECTION_DATA);
        uleb(body.len() as u64, &mut file);
        file.extend_from_slice(&body);
        file
    }

    #[test]
    fn code_and_data_sections_are_classified() {
        let wasm = WasmFile::parse(&build_wasm()).unwrap();
        let sections = wasm.classify_sections();
        assert_eq!(sections.exec.len(), 1);
        assert_eq!(sections.data.len(), 1);
        assert_eq!(sections.data[0].address, 0x400);
        assert_eq!(sections.data[0].address_end, 0x408);
    }

    #[test]
    fn linear_memory_addresses_map_into_the_segment() {
        let wasm = WasmFile::parse(&build_wasm()).unwrap();
        let offset = wasm.va_to_offset(0x402).unwrap();
        assert_eq!(wasm.data()[offset as usize], b'C');
        assert_eq!(wasm.offset_to_va(offset), 0x402);
    }

    #[test]
    fn rejects_bad_version() {
        let mut file = build_wasm();
        file[4] = 2;
        assert!(WasmFile::parse(&file).is_err());
    }
}

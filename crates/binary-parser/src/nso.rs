//! NSO parser for Nintendo Switch IL2CPP binaries
//!
//! The three segments (text, rodata, data) are optionally
//! LZ4-block-compressed as flagged in the header. They are expanded
//! into one linear image sized `data_memory_offset +
//! data_decompressed_size + bss_size`; after expansion a virtual
//! address equals its in-image offset, so the address mapping is the
//! identity.

use metadump_core::Version;

use crate::common::{BinaryFormat, Il2CppBinary, SearchSection, SectionClassification};
use crate::error::{ParseError, ParseResult};
use crate::stream::BinaryStream;

pub const NSO_MAGIC: u32 = 0x304F_534E; // "NSO0"

const FLAG_TEXT_COMPRESSED: u32 = 1 << 0;
const FLAG_RODATA_COMPRESSED: u32 = 1 << 1;
const FLAG_DATA_COMPRESSED: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, Default)]
struct NsoSegment {
    file_offset: u32,
    memory_offset: u32,
    decompressed_size: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct NsoHeader {
    flags: u32,
    text: NsoSegment,
    rodata: NsoSegment,
    data: NsoSegment,
    bss_size: u32,
    text_compressed_size: u32,
    rodata_compressed_size: u32,
    data_compressed_size: u32,
}

pub struct NsoFile {
    /// The fully decompressed linear image.
    image: Vec<u8>,
    header: NsoHeader,
    is_dumped: bool,
}

impl NsoFile {
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let header = Self::read_header(data)?;
        let image = Self::build_image(data, &header)?;
        Ok(Self {
            image,
            header,
            is_dumped: false,
        })
    }

    fn read_header(data: &[u8]) -> ParseResult<NsoHeader> {
        let mut r = BinaryStream::new(data, Version::MIN, false);
        let magic = r.read_u32()?;
        if magic != NSO_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: NSO_MAGIC,
                actual: magic,
            });
        }
        let _version = r.read_u32()?;
        let _reserved = r.read_u32()?;
        let flags = r.read_u32()?;

        let mut segment = |r: &mut BinaryStream| -> ParseResult<NsoSegment> {
            Ok(NsoSegment {
                file_offset: r.read_u32()?,
                memory_offset: r.read_u32()?,
                decompressed_size: r.read_u32()?,
            })
        };
        let text = segment(&mut r)?;
        let _module_name_offset = r.read_u32()?;
        let rodata = segment(&mut r)?;
        let _module_name_size = r.read_u32()?;
        let data_seg = segment(&mut r)?;
        let bss_size = r.read_u32()?;

        // Compressed sizes live in the extended header at 0x60.
        r.set_position(0x60);
        let text_compressed_size = r.read_u32()?;
        let rodata_compressed_size = r.read_u32()?;
        let data_compressed_size = r.read_u32()?;

        Ok(NsoHeader {
            flags,
            text,
            rodata,
            data: data_seg,
            bss_size,
            text_compressed_size,
            rodata_compressed_size,
            data_compressed_size,
        })
    }

    fn build_image(data: &[u8], header: &NsoHeader) -> ParseResult<Vec<u8>> {
        let total = header.data.memory_offset as usize
            + header.data.decompressed_size as usize
            + header.bss_size as usize;
        let mut image = vec![0u8; total];

        let mut expand = |seg: &NsoSegment, compressed: bool, compressed_size: u32| -> ParseResult<()> {
            let start = seg.file_offset as usize;
            let out_start = seg.memory_offset as usize;
            let out_size = seg.decompressed_size as usize;
            if out_start + out_size > image.len() {
                return Err(ParseError::invalid_header("NSO segment out of range"));
            }
            if compressed {
                let end = start + compressed_size as usize;
                if end > data.len() {
                    return Err(ParseError::truncated(end, data.len()));
                }
                let decompressed =
                    lz4_flex::block::decompress(&data[start..end], out_size).map_err(|e| {
                        ParseError::DecompressionFailed(e.to_string())
                    })?;
                image[out_start..out_start + decompressed.len()]
                    .copy_from_slice(&decompressed);
            } else {
                let end = start + out_size;
                if end > data.len() {
                    return Err(ParseError::truncated(end, data.len()));
                }
                image[out_start..out_start + out_size].copy_from_slice(&data[start..end]);
            }
            Ok(())
        };

        expand(
            &header.text,
            header.flags & FLAG_TEXT_COMPRESSED != 0,
            header.text_compressed_size,
        )?;
        expand(
            &header.rodata,
            header.flags & FLAG_RODATA_COMPRESSED != 0,
            header.rodata_compressed_size,
        )?;
        expand(
            &header.data,
            header.flags & FLAG_DATA_COMPRESSED != 0,
            header.data_compressed_size,
        )?;
        Ok(image)
    }
}

impl Il2CppBinary for NsoFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Nso
    }

    fn data(&self) -> &[u8] {
        &self.image
    }

    fn is_32bit(&self) -> bool {
        false
    }

    fn is_dumped(&self) -> bool {
        self.is_dumped
    }

    fn set_dumped(&mut self, dumped: bool) {
        self.is_dumped = dumped;
    }

    fn va_to_offset(&self, va: u64) -> ParseResult<u64> {
        if va < self.image.len() as u64 {
            Ok(va)
        } else {
            Err(ParseError::AddressOutOfRange(va))
        }
    }

    fn offset_to_va(&self, offset: u64) -> u64 {
        offset
    }

    fn classify_sections(&self) -> SectionClassification {
        let h = &self.header;
        let text_start = h.text.memory_offset as u64;
        let text_end = text_start + h.text.decompressed_size as u64;
        let rodata_start = h.rodata.memory_offset as u64;
        let rodata_end = rodata_start + h.rodata.decompressed_size as u64;
        let data_start = h.data.memory_offset as u64;
        let data_end = data_start + h.data.decompressed_size as u64;
        let bss_end = data_end + h.bss_size as u64;

        let section = |start: u64, end: u64| SearchSection {
            offset: start,
            offset_end: end,
            address: start,
            address_end: end,
        };

        let exec = vec![section(text_start, text_end)];
        let data = vec![
            section(rodata_start, rodata_end),
            section(data_start, data_end),
        ];
        let bss = if h.bss_size > 0 {
            vec![section(data_end, bss_end)]
        } else {
            data.clone()
        };
        SectionClassification { exec, data, bss }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_nso(compress: bool) -> (Vec<u8>, usize) {
        let text: Vec<u8> = (0..64u8).collect();
        let rodata = vec![0xAAu8; 32];
        let data_seg = vec![0x55u8; 48];
        let bss_size = 0x20u32;

        let mut file = vec![0u8; 0x100];
        file[0..4].copy_from_slice(&NSO_MAGIC.to_le_bytes());
        if compress {
            file[12..16].copy_from_slice(&7u32.to_le_bytes());
        }

        let mut payload = Vec::new();
        let mut seg = |contents: &[u8], header_at: usize, memory_offset: u32| -> u32 {
            let file_offset = 0x100 + payload.len();
            let blob = if compress {
                lz4_flex::block::compress(contents)
            } else {
                contents.to_vec()
            };
            payload.extend_from_slice(&blob);
            file[header_at..header_at + 4].copy_from_slice(&(file_offset as u32).to_le_bytes());
            file[header_at + 4..header_at + 8].copy_from_slice(&memory_offset.to_le_bytes());
            file[header_at + 8..header_at + 12]
                .copy_from_slice(&(contents.len() as u32).to_le_bytes());
            blob.len() as u32
        };
        let text_len = seg(&text, 0x10, 0);
        let rodata_len = seg(&rodata, 0x20, 64);
        let data_len = seg(&data_seg, 0x30, 96);
        file[0x3C..0x40].copy_from_slice(&bss_size.to_le_bytes());
        file[0x60..0x64].copy_from_slice(&text_len.to_le_bytes());
        file[0x64..0x68].copy_from_slice(&rodata_len.to_le_bytes());
        file[0x68..0x6C].copy_from_slice(&data_len.to_le_bytes());
        file.extend_from_slice(&payload);

        let expected_len = 96 + 48 + bss_size as usize;
        (file, expected_len)
    }

    #[test]
    fn decompressed_image_has_expected_length() {
        let (file, expected_len) = build_nso(true);
        let nso = NsoFile::parse(&file).unwrap();
        assert_eq!(nso.data().len(), expected_len);
        assert_eq!(&nso.data()[0..64], (0..64u8).collect::<Vec<_>>().as_slice());
        assert_eq!(nso.data()[64], 0xAA);
        assert_eq!(nso.data()[96], 0x55);
    }

    #[test]
    fn uncompressed_segments_copy_through() {
        let (file, expected_len) = build_nso(false);
        let nso = NsoFile::parse(&file).unwrap();
        assert_eq!(nso.data().len(), expected_len);
        assert_eq!(nso.data()[64], 0xAA);
    }

    #[test]
    fn address_mapping_is_identity() {
        let (file, _) = build_nso(true);
        let nso = NsoFile::parse(&file).unwrap();
        assert_eq!(nso.va_to_offset(96).unwrap(), 96);
        assert_eq!(nso.offset_to_va(64), 64);
        assert!(nso.va_to_offset(0x10_0000).is_err());
    }

    #[test]
    fn bss_is_classified_separately() {
        let (file, _) = build_nso(true);
        let nso = NsoFile::parse(&file).unwrap();
        let sections = nso.classify_sections();
        assert_eq!(sections.exec.len(), 1);
        assert_eq!(sections.data.len(), 2);
        assert_eq!(sections.bss.len(), 1);
        assert_eq!(sections.bss[0].address, 144);
        assert_eq!(sections.bss[0].address_end, 176);
    }

    #[test]
    fn corrupt_lz4_fails() {
        let (mut file, _) = build_nso(true);
        // Stomp the compressed text payload.
        for b in &mut file[0x100..0x110] {
            *b = 0xFF;
        }
        assert!(matches!(
            NsoFile::parse(&file),
            Err(ParseError::DecompressionFailed(_))
        ));
    }
}

//! Seekable little-endian byte stream
//!
//! A cheap cursor over an in-memory buffer with the primitive decoders
//! the IL2CPP loaders need: fixed-width integers, pointer-width
//! integers, NUL-terminated and fixed-length UTF-8 strings, LEB128 and
//! .NET compressed integers, and batch array reads. Everything is
//! little-endian; the metadata and binary formats define no other byte
//! order.

use byteorder::{ByteOrder, LittleEndian};
use metadump_core::Version;

use crate::error::{ParseError, ParseResult};

/// Cursor over a borrowed buffer carrying the decode context
/// (IL2CPP version and pointer width) the struct schema needs.
pub struct BinaryStream<'a> {
    data: &'a [u8],
    pos: usize,
    version: Version,
    is_32bit: bool,
}

impl<'a> BinaryStream<'a> {
    pub fn new(data: &'a [u8], version: Version, is_32bit: bool) -> Self {
        Self {
            data,
            pos: 0,
            version,
            is_32bit,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_32bit(&self) -> bool {
        self.is_32bit
    }

    pub fn pointer_size(&self) -> usize {
        if self.is_32bit {
            4
        } else {
            8
        }
    }

    fn take(&mut self, count: usize) -> ParseResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                ParseError::truncated(count, self.data.len().saturating_sub(self.pos))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    // ---- fixed-width primitives ----

    pub fn read_bytes(&mut self, count: usize) -> ParseResult<&'a [u8]> {
        self.take(count)
    }

    pub fn read_u8(&mut self) -> ParseResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> ParseResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> ParseResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> ParseResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> ParseResult<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> ParseResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> ParseResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> ParseResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> ParseResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> ParseResult<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn read_f64(&mut self) -> ParseResult<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    /// Pointer-width unsigned read, zero-extended to `u64`.
    pub fn read_ptr(&mut self) -> ParseResult<u64> {
        if self.is_32bit {
            Ok(self.read_u32()? as u64)
        } else {
            self.read_u64()
        }
    }

    /// Pointer-width signed read, sign-extended to `i64`.
    pub fn read_int_ptr(&mut self) -> ParseResult<i64> {
        if self.is_32bit {
            Ok(self.read_i32()? as i64)
        } else {
            self.read_i64()
        }
    }

    // ---- strings ----

    /// UTF-8 string up to (and consuming) a NUL terminator.
    pub fn read_string_to_null(&mut self) -> ParseResult<String> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ParseError::truncated(1, 0))?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }

    /// UTF-8 string of an exact byte length.
    pub fn read_string(&mut self, length: usize) -> ParseResult<String> {
        Ok(String::from_utf8_lossy(self.take(length)?).into_owned())
    }

    // ---- variable-width integers ----

    /// Unsigned LEB128.
    pub fn read_uleb128(&mut self) -> ParseResult<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(result)
    }

    /// Signed LEB128, two's-complement sign extension. This is the
    /// encoding WASM init expressions use.
    pub fn read_sleb128(&mut self) -> ParseResult<i64> {
        let mut result: i64 = 0;
        let mut shift = 0;
        let mut byte;
        loop {
            byte = self.read_u8()?;
            result |= i64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        if shift < 64 && byte & 0x40 != 0 {
            result |= !0i64 << shift;
        }
        Ok(result)
    }

    /// .NET compressed unsigned integer: 1 byte when the top bit is
    /// clear, 2 bytes for a `10` prefix, 4 bytes for a `110` prefix.
    pub fn read_compressed_u32(&mut self) -> ParseResult<u32> {
        let b = self.read_u8()?;
        if b & 0x80 == 0 {
            Ok(u32::from(b))
        } else if b & 0x40 == 0 {
            Ok((u32::from(b & 0x3F) << 8) | u32::from(self.read_u8()?))
        } else {
            Ok((u32::from(b & 0x1F) << 24)
                | (u32::from(self.read_u8()?) << 16)
                | (u32::from(self.read_u8()?) << 8)
                | u32::from(self.read_u8()?))
        }
    }

    /// .NET compressed signed integer: the low bit of the unsigned
    /// encoding carries the sign.
    pub fn read_compressed_i32(&mut self) -> ParseResult<i32> {
        let encoded = self.read_compressed_u32()?;
        if encoded & 1 != 0 {
            Ok(-((encoded >> 1) as i32) - 1)
        } else {
            Ok((encoded >> 1) as i32)
        }
    }

    // ---- batch array reads ----

    pub fn read_u32_array(&mut self, count: usize) -> ParseResult<Vec<u32>> {
        let bytes = self.take(count * 4)?;
        let mut out = vec![0u32; count];
        LittleEndian::read_u32_into(bytes, &mut out);
        Ok(out)
    }

    pub fn read_i32_array(&mut self, count: usize) -> ParseResult<Vec<i32>> {
        let bytes = self.take(count * 4)?;
        let mut out = vec![0i32; count];
        LittleEndian::read_i32_into(bytes, &mut out);
        Ok(out)
    }

    pub fn read_u64_array(&mut self, count: usize) -> ParseResult<Vec<u64>> {
        let bytes = self.take(count * 8)?;
        let mut out = vec![0u64; count];
        LittleEndian::read_u64_into(bytes, &mut out);
        Ok(out)
    }

    /// Array of pointer-width values, widened to `u64`.
    pub fn read_ptr_array(&mut self, count: usize) -> ParseResult<Vec<u64>> {
        if self.is_32bit {
            Ok(self.read_u32_array(count)?.into_iter().map(u64::from).collect())
        } else {
            self.read_u64_array(count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadump_core::v;

    fn stream(data: &[u8]) -> BinaryStream<'_> {
        BinaryStream::new(data, v(24, 0), false)
    }

    #[test]
    fn primitives_and_position() {
        let data = [0x01, 0x02, 0x03, 0x04, 0xFF, 0xFF];
        let mut r = stream(&data);
        assert_eq!(r.read_u32().unwrap(), 0x04030201);
        assert_eq!(r.read_i16().unwrap(), -1);
        assert_eq!(r.position(), 6);
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn pointer_width_follows_flag() {
        let data = [0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0];
        let mut r = BinaryStream::new(&data, v(24, 0), true);
        assert_eq!(r.read_ptr().unwrap(), 0x12345678);
        let mut r = BinaryStream::new(&data, v(24, 0), false);
        assert_eq!(r.read_ptr().unwrap(), 0x12345678);
        assert_eq!(r.position(), 8);
    }

    #[test]
    fn string_to_null_stops_and_consumes_terminator() {
        let data = b"mscorlib.dll\0rest";
        let mut r = stream(data);
        assert_eq!(r.read_string_to_null().unwrap(), "mscorlib.dll");
        assert_eq!(r.read_string(4).unwrap(), "rest");
    }

    #[test]
    fn uleb128() {
        let mut r = stream(&[0xE5, 0x8E, 0x26]);
        assert_eq!(r.read_uleb128().unwrap(), 624485);
        let mut r = stream(&[0x00]);
        assert_eq!(r.read_uleb128().unwrap(), 0);
    }

    #[test]
    fn sleb128_sign_extends() {
        // -123456 encoded per the WASM spec example
        let mut r = stream(&[0xC0, 0xBB, 0x78]);
        assert_eq!(r.read_sleb128().unwrap(), -123456);
        let mut r = stream(&[0x7F]);
        assert_eq!(r.read_sleb128().unwrap(), -1);
        let mut r = stream(&[0x3F]);
        assert_eq!(r.read_sleb128().unwrap(), 63);
    }

    #[test]
    fn compressed_u32_width_classes() {
        let mut r = stream(&[0x7F]);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x7F);
        // two-byte form: 10xxxxxx
        let mut r = stream(&[0x80 | 0x01, 0x80]);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x180);
        // four-byte form: 110xxxxx
        let mut r = stream(&[0xC0 | 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x01020304);
    }

    #[test]
    fn compressed_i32_low_bit_sign() {
        // even encodings are non-negative, odd encodings negative
        let mut r = stream(&[0x06]);
        assert_eq!(r.read_compressed_i32().unwrap(), 3);
        let mut r = stream(&[0x05]);
        assert_eq!(r.read_compressed_i32().unwrap(), -3);
        let mut r = stream(&[0x01]);
        assert_eq!(r.read_compressed_i32().unwrap(), -1);
        let mut r = stream(&[0x00]);
        assert_eq!(r.read_compressed_i32().unwrap(), 0);
    }

    #[test]
    fn batch_reads_are_contiguous() {
        let mut data = Vec::new();
        for i in 0u32..4 {
            data.extend_from_slice(&i.to_le_bytes());
        }
        let mut r = BinaryStream::new(&data, v(24, 0), true);
        assert_eq!(r.read_ptr_array(4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(r.position(), 16);
        let mut r = stream(&data);
        assert_eq!(r.read_u32_array(4).unwrap(), vec![0, 1, 2, 3]);
        assert!(r.read_u32_array(1).is_err());
    }
}

//! Version-aware struct schema
//!
//! IL2CPP evolves additively: fields appear in one format version and
//! disappear in another, but widths rarely change. Each on-disk struct
//! is declared once as a field table via [`versioned_struct!`]; the
//! macro generates the plain struct, a compiled reader and a
//! `size_of(version, is_32bit)` from the same table, so the reader and
//! the size can never drift apart.
//!
//! A field is present at version `v` iff `min <= v <= max` for its
//! declared closed range; fields without a range are always present.
//! The pseudo-type `ptr` reads a pointer-width integer (4 or 8 bytes
//! per the stream's flag) widened to `u64`.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use metadump_core::Version;

use crate::error::ParseResult;
use crate::stream::BinaryStream;

/// A type that can be decoded from a [`BinaryStream`] under the
/// stream's version and pointer-width context.
pub trait StructRead: Sized + Default {
    fn read(r: &mut BinaryStream<'_>) -> ParseResult<Self>;

    /// Size in bytes of one record at the given version.
    fn size_of(version: Version, is_32bit: bool) -> usize;
}

macro_rules! impl_primitive {
    ($ty:ty, $read:ident, $width:expr) => {
        impl StructRead for $ty {
            fn read(r: &mut BinaryStream<'_>) -> ParseResult<Self> {
                r.$read()
            }

            fn size_of(_version: Version, _is_32bit: bool) -> usize {
                $width
            }
        }
    };
}

impl_primitive!(u8, read_u8, 1);
impl_primitive!(i8, read_i8, 1);
impl_primitive!(u16, read_u16, 2);
impl_primitive!(i16, read_i16, 2);
impl_primitive!(u32, read_u32, 4);
impl_primitive!(i32, read_i32, 4);
impl_primitive!(u64, read_u64, 8);
impl_primitive!(i64, read_i64, 8);
impl_primitive!(f32, read_f32, 4);
impl_primitive!(f64, read_f64, 8);

impl StructRead for bool {
    fn read(r: &mut BinaryStream<'_>) -> ParseResult<Self> {
        r.read_bool()
    }

    fn size_of(_version: Version, _is_32bit: bool) -> usize {
        1
    }
}

// Fixed-size byte runs such as the assembly public-key token.
impl StructRead for [u8; 8] {
    fn read(r: &mut BinaryStream<'_>) -> ParseResult<Self> {
        let mut out = [0u8; 8];
        out.copy_from_slice(r.read_bytes(8)?);
        Ok(out)
    }

    fn size_of(_version: Version, _is_32bit: bool) -> usize {
        8
    }
}

/// Declare an on-disk struct as a version-annotated field table.
///
/// ```ignore
/// versioned_struct! {
///     pub struct Il2CppImageDefinition {
///         name_index: i32,
///         [v(19, 0), Version::MAX] token: u32,
///         modules: ptr,
///     }
/// }
/// ```
#[macro_export]
macro_rules! versioned_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* $([$min:expr, $max:expr])? $field:ident: $ty:tt, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $crate::versioned_struct!(@ty $ty), )*
        }

        impl $crate::versioned::StructRead for $name {
            fn read(r: &mut $crate::stream::BinaryStream<'_>) -> $crate::error::ParseResult<Self> {
                let ver = r.version();
                let mut out = Self::default();
                $(
                    {
                        let (lo, hi) = $crate::versioned_struct!(@range $($min, $max)?);
                        if ver.in_range(lo, hi) {
                            out.$field = $crate::versioned_struct!(@read r, $ty)?;
                        }
                    }
                )*
                let _ = &mut out;
                Ok(out)
            }

            fn size_of(version: metadump_core::Version, is_32bit: bool) -> usize {
                let mut size = 0usize;
                $(
                    {
                        let (lo, hi) = $crate::versioned_struct!(@range $($min, $max)?);
                        if version.in_range(lo, hi) {
                            size += $crate::versioned_struct!(@size $ty, version, is_32bit);
                        }
                    }
                )*
                size
            }
        }
    };

    (@ty ptr) => { u64 };
    (@ty $ty:ty) => { $ty };

    (@read $r:ident, ptr) => { $r.read_ptr() };
    (@read $r:ident, $ty:ty) => { <$ty as $crate::versioned::StructRead>::read($r) };

    (@size ptr, $version:ident, $is_32bit:ident) => {
        if $is_32bit { 4 } else { 8 }
    };
    (@size $ty:ty, $version:ident, $is_32bit:ident) => {
        <$ty as $crate::versioned::StructRead>::size_of($version, $is_32bit)
    };

    (@range $min:expr, $max:expr) => { ($min, $max) };
    (@range) => { (metadump_core::Version::MIN, metadump_core::Version::MAX) };
}

static SIZE_CACHE: OnceLock<Mutex<HashMap<(TypeId, Version, bool), usize>>> = OnceLock::new();

/// Cached [`StructRead::size_of`]. The derivation is deterministic, so
/// first-writer races between threads are benign.
pub fn cached_size_of<T: StructRead + 'static>(version: Version, is_32bit: bool) -> usize {
    let cache = SIZE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let key = (TypeId::of::<T>(), version, is_32bit);
    if let Ok(guard) = cache.lock() {
        if let Some(&size) = guard.get(&key) {
            return size;
        }
    }
    let size = T::size_of(version, is_32bit);
    if let Ok(mut guard) = cache.lock() {
        guard.insert(key, size);
    }
    size
}

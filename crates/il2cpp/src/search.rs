//! Registration-structure locator
//!
//! Finds the `Il2CppCodeRegistration` and `Il2CppMetadataRegistration`
//! roots in a stripped binary using three layered strategies: the
//! `"mscorlib.dll"` anchor scan (v24.2+), count-anchored scans over the
//! data sections (pre-24.2), and the `[T][P][T]` type-count-pair scan
//! (v27+). Symbol lookup and manual addresses are handled by the
//! dumper on top of this.
//!
//! Decode failures on speculative positions mean "not a match", never
//! an error; both finders return 0 when every candidate is rejected.

use metadump_binary_parser::{BinaryFormat, BinaryStream, Il2CppBinary, SearchSection};
use metadump_core::{v, Version};
use tracing::debug;

const FEATURE_BYTES: &[u8] = b"mscorlib.dll\0";

pub struct SectionHelper<'a> {
    binary: &'a dyn Il2CppBinary,
    version: Version,
    method_count: usize,
    type_definitions_count: usize,
    metadata_usages_count: usize,
    image_count: usize,
    exec: Vec<SearchSection>,
    data: Vec<SearchSection>,
    bss: Vec<SearchSection>,
    /// Set when the code registration was found in executable space;
    /// the metadata scan then expects its sample pointers there too.
    pointer_in_exec: bool,
}

impl<'a> SectionHelper<'a> {
    pub fn new(
        binary: &'a dyn Il2CppBinary,
        version: Version,
        method_count: usize,
        type_definitions_count: usize,
        metadata_usages_count: usize,
        image_count: usize,
    ) -> Self {
        let sections = binary.classify_sections();
        Self {
            binary,
            version,
            method_count,
            type_definitions_count,
            metadata_usages_count,
            image_count,
            exec: sections.exec,
            data: sections.data,
            bss: sections.bss,
            pointer_in_exec: false,
        }
    }

    fn pointer_size(&self) -> usize {
        self.binary.pointer_size()
    }

    fn raw(&self) -> &[u8] {
        self.binary.data()
    }

    fn stream_at(&self, offset: usize) -> BinaryStream<'_> {
        let mut r = BinaryStream::new(self.raw(), self.version, self.binary.is_32bit());
        r.set_position(offset);
        r
    }

    fn read_ptr_at(&self, offset: usize) -> Option<u64> {
        self.stream_at(offset).read_ptr().ok()
    }

    fn offset_to_data_va(&self, offset: u64) -> Option<u64> {
        self.data
            .iter()
            .find(|section| section.offset <= offset && offset < section.offset_end)
            .map(|section| offset - section.offset + section.address)
    }

    /// Pointer-aligned occurrences of `va` as a pointer-width word,
    /// returned as (file offset, slot VA) pairs within data sections.
    fn find_pointer_refs(&self, va: u64) -> Vec<(u64, u64)> {
        let ptr_size = self.pointer_size();
        let needle = if ptr_size == 8 {
            va.to_le_bytes().to_vec()
        } else {
            (va as u32).to_le_bytes().to_vec()
        };
        let mut refs = Vec::new();
        for idx in metadump_binary_parser::pattern::search_bytes(self.raw(), &needle) {
            if idx % ptr_size != 0 {
                continue;
            }
            if let Some(slot_va) = self.offset_to_data_va(idx as u64) {
                refs.push((idx as u64, slot_va));
            }
        }
        refs
    }

    /// Offset backoff from the code-gen-modules field to the struct
    /// start, in pointer slots, for the layout the scan assumes.
    fn code_gen_modules_backoff(&self) -> u64 {
        if self.version >= v(29, 1) {
            16
        } else if self.version >= v(29, 0) {
            14
        } else {
            13
        }
    }

    pub fn find_code_registration(&mut self) -> u64 {
        if self.version >= v(24, 2) {
            // ELF keeps the module tables in executable segments more
            // often than not; scan those first there.
            let exec_first = self.binary.format() == BinaryFormat::Elf;
            let (first, second) = if exec_first {
                (self.exec.clone(), self.data.clone())
            } else {
                (self.data.clone(), self.exec.clone())
            };
            let result = self.find_code_registration_2019(&first);
            if result != 0 {
                self.pointer_in_exec = exec_first;
                return result;
            }
            let result = self.find_code_registration_2019(&second);
            if result != 0 {
                self.pointer_in_exec = !exec_first;
            }
            return result;
        }
        self.find_code_registration_old()
    }

    pub fn find_metadata_registration(&mut self) -> u64 {
        if self.version < v(19, 0) {
            return 0;
        }
        if self.version >= v(27, 0) {
            return self.find_metadata_registration_by_type_count_pair();
        }
        self.find_metadata_registration_old()
    }

    /// Strategy 1: anchor on the `"mscorlib.dll"` literal, chase the
    /// references to it (string -> module -> module array slot), then
    /// verify the slot belongs to a `code_gen_modules` array preceded
    /// by the image count.
    fn find_code_registration_2019(&self, sections: &[SearchSection]) -> u64 {
        for section in sections {
            let start = section.offset as usize;
            let end = (section.offset_end as usize).min(self.raw().len());
            if start >= end {
                continue;
            }
            let buff = &self.raw()[start..end];
            for index in metadump_binary_parser::pattern::search_bytes(buff, FEATURE_BYTES) {
                let dll_va = section.address + index as u64;
                for (_, module_va) in self.find_pointer_refs(dll_va) {
                    for (_, slot_va) in self.find_pointer_refs(module_va) {
                        let result = if self.version >= v(27, 0) {
                            self.match_module_array_v27(slot_va)
                        } else {
                            self.match_module_array(slot_va)
                        };
                        if result != 0 {
                            debug!("code registration candidate at {result:#x}");
                            return result;
                        }
                    }
                }
            }
        }
        0
    }

    /// The slot at `slot_va` holds a pointer to a code-gen module, so
    /// it is the `i`-th entry of the module array for some `i`. Find
    /// the field that points at the candidate array base and accept it
    /// when the preceding slot carries the image count.
    fn match_module_array(&self, slot_va: u64) -> u64 {
        let ptr_size = self.pointer_size() as u64;
        for i in 0..self.image_count as u64 {
            let array_base = slot_va - i * ptr_size;
            for (field_offset, field_va) in self.find_pointer_refs(array_base) {
                if field_offset < ptr_size {
                    continue;
                }
                let Some(preceding) =
                    self.read_ptr_at((field_offset - ptr_size) as usize)
                else {
                    continue;
                };
                if preceding == self.image_count as u64 {
                    return field_va - ptr_size * self.code_gen_modules_backoff();
                }
            }
        }
        0
    }

    /// v27+ short-cut: instead of chasing references per candidate
    /// base, scan for `[image_count][modules_ptr]` pairs whose pointer
    /// lands inside the candidate array.
    fn match_module_array_v27(&self, slot_va: u64) -> u64 {
        if self.image_count == 0 {
            return 0;
        }
        let ptr_size = self.pointer_size() as u64;
        let min_target = slot_va - (self.image_count as u64 - 1) * ptr_size;
        let needle = if ptr_size == 8 {
            (self.image_count as u64).to_le_bytes().to_vec()
        } else {
            (self.image_count as u32).to_le_bytes().to_vec()
        };
        for idx in metadump_binary_parser::pattern::search_bytes(self.raw(), &needle) {
            if idx % ptr_size as usize != 0 {
                continue;
            }
            let field_offset = idx + ptr_size as usize;
            let Some(modules_ptr) = self.read_ptr_at(field_offset) else {
                continue;
            };
            if !(min_target..=slot_va).contains(&modules_ptr) {
                continue;
            }
            let i = (slot_va - modules_ptr) / ptr_size;
            if i >= self.image_count as u64 || modules_ptr != slot_va - i * ptr_size {
                continue;
            }
            if let Some(field_va) = self.offset_to_data_va(field_offset as u64) {
                return field_va - ptr_size * self.code_gen_modules_backoff();
            }
        }
        0
    }

    /// Strategy 2 (pre-24.2): a word equal to the method count followed
    /// by a data pointer hosting `method_count` executable-space
    /// pointers marks the struct start.
    fn find_code_registration_old(&self) -> u64 {
        let ptr_size = self.pointer_size();
        for section in &self.data {
            let mut offset = section.offset as usize;
            let end = (section.offset_end as usize).min(self.raw().len());
            while offset + ptr_size * 2 <= end {
                let mut r = self.stream_at(offset);
                if let (Ok(count), Ok(pointer)) = (r.read_int_ptr(), r.read_ptr()) {
                    if count == self.method_count as i64
                        && self.try_method_pointer_table(pointer)
                    {
                        return offset as u64 - section.offset + section.address;
                    }
                }
                offset += ptr_size;
            }
        }
        0
    }

    fn try_method_pointer_table(&self, pointer_va: u64) -> bool {
        let Ok(table_offset) = self.binary.va_to_offset(pointer_va) else {
            return false;
        };
        if !self
            .data
            .iter()
            .any(|section| section.contains_offset(table_offset))
        {
            return false;
        }
        let Ok(pointers) = self
            .stream_at(table_offset as usize)
            .read_ptr_array(self.method_count)
        else {
            return false;
        };
        pointers
            .iter()
            .all(|&ptr| self.exec.iter().any(|section| section.contains_address(ptr)))
    }

    /// Strategy 2 for the metadata side: anchor on the
    /// type-definitions count, then require the downstream usages
    /// pointer to host `metadata_usages_count` BSS pointers.
    fn find_metadata_registration_old(&self) -> u64 {
        let ptr_size = self.pointer_size();
        for section in &self.data {
            let mut offset = section.offset as usize;
            let end = (section.offset_end as usize)
                .min(self.raw().len())
                .saturating_sub(ptr_size);
            while offset + ptr_size <= end {
                let mut r = self.stream_at(offset);
                if r.read_int_ptr().ok() == Some(self.type_definitions_count as i64) {
                    // Two slots ahead of the sizes pointer sits the
                    // usages pointer.
                    r.set_position(offset + ptr_size * 3);
                    if let Ok(pointer) = r.read_ptr() {
                        if self.try_usages_table(pointer) {
                            return offset as u64 - section.offset + section.address
                                - ptr_size as u64 * 12;
                        }
                    }
                }
                offset += ptr_size;
            }
        }
        0
    }

    fn try_usages_table(&self, pointer_va: u64) -> bool {
        if self.metadata_usages_count == 0 {
            return false;
        }
        let Ok(table_offset) = self.binary.va_to_offset(pointer_va) else {
            return false;
        };
        if !self
            .data
            .iter()
            .any(|section| section.contains_offset(table_offset))
        {
            return false;
        }
        let Ok(pointers) = self
            .stream_at(table_offset as usize)
            .read_ptr_array(self.metadata_usages_count)
        else {
            return false;
        };
        pointers
            .iter()
            .all(|&ptr| self.bss.iter().any(|section| section.contains_address(ptr)))
    }

    /// Strategy 3: `[T][P][T]` where `T` is the type-definitions count
    /// and `P` the field-offsets pointer. The sizes pointer after the
    /// second `T` must host plausible record pointers.
    fn find_metadata_registration_by_type_count_pair(&self) -> u64 {
        let ptr_size = self.pointer_size() as u64;
        let type_count = self.type_definitions_count as u64;
        let needle = if ptr_size == 8 {
            type_count.to_le_bytes().to_vec()
        } else {
            (type_count as u32).to_le_bytes().to_vec()
        };

        for section in &self.data {
            let start = section.offset as usize;
            let end = (section.offset_end as usize).min(self.raw().len());
            if start >= end {
                continue;
            }
            let slice = &self.raw()[start..end];
            for idx in metadump_binary_parser::pattern::search_bytes(slice, &needle) {
                if idx % ptr_size as usize != 0 {
                    continue;
                }
                let second = idx + 2 * ptr_size as usize;
                let Some(second_value) = self.read_ptr_at(start + second) else {
                    continue;
                };
                if second_value != type_count {
                    continue;
                }
                let Some(sizes_ptr) = self.read_ptr_at(start + idx + 3 * ptr_size as usize)
                else {
                    continue;
                };
                if self.sample_record_pointers(sizes_ptr) {
                    return section.address + idx as u64 - ptr_size * 10;
                }
            }
        }
        0
    }

    /// Sample up to ten pointers through a candidate table; every one
    /// must land in data (or executable, when the code registration was
    /// found there) space.
    fn sample_record_pointers(&self, table_va: u64) -> bool {
        let Some(table_offset) = self
            .data
            .iter()
            .find(|section| section.contains_address(table_va))
            .map(|section| table_va - section.address + section.offset)
        else {
            return false;
        };
        let sample = self.type_definitions_count.min(10);
        if sample == 0 {
            return false;
        }
        let Ok(pointers) = self.stream_at(table_offset as usize).read_ptr_array(sample) else {
            return false;
        };
        let target = if self.pointer_in_exec {
            &self.exec
        } else {
            &self.data
        };
        pointers
            .iter()
            .all(|&ptr| target.iter().any(|section| section.contains_address(ptr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeBinary;

    const PTR: u64 = 8;

    /// Lay out a module-array anchor: the dll name string, a module
    /// whose first field points at it, a module pointer array preceded
    /// by the image count, and a CodeRegistration tail.
    fn build_anchor_binary(image_count: u64, backoff: u64) -> (FakeBinary, u64) {
        let mut binary = FakeBinary::new(0x2000, 0x800);
        let dll_va = binary.alloc_bytes(FEATURE_BYTES);
        let module_va = binary.alloc_ptr(dll_va);
        // modules array: [module] [pad...] preceded by image_count
        binary.alloc_ptr(image_count);
        let array_va = binary.alloc_ptr(module_va);
        for _ in 1..image_count {
            binary.alloc_ptr(0);
        }
        // the CodeRegistration's modules-count/modules fields
        binary.alloc_ptr(image_count);
        let field_va = binary.alloc_ptr(array_va);
        (binary, field_va - backoff * PTR)
    }

    #[test]
    fn mscorlib_anchor_locates_code_registration() {
        let (binary, expected) = build_anchor_binary(1, 13);
        let mut helper = SectionHelper::new(&binary, v(24, 2), 0, 0, 0, 1);
        assert_eq!(helper.find_code_registration(), expected);
    }

    #[test]
    fn backoff_grows_with_version() {
        let (binary, expected_13) = build_anchor_binary(1, 13);
        let mut helper = SectionHelper::new(&binary, v(27, 0), 0, 0, 0, 1);
        assert_eq!(helper.find_code_registration(), expected_13);

        let (binary, expected_16) = build_anchor_binary(1, 16);
        let mut helper = SectionHelper::new(&binary, v(29, 1), 0, 0, 0, 1);
        assert_eq!(helper.find_code_registration(), expected_16);
    }

    #[test]
    fn locator_is_idempotent() {
        let (binary, expected) = build_anchor_binary(2, 13);
        let mut helper = SectionHelper::new(&binary, v(24, 2), 0, 0, 0, 2);
        let first = helper.find_code_registration();
        let second = helper.find_code_registration();
        assert_eq!(first, expected);
        assert_eq!(first, second);
    }

    #[test]
    fn type_count_pair_locates_metadata_registration() {
        let type_count = 7u64;
        let mut binary = FakeBinary::new(0x2000, 0x800);
        // a table of record pointers into data space for the sampler
        let record = binary.alloc_ptr(0);
        let mut table = Vec::new();
        for _ in 0..type_count {
            table.push(record);
        }
        let table_va = binary.alloc_ptrs(&table);
        // [T][P][T][sizes_ptr]
        let anchor_va = binary.alloc_ptr(type_count);
        binary.alloc_ptr(record);
        binary.alloc_ptr(type_count);
        binary.alloc_ptr(table_va);

        let mut helper =
            SectionHelper::new(&binary, v(27, 0), 0, type_count as usize, 0, 1);
        assert_eq!(
            helper.find_metadata_registration(),
            anchor_va - 10 * PTR
        );
    }

    #[test]
    fn corrupted_counts_reject_every_candidate() {
        let (binary, _) = build_anchor_binary(1, 13);
        // Wrong image count: the preceding-slot check fails.
        let mut helper = SectionHelper::new(&binary, v(24, 2), 0, 0, 0, 5);
        assert_eq!(helper.find_code_registration(), 0);
        // No [T][P][T] anywhere for this count.
        let mut helper = SectionHelper::new(&binary, v(27, 0), 0, 0x4455, 0, 1);
        assert_eq!(helper.find_metadata_registration(), 0);
    }

    #[test]
    fn old_scan_finds_method_count_anchor() {
        let method_count = 3u64;
        let mut binary = FakeBinary::new(0x2000, 0x800);
        // method pointer table living in data space, pointers into exec
        let table_va = binary.alloc_ptrs(&[0x100, 0x200, 0x300]);
        let anchor_va = binary.alloc_ptr(method_count);
        binary.alloc_ptr(table_va);

        let mut helper =
            SectionHelper::new(&binary, v(21, 0), method_count as usize, 0, 0, 1);
        assert_eq!(helper.find_code_registration(), anchor_va);
    }
}

//! Binary-side loader
//!
//! Walks from the two registration roots through the pointer-arrayed
//! tables: method/invoker pointer arrays, `Il2CppType` records, field
//! offsets, generic insts, the generic-method table and method specs,
//! and (v24.2+) the per-assembly code-gen modules with their RGCTX
//! tables. Once the registration addresses are accepted, any
//! out-of-range read means the root was misidentified and is reported
//! as an error.

use std::collections::HashMap;

use indexmap::IndexMap;
use metadump_binary_parser::{BinaryStream, Il2CppBinary, StructRead};
use metadump_core::{v, Error, Result, Version};
use tracing::{info, warn};

use crate::structs::*;

/// Counts above this are implausible and signal a misaligned
/// registration read.
const SANITY_LIMIT: u64 = 0x50000;

pub struct Il2Cpp {
    pub binary: Box<dyn Il2CppBinary>,
    pub version: Version,
    metadata_usages_count: u64,
    field_offsets_override: Option<bool>,

    pub code_registration: Il2CppCodeRegistration,
    pub metadata_registration: Il2CppMetadataRegistration,

    pub method_pointers: Vec<u64>,
    pub generic_method_pointers: Vec<u64>,
    pub invoker_pointers: Vec<u64>,
    pub custom_attribute_generators: Vec<u64>,
    pub reverse_pinvoke_wrappers: Vec<u64>,
    pub unresolved_virtual_call_pointers: Vec<u64>,
    pub metadata_usages: Vec<u64>,

    pub types: Vec<Il2CppType>,
    type_index_by_va: HashMap<u64, usize>,

    field_offsets: Vec<u64>,
    field_offsets_are_pointers: bool,

    pub generic_inst_pointers: Vec<u64>,
    pub generic_insts: Vec<Il2CppGenericInst>,
    pub generic_method_table: Vec<Il2CppGenericMethodFunctionsDefinitions>,
    pub method_specs: Vec<Il2CppMethodSpec>,
    /// Method-definition index to spec indices.
    pub method_specs_by_definition: HashMap<i32, Vec<usize>>,
    /// Spec index to generic method pointer.
    pub method_spec_pointers: HashMap<usize, u64>,

    pub code_gen_modules: IndexMap<String, Il2CppCodeGenModule>,
    pub module_method_pointers: IndexMap<String, Vec<u64>>,
    /// Module name -> token -> RGCTX slots.
    pub module_rgctxs: IndexMap<String, HashMap<u32, Vec<Il2CppRGCTXDefinition>>>,
}

impl Il2Cpp {
    pub fn new(binary: Box<dyn Il2CppBinary>, version: Version, metadata_usages_count: u64) -> Self {
        Self {
            binary,
            version,
            metadata_usages_count,
            field_offsets_override: None,
            code_registration: Default::default(),
            metadata_registration: Default::default(),
            method_pointers: Vec::new(),
            generic_method_pointers: Vec::new(),
            invoker_pointers: Vec::new(),
            custom_attribute_generators: Vec::new(),
            reverse_pinvoke_wrappers: Vec::new(),
            unresolved_virtual_call_pointers: Vec::new(),
            metadata_usages: Vec::new(),
            types: Vec::new(),
            type_index_by_va: HashMap::new(),
            field_offsets: Vec::new(),
            field_offsets_are_pointers: false,
            generic_inst_pointers: Vec::new(),
            generic_insts: Vec::new(),
            generic_method_table: Vec::new(),
            method_specs: Vec::new(),
            method_specs_by_definition: HashMap::new(),
            method_spec_pointers: HashMap::new(),
            code_gen_modules: IndexMap::new(),
            module_method_pointers: IndexMap::new(),
            module_rgctxs: IndexMap::new(),
        }
    }

    /// Override the v21 flat-vs-pointer field-offset heuristic.
    pub fn set_field_offsets_override(&mut self, override_value: Option<bool>) {
        self.field_offsets_override = override_value;
    }

    pub fn pointer_size(&self) -> u64 {
        self.binary.pointer_size() as u64
    }

    // ---- raw read helpers ----

    fn stream_at_va(&self, va: u64) -> Result<BinaryStream<'_>> {
        let offset = self.binary.va_to_offset(va).map_err(Error::from)?;
        let mut r = BinaryStream::new(self.binary.data(), self.version, self.binary.is_32bit());
        r.set_position(offset as usize);
        Ok(r)
    }

    pub fn read_struct_at_va<T: StructRead>(&self, va: u64) -> Result<T> {
        let mut r = self.stream_at_va(va)?;
        T::read(&mut r).map_err(Error::from)
    }

    pub fn read_ptr_array_at_va(&self, va: u64, count: usize) -> Result<Vec<u64>> {
        let mut r = self.stream_at_va(va)?;
        r.read_ptr_array(count).map_err(Error::from)
    }

    pub fn read_u32_array_at_va(&self, va: u64, count: usize) -> Result<Vec<u32>> {
        let mut r = self.stream_at_va(va)?;
        r.read_u32_array(count).map_err(Error::from)
    }

    pub fn read_string_at_va(&self, va: u64) -> Result<String> {
        let mut r = self.stream_at_va(va)?;
        r.read_string_to_null().map_err(Error::from)
    }

    fn read_struct_array_at_va<T: StructRead>(&self, va: u64, count: usize) -> Result<Vec<T>> {
        let mut r = self.stream_at_va(va)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::read(&mut r).map_err(Error::from)?);
        }
        Ok(out)
    }

    // ---- initialization ----

    /// Accept registration addresses after correcting the locator's
    /// constant-offset assumption for the detected subversion. The
    /// probes are idempotent: every decision reads the provisional
    /// struct once.
    pub fn auto_init(&mut self, code_registration: u64, metadata_registration: u64) -> Result<bool> {
        let code_registration = self.correct_code_registration(code_registration);
        if code_registration == 0 || metadata_registration == 0 {
            return Ok(false);
        }
        info!("CodeRegistration : {code_registration:x}");
        info!("MetadataRegistration : {metadata_registration:x}");
        self.init(code_registration, metadata_registration)?;
        Ok(true)
    }

    fn correct_code_registration(&mut self, mut code_registration: u64) -> u64 {
        if code_registration == 0 || self.version < v(24, 2) {
            return code_registration;
        }
        let Ok(provisional) = self.read_struct_at_va::<Il2CppCodeRegistration>(code_registration)
        else {
            return code_registration;
        };
        let ptr = self.pointer_size();
        let oversized = provisional.invoker_pointers_count > SANITY_LIMIT;
        if self.version == v(31, 0) && oversized {
            code_registration -= ptr * 2;
        } else if self.version == v(29, 0) && oversized {
            self.version = v(29, 1);
            code_registration -= ptr * 2;
            info!("il2cpp version revised to {}", self.version);
        } else if self.version == v(27, 0) && oversized {
            self.version = v(27, 1);
            code_registration -= ptr;
            info!("il2cpp version revised to {}", self.version);
        } else if self.version == v(24, 4) {
            // The locator's 13-slot constant undershoots the 24.4
            // layout by the custom-attribute pair.
            code_registration -= ptr * 2;
            if oversized {
                self.version = v(24, 5);
                code_registration -= ptr;
                info!("il2cpp version revised to {}", self.version);
            }
        } else if self.version == v(24, 2) && oversized {
            self.version = v(24, 3);
            code_registration -= ptr * 2;
            info!("il2cpp version revised to {}", self.version);
        }
        code_registration
    }

    pub fn init(&mut self, code_registration: u64, metadata_registration: u64) -> Result<()> {
        self.code_registration = self.read_struct_at_va(code_registration)?;
        self.detect_version_from_registration(code_registration)?;
        self.metadata_registration = self.read_struct_at_va(metadata_registration)?;

        self.load_pointer_tables()?;
        self.load_types()?;
        self.load_field_offsets()?;
        self.load_generics()?;
        if self.version >= v(24, 2) {
            self.load_code_gen_modules()?;
        }
        Ok(())
    }

    /// Rename-only subversion probe, run on every acceptance path
    /// (anchor scan, pattern scan, symbols, manual addresses). When a
    /// base layout misdecodes the invoker count to an implausible
    /// value, the binary is the adjacent subversion; the address itself
    /// is exact here, so only the version and the decode change.
    fn detect_version_from_registration(&mut self, code_registration: u64) -> Result<()> {
        if self.code_registration.invoker_pointers_count <= SANITY_LIMIT {
            return Ok(());
        }
        let revised = if self.version == v(24, 2) {
            v(24, 3)
        } else if self.version == v(24, 4) {
            v(24, 5)
        } else if self.version == v(27, 0) {
            v(27, 1)
        } else if self.version == v(29, 0) {
            v(29, 1)
        } else {
            return Ok(());
        };
        self.version = revised;
        info!("il2cpp version revised to {}", self.version);
        self.code_registration = self.read_struct_at_va(code_registration)?;
        Ok(())
    }

    fn load_pointer_tables(&mut self) -> Result<()> {
        let cr = self.code_registration.clone();
        let mr = self.metadata_registration.clone();

        if self.version <= v(24, 1) && cr.method_pointers_count > 0 {
            self.method_pointers =
                self.read_ptr_array_at_va(cr.method_pointers, cr.method_pointers_count as usize)?;
        }
        if cr.generic_method_pointers_count > 0 {
            self.generic_method_pointers = self.read_ptr_array_at_va(
                cr.generic_method_pointers,
                cr.generic_method_pointers_count as usize,
            )?;
        }
        if cr.invoker_pointers_count > 0 {
            self.invoker_pointers = self
                .read_ptr_array_at_va(cr.invoker_pointers, cr.invoker_pointers_count as usize)?;
        }
        if self.version < v(27, 0) && cr.custom_attribute_count > 0 {
            self.custom_attribute_generators = self.read_ptr_array_at_va(
                cr.custom_attribute_generators,
                cr.custom_attribute_count as usize,
            )?;
        }
        if self.version >= v(22, 0) {
            if cr.reverse_pinvoke_wrapper_count > 0 {
                self.reverse_pinvoke_wrappers = self.read_ptr_array_at_va(
                    cr.reverse_pinvoke_wrappers,
                    cr.reverse_pinvoke_wrapper_count as usize,
                )?;
            }
            if cr.unresolved_virtual_call_count > 0 {
                self.unresolved_virtual_call_pointers = self.read_ptr_array_at_va(
                    cr.unresolved_virtual_call_pointers,
                    cr.unresolved_virtual_call_count as usize,
                )?;
            }
        }
        if self.version > v(16, 0) && self.version < v(27, 0) && self.metadata_usages_count > 0 {
            self.metadata_usages = self
                .read_ptr_array_at_va(mr.metadata_usages, self.metadata_usages_count as usize)?;
        }
        Ok(())
    }

    fn load_types(&mut self) -> Result<()> {
        let mr = &self.metadata_registration;
        let type_pointers = self.read_ptr_array_at_va(mr.types, mr.types_count as usize)?;
        let mut types = Vec::with_capacity(type_pointers.len());
        let mut by_va = HashMap::with_capacity(type_pointers.len());
        for (index, &va) in type_pointers.iter().enumerate() {
            let mut r = self.stream_at_va(va)?;
            let datapoint = r.read_u64().map_err(Error::from)?;
            let bits = r.read_u32().map_err(Error::from)?;
            types.push(Il2CppType::decode(datapoint, bits, self.version));
            by_va.insert(va, index);
        }
        self.types = types;
        self.type_index_by_va = by_va;
        Ok(())
    }

    /// Flat `u32` table below v21, per-type pointer tables above; at
    /// exactly v21 probe the first six words (five zeros followed by a
    /// positive word read as per-type pointers in the wild).
    fn load_field_offsets(&mut self) -> Result<()> {
        let mr = self.metadata_registration.clone();
        let count = mr.field_offsets_count as usize;

        let mut pointers = self.version > v(21, 0);
        if self.version == v(21, 0) {
            let probe = self.read_ptr_array_at_va(mr.field_offsets, count.min(6))?;
            pointers = probe.len() == 6
                && probe[..5].iter().all(|&word| word == 0)
                && probe[5] > 0;
        }
        if let Some(override_value) = self.field_offsets_override {
            pointers = override_value;
        }

        self.field_offsets_are_pointers = pointers;
        if count == 0 {
            return Ok(());
        }
        self.field_offsets = if pointers {
            self.read_ptr_array_at_va(mr.field_offsets, count)?
        } else {
            self.read_u32_array_at_va(mr.field_offsets, count)?
                .into_iter()
                .map(u64::from)
                .collect()
        };
        Ok(())
    }

    fn load_generics(&mut self) -> Result<()> {
        let mr = self.metadata_registration.clone();

        self.generic_inst_pointers =
            self.read_ptr_array_at_va(mr.generic_insts, mr.generic_insts_count as usize)?;
        let mut insts = Vec::with_capacity(self.generic_inst_pointers.len());
        for &va in &self.generic_inst_pointers {
            insts.push(self.read_struct_at_va::<Il2CppGenericInst>(va)?);
        }
        self.generic_insts = insts;

        self.generic_method_table = self.read_struct_array_at_va(
            mr.generic_method_table,
            mr.generic_method_table_count as usize,
        )?;
        self.method_specs =
            self.read_struct_array_at_va(mr.method_specs, mr.method_specs_count as usize)?;

        let mut by_definition: HashMap<i32, Vec<usize>> = HashMap::new();
        let mut spec_pointers = HashMap::new();
        for entry in &self.generic_method_table {
            let spec_index = entry.generic_method_index as usize;
            let Some(spec) = self.method_specs.get(spec_index) else {
                continue;
            };
            by_definition
                .entry(spec.method_definition_index)
                .or_default()
                .push(spec_index);
            let pointer_index = entry.indices.method_index;
            if pointer_index >= 0 {
                if let Some(&pointer) = self.generic_method_pointers.get(pointer_index as usize) {
                    spec_pointers.insert(spec_index, pointer);
                }
            }
        }
        self.method_specs_by_definition = by_definition;
        self.method_spec_pointers = spec_pointers;
        Ok(())
    }

    fn load_code_gen_modules(&mut self) -> Result<()> {
        let cr = self.code_registration.clone();
        let module_pointers =
            self.read_ptr_array_at_va(cr.code_gen_modules, cr.code_gen_modules_count as usize)?;

        for va in module_pointers {
            let module: Il2CppCodeGenModule = self.read_struct_at_va(va)?;
            let name = self.read_string_at_va(module.module_name)?;

            let method_pointers = if module.method_pointer_count > 0 {
                match self.read_ptr_array_at_va(
                    module.method_pointers,
                    module.method_pointer_count as usize,
                ) {
                    Ok(pointers) => pointers,
                    Err(_) => {
                        warn!("module {name}: method pointer table unreadable");
                        vec![0; module.method_pointer_count as usize]
                    }
                }
            } else {
                Vec::new()
            };

            let mut rgctxs_by_token = HashMap::new();
            if module.rgctxs_count > 0 {
                let rgctxs: Vec<Il2CppRGCTXDefinition> =
                    self.read_struct_array_at_va(module.rgctxs, module.rgctxs_count as usize)?;
                let ranges: Vec<Il2CppTokenRangePair> = self.read_struct_array_at_va(
                    module.rgctx_ranges,
                    module.rgctx_ranges_count as usize,
                )?;
                for pair in ranges {
                    let start = pair.range.start.max(0) as usize;
                    let end = (start + pair.range.length.max(0) as usize).min(rgctxs.len());
                    rgctxs_by_token.insert(pair.token, rgctxs[start..end].to_vec());
                }
            }

            self.module_method_pointers
                .insert(name.clone(), method_pointers);
            self.module_rgctxs.insert(name.clone(), rgctxs_by_token);
            self.code_gen_modules.insert(name, module);
        }
        Ok(())
    }

    // ---- lookups ----

    pub fn get_type(&self, va: u64) -> Option<&Il2CppType> {
        self.type_index_by_va.get(&va).map(|&index| &self.types[index])
    }

    pub fn type_index_of(&self, va: u64) -> Option<usize> {
        self.type_index_by_va.get(&va).copied()
    }

    /// Field offset for `(type, field)`; `-1` means not applicable.
    /// Non-static value-type fields are relative to the unboxed start.
    pub fn field_offset(
        &self,
        type_index: usize,
        field_index_in_type: usize,
        global_field_index: usize,
        is_value_type: bool,
        is_static: bool,
    ) -> i32 {
        let raw = if self.field_offsets_are_pointers {
            let Some(&table) = self.field_offsets.get(type_index) else {
                return -1;
            };
            if table == 0 {
                return -1;
            }
            let Ok(offset) = self.binary.va_to_offset(table) else {
                return -1;
            };
            let mut r = BinaryStream::new(self.binary.data(), self.version, self.binary.is_32bit());
            r.set_position(offset as usize + 4 * field_index_in_type);
            match r.read_i32() {
                Ok(value) => value as i64,
                Err(_) => return -1,
            }
        } else {
            match self.field_offsets.get(global_field_index) {
                Some(&value) => value as i64,
                None => return -1,
            }
        };

        let mut offset = raw;
        if offset > 0 && is_value_type && !is_static {
            offset -= if self.binary.is_32bit() { 8 } else { 16 };
        }
        offset as i32
    }

    /// Code pointer for a method definition; 0 when absent. v24.2+
    /// indexes the per-assembly module by the token's RID, earlier
    /// versions the global table by `method_index`.
    pub fn method_pointer(&self, image_name: &str, method_def: &Il2CppMethodDefinition) -> u64 {
        if self.version >= v(24, 2) {
            let rid = (method_def.token & 0x00FF_FFFF) as usize;
            if rid == 0 {
                return 0;
            }
            self.module_method_pointers
                .get(image_name)
                .and_then(|pointers| pointers.get(rid - 1))
                .copied()
                .unwrap_or(0)
        } else {
            if method_def.method_index < 0 {
                return 0;
            }
            self.method_pointers
                .get(method_def.method_index as usize)
                .copied()
                .unwrap_or(0)
        }
    }

    /// RVA for an absolute pointer; dumps subtract the capture base.
    pub fn rva(&self, pointer: u64) -> u64 {
        if self.binary.is_dumped() {
            pointer.wrapping_sub(self.binary.image_base())
        } else {
            pointer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::testutil::{build_binary_fixture, MetadataBuilder};

    fn fixture() -> (Metadata, Il2Cpp) {
        let metadata = Metadata::parse(&MetadataBuilder::new().build()).unwrap();
        let (binary, addresses) = build_binary_fixture();
        let mut il2cpp = Il2Cpp::new(Box::new(binary), metadata.version, 0);
        il2cpp
            .init(addresses.code_registration, addresses.metadata_registration)
            .unwrap();
        (metadata, il2cpp)
    }

    #[test]
    fn loads_types_and_generics() {
        let (_, il2cpp) = fixture();
        assert_eq!(il2cpp.types.len(), 11);
        assert_eq!(il2cpp.types[5].kind, TypeKind::GenericInst);
        assert_eq!(il2cpp.generic_insts.len(), 2);
        assert_eq!(il2cpp.generic_insts[1].type_argc, 2);
        assert_eq!(il2cpp.method_specs.len(), 1);
        // The generic-method table binds spec 0 to pointer slot 0.
        assert_eq!(il2cpp.method_spec_pointers.get(&0), Some(&0x1234));
        assert_eq!(
            il2cpp.method_specs_by_definition.get(&0).map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn module_method_pointer_lookup_uses_token_rid() {
        let (metadata, il2cpp) = fixture();
        assert!(il2cpp.code_gen_modules.contains_key("mscorlib.dll"));
        let pointer = il2cpp.method_pointer("mscorlib.dll", &metadata.method_defs[0]);
        assert_eq!(pointer, 0x4141);
        assert_eq!(il2cpp.method_pointer("Missing.dll", &metadata.method_defs[0]), 0);
    }

    #[test]
    fn field_offsets_resolve_through_per_type_tables() {
        let (_, il2cpp) = fixture();
        assert_eq!(il2cpp.field_offset(1, 0, 0, false, false), 16);
        assert_eq!(il2cpp.field_offset(1, 1, 0, false, false), 24);
        // Value-type instance fields drop the boxed header.
        assert_eq!(il2cpp.field_offset(1, 1, 0, true, false), 8);
        // A null per-type table means no data.
        assert_eq!(il2cpp.field_offset(0, 0, 0, false, false), -1);
    }

    #[test]
    fn subversion_probe_promotes_24_4_to_24_5() {
        use crate::testutil::FakeBinary;
        let mut binary = FakeBinary::new(0x1000, 0x100);
        // A provisional 24.4 read with an implausible invoker count
        // (slot 4) marks the real layout as 24.5.
        let va = binary.alloc_ptrs(&[0, 0, 0, 0, 0x60000, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let mut il2cpp = Il2Cpp::new(Box::new(binary), v(24, 4), 0);
        let corrected = il2cpp.correct_code_registration(va);
        assert_eq!(il2cpp.version, v(24, 5));
        assert_eq!(corrected, va - 24);
    }

    #[test]
    fn subversion_probe_demotes_24_2_to_24_3_on_oversized_invoker_count() {
        use crate::testutil::FakeBinary;
        let mut binary = FakeBinary::new(0x1000, 0x100);
        // A provisional 24.2 decode with an implausible invoker count
        // (slot 4) marks the real layout as 24.3.
        let va = binary.alloc_ptrs(&[0, 0, 0, 0, 0x60000, 0, 0, 0, 0, 0, 0, 0, 1, 0]);
        let mut il2cpp = Il2Cpp::new(Box::new(binary), v(24, 2), 0);
        let corrected = il2cpp.correct_code_registration(va);
        assert_eq!(il2cpp.version, v(24, 3));
        assert_eq!(corrected, va - 16);
    }

    #[test]
    fn init_promotes_the_subversion_on_every_acceptance_path() {
        use crate::testutil::FakeBinary;
        let mut binary = FakeBinary::new(0x1000, 0x100);
        // A 27.1-layout registration: the adjustor-thunk slot (index 4)
        // reads as the invoker count under the provisional 27.0
        // decode, so init itself must rename the version and re-read,
        // exactly as it does when the address came from a symbol.
        let code_va =
            binary.alloc_ptrs(&[0, 0, 0, 0, 0x99999, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let meta_va = binary.alloc_ptrs(&[0; 16]);
        let mut il2cpp = Il2Cpp::new(Box::new(binary), v(27, 0), 0);
        il2cpp.init(code_va, meta_va).unwrap();
        assert_eq!(il2cpp.version, v(27, 1));
        assert_eq!(il2cpp.code_registration.invoker_pointers_count, 0);
    }

    #[test]
    fn subversion_probe_is_quiet_on_plausible_counts() {
        let (binary, addresses) = build_binary_fixture();
        let mut il2cpp = Il2Cpp::new(Box::new(binary), v(24, 2), 0);
        let corrected = il2cpp.correct_code_registration(addresses.code_registration);
        assert_eq!(il2cpp.version, v(24, 2));
        assert_eq!(corrected, addresses.code_registration);
    }

    #[test]
    fn auto_init_rejects_missing_addresses() {
        let (binary, _) = build_binary_fixture();
        let mut il2cpp = Il2Cpp::new(Box::new(binary), v(24, 2), 0);
        assert!(!il2cpp.auto_init(0, 0x1000).unwrap());
    }
}

//! IL2CPP on-disk and in-binary structure definitions
//!
//! Every struct is declared through `versioned_struct!`, which derives
//! the reader and the per-version size from one field table. Field
//! applicability ranges follow the IL2CPP format history; sizes that
//! the subversion probes depend on (the 264-byte v24.2 header, the
//! 68-byte v24.2 assembly entry) are pinned by tests below.

use metadump_binary_parser::versioned_struct;
use metadump_core::{v, Version};

const MIN: Version = Version::MIN;
const MAX: Version = Version::MAX;

versioned_struct! {
    /// `global-metadata.dat` header: magic, version, then packed
    /// (offset, size) pairs per table.
    pub struct Il2CppGlobalMetadataHeader {
        sanity: u32,
        version: i32,
        string_literal_offset: u32,
        string_literal_size: i32,
        string_literal_data_offset: u32,
        string_literal_data_size: i32,
        string_offset: u32,
        string_size: i32,
        events_offset: u32,
        events_size: i32,
        properties_offset: u32,
        properties_size: i32,
        methods_offset: u32,
        methods_size: i32,
        parameter_default_values_offset: u32,
        parameter_default_values_size: i32,
        field_default_values_offset: u32,
        field_default_values_size: i32,
        field_and_parameter_default_value_data_offset: u32,
        field_and_parameter_default_value_data_size: i32,
        field_marshaled_sizes_offset: u32,
        field_marshaled_sizes_size: i32,
        parameters_offset: u32,
        parameters_size: i32,
        fields_offset: u32,
        fields_size: i32,
        generic_parameters_offset: u32,
        generic_parameters_size: i32,
        generic_parameter_constraints_offset: u32,
        generic_parameter_constraints_size: i32,
        generic_containers_offset: u32,
        generic_containers_size: i32,
        nested_types_offset: u32,
        nested_types_size: i32,
        interfaces_offset: u32,
        interfaces_size: i32,
        vtable_methods_offset: u32,
        vtable_methods_size: i32,
        interface_offsets_offset: u32,
        interface_offsets_size: i32,
        type_definitions_offset: u32,
        type_definitions_size: i32,
        [MIN, v(24, 1)] rgctx_entries_offset: u32,
        [MIN, v(24, 1)] rgctx_entries_count: i32,
        images_offset: u32,
        images_size: i32,
        assemblies_offset: u32,
        assemblies_size: i32,
        [v(19, 0), v(24, 5)] metadata_usage_lists_offset: u32,
        [v(19, 0), v(24, 5)] metadata_usage_lists_count: i32,
        [v(19, 0), v(24, 5)] metadata_usage_pairs_offset: u32,
        [v(19, 0), v(24, 5)] metadata_usage_pairs_count: i32,
        [v(19, 0), MAX] field_refs_offset: u32,
        [v(19, 0), MAX] field_refs_size: i32,
        [v(20, 0), MAX] referenced_assemblies_offset: u32,
        [v(20, 0), MAX] referenced_assemblies_size: i32,
        [v(21, 0), v(27, 2)] attributes_info_offset: u32,
        [v(21, 0), v(27, 2)] attributes_info_count: i32,
        [v(21, 0), v(27, 2)] attribute_types_offset: u32,
        [v(21, 0), v(27, 2)] attribute_types_count: i32,
        [v(29, 0), MAX] attribute_data_offset: u32,
        [v(29, 0), MAX] attribute_data_size: i32,
        [v(29, 0), MAX] attribute_data_range_offset: u32,
        [v(29, 0), MAX] attribute_data_range_size: i32,
        [v(22, 0), MAX] unresolved_virtual_call_parameter_types_offset: u32,
        [v(22, 0), MAX] unresolved_virtual_call_parameter_types_size: i32,
        [v(22, 0), MAX] unresolved_virtual_call_parameter_ranges_offset: u32,
        [v(22, 0), MAX] unresolved_virtual_call_parameter_ranges_size: i32,
        [v(23, 0), MAX] windows_runtime_type_names_offset: u32,
        [v(23, 0), MAX] windows_runtime_type_names_size: i32,
        [v(27, 0), MAX] windows_runtime_strings_offset: u32,
        [v(27, 0), MAX] windows_runtime_strings_size: i32,
        [v(24, 0), MAX] exported_type_definitions_offset: u32,
        [v(24, 0), MAX] exported_type_definitions_size: i32,
    }
}

versioned_struct! {
    /// One entry per assembly image.
    pub struct Il2CppImageDefinition {
        name_index: i32,
        assembly_index: i32,
        type_start: i32,
        type_count: u32,
        [v(24, 0), MAX] exported_type_start: i32,
        [v(24, 0), MAX] exported_type_count: u32,
        [v(19, 0), MAX] entry_point_index: i32,
        [v(19, 0), MAX] token: u32,
        [v(24, 1), MAX] custom_attribute_start: i32,
        [v(24, 1), MAX] custom_attribute_count: u32,
    }
}

versioned_struct! {
    pub struct Il2CppAssemblyNameDefinition {
        name_index: i32,
        culture_index: i32,
        [MIN, v(24, 3)] hash_value_index: i32,
        public_key_index: i32,
        hash_alg: u32,
        hash_len: i32,
        flags: u32,
        major: i32,
        minor: i32,
        build: i32,
        revision: i32,
        public_key_token: [u8; 8],
    }
}

versioned_struct! {
    pub struct Il2CppAssemblyDefinition {
        image_index: i32,
        [v(24, 1), MAX] token: u32,
        [MIN, v(24, 0)] custom_attribute_index: i32,
        referenced_assembly_start: i32,
        referenced_assembly_count: i32,
        aname: Il2CppAssemblyNameDefinition,
    }
}

versioned_struct! {
    pub struct Il2CppTypeDefinition {
        name_index: i32,
        namespace_index: i32,
        [MIN, v(24, 0)] custom_attribute_index: i32,
        byval_type_index: i32,
        [MIN, v(24, 5)] byref_type_index: i32,
        declaring_type_index: i32,
        parent_index: i32,
        element_type_index: i32,
        [MIN, v(24, 1)] rgctx_start_index: i32,
        [MIN, v(24, 1)] rgctx_count: i32,
        generic_container_index: i32,
        [MIN, v(22, 0)] delegate_wrapper_from_managed_to_native_index: i32,
        [MIN, v(22, 0)] marshaling_functions_index: i32,
        [v(21, 0), v(22, 0)] ccw_function_index: i32,
        [v(21, 0), v(22, 0)] guid_index: i32,
        flags: u32,
        field_start: i32,
        method_start: i32,
        event_start: i32,
        property_start: i32,
        nested_types_start: i32,
        interfaces_start: i32,
        vtable_start: i32,
        interface_offsets_start: i32,
        method_count: u16,
        property_count: u16,
        field_count: u16,
        event_count: u16,
        nested_type_count: u16,
        vtable_count: u16,
        interfaces_count: u16,
        interface_offsets_count: u16,
        bitfield: u32,
        [v(19, 0), MAX] token: u32,
    }
}

impl Il2CppTypeDefinition {
    pub fn is_value_type(&self) -> bool {
        self.bitfield & 1 != 0
    }

    pub fn is_enum(&self) -> bool {
        self.bitfield >> 1 & 1 != 0
    }
}

versioned_struct! {
    pub struct Il2CppMethodDefinition {
        name_index: i32,
        declaring_type: i32,
        return_type: i32,
        [v(31, 0), MAX] return_parameter_token: u32,
        parameter_start: i32,
        [MIN, v(24, 0)] custom_attribute_index: i32,
        generic_container_index: i32,
        [MIN, v(24, 1)] method_index: i32,
        [MIN, v(24, 1)] invoker_index: i32,
        [MIN, v(24, 1)] delegate_wrapper_index: i32,
        [MIN, v(24, 1)] rgctx_start_index: i32,
        [MIN, v(24, 1)] rgctx_count: i32,
        token: u32,
        flags: u16,
        iflags: u16,
        slot: u16,
        parameter_count: u16,
    }
}

versioned_struct! {
    pub struct Il2CppFieldDefinition {
        name_index: i32,
        type_index: i32,
        [MIN, v(24, 0)] custom_attribute_index: i32,
        [v(19, 0), MAX] token: u32,
    }
}

versioned_struct! {
    pub struct Il2CppParameterDefinition {
        name_index: i32,
        token: u32,
        [MIN, v(24, 0)] custom_attribute_index: i32,
        type_index: i32,
    }
}

versioned_struct! {
    pub struct Il2CppFieldDefaultValue {
        field_index: i32,
        type_index: i32,
        data_index: i32,
    }
}

versioned_struct! {
    pub struct Il2CppParameterDefaultValue {
        parameter_index: i32,
        type_index: i32,
        data_index: i32,
    }
}

versioned_struct! {
    pub struct Il2CppPropertyDefinition {
        name_index: i32,
        get: i32,
        set: i32,
        attrs: u32,
        [MIN, v(24, 0)] custom_attribute_index: i32,
        [v(19, 0), MAX] token: u32,
    }
}

versioned_struct! {
    pub struct Il2CppEventDefinition {
        name_index: i32,
        type_index: i32,
        add: i32,
        remove: i32,
        raise: i32,
        [MIN, v(24, 0)] custom_attribute_index: i32,
        [v(19, 0), MAX] token: u32,
    }
}

versioned_struct! {
    pub struct Il2CppGenericContainer {
        /// Type or method definition this container belongs to.
        owner_index: i32,
        type_argc: i32,
        /// Non-zero for generic methods, zero for generic types.
        is_method: i32,
        generic_parameter_start: i32,
    }
}

versioned_struct! {
    pub struct Il2CppGenericParameter {
        owner_index: i32,
        name_index: i32,
        constraints_start: i16,
        constraints_count: i16,
        num: u16,
        flags: u16,
    }
}

versioned_struct! {
    pub struct Il2CppStringLiteral {
        length: u32,
        data_index: i32,
    }
}

versioned_struct! {
    pub struct Il2CppMetadataUsageList {
        start: u32,
        count: u32,
    }
}

versioned_struct! {
    pub struct Il2CppMetadataUsagePair {
        destination_index: u32,
        encoded_source_index: u32,
    }
}

versioned_struct! {
    pub struct Il2CppFieldRef {
        type_index: i32,
        /// Offset into the owning type's fields, not a global index.
        field_index: i32,
    }
}

versioned_struct! {
    /// Token-keyed attribute range, v21 through v28.
    pub struct Il2CppCustomAttributeTypeRange {
        [v(24, 1), MAX] token: u32,
        start: i32,
        count: i32,
    }
}

versioned_struct! {
    /// v29 replaces the type ranges with offsets into an attribute
    /// data blob.
    pub struct Il2CppCustomAttributeDataRange {
        token: u32,
        start_offset: u32,
    }
}

versioned_struct! {
    pub struct Il2CppRGCTXDefinition {
        type_raw: i32,
        [MIN, v(27, 1)] raw_index: i32,
        [v(27, 2), MAX] data: ptr,
    }
}

/// Runtime-generic-context slot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RgctxDataType {
    Invalid,
    Type,
    Class,
    Method,
    Array,
}

impl Il2CppRGCTXDefinition {
    pub fn data_type(&self) -> RgctxDataType {
        match self.type_raw {
            1 => RgctxDataType::Type,
            2 => RgctxDataType::Class,
            3 => RgctxDataType::Method,
            4 => RgctxDataType::Array,
            _ => RgctxDataType::Invalid,
        }
    }

    pub fn method_index(&self) -> i32 {
        self.raw_index
    }

    pub fn type_index(&self) -> i32 {
        self.raw_index
    }
}

// ---- structures read out of the executable ----

versioned_struct! {
    /// Root descriptor for generated code tables.
    pub struct Il2CppCodeRegistration {
        [MIN, v(24, 1)] method_pointers_count: ptr,
        [MIN, v(24, 1)] method_pointers: ptr,
        [v(22, 0), MAX] reverse_pinvoke_wrapper_count: ptr,
        [v(22, 0), MAX] reverse_pinvoke_wrappers: ptr,
        [v(21, 0), MAX] generic_method_pointers_count: ptr,
        [v(21, 0), MAX] generic_method_pointers: ptr,
        // The adjustor-thunk slot exists at 24.5 and again from 27.1;
        // 27.0 lacks it, which is what the locator's one-pointer
        // backoff corrects for.
        [v(24, 5), v(24, 5)] generic_adjustor_thunks: ptr,
        [v(27, 1), MAX] generic_adjustor_thunks_v27: ptr,
        invoker_pointers_count: ptr,
        invoker_pointers: ptr,
        [MIN, v(24, 5)] custom_attribute_count: ptr,
        [MIN, v(24, 5)] custom_attribute_generators: ptr,
        [v(21, 0), v(22, 0)] guid_count: ptr,
        [v(21, 0), v(22, 0)] guids: ptr,
        [v(22, 0), MAX] unresolved_virtual_call_count: ptr,
        [v(22, 0), MAX] unresolved_virtual_call_pointers: ptr,
        [v(29, 1), MAX] unresolved_instance_call_pointers: ptr,
        [v(29, 1), MAX] unresolved_static_call_pointers: ptr,
        [v(23, 0), MAX] interop_data_count: ptr,
        [v(23, 0), MAX] interop_data: ptr,
        [v(24, 3), MAX] windows_runtime_factory_count: ptr,
        [v(24, 3), MAX] windows_runtime_factory_table: ptr,
        [v(24, 2), MAX] code_gen_modules_count: ptr,
        [v(24, 2), MAX] code_gen_modules: ptr,
    }
}

versioned_struct! {
    /// Root descriptor for runtime metadata tables.
    pub struct Il2CppMetadataRegistration {
        generic_classes_count: ptr,
        generic_classes: ptr,
        generic_insts_count: ptr,
        generic_insts: ptr,
        generic_method_table_count: ptr,
        generic_method_table: ptr,
        types_count: ptr,
        types: ptr,
        method_specs_count: ptr,
        method_specs: ptr,
        field_offsets_count: ptr,
        field_offsets: ptr,
        type_definitions_sizes_count: ptr,
        type_definitions_sizes: ptr,
        [v(19, 0), MAX] metadata_usages_count: ptr,
        [v(19, 0), MAX] metadata_usages: ptr,
    }
}

versioned_struct! {
    /// Per-assembly code collection, v24.2+.
    pub struct Il2CppCodeGenModule {
        module_name: ptr,
        method_pointer_count: ptr,
        method_pointers: ptr,
        [v(24, 5), MAX] adjustor_thunk_count: ptr,
        [v(24, 5), MAX] adjustor_thunks: ptr,
        invoker_indices: ptr,
        reverse_pinvoke_wrapper_count: ptr,
        reverse_pinvoke_wrapper_indices: ptr,
        rgctx_ranges_count: ptr,
        rgctx_ranges: ptr,
        rgctxs_count: ptr,
        rgctxs: ptr,
        debugger_metadata: ptr,
        [v(27, 0), MAX] custom_attribute_cache_generator: ptr,
        [v(27, 0), MAX] module_initializer: ptr,
        [v(27, 0), MAX] static_constructor_type_indices: ptr,
        [v(27, 0), MAX] metadata_registration: ptr,
        [v(27, 0), MAX] code_registration: ptr,
    }
}

versioned_struct! {
    pub struct Il2CppRange {
        start: i32,
        length: i32,
    }
}

versioned_struct! {
    pub struct Il2CppTokenRangePair {
        token: u32,
        range: Il2CppRange,
    }
}

versioned_struct! {
    pub struct Il2CppGenericMethodIndices {
        method_index: i32,
        invoker_index: i32,
        [v(24, 5), MAX] adjustor_thunk_index: i32,
    }
}

versioned_struct! {
    pub struct Il2CppGenericMethodFunctionsDefinitions {
        generic_method_index: i32,
        indices: Il2CppGenericMethodIndices,
    }
}

versioned_struct! {
    pub struct Il2CppMethodSpec {
        method_definition_index: i32,
        /// Index into the generic-inst table, -1 when the class is not
        /// specialized.
        class_inst_index: i32,
        /// Index into the generic-inst table, -1 when the method is not
        /// specialized.
        method_inst_index: i32,
    }
}

versioned_struct! {
    pub struct Il2CppGenericInst {
        type_argc: ptr,
        /// Pointer to `type_argc` pointers to `Il2CppType`.
        type_argv: ptr,
    }
}

versioned_struct! {
    pub struct Il2CppGenericContext {
        class_inst: ptr,
        method_inst: ptr,
    }
}

versioned_struct! {
    pub struct Il2CppGenericClass {
        [MIN, v(24, 5)] type_definition_index: ptr,
        [v(27, 0), MAX] type_ptr: ptr,
        context: Il2CppGenericContext,
        cached_class: ptr,
    }
}

versioned_struct! {
    pub struct Il2CppArrayType {
        etype: ptr,
        rank: u8,
        numsizes: u8,
        numlobounds: u8,
    }
}

versioned_struct! {
    pub struct Il2CppTypeDefinitionSizes {
        instance_size: u32,
        native_size: i32,
        static_fields_size: u32,
        thread_static_fields_size: u32,
    }
}

// ---- Il2CppType ----

/// Managed type discriminant from the 8-bit `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    Ptr,
    ValueType,
    Class,
    Var,
    Array,
    GenericInst,
    TypedByRef,
    I,
    U,
    Object,
    SzArray,
    MVar,
    Unknown(u8),
}

impl TypeKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => TypeKind::Void,
            0x02 => TypeKind::Boolean,
            0x03 => TypeKind::Char,
            0x04 => TypeKind::I1,
            0x05 => TypeKind::U1,
            0x06 => TypeKind::I2,
            0x07 => TypeKind::U2,
            0x08 => TypeKind::I4,
            0x09 => TypeKind::U4,
            0x0A => TypeKind::I8,
            0x0B => TypeKind::U8,
            0x0C => TypeKind::R4,
            0x0D => TypeKind::R8,
            0x0E => TypeKind::String,
            0x0F => TypeKind::Ptr,
            0x11 => TypeKind::ValueType,
            0x12 => TypeKind::Class,
            0x13 => TypeKind::Var,
            0x14 => TypeKind::Array,
            0x15 => TypeKind::GenericInst,
            0x16 => TypeKind::TypedByRef,
            0x18 => TypeKind::I,
            0x19 => TypeKind::U,
            0x1C => TypeKind::Object,
            0x1D => TypeKind::SzArray,
            0x1E => TypeKind::MVar,
            other => TypeKind::Unknown(other),
        }
    }

    /// C#-style spelling for primitive kinds.
    pub fn primitive_name(&self) -> Option<&'static str> {
        Some(match self {
            TypeKind::Void => "void",
            TypeKind::Boolean => "bool",
            TypeKind::Char => "char",
            TypeKind::I1 => "sbyte",
            TypeKind::U1 => "byte",
            TypeKind::I2 => "short",
            TypeKind::U2 => "ushort",
            TypeKind::I4 => "int",
            TypeKind::U4 => "uint",
            TypeKind::I8 => "long",
            TypeKind::U8 => "ulong",
            TypeKind::R4 => "float",
            TypeKind::R8 => "double",
            TypeKind::String => "string",
            TypeKind::TypedByRef => "TypedReference",
            TypeKind::I => "IntPtr",
            TypeKind::U => "UIntPtr",
            TypeKind::Object => "object",
            _ => return None,
        })
    }
}

/// A 12-byte packed runtime type record: an 8-byte `datapoint` union
/// re-interpreted per the discriminant, plus a 32-bit `bits` word.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Il2CppType {
    pub datapoint: u64,
    pub bits: u32,
    pub attrs: u16,
    pub kind: TypeKind,
    pub num_mods: u8,
    pub byref: bool,
    pub pinned: bool,
    pub valuetype: bool,
}

impl Il2CppType {
    /// Decode the `bits` word. v27.2 narrows `num_mods` to 5 bits and
    /// shifts the flag bits down by one, adding `valuetype` at bit 31.
    pub fn decode(datapoint: u64, bits: u32, version: Version) -> Self {
        let attrs = (bits & 0xFFFF) as u16;
        let kind = TypeKind::from_raw((bits >> 16 & 0xFF) as u8);
        if version >= v(27, 2) {
            Self {
                datapoint,
                bits,
                attrs,
                kind,
                num_mods: (bits >> 24 & 0x1F) as u8,
                byref: bits >> 29 & 1 != 0,
                pinned: bits >> 30 & 1 != 0,
                valuetype: bits >> 31 & 1 != 0,
            }
        } else {
            Self {
                datapoint,
                bits,
                attrs,
                kind,
                num_mods: (bits >> 24 & 0x3F) as u8,
                byref: bits >> 30 & 1 != 0,
                pinned: bits >> 31 & 1 != 0,
                valuetype: false,
            }
        }
    }
}

/// Kind buckets of the metadata-usage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataUsage {
    TypeInfo,
    Il2CppType,
    MethodDef,
    FieldInfo,
    StringLiteral,
}

impl MetadataUsage {
    pub fn from_kind(kind: u32) -> Option<Self> {
        match kind {
            1 => Some(MetadataUsage::TypeInfo),
            2 => Some(MetadataUsage::Il2CppType),
            3 => Some(MetadataUsage::MethodDef),
            4 => Some(MetadataUsage::FieldInfo),
            5 => Some(MetadataUsage::StringLiteral),
            _ => None,
        }
    }
}

/// .NET type-attribute bits used by the dump writer.
pub mod type_attributes {
    pub const VISIBILITY_MASK: u32 = 0x0000_0007;
    pub const NOT_PUBLIC: u32 = 0x0000_0000;
    pub const PUBLIC: u32 = 0x0000_0001;
    pub const NESTED_PUBLIC: u32 = 0x0000_0002;
    pub const NESTED_PRIVATE: u32 = 0x0000_0003;
    pub const NESTED_FAMILY: u32 = 0x0000_0004;
    pub const NESTED_ASSEMBLY: u32 = 0x0000_0005;
    pub const NESTED_FAM_AND_ASSEM: u32 = 0x0000_0006;
    pub const NESTED_FAM_OR_ASSEM: u32 = 0x0000_0007;

    pub const INTERFACE: u32 = 0x0000_0020;
    pub const ABSTRACT: u32 = 0x0000_0080;
    pub const SEALED: u32 = 0x0000_0100;
    pub const SERIALIZABLE: u32 = 0x0000_2000;
}

/// .NET field-attribute bits.
pub mod field_attributes {
    pub const FIELD_ACCESS_MASK: u16 = 0x0007;
    pub const PRIVATE: u16 = 0x0001;
    pub const FAM_AND_ASSEM: u16 = 0x0002;
    pub const ASSEMBLY: u16 = 0x0003;
    pub const FAMILY: u16 = 0x0004;
    pub const FAM_OR_ASSEM: u16 = 0x0005;
    pub const PUBLIC: u16 = 0x0006;

    pub const STATIC: u16 = 0x0010;
    pub const INIT_ONLY: u16 = 0x0020;
    pub const LITERAL: u16 = 0x0040;
}

/// .NET method-attribute bits.
pub mod method_attributes {
    pub const MEMBER_ACCESS_MASK: u16 = 0x0007;
    pub const PRIVATE: u16 = 0x0001;
    pub const FAM_AND_ASSEM: u16 = 0x0002;
    pub const ASSEMBLY: u16 = 0x0003;
    pub const FAMILY: u16 = 0x0004;
    pub const FAM_OR_ASSEM: u16 = 0x0005;
    pub const PUBLIC: u16 = 0x0006;

    pub const STATIC: u16 = 0x0010;
    pub const FINAL: u16 = 0x0020;
    pub const VIRTUAL: u16 = 0x0040;
    pub const HIDE_BY_SIG: u16 = 0x0080;
    pub const VTABLE_LAYOUT_MASK: u16 = 0x0100;
    pub const NEW_SLOT: u16 = 0x0100;
    pub const ABSTRACT: u16 = 0x0400;
    pub const PINVOKE_IMPL: u16 = 0x2000;
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadump_binary_parser::StructRead;

    #[test]
    fn header_size_anchors_the_24_2_probe() {
        // The first table starts right after the header, so the 24.2
        // layout puts string_literal_offset at exactly 264.
        assert_eq!(Il2CppGlobalMetadataHeader::size_of(v(24, 2), false), 264);
        assert_eq!(Il2CppGlobalMetadataHeader::size_of(v(24, 0), false), 272);
    }

    #[test]
    fn assembly_entry_size_anchors_the_24_4_probe() {
        assert_eq!(Il2CppAssemblyDefinition::size_of(v(24, 2), false), 68);
        assert_eq!(Il2CppAssemblyDefinition::size_of(v(24, 4), false), 64);
    }

    #[test]
    fn image_size_grows_with_custom_attribute_range() {
        assert_eq!(Il2CppImageDefinition::size_of(v(24, 0), false), 32);
        assert_eq!(Il2CppImageDefinition::size_of(v(24, 1), false), 40);
        assert_eq!(Il2CppImageDefinition::size_of(v(16, 0), false), 16);
    }

    #[test]
    fn type_definition_sizes() {
        assert_eq!(Il2CppTypeDefinition::size_of(v(24, 0), false), 104);
        assert_eq!(Il2CppTypeDefinition::size_of(v(24, 2), false), 92);
        assert_eq!(Il2CppTypeDefinition::size_of(v(27, 0), false), 88);
    }

    #[test]
    fn method_definition_sizes() {
        assert_eq!(Il2CppMethodDefinition::size_of(v(24, 0), false), 56);
        assert_eq!(Il2CppMethodDefinition::size_of(v(24, 1), false), 52);
        assert_eq!(Il2CppMethodDefinition::size_of(v(24, 2), false), 32);
        assert_eq!(Il2CppMethodDefinition::size_of(v(29, 0), false), 32);
        assert_eq!(Il2CppMethodDefinition::size_of(v(31, 0), false), 36);
    }

    #[test]
    fn code_registration_field_backoff_constants() {
        // Pointer distance from the struct start to the
        // code_gen_modules field for the base layouts the locator
        // assumes: 13 for 24.2 through 28, 14 for 29.0, 16 for 29.1.
        let slots_before_modules = |ver| {
            (Il2CppCodeRegistration::size_of(ver, false) / 8) as u64 - 1
        };
        assert_eq!(slots_before_modules(v(27, 0)), 13);
        assert_eq!(slots_before_modules(v(29, 0)), 14);
        assert_eq!(slots_before_modules(v(29, 1)), 16);
        // 24.4 carries the custom-attribute pair the locator constant
        // does not account for; the auto-correction backs off 2 slots.
        assert_eq!(slots_before_modules(v(24, 4)), 15);
        assert_eq!(slots_before_modules(v(24, 5)), 16);
    }

    #[test]
    fn metadata_registration_anchor_offsets() {
        // field_offsets_count is the 10th pointer slot and
        // type_definitions_sizes_count the 12th; both anchor scans
        // depend on those distances.
        assert_eq!(Il2CppMetadataRegistration::size_of(v(24, 2), false), 16 * 8);
        assert_eq!(Il2CppMetadataRegistration::size_of(v(16, 0), false), 14 * 8);
    }

    #[test]
    fn type_bits_decoding_pre_and_post_27_2() {
        // attrs = 0x0006, kind = CLASS (0x12), num_mods = 3,
        // byref set, pinned clear under the pre-27.2 layout.
        let bits = 0x0006 | 0x12 << 16 | 0x03 << 24 | 1 << 30;
        let ty = Il2CppType::decode(0x1000, bits, v(24, 5));
        assert_eq!(ty.attrs, 6);
        assert_eq!(ty.kind, TypeKind::Class);
        assert_eq!(ty.num_mods, 3);
        assert!(ty.byref);
        assert!(!ty.pinned);
        assert!(!ty.valuetype);

        // Same word at 27.2: bit 30 is now pinned, bit 29 byref, and
        // num_mods loses its top bit.
        let ty = Il2CppType::decode(0x1000, bits, v(27, 2));
        assert_eq!(ty.num_mods, 3);
        assert!(!ty.byref);
        assert!(ty.pinned);
        assert!(!ty.valuetype);

        let valuetype_bits = 0x11u32 << 16 | 1 << 31;
        let ty = Il2CppType::decode(0, valuetype_bits, v(29, 0));
        assert_eq!(ty.kind, TypeKind::ValueType);
        assert!(ty.valuetype);
    }

    #[test]
    fn unknown_type_kind_is_preserved() {
        assert_eq!(TypeKind::from_raw(0x55), TypeKind::Unknown(0x55));
        assert_eq!(TypeKind::from_raw(0x55).primitive_name(), None);
        assert_eq!(TypeKind::I4.primitive_name(), Some("int"));
    }

    #[test]
    fn generic_method_table_entry_grows_at_24_5() {
        assert_eq!(
            Il2CppGenericMethodFunctionsDefinitions::size_of(v(24, 2), false),
            12
        );
        assert_eq!(
            Il2CppGenericMethodFunctionsDefinitions::size_of(v(24, 5), false),
            16
        );
    }
}

//! Type-name resolution and default-value decoding
//!
//! Composes fully-qualified managed names from the metadata tables and
//! the binary's type records: namespaces, nested declarations, arrays,
//! pointers and generic parameter substitution. Resolution is by index
//! through the loader's tables, never by chasing raw pointers, so
//! cyclic generic references cannot recurse into ownership problems.
//!
//! Three memoization caches keep the composition linear: the per-type
//! name, the generic-inst parameter string, and the generic-container
//! parameter string.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use metadump_binary_parser::cached_size_of;
use metadump_core::{v, Version};
use tracing::debug;

use crate::binary::Il2Cpp;
use crate::metadata::Metadata;
use crate::search::SectionHelper;
use crate::structs::*;

/// A decoded field/parameter default value. `Raw` carries the blob
/// offset when the discriminant is not decodable.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Boolean(bool),
    U8(u8),
    I8(i8),
    Char(char),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    String(Option<String>),
    Raw(u64),
}

impl fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Boolean(value) => write!(f, "{value}"),
            DefaultValue::U8(value) => write!(f, "{value}"),
            DefaultValue::I8(value) => write!(f, "{value}"),
            DefaultValue::Char(value) => write!(f, "'{}'", value.escape_default()),
            DefaultValue::U16(value) => write!(f, "{value}"),
            DefaultValue::I16(value) => write!(f, "{value}"),
            DefaultValue::U32(value) => write!(f, "{value}"),
            DefaultValue::I32(value) => write!(f, "{value}"),
            DefaultValue::U64(value) => write!(f, "{value}"),
            DefaultValue::I64(value) => write!(f, "{value}"),
            DefaultValue::F32(value) => write!(f, "{value}f"),
            DefaultValue::F64(value) => write!(f, "{value}"),
            DefaultValue::String(Some(value)) => write!(f, "\"{}\"", value.escape_default()),
            DefaultValue::String(None) => write!(f, "null"),
            DefaultValue::Raw(offset) => write!(f, "/* metadata offset {offset:#x} */"),
        }
    }
}

pub struct Il2CppExecutor<'a> {
    pub metadata: &'a Metadata,
    pub il2cpp: &'a Il2Cpp,
    /// Attribute generator pointers, flattened per attribute index.
    pub custom_attribute_generators: Vec<u64>,

    type_name_cache: RefCell<HashMap<(u64, u32, bool, bool), String>>,
    generic_class_cache: RefCell<HashMap<u64, Il2CppGenericClass>>,
    generic_inst_cache: RefCell<HashMap<u64, Il2CppGenericInst>>,
    generic_inst_params_cache: RefCell<HashMap<(u64, u64), String>>,
    generic_container_params_cache: RefCell<HashMap<(i32, i32), String>>,
}

impl<'a> Il2CppExecutor<'a> {
    pub fn new(metadata: &'a Metadata, il2cpp: &'a Il2Cpp) -> Self {
        let mut custom_attribute_generators = Vec::new();
        if il2cpp.version >= v(27, 0) && il2cpp.version < v(29, 0) {
            // v27/v28 moved the generators into the code-gen modules.
            let total: usize = metadata
                .image_defs
                .iter()
                .map(|image| image.custom_attribute_count as usize)
                .sum();
            custom_attribute_generators = vec![0; total];
            for image in &metadata.image_defs {
                let Ok(image_name) = metadata.get_string(image.name_index) else {
                    continue;
                };
                let Some(module) = il2cpp.code_gen_modules.get(&image_name) else {
                    continue;
                };
                if image.custom_attribute_count == 0 {
                    continue;
                }
                if let Ok(pointers) = il2cpp.read_ptr_array_at_va(
                    module.custom_attribute_cache_generator,
                    image.custom_attribute_count as usize,
                ) {
                    for (i, pointer) in pointers.into_iter().enumerate() {
                        let index = image.custom_attribute_start as usize + i;
                        if index < custom_attribute_generators.len() {
                            custom_attribute_generators[index] = pointer;
                        }
                    }
                }
            }
        } else if il2cpp.version < v(27, 0) {
            custom_attribute_generators = il2cpp.custom_attribute_generators.clone();
        }

        Self {
            metadata,
            il2cpp,
            custom_attribute_generators,
            type_name_cache: RefCell::new(HashMap::new()),
            generic_class_cache: RefCell::new(HashMap::new()),
            generic_inst_cache: RefCell::new(HashMap::new()),
            generic_inst_params_cache: RefCell::new(HashMap::new()),
            generic_container_params_cache: RefCell::new(HashMap::new()),
        }
    }

    fn version(&self) -> Version {
        self.il2cpp.version
    }

    /// Managed name of a runtime type record.
    pub fn get_type_name(
        &self,
        il2cpp_type: &Il2CppType,
        add_namespace: bool,
        is_nested: bool,
    ) -> String {
        let key = (
            il2cpp_type.datapoint,
            il2cpp_type.bits,
            add_namespace,
            is_nested,
        );
        if let Some(cached) = self.type_name_cache.borrow().get(&key) {
            return cached.clone();
        }
        let name = self.type_name_uncached(il2cpp_type, add_namespace, is_nested);
        self.type_name_cache.borrow_mut().insert(key, name.clone());
        name
    }

    fn type_name_uncached(
        &self,
        il2cpp_type: &Il2CppType,
        add_namespace: bool,
        is_nested: bool,
    ) -> String {
        match il2cpp_type.kind {
            TypeKind::Array => {
                let element = self
                    .il2cpp
                    .read_struct_at_va::<Il2CppArrayType>(il2cpp_type.datapoint)
                    .ok()
                    .and_then(|array| self.il2cpp.get_type(array.etype));
                match element {
                    Some(element) => {
                        format!("{}[,]", self.get_type_name(element, add_namespace, false))
                    }
                    None => "object[]".to_string(),
                }
            }
            TypeKind::SzArray => match self.il2cpp.get_type(il2cpp_type.datapoint) {
                Some(element) => {
                    format!("{}[]", self.get_type_name(element, add_namespace, false))
                }
                None => "object[]".to_string(),
            },
            TypeKind::Ptr => match self.il2cpp.get_type(il2cpp_type.datapoint) {
                Some(pointee) => {
                    format!("{}*", self.get_type_name(pointee, add_namespace, false))
                }
                None => "void*".to_string(),
            },
            TypeKind::Var | TypeKind::MVar => self
                .generic_parameter_from_type(il2cpp_type)
                .and_then(|param| self.metadata.get_string(param.name_index).ok())
                .unwrap_or_else(|| "T".to_string()),
            TypeKind::Class | TypeKind::ValueType | TypeKind::GenericInst => {
                self.class_like_name(il2cpp_type, add_namespace, is_nested)
            }
            kind => kind
                .primitive_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("UnknownType({kind:?})")),
        }
    }

    fn class_like_name(
        &self,
        il2cpp_type: &Il2CppType,
        add_namespace: bool,
        is_nested: bool,
    ) -> String {
        let mut generic_class = None;
        let type_def = if il2cpp_type.kind == TypeKind::GenericInst {
            let class = self.read_generic_class(il2cpp_type.datapoint);
            let def = class
                .as_ref()
                .and_then(|class| self.generic_class_type_definition(class));
            generic_class = class;
            def
        } else {
            self.type_definition_from_type(il2cpp_type)
        };
        let Some(type_def) = type_def else {
            return "UnknownType".to_string();
        };

        let mut result = String::new();
        if type_def.declaring_type_index != -1 {
            if let Some(declaring) = self.il2cpp.types.get(type_def.declaring_type_index as usize)
            {
                result.push_str(&self.get_type_name(declaring, add_namespace, true));
                result.push('.');
            }
        } else if add_namespace {
            if let Ok(namespace) = self.metadata.get_string(type_def.namespace_index) {
                if !namespace.is_empty() {
                    result.push_str(&namespace);
                    result.push('.');
                }
            }
        }

        let raw_name = self
            .metadata
            .get_string(type_def.name_index)
            .unwrap_or_else(|_| "<unknown>".to_string());
        result.push_str(strip_arity(&raw_name));

        if is_nested {
            return result;
        }

        if let Some(generic_class) = generic_class {
            if let Some(inst) = self.read_generic_inst(generic_class.context.class_inst) {
                result.push_str(&self.generic_inst_params(&inst));
            }
        } else if type_def.generic_container_index >= 0 {
            if let Some(container) = self
                .metadata
                .generic_containers
                .get(type_def.generic_container_index as usize)
            {
                result.push_str(&self.generic_container_params(container));
            }
        }
        result
    }

    /// Name of a type definition, optionally with its open generic
    /// parameter list.
    pub fn get_type_def_name(
        &self,
        type_def: &Il2CppTypeDefinition,
        add_namespace: bool,
        generic_parameters: bool,
    ) -> String {
        let mut prefix = String::new();
        if type_def.declaring_type_index != -1 {
            if let Some(declaring) = self.il2cpp.types.get(type_def.declaring_type_index as usize)
            {
                prefix = self.get_type_name(declaring, add_namespace, true);
                prefix.push('.');
            }
        } else if add_namespace {
            if let Ok(namespace) = self.metadata.get_string(type_def.namespace_index) {
                if !namespace.is_empty() {
                    prefix = namespace;
                    prefix.push('.');
                }
            }
        }

        let raw_name = self
            .metadata
            .get_string(type_def.name_index)
            .unwrap_or_else(|_| "<unknown>".to_string());
        let mut name = if type_def.generic_container_index >= 0 {
            strip_arity(&raw_name).to_string()
        } else {
            raw_name
        };
        if generic_parameters && type_def.generic_container_index >= 0 {
            if let Some(container) = self
                .metadata
                .generic_containers
                .get(type_def.generic_container_index as usize)
            {
                name.push_str(&self.generic_container_params(container));
            }
        }
        prefix + &name
    }

    /// `(declaring type name, method name)` for a method spec, each
    /// carrying its generic arguments when specialized.
    pub fn get_method_spec_name(
        &self,
        method_spec: &Il2CppMethodSpec,
        add_namespace: bool,
    ) -> (String, String) {
        let Some(method_def) = self
            .metadata
            .method_defs
            .get(method_spec.method_definition_index as usize)
        else {
            return ("UnknownType".to_string(), "UnknownMethod".to_string());
        };
        let Some(type_def) = self
            .metadata
            .type_defs
            .get(method_def.declaring_type as usize)
        else {
            return ("UnknownType".to_string(), "UnknownMethod".to_string());
        };

        let mut type_name = self.get_type_def_name(type_def, add_namespace, false);
        if method_spec.class_inst_index != -1 {
            if let Some(inst) = self
                .il2cpp
                .generic_insts
                .get(method_spec.class_inst_index as usize)
            {
                type_name.push_str(&self.generic_inst_params(inst));
            }
        }

        let mut method_name = self
            .metadata
            .get_string(method_def.name_index)
            .unwrap_or_else(|_| "<unknown>".to_string());
        if method_spec.method_inst_index != -1 {
            if let Some(inst) = self
                .il2cpp
                .generic_insts
                .get(method_spec.method_inst_index as usize)
            {
                method_name.push_str(&self.generic_inst_params(inst));
            }
        }
        (type_name, method_name)
    }

    /// `<T1, T2, …>` for a concrete instantiation.
    fn generic_inst_params(&self, inst: &Il2CppGenericInst) -> String {
        let key = (inst.type_argv, inst.type_argc);
        if let Some(cached) = self.generic_inst_params_cache.borrow().get(&key) {
            return cached.clone();
        }
        let mut names = Vec::with_capacity(inst.type_argc as usize);
        match self
            .il2cpp
            .read_ptr_array_at_va(inst.type_argv, inst.type_argc as usize)
        {
            Ok(pointers) => {
                for pointer in pointers {
                    match self.il2cpp.get_type(pointer) {
                        Some(ty) => names.push(self.get_type_name(ty, false, false)),
                        None => names.push("?".to_string()),
                    }
                }
            }
            Err(_) => names.push("?".to_string()),
        }
        let params = format!("<{}>", names.join(", "));
        self.generic_inst_params_cache
            .borrow_mut()
            .insert(key, params.clone());
        params
    }

    /// `<T1, T2, …>` for an open generic definition.
    fn generic_container_params(&self, container: &Il2CppGenericContainer) -> String {
        let key = (container.generic_parameter_start, container.type_argc);
        if let Some(cached) = self.generic_container_params_cache.borrow().get(&key) {
            return cached.clone();
        }
        let mut names = Vec::with_capacity(container.type_argc as usize);
        for i in 0..container.type_argc {
            let index = (container.generic_parameter_start + i) as usize;
            let name = self
                .metadata
                .generic_parameters
                .get(index)
                .and_then(|param| self.metadata.get_string(param.name_index).ok())
                .unwrap_or_else(|| "T".to_string());
            names.push(name);
        }
        let params = format!("<{}>", names.join(", "));
        self.generic_container_params_cache
            .borrow_mut()
            .insert(key, params.clone());
        params
    }

    fn read_generic_class(&self, va: u64) -> Option<Il2CppGenericClass> {
        if let Some(cached) = self.generic_class_cache.borrow().get(&va) {
            return Some(cached.clone());
        }
        let class = self.il2cpp.read_struct_at_va::<Il2CppGenericClass>(va).ok()?;
        self.generic_class_cache.borrow_mut().insert(va, class.clone());
        Some(class)
    }

    fn read_generic_inst(&self, va: u64) -> Option<Il2CppGenericInst> {
        if va == 0 {
            return None;
        }
        if let Some(cached) = self.generic_inst_cache.borrow().get(&va) {
            return Some(cached.clone());
        }
        let inst = self.il2cpp.read_struct_at_va::<Il2CppGenericInst>(va).ok()?;
        self.generic_inst_cache.borrow_mut().insert(va, inst.clone());
        Some(inst)
    }

    fn generic_class_type_definition(
        &self,
        generic_class: &Il2CppGenericClass,
    ) -> Option<&Il2CppTypeDefinition> {
        if self.version() >= v(27, 0) {
            let ty = self.il2cpp.get_type(generic_class.type_ptr)?;
            return self.type_definition_from_type(ty);
        }
        let index = generic_class.type_definition_index;
        if index == u64::MAX || index == u32::MAX as u64 {
            return None;
        }
        self.metadata.type_defs.get(index as usize)
    }

    /// For v27+ memory dumps, class fields carry runtime handles that
    /// must be translated back to table indices via the image base.
    fn type_definition_from_type(
        &self,
        il2cpp_type: &Il2CppType,
    ) -> Option<&Il2CppTypeDefinition> {
        let index = if self.version() >= v(27, 0) && self.il2cpp.binary.is_dumped() {
            let offset = il2cpp_type
                .datapoint
                .wrapping_sub(self.metadata.image_base)
                .wrapping_sub(self.metadata.header.type_definitions_offset as u64);
            let size = cached_size_of::<Il2CppTypeDefinition>(self.metadata.version, false) as u64;
            (offset / size) as usize
        } else {
            il2cpp_type.datapoint as usize
        };
        self.metadata.type_defs.get(index)
    }

    fn generic_parameter_from_type(
        &self,
        il2cpp_type: &Il2CppType,
    ) -> Option<&Il2CppGenericParameter> {
        let index = if self.version() >= v(27, 0) && self.il2cpp.binary.is_dumped() {
            let offset = il2cpp_type
                .datapoint
                .wrapping_sub(self.metadata.image_base)
                .wrapping_sub(self.metadata.header.generic_parameters_offset as u64);
            let size = cached_size_of::<Il2CppGenericParameter>(self.metadata.version, false) as u64;
            (offset / size) as usize
        } else {
            il2cpp_type.datapoint as usize
        };
        self.metadata.generic_parameters.get(index)
    }

    /// RGCTX slots for a type, from the module tables (v24.2+) or the
    /// metadata table (earlier).
    pub fn rgctx_definitions(
        &self,
        image_name: &str,
        type_def: &Il2CppTypeDefinition,
    ) -> Option<Vec<Il2CppRGCTXDefinition>> {
        if self.version() >= v(24, 2) {
            return self
                .il2cpp
                .module_rgctxs
                .get(image_name)
                .and_then(|by_token| by_token.get(&type_def.token))
                .cloned();
        }
        if type_def.rgctx_count > 0 {
            let start = type_def.rgctx_start_index.max(0) as usize;
            let end = (start + type_def.rgctx_count as usize).min(self.metadata.rgctx_entries.len());
            return Some(self.metadata.rgctx_entries[start..end].to_vec());
        }
        None
    }

    /// Decode one default value; the shape follows the resolved type's
    /// primitive kind. Strings and 32-bit ints are compressed from v29.
    pub fn try_get_default_value(&self, type_index: usize, data_index: i32) -> DefaultValue {
        let pointer = self.metadata.default_value_data_offset(data_index);
        let Some(default_type) = self.il2cpp.types.get(type_index) else {
            return DefaultValue::Raw(pointer as u64);
        };
        let mut r = self.metadata.stream();
        r.set_position(pointer);
        let compressed = self.version() >= v(29, 0);

        let decoded = match default_type.kind {
            TypeKind::Boolean => r.read_bool().map(DefaultValue::Boolean),
            TypeKind::U1 => r.read_u8().map(DefaultValue::U8),
            TypeKind::I1 => r.read_i8().map(DefaultValue::I8),
            TypeKind::Char => r
                .read_u16()
                .map(|raw| DefaultValue::Char(char::from_u32(raw as u32).unwrap_or('?'))),
            TypeKind::U2 => r.read_u16().map(DefaultValue::U16),
            TypeKind::I2 => r.read_i16().map(DefaultValue::I16),
            TypeKind::U4 => {
                if compressed {
                    r.read_compressed_u32().map(DefaultValue::U32)
                } else {
                    r.read_u32().map(DefaultValue::U32)
                }
            }
            TypeKind::I4 => {
                if compressed {
                    r.read_compressed_i32().map(DefaultValue::I32)
                } else {
                    r.read_i32().map(DefaultValue::I32)
                }
            }
            TypeKind::U8 => r.read_u64().map(DefaultValue::U64),
            TypeKind::I8 => r.read_i64().map(DefaultValue::I64),
            TypeKind::R4 => r.read_f32().map(DefaultValue::F32),
            TypeKind::R8 => r.read_f64().map(DefaultValue::F64),
            TypeKind::String => {
                let length = if compressed {
                    r.read_compressed_i32()
                } else {
                    r.read_i32()
                };
                match length {
                    Ok(-1) if compressed => Ok(DefaultValue::String(None)),
                    Ok(length) if length >= 0 => r
                        .read_string(length as usize)
                        .map(|s| DefaultValue::String(Some(s))),
                    Ok(_) | Err(_) => {
                        return DefaultValue::Raw(pointer as u64);
                    }
                }
            }
            kind => {
                debug!("no default-value codec for {kind:?}");
                return DefaultValue::Raw(pointer as u64);
            }
        };
        decoded.unwrap_or(DefaultValue::Raw(pointer as u64))
    }

    /// Locator pre-seeded with this universe's counts.
    pub fn section_helper(&self) -> SectionHelper<'_> {
        let method_count = self
            .metadata
            .method_defs
            .iter()
            .filter(|method| method.method_index >= 0)
            .count();
        SectionHelper::new(
            self.il2cpp.binary.as_ref(),
            self.version(),
            method_count,
            self.metadata.type_defs.len(),
            self.metadata.metadata_usages_count as usize,
            self.metadata.image_defs.len(),
        )
    }
}

fn strip_arity(name: &str) -> &str {
    match name.find('`') {
        Some(index) => &name[..index],
        None => name,
    }
}

//! Output generators: the C#-like `dump.cs`, the IDA/Ghidra
//! `script.json` annotations and the `il2cpp.h` struct header.

use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

use metadump_core::{Config, Error, Result};

use crate::executor::Il2CppExecutor;
use crate::structs::*;

/// C#-like pseudocode dump of every image, type, field, property and
/// method.
pub struct Decompiler<'a> {
    executor: &'a Il2CppExecutor<'a>,
    config: &'a Config,
}

impl<'a> Decompiler<'a> {
    pub fn new(executor: &'a Il2CppExecutor<'a>, config: &'a Config) -> Self {
        Self { executor, config }
    }

    pub fn write_to_file(&self, output_dir: &Path) -> Result<()> {
        std::fs::write(output_dir.join("dump.cs"), self.decompile()?)?;
        Ok(())
    }

    pub fn decompile(&self) -> Result<String> {
        let metadata = self.executor.metadata;
        let mut out = String::new();

        for (index, image) in metadata.image_defs.iter().enumerate() {
            let name = metadata.get_string(image.name_index)?;
            let _ = writeln!(out, "// Image {index}: {name} - {}", image.type_start);
        }

        for image in &metadata.image_defs {
            let image_name = metadata.get_string(image.name_index)?;
            let type_end = image.type_start as usize + image.type_count as usize;
            for type_index in image.type_start.max(0) as usize..type_end {
                let Some(type_def) = metadata.type_defs.get(type_index) else {
                    break;
                };
                self.dump_type(&mut out, type_def, type_index, &image_name)?;
            }
        }
        Ok(out)
    }

    fn dump_type(
        &self,
        out: &mut String,
        type_def: &Il2CppTypeDefinition,
        type_index: usize,
        image_name: &str,
    ) -> Result<()> {
        let metadata = self.executor.metadata;
        let il2cpp = self.executor.il2cpp;

        let namespace = metadata.get_string(type_def.namespace_index)?;
        let _ = writeln!(out, "\n// Namespace: {namespace}");

        if self.config.dump_attribute
            && type_def.flags & type_attributes::SERIALIZABLE != 0
        {
            out.push_str("[Serializable]\n");
        }

        let visibility = match type_def.flags & type_attributes::VISIBILITY_MASK {
            type_attributes::PUBLIC | type_attributes::NESTED_PUBLIC => "public ",
            type_attributes::NOT_PUBLIC
            | type_attributes::NESTED_FAM_AND_ASSEM
            | type_attributes::NESTED_ASSEMBLY => "internal ",
            type_attributes::NESTED_PRIVATE => "private ",
            type_attributes::NESTED_FAMILY => "protected ",
            type_attributes::NESTED_FAM_OR_ASSEM => "protected internal ",
            _ => "",
        };
        out.push_str(visibility);

        let is_interface = type_def.flags & type_attributes::INTERFACE != 0;
        let is_abstract = type_def.flags & type_attributes::ABSTRACT != 0;
        let is_sealed = type_def.flags & type_attributes::SEALED != 0;
        if is_abstract && is_sealed {
            out.push_str("static ");
        } else if !is_interface && is_abstract {
            out.push_str("abstract ");
        } else if !type_def.is_value_type() && !type_def.is_enum() && is_sealed {
            out.push_str("sealed ");
        }

        let kind = if is_interface {
            "interface "
        } else if type_def.is_enum() {
            "enum "
        } else if type_def.is_value_type() {
            "struct "
        } else {
            "class "
        };
        out.push_str(kind);
        out.push_str(&self.executor.get_type_def_name(type_def, false, true));

        let mut extends = Vec::new();
        if type_def.parent_index >= 0 && !type_def.is_value_type() && !type_def.is_enum() {
            if let Some(parent) = il2cpp.types.get(type_def.parent_index as usize) {
                let parent_name = self.executor.get_type_name(parent, false, false);
                if parent_name != "object" {
                    extends.push(parent_name);
                }
            }
        }
        for i in 0..type_def.interfaces_count as usize {
            let Some(&interface_index) = metadata
                .interface_indices
                .get(type_def.interfaces_start.max(0) as usize + i)
            else {
                continue;
            };
            if let Some(interface) = il2cpp.types.get(interface_index.max(0) as usize) {
                extends.push(self.executor.get_type_name(interface, false, false));
            }
        }
        if !extends.is_empty() {
            let _ = write!(out, " : {}", extends.join(", "));
        }

        if self.config.dump_type_def_index {
            let _ = write!(out, " // TypeDefIndex: {type_index}");
        }
        out.push_str("\n{\n");

        if self.config.dump_field && type_def.field_count > 0 {
            out.push_str("\t// Fields\n");
            for i in 0..type_def.field_count as usize {
                self.dump_field(out, type_def, type_index, i)?;
            }
        }
        if self.config.dump_property && type_def.property_count > 0 {
            out.push_str("\t// Properties\n");
            for i in 0..type_def.property_count as usize {
                self.dump_property(out, type_def, i)?;
            }
        }
        if self.config.dump_method && type_def.method_count > 0 {
            out.push_str("\t// Methods\n");
            for i in 0..type_def.method_count as usize {
                self.dump_method(out, type_def, image_name, i)?;
            }
        }
        out.push_str("}\n");
        Ok(())
    }

    fn dump_field(
        &self,
        out: &mut String,
        type_def: &Il2CppTypeDefinition,
        type_index: usize,
        field_in_type: usize,
    ) -> Result<()> {
        let metadata = self.executor.metadata;
        let il2cpp = self.executor.il2cpp;
        let global_index = type_def.field_start.max(0) as usize + field_in_type;
        let Some(field_def) = metadata.field_defs.get(global_index) else {
            return Ok(());
        };
        let Some(field_type) = il2cpp.types.get(field_def.type_index.max(0) as usize) else {
            return Ok(());
        };

        let attrs = field_type.attrs;
        let access = match attrs & field_attributes::FIELD_ACCESS_MASK {
            field_attributes::PRIVATE => "private ",
            field_attributes::PUBLIC => "public ",
            field_attributes::FAMILY => "protected ",
            field_attributes::ASSEMBLY | field_attributes::FAM_AND_ASSEM => "internal ",
            field_attributes::FAM_OR_ASSEM => "protected internal ",
            _ => "",
        };
        out.push('\t');
        out.push_str(access);
        let is_static = attrs & field_attributes::STATIC != 0;
        let is_literal = attrs & field_attributes::LITERAL != 0;
        if is_literal {
            out.push_str("const ");
        } else {
            if is_static {
                out.push_str("static ");
            }
            if attrs & field_attributes::INIT_ONLY != 0 {
                out.push_str("readonly ");
            }
        }

        let _ = write!(
            out,
            "{} {}",
            self.executor.get_type_name(field_type, false, false),
            metadata.get_string(field_def.name_index)?
        );

        if let Some(default) = metadata.field_default_value(global_index as i32) {
            if default.data_index != -1 {
                let value = self
                    .executor
                    .try_get_default_value(default.type_index.max(0) as usize, default.data_index);
                let _ = write!(out, " = {value}");
            }
        }
        out.push(';');

        if self.config.dump_field_offset && !is_literal {
            let offset = il2cpp.field_offset(
                type_index,
                field_in_type,
                global_index,
                type_def.is_value_type(),
                is_static,
            );
            if offset >= 0 {
                let _ = write!(out, " // {offset:#x}");
            }
        }
        out.push('\n');
        Ok(())
    }

    fn dump_property(
        &self,
        out: &mut String,
        type_def: &Il2CppTypeDefinition,
        property_in_type: usize,
    ) -> Result<()> {
        let metadata = self.executor.metadata;
        let il2cpp = self.executor.il2cpp;
        let index = type_def.property_start.max(0) as usize + property_in_type;
        let Some(property) = metadata.property_defs.get(index) else {
            return Ok(());
        };

        // The property's shape comes from its accessors.
        let type_name = if property.get >= 0 {
            metadata
                .method_defs
                .get(type_def.method_start as usize + property.get as usize)
                .and_then(|getter| il2cpp.types.get(getter.return_type.max(0) as usize))
                .map(|ty| self.executor.get_type_name(ty, false, false))
        } else if property.set >= 0 {
            metadata
                .method_defs
                .get(type_def.method_start as usize + property.set as usize)
                .and_then(|setter| {
                    metadata
                        .parameter_defs
                        .get(setter.parameter_start.max(0) as usize)
                })
                .and_then(|param| il2cpp.types.get(param.type_index.max(0) as usize))
                .map(|ty| self.executor.get_type_name(ty, false, false))
        } else {
            None
        };

        let mut accessors = Vec::new();
        if property.get >= 0 {
            accessors.push("get;");
        }
        if property.set >= 0 {
            accessors.push("set;");
        }
        let _ = writeln!(
            out,
            "\t{} {} {{ {} }}",
            type_name.unwrap_or_else(|| "object".to_string()),
            metadata.get_string(property.name_index)?,
            accessors.join(" ")
        );
        Ok(())
    }

    fn dump_method(
        &self,
        out: &mut String,
        type_def: &Il2CppTypeDefinition,
        image_name: &str,
        method_in_type: usize,
    ) -> Result<()> {
        let metadata = self.executor.metadata;
        let il2cpp = self.executor.il2cpp;
        let index = type_def.method_start.max(0) as usize + method_in_type;
        let Some(method_def) = metadata.method_defs.get(index) else {
            return Ok(());
        };

        if self.config.dump_method_offset {
            let pointer = il2cpp.method_pointer(image_name, method_def);
            if pointer > 0 {
                let _ = writeln!(
                    out,
                    "\t// RVA: 0x{:X} VA: 0x{pointer:X}",
                    il2cpp.rva(pointer)
                );
            } else {
                out.push_str("\t// RVA: -1 VA: -1\n");
            }
        }

        out.push('\t');
        out.push_str(method_modifiers(method_def.flags));
        let return_type = il2cpp
            .types
            .get(method_def.return_type.max(0) as usize)
            .map(|ty| self.executor.get_type_name(ty, false, false))
            .unwrap_or_else(|| "void".to_string());
        let _ = write!(
            out,
            "{return_type} {}(",
            metadata.get_string(method_def.name_index)?
        );

        let mut parameters = Vec::new();
        for i in 0..method_def.parameter_count as usize {
            let Some(param) = metadata
                .parameter_defs
                .get(method_def.parameter_start.max(0) as usize + i)
            else {
                continue;
            };
            let param_type = il2cpp
                .types
                .get(param.type_index.max(0) as usize)
                .map(|ty| self.executor.get_type_name(ty, false, false))
                .unwrap_or_else(|| "object".to_string());
            let mut rendered = format!("{param_type} {}", metadata.get_string(param.name_index)?);
            let param_index = method_def.parameter_start + i as i32;
            if let Some(default) = metadata.parameter_default_value(param_index) {
                if default.data_index != -1 {
                    let value = self.executor.try_get_default_value(
                        default.type_index.max(0) as usize,
                        default.data_index,
                    );
                    let _ = write!(rendered, " = {value}");
                }
            }
            parameters.push(rendered);
        }
        let _ = writeln!(out, "{}) {{ }}", parameters.join(", "));

        // Known generic instantiations of this method.
        if let Some(spec_indices) = il2cpp.method_specs_by_definition.get(&(index as i32)) {
            out.push_str("\t/* GenericInstMethod :\n");
            for &spec_index in spec_indices {
                let spec = &il2cpp.method_specs[spec_index];
                let (spec_type, spec_method) = self.executor.get_method_spec_name(spec, false);
                let pointer = il2cpp.method_spec_pointers.get(&spec_index).copied();
                match pointer {
                    Some(pointer) if pointer > 0 => {
                        let _ = writeln!(
                            out,
                            "\t|-RVA: 0x{:X} VA: 0x{pointer:X} |-{spec_type}.{spec_method}",
                            il2cpp.rva(pointer)
                        );
                    }
                    _ => {
                        let _ = writeln!(out, "\t|-RVA: -1 VA: -1 |-{spec_type}.{spec_method}");
                    }
                }
            }
            out.push_str("\t*/\n");
        }
        Ok(())
    }
}

fn method_modifiers(flags: u16) -> &'static str {
    let access = flags & method_attributes::MEMBER_ACCESS_MASK;
    let is_static = flags & method_attributes::STATIC != 0;
    let is_abstract = flags & method_attributes::ABSTRACT != 0;
    let is_virtual = flags & method_attributes::VIRTUAL != 0;
    match (access, is_static, is_abstract, is_virtual) {
        (method_attributes::PUBLIC, true, _, _) => "public static ",
        (method_attributes::PUBLIC, _, true, _) => "public abstract ",
        (method_attributes::PUBLIC, _, _, true) => "public virtual ",
        (method_attributes::PUBLIC, ..) => "public ",
        (method_attributes::PRIVATE, true, _, _) => "private static ",
        (method_attributes::PRIVATE, ..) => "private ",
        (method_attributes::FAMILY, _, true, _) => "protected abstract ",
        (method_attributes::FAMILY, ..) => "protected ",
        (_, true, _, _) => "internal static ",
        _ => "internal ",
    }
}

/// `script.json` consumed by the IDA/Ghidra annotation scripts.
#[derive(Debug, Default, Serialize)]
pub struct ScriptJson {
    #[serde(rename = "ScriptMethod")]
    pub methods: Vec<ScriptMethod>,
    #[serde(rename = "ScriptString")]
    pub strings: Vec<ScriptString>,
    #[serde(rename = "ScriptMetadata")]
    pub metadata: Vec<ScriptMetadata>,
    #[serde(rename = "ScriptMetadataMethod")]
    pub metadata_methods: Vec<ScriptMetadataMethod>,
    #[serde(rename = "Addresses")]
    pub addresses: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub struct ScriptMethod {
    #[serde(rename = "Address")]
    pub address: u64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Signature")]
    pub signature: String,
    #[serde(rename = "TypeSignature")]
    pub type_signature: String,
}

#[derive(Debug, Serialize)]
pub struct ScriptString {
    #[serde(rename = "Address")]
    pub address: u64,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct ScriptMetadata {
    #[serde(rename = "Address")]
    pub address: u64,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ScriptMetadataMethod {
    #[serde(rename = "Address")]
    pub address: u64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MethodAddress")]
    pub method_address: u64,
}

impl ScriptJson {
    pub fn from_executor(executor: &Il2CppExecutor<'_>) -> Result<Self> {
        let metadata = executor.metadata;
        let il2cpp = executor.il2cpp;
        let mut script = ScriptJson::default();

        for image in &metadata.image_defs {
            let image_name = metadata.get_string(image.name_index)?;
            let type_end = image.type_start as usize + image.type_count as usize;
            for type_index in image.type_start.max(0) as usize..type_end {
                let Some(type_def) = metadata.type_defs.get(type_index) else {
                    break;
                };
                let type_name = executor.get_type_def_name(type_def, true, true);
                for i in 0..type_def.method_count as usize {
                    let index = type_def.method_start.max(0) as usize + i;
                    let Some(method_def) = metadata.method_defs.get(index) else {
                        continue;
                    };
                    let pointer = il2cpp.method_pointer(&image_name, method_def);
                    if pointer == 0 {
                        continue;
                    }
                    let method_name = metadata.get_string(method_def.name_index)?;
                    script.addresses.push(il2cpp.rva(pointer));
                    script.methods.push(ScriptMethod {
                        address: il2cpp.rva(pointer),
                        name: format!("{type_name}$${method_name}"),
                        signature: format!("{type_name}.{method_name}"),
                        type_signature: type_name.clone(),
                    });
                }
            }
        }

        // Generic instantiations with known code pointers.
        for (spec_index, spec) in il2cpp.method_specs.iter().enumerate() {
            let Some(&pointer) = il2cpp.method_spec_pointers.get(&spec_index) else {
                continue;
            };
            if pointer == 0 {
                continue;
            }
            let (type_name, method_name) = executor.get_method_spec_name(spec, true);
            script.addresses.push(il2cpp.rva(pointer));
            script.methods.push(ScriptMethod {
                address: il2cpp.rva(pointer),
                name: format!("{type_name}$${method_name}"),
                signature: format!("{type_name}.{method_name}"),
                type_signature: type_name,
            });
        }

        // String-literal metadata-usage slots (v19 through v26).
        if let Some(literals) = metadata.metadata_usages.get(&MetadataUsage::StringLiteral) {
            for (&destination, &literal_index) in literals {
                let Some(&slot) = il2cpp.metadata_usages.get(destination as usize) else {
                    continue;
                };
                if let Some(value) = metadata.get_string_literal(literal_index as usize) {
                    script.strings.push(ScriptString {
                        address: il2cpp.rva(slot),
                        value,
                    });
                }
            }
        }
        if let Some(type_infos) = metadata.metadata_usages.get(&MetadataUsage::TypeInfo) {
            for (&destination, &type_index) in type_infos {
                let (Some(&slot), Some(type_def)) = (
                    il2cpp.metadata_usages.get(destination as usize),
                    metadata.type_defs.get(type_index as usize),
                ) else {
                    continue;
                };
                script.metadata.push(ScriptMetadata {
                    address: il2cpp.rva(slot),
                    name: executor.get_type_def_name(type_def, true, true),
                });
            }
        }
        if let Some(methods) = metadata.metadata_usages.get(&MetadataUsage::MethodDef) {
            for (&destination, &method_index) in methods {
                let (Some(&slot), Some(method_def)) = (
                    il2cpp.metadata_usages.get(destination as usize),
                    metadata.method_defs.get(method_index as usize),
                ) else {
                    continue;
                };
                let Some(type_def) =
                    metadata.type_defs.get(method_def.declaring_type as usize)
                else {
                    continue;
                };
                let image_name = metadata
                    .image_defs
                    .iter()
                    .find(|image| {
                        let start = image.type_start.max(0) as usize;
                        (start..start + image.type_count as usize)
                            .contains(&(method_def.declaring_type as usize))
                    })
                    .and_then(|image| metadata.get_string(image.name_index).ok())
                    .unwrap_or_default();
                script.metadata_methods.push(ScriptMetadataMethod {
                    address: il2cpp.rva(slot),
                    name: format!(
                        "{}${}",
                        executor.get_type_def_name(type_def, true, true),
                        metadata.get_string(method_def.name_index)?
                    ),
                    method_address: il2cpp.rva(il2cpp.method_pointer(&image_name, method_def)),
                });
            }
        }

        Ok(script)
    }

    pub fn write_to_file(&self, output_dir: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| Error::parse(e.to_string()))?;
        std::fs::write(output_dir.join("script.json"), content)?;
        Ok(())
    }
}

/// `il2cpp.h`: C struct layouts derived from the field-offset tables.
pub struct HeaderGenerator<'a> {
    executor: &'a Il2CppExecutor<'a>,
}

impl<'a> HeaderGenerator<'a> {
    pub fn new(executor: &'a Il2CppExecutor<'a>) -> Self {
        Self { executor }
    }

    pub fn write_to_file(&self, output_dir: &Path) -> Result<()> {
        std::fs::write(output_dir.join("il2cpp.h"), self.generate()?)?;
        Ok(())
    }

    pub fn generate(&self) -> Result<String> {
        let metadata = self.executor.metadata;
        let mut out = String::new();
        out.push_str("#ifndef IL2CPP_H\n#define IL2CPP_H\n\n#include <stdint.h>\n\n");
        out.push_str(
            "typedef struct Il2CppObject {\n\tvoid *klass;\n\tvoid *monitor;\n} Il2CppObject;\n\n",
        );
        out.push_str(
            "typedef struct Il2CppString {\n\tIl2CppObject object;\n\tint32_t length;\n\tuint16_t chars[1];\n} Il2CppString;\n\n",
        );
        out.push_str(
            "typedef struct Il2CppArray {\n\tIl2CppObject object;\n\tvoid *bounds;\n\tuintptr_t max_length;\n} Il2CppArray;\n\n",
        );

        for (type_index, type_def) in metadata.type_defs.iter().enumerate() {
            if type_def.is_enum() {
                self.generate_enum(&mut out, type_def)?;
            } else {
                self.generate_struct(&mut out, type_def, type_index)?;
            }
        }
        out.push_str("#endif\n");
        Ok(out)
    }

    fn safe_name(&self, type_def: &Il2CppTypeDefinition) -> String {
        let full = self.executor.get_type_def_name(type_def, true, false);
        full.chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect()
    }

    fn generate_struct(
        &self,
        out: &mut String,
        type_def: &Il2CppTypeDefinition,
        type_index: usize,
    ) -> Result<()> {
        let metadata = self.executor.metadata;
        let il2cpp = self.executor.il2cpp;
        let name = self.safe_name(type_def);
        let _ = writeln!(out, "typedef struct {name}_o {{");
        if !type_def.is_value_type() {
            out.push_str("\tIl2CppObject object;\n");
        }
        for i in 0..type_def.field_count as usize {
            let global_index = type_def.field_start.max(0) as usize + i;
            let Some(field) = metadata.field_defs.get(global_index) else {
                continue;
            };
            let Some(field_type) = il2cpp.types.get(field.type_index.max(0) as usize) else {
                continue;
            };
            if field_type.attrs & field_attributes::STATIC != 0 {
                continue;
            }
            let offset = il2cpp.field_offset(
                type_index,
                i,
                global_index,
                type_def.is_value_type(),
                false,
            );
            let _ = writeln!(
                out,
                "\t{} {}; // {offset:#x}",
                c_type_name(&self.executor.get_type_name(field_type, false, false)),
                metadata.get_string(field.name_index)?
            );
        }
        let _ = writeln!(out, "}} {name}_o;\n");
        Ok(())
    }

    fn generate_enum(&self, out: &mut String, type_def: &Il2CppTypeDefinition) -> Result<()> {
        let metadata = self.executor.metadata;
        let il2cpp = self.executor.il2cpp;
        let name = self.safe_name(type_def);
        let _ = writeln!(out, "typedef enum {name} {{");
        for i in 0..type_def.field_count as usize {
            let global_index = type_def.field_start.max(0) as usize + i;
            let Some(field) = metadata.field_defs.get(global_index) else {
                continue;
            };
            let Some(field_type) = il2cpp.types.get(field.type_index.max(0) as usize) else {
                continue;
            };
            if field_type.attrs & field_attributes::LITERAL == 0 {
                continue;
            }
            let field_name = metadata.get_string(field.name_index)?;
            match metadata.field_default_value(global_index as i32) {
                Some(default) if default.data_index != -1 => {
                    let value = self.executor.try_get_default_value(
                        default.type_index.max(0) as usize,
                        default.data_index,
                    );
                    let _ = writeln!(out, "\t{name}_{field_name} = {value},");
                }
                _ => {
                    let _ = writeln!(out, "\t{name}_{field_name},");
                }
            }
        }
        let _ = writeln!(out, "}} {name};\n");
        Ok(())
    }
}

fn c_type_name(managed: &str) -> &str {
    match managed {
        "void" => "void",
        "bool" => "uint8_t",
        "byte" => "uint8_t",
        "sbyte" => "int8_t",
        "short" => "int16_t",
        "ushort" => "uint16_t",
        "int" => "int32_t",
        "uint" => "uint32_t",
        "long" => "int64_t",
        "ulong" => "uint64_t",
        "char" => "uint16_t",
        "float" => "float",
        "double" => "double",
        "IntPtr" => "intptr_t",
        "UIntPtr" => "uintptr_t",
        "string" => "Il2CppString *",
        _ => "void *",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::Il2Cpp;
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
    fn dump_lists_one_declaration_per_type() {
        let (metadata, il2cpp) = fixture();
        let executor = Il2CppExecutor::new(&metadata, &il2cpp);
        let config = Config::default();
        let dump = Decompiler::new(&executor, &config).decompile().unwrap();
        assert!(dump.starts_with("// Image 0: mscorlib.dll - 0"));
        // one TypeDefIndex marker per type definition
        assert_eq!(
            dump.matches("// TypeDefIndex: ").count(),
            metadata.type_defs.len()
        );
        assert!(dump.contains("class Foo"));
        assert!(dump.contains("void Bar(int x)"));
        assert!(dump.contains("|-RVA: 0x1234 VA: 0x1234 |-Foo.Bar<String, List<Int32>>"));
    }

    #[test]
    fn script_json_serializes_with_pascal_case_keys() {
        let (metadata, il2cpp) = fixture();
        let executor = Il2CppExecutor::new(&metadata, &il2cpp);
        let script = ScriptJson::from_executor(&executor).unwrap();
        assert!(!script.methods.is_empty());
        let json = serde_json::to_string(&script).unwrap();
        assert!(json.contains("\"ScriptMethod\""));
        assert!(json.contains("\"Address\""));
        assert!(json.contains("Foo$$Bar"));
    }

    #[test]
    fn header_renders_object_layout() {
        let (metadata, il2cpp) = fixture();
        let executor = Il2CppExecutor::new(&metadata, &il2cpp);
        let header = HeaderGenerator::new(&executor).generate().unwrap();
        assert!(header.contains("typedef struct Il2CppObject"));
        assert!(header.contains("typedef struct Foo_o"));
    }

    #[test]
    fn config_gates_sections() {
        let (metadata, il2cpp) = fixture();
        let executor = Il2CppExecutor::new(&metadata, &il2cpp);
        let config = Config {
            dump_method: false,
            dump_type_def_index: false,
            ..Config::default()
        };
        let dump = Decompiler::new(&executor, &config).decompile().unwrap();
        assert!(!dump.contains("// Methods"));
        assert!(!dump.contains("TypeDefIndex"));
    }
}

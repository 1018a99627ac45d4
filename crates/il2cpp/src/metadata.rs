//! `global-metadata.dat` loader
//!
//! Validates the magic and version, reads the header through the
//! versioned schema, probes the fractional subversions the header does
//! not announce, and then decodes every table with counts derived from
//! `region_size / size_of(Element, version)`.

use std::collections::HashMap;

use metadump_binary_parser::{cached_size_of, BinaryStream, StructRead};
use metadump_core::{v, Error, Result, Version, MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION};
use tracing::{debug, info};

use crate::structs::*;

pub const METADATA_MAGIC: u32 = 0xFAB1_1BAF;

/// Parsed metadata universe. All tables are immutable after
/// construction.
pub struct Metadata {
    data: Vec<u8>,
    pub version: Version,
    pub header: Il2CppGlobalMetadataHeader,
    /// Handle-translation base for v27+ memory dumps; assigned by the
    /// dumper once the binary types are loaded.
    pub image_base: u64,

    pub image_defs: Vec<Il2CppImageDefinition>,
    pub assembly_defs: Vec<Il2CppAssemblyDefinition>,
    pub type_defs: Vec<Il2CppTypeDefinition>,
    pub method_defs: Vec<Il2CppMethodDefinition>,
    pub parameter_defs: Vec<Il2CppParameterDefinition>,
    pub field_defs: Vec<Il2CppFieldDefinition>,
    pub property_defs: Vec<Il2CppPropertyDefinition>,
    pub event_defs: Vec<Il2CppEventDefinition>,
    pub generic_containers: Vec<Il2CppGenericContainer>,
    pub generic_parameters: Vec<Il2CppGenericParameter>,
    pub constraint_indices: Vec<i32>,
    pub interface_indices: Vec<i32>,
    pub nested_type_indices: Vec<i32>,
    pub vtable_methods: Vec<u32>,
    pub string_literals: Vec<Il2CppStringLiteral>,
    pub field_refs: Vec<Il2CppFieldRef>,
    pub attribute_type_ranges: Vec<Il2CppCustomAttributeTypeRange>,
    pub attribute_types: Vec<i32>,
    pub attribute_data_ranges: Vec<Il2CppCustomAttributeDataRange>,
    pub rgctx_entries: Vec<Il2CppRGCTXDefinition>,

    field_default_values: HashMap<i32, Il2CppFieldDefaultValue>,
    parameter_default_values: HashMap<i32, Il2CppParameterDefaultValue>,
    /// Token to attribute-range index, per image (v24.1+).
    attribute_ranges_by_token: Vec<HashMap<u32, usize>>,
    pub metadata_usages: HashMap<MetadataUsage, HashMap<u32, u32>>,
    pub metadata_usages_count: u64,
}

fn read_table<T: StructRead + 'static>(
    data: &[u8],
    version: Version,
    offset: u32,
    size: i32,
) -> Result<Vec<T>> {
    if offset == 0 || size <= 0 {
        return Ok(Vec::new());
    }
    let element_size = cached_size_of::<T>(version, false);
    if element_size == 0 {
        return Ok(Vec::new());
    }
    let count = size as usize / element_size;
    let mut r = BinaryStream::new(data, version, false);
    r.set_position(offset as usize);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(T::read(&mut r).map_err(Error::from)?);
    }
    Ok(out)
}

fn read_header(data: &[u8], version: Version) -> Result<Il2CppGlobalMetadataHeader> {
    let mut r = BinaryStream::new(data, version, false);
    Il2CppGlobalMetadataHeader::read(&mut r).map_err(Error::from)
}

impl Metadata {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = BinaryStream::new(data, Version::MIN, false);
        let sanity = r.read_u32().map_err(Error::from)?;
        if sanity != METADATA_MAGIC {
            return Err(Error::InvalidMagic {
                expected: METADATA_MAGIC,
                actual: sanity,
            });
        }
        let raw_version = r.read_i32().map_err(Error::from)?;
        if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&raw_version) {
            return Err(Error::UnsupportedVersion(raw_version));
        }

        let mut version = v(raw_version as u16, 0);
        let mut header = read_header(data, version)?;

        // v24 subversions are not announced by the header; probe them.
        if version == v(24, 0) {
            if header.string_literal_offset == 264 {
                // Only the 24.2 header is exactly 264 bytes long.
                version = v(24, 2);
                header = read_header(data, version)?;
            } else {
                let images: Vec<Il2CppImageDefinition> =
                    read_table(data, version, header.images_offset, header.images_size)?;
                if images.iter().any(|image| image.token != 1) {
                    version = v(24, 1);
                    header = read_header(data, version)?;
                }
            }
            if version != v(24, 0) {
                debug!("metadata subversion detected: {version}");
            }
        }

        let image_defs: Vec<Il2CppImageDefinition> =
            read_table(data, version, header.images_offset, header.images_size)?;

        // A 24.2 file whose assembly entries come out short is 24.4.
        if version == v(24, 2)
            && (header.assemblies_size.max(0) as usize / 68) < image_defs.len()
        {
            version = v(24, 4);
            debug!("metadata subversion detected: {version}");
        }

        info!("metadata version {version}");

        let assembly_defs =
            read_table(data, version, header.assemblies_offset, header.assemblies_size)?;
        let type_defs = read_table(
            data,
            version,
            header.type_definitions_offset,
            header.type_definitions_size,
        )?;
        let method_defs =
            read_table(data, version, header.methods_offset, header.methods_size)?;
        let parameter_defs =
            read_table(data, version, header.parameters_offset, header.parameters_size)?;
        let field_defs = read_table(data, version, header.fields_offset, header.fields_size)?;
        let property_defs =
            read_table(data, version, header.properties_offset, header.properties_size)?;
        let event_defs = read_table(data, version, header.events_offset, header.events_size)?;
        let generic_containers = read_table(
            data,
            version,
            header.generic_containers_offset,
            header.generic_containers_size,
        )?;
        let generic_parameters = read_table(
            data,
            version,
            header.generic_parameters_offset,
            header.generic_parameters_size,
        )?;
        let string_literals = read_table(
            data,
            version,
            header.string_literal_offset,
            header.string_literal_size,
        )?;

        let read_i32_region = |offset: u32, size: i32| -> Result<Vec<i32>> {
            if offset == 0 || size <= 0 {
                return Ok(Vec::new());
            }
            let mut r = BinaryStream::new(data, version, false);
            r.set_position(offset as usize);
            r.read_i32_array(size as usize / 4).map_err(Error::from)
        };
        let constraint_indices = read_i32_region(
            header.generic_parameter_constraints_offset,
            header.generic_parameter_constraints_size,
        )?;
        let interface_indices =
            read_i32_region(header.interfaces_offset, header.interfaces_size)?;
        let nested_type_indices =
            read_i32_region(header.nested_types_offset, header.nested_types_size)?;
        let vtable_methods = {
            if header.vtable_methods_offset == 0 || header.vtable_methods_size <= 0 {
                Vec::new()
            } else {
                let mut r = BinaryStream::new(data, version, false);
                r.set_position(header.vtable_methods_offset as usize);
                r.read_u32_array(header.vtable_methods_size as usize / 4)
                    .map_err(Error::from)?
            }
        };

        let field_default_value_list: Vec<Il2CppFieldDefaultValue> = read_table(
            data,
            version,
            header.field_default_values_offset,
            header.field_default_values_size,
        )?;
        let field_default_values = field_default_value_list
            .into_iter()
            .map(|value| (value.field_index, value))
            .collect();
        let parameter_default_value_list: Vec<Il2CppParameterDefaultValue> = read_table(
            data,
            version,
            header.parameter_default_values_offset,
            header.parameter_default_values_size,
        )?;
        let parameter_default_values = parameter_default_value_list
            .into_iter()
            .map(|value| (value.parameter_index, value))
            .collect();

        let field_refs = if version > v(16, 0) {
            read_table(data, version, header.field_refs_offset, header.field_refs_size)?
        } else {
            Vec::new()
        };

        // Metadata usage exists between v17 and v26; the count field of
        // the lists is an element count, not a byte size.
        let mut metadata_usages: HashMap<MetadataUsage, HashMap<u32, u32>> = HashMap::new();
        if version > v(16, 0) && version < v(27, 0) {
            let usage_lists: Vec<Il2CppMetadataUsageList> = read_table(
                data,
                version,
                header.metadata_usage_lists_offset,
                header.metadata_usage_lists_count,
            )?;
            let usage_pairs: Vec<Il2CppMetadataUsagePair> = read_table(
                data,
                version,
                header.metadata_usage_pairs_offset,
                header.metadata_usage_pairs_count,
            )?;
            for list in &usage_lists {
                for i in 0..list.count {
                    let Some(pair) = usage_pairs.get((list.start + i) as usize) else {
                        continue;
                    };
                    let kind = pair.encoded_source_index >> 29 & 0x7;
                    let decoded = decode_usage_index(pair.encoded_source_index, version);
                    if let Some(usage) = MetadataUsage::from_kind(kind) {
                        metadata_usages
                            .entry(usage)
                            .or_default()
                            .insert(pair.destination_index, decoded);
                    }
                }
            }
        }
        let metadata_usages_count = metadata_usages
            .values()
            .flat_map(|bucket| bucket.keys())
            .max()
            .map_or(0, |&max| max as u64 + 1);

        let (attribute_type_ranges, attribute_types): (
            Vec<Il2CppCustomAttributeTypeRange>,
            Vec<i32>,
        ) = if version > v(20, 0) && version < v(29, 0) {
                (
                    read_table(
                        data,
                        version,
                        header.attributes_info_offset,
                        header.attributes_info_count,
                    )?,
                    read_i32_region(header.attribute_types_offset, header.attribute_types_count)?,
                )
            } else {
                (Vec::new(), Vec::new())
            };
        let attribute_data_ranges: Vec<Il2CppCustomAttributeDataRange> = if version >= v(29, 0) {
            read_table(
                data,
                version,
                header.attribute_data_range_offset,
                header.attribute_data_range_size,
            )?
        } else {
            Vec::new()
        };

        // Token-keyed attribute lookup per image, v24.1+.
        let mut attribute_ranges_by_token = Vec::new();
        if version > v(24, 0) {
            for image in &image_defs {
                let mut by_token = HashMap::new();
                let start = image.custom_attribute_start.max(0) as usize;
                let end = start + image.custom_attribute_count as usize;
                for index in start..end {
                    let token = if version >= v(29, 0) {
                        attribute_data_ranges.get(index).map(|range| range.token)
                    } else {
                        attribute_type_ranges.get(index).map(|range| range.token)
                    };
                    if let Some(token) = token {
                        by_token.insert(token, index);
                    }
                }
                attribute_ranges_by_token.push(by_token);
            }
        }

        let rgctx_entries = if version <= v(24, 1) {
            read_table(
                data,
                version,
                header.rgctx_entries_offset,
                header.rgctx_entries_count,
            )?
        } else {
            Vec::new()
        };

        info!(
            "parsed {} types, {} methods, {} images",
            type_defs.len(),
            method_defs.len(),
            image_defs.len()
        );

        Ok(Self {
            data: data.to_vec(),
            version,
            header,
            image_base: 0,
            image_defs,
            assembly_defs,
            type_defs,
            method_defs,
            parameter_defs,
            field_defs,
            property_defs,
            event_defs,
            generic_containers,
            generic_parameters,
            constraint_indices,
            interface_indices,
            nested_type_indices,
            vtable_methods,
            string_literals,
            field_refs,
            attribute_type_ranges,
            attribute_types,
            attribute_data_ranges,
            rgctx_entries,
            field_default_values,
            parameter_default_values,
            attribute_ranges_by_token,
            metadata_usages,
            metadata_usages_count,
        })
    }

    pub fn stream(&self) -> BinaryStream<'_> {
        BinaryStream::new(&self.data, self.version, false)
    }

    /// String-pool lookup.
    pub fn get_string(&self, index: i32) -> Result<String> {
        if index < 0 {
            return Err(Error::not_found(format!("string index {index}")));
        }
        let mut r = self.stream();
        r.set_position(self.header.string_offset as usize + index as usize);
        r.read_string_to_null().map_err(Error::from)
    }

    /// UTF-8 string literal from the literal data blob.
    pub fn get_string_literal(&self, index: usize) -> Option<String> {
        let literal = self.string_literals.get(index)?;
        let mut r = self.stream();
        r.set_position(
            self.header.string_literal_data_offset as usize + literal.data_index as usize,
        );
        r.read_string(literal.length as usize).ok()
    }

    pub fn field_default_value(&self, field_index: i32) -> Option<&Il2CppFieldDefaultValue> {
        self.field_default_values.get(&field_index)
    }

    pub fn parameter_default_value(
        &self,
        parameter_index: i32,
    ) -> Option<&Il2CppParameterDefaultValue> {
        self.parameter_default_values.get(&parameter_index)
    }

    /// File offset of a default-value payload.
    pub fn default_value_data_offset(&self, data_index: i32) -> usize {
        self.header.field_and_parameter_default_value_data_offset as usize + data_index as usize
    }

    /// Attribute-range index for a member token; before v24.1 the
    /// member's own attribute index is authoritative.
    pub fn custom_attribute_index(
        &self,
        image_index: usize,
        custom_attribute_index: i32,
        token: u32,
    ) -> i32 {
        if self.version > v(24, 0) {
            self.attribute_ranges_by_token
                .get(image_index)
                .and_then(|by_token| by_token.get(&token))
                .map_or(-1, |&index| index as i32)
        } else {
            custom_attribute_index
        }
    }
}

fn decode_usage_index(encoded: u32, version: Version) -> u32 {
    if version >= v(27, 0) {
        // The low bit became an inflation flag in v27.
        (encoded & 0x1FFF_FFFE) >> 1
    } else {
        encoded & 0x1FFF_FFFF
    }
}

//! Dump orchestration
//!
//! Wires the pieces together in dependency order: metadata header and
//! subversion probe, metadata tables, format-parser setup, the
//! registration scan (anchor scan, then the ELF ARM pattern scan, then
//! symbols, then caller-supplied addresses), binary tables, and
//! finally resolver readiness.

use std::path::Path;

use metadump_binary_parser::BinaryFormat;
use metadump_core::{v, Config, Error, Result};
use tracing::{info, warn};

use crate::binary::Il2Cpp;
use crate::executor::Il2CppExecutor;
use crate::metadata::Metadata;
use crate::output::{Decompiler, HeaderGenerator, ScriptJson};
use crate::search::SectionHelper;

/// Inputs the automatic strategies cannot derive on their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualInputs {
    /// Caller-supplied `(CodeRegistration, MetadataRegistration)` VAs,
    /// used when every locator strategy fails.
    pub registration: Option<(u64, u64)>,
    /// Image base of a memory dump.
    pub dump_image_base: Option<u64>,
}

pub struct Il2CppDumper {
    pub metadata: Metadata,
    pub il2cpp: Il2Cpp,
}

impl Il2CppDumper {
    pub fn from_files(
        binary_path: &Path,
        metadata_path: &Path,
        config: &Config,
        manual: ManualInputs,
    ) -> Result<Self> {
        info!("loading binary from {binary_path:?}");
        let binary = metadump_binary_parser::load_binary(binary_path).map_err(Error::from)?;
        info!("loading metadata from {metadata_path:?}");
        let metadata_bytes = std::fs::read(metadata_path)?;
        Self::assemble(binary, &metadata_bytes, config, manual)
    }

    pub fn from_bytes(
        binary_data: &[u8],
        metadata_data: &[u8],
        config: &Config,
        manual: ManualInputs,
    ) -> Result<Self> {
        let binary = metadump_binary_parser::parse_binary(binary_data).map_err(Error::from)?;
        Self::assemble(binary, metadata_data, config, manual)
    }

    fn assemble(
        binary: Box<dyn metadump_binary_parser::Il2CppBinary>,
        metadata_bytes: &[u8],
        config: &Config,
        manual: ManualInputs,
    ) -> Result<Self> {
        let mut metadata = Metadata::parse(metadata_bytes)?;

        let version = if config.force_il2cpp_version {
            config.force_version
        } else {
            metadata.version
        };
        let mut il2cpp = Il2Cpp::new(binary, version, metadata.metadata_usages_count);
        il2cpp.set_field_offsets_override(config.field_offsets_are_pointers);
        info!("il2cpp version {}", il2cpp.version);

        if config.force_dump || il2cpp.binary.check_dump() {
            match manual.dump_image_base {
                Some(base) if base != 0 => {
                    info!("treating input as a memory dump at base {base:#x}");
                    il2cpp.binary.set_image_base(base);
                    il2cpp.binary.set_dumped(true);
                    if !config.no_redirected_pointer {
                        il2cpp.binary.reload().map_err(Error::from)?;
                    }
                }
                _ if il2cpp.binary.format() != BinaryFormat::Elf => {
                    il2cpp.binary.set_dumped(true);
                }
                _ => {
                    warn!("input looks like a dump; pass the capture base to rebase it");
                }
            }
        }

        Self::locate_registrations(&metadata, &mut il2cpp, manual)?;

        // v27+ dumps carry runtime handles in the type records; derive
        // the translation base from the first type definition.
        if il2cpp.version >= v(27, 0) && il2cpp.binary.is_dumped() {
            if let Some(first) = metadata.type_defs.first() {
                if let Some(ty) = il2cpp.types.get(first.byval_type_index.max(0) as usize) {
                    metadata.image_base = ty
                        .datapoint
                        .wrapping_sub(metadata.header.type_definitions_offset as u64);
                }
            }
        }

        Ok(Self { metadata, il2cpp })
    }

    fn locate_registrations(
        metadata: &Metadata,
        il2cpp: &mut Il2Cpp,
        manual: ManualInputs,
    ) -> Result<()> {
        info!("searching for registration structures");
        let method_count = metadata
            .method_defs
            .iter()
            .filter(|method| method.method_index >= 0)
            .count();

        let (code_registration, metadata_registration) = {
            let mut helper = SectionHelper::new(
                il2cpp.binary.as_ref(),
                il2cpp.version,
                method_count,
                metadata.type_defs.len(),
                metadata.metadata_usages_count as usize,
                metadata.image_defs.len(),
            );
            let code = helper.find_code_registration();
            let meta = helper.find_metadata_registration();
            (code, meta)
        };
        if il2cpp.auto_init(code_registration, metadata_registration)? {
            return Ok(());
        }

        if let Some((code, meta)) = il2cpp.binary.pattern_registration_scan(il2cpp.version) {
            info!("registration found by instruction-pattern scan");
            il2cpp.init(code, meta)?;
            return Ok(());
        }

        let prefix = if il2cpp.binary.format() == BinaryFormat::MachO {
            "_"
        } else {
            ""
        };
        let code = il2cpp.binary.find_symbol(&format!("{prefix}g_CodeRegistration"));
        let meta = il2cpp
            .binary
            .find_symbol(&format!("{prefix}g_MetadataRegistration"));
        if let (Some(code), Some(meta)) = (code, meta) {
            info!("registration found by symbol lookup");
            il2cpp.init(code, meta)?;
            return Ok(());
        }

        if let Some((code, meta)) = manual.registration {
            info!("using caller-supplied registration addresses");
            il2cpp.init(code, meta)?;
            return Ok(());
        }

        Err(Error::RegistrationNotFound)
    }

    /// Write every configured artifact into `output_dir`.
    pub fn dump(&self, config: &Config, output_dir: &Path) -> Result<()> {
        let executor = Il2CppExecutor::new(&self.metadata, &self.il2cpp);

        info!("writing dump.cs");
        Decompiler::new(&executor, config).write_to_file(output_dir)?;

        if config.generate_script {
            info!("writing script.json");
            ScriptJson::from_executor(&executor)?.write_to_file(output_dir)?;
        }
        if config.generate_struct {
            info!("writing il2cpp.h");
            HeaderGenerator::new(&executor).write_to_file(output_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{build_binary_fixture, MetadataBuilder};

    #[test]
    fn manual_addresses_rescue_a_failed_scan() {
        let metadata = Metadata::parse(&MetadataBuilder::new().build()).unwrap();
        let (binary, addresses) = build_binary_fixture();
        let mut il2cpp = Il2Cpp::new(Box::new(binary), metadata.version, 0);

        // The metadata-side scan cannot verify a candidate here (the
        // fixture has no metadata usages), so auto mode fails and the
        // manual pair must be honored.
        let manual = ManualInputs {
            registration: Some((addresses.code_registration, addresses.metadata_registration)),
            dump_image_base: None,
        };
        Il2CppDumper::locate_registrations(&metadata, &mut il2cpp, manual).unwrap();
        assert_eq!(il2cpp.types.len(), 11);
    }

    #[test]
    fn missing_registration_is_surfaced_not_panicked() {
        let metadata = Metadata::parse(&MetadataBuilder::new().build()).unwrap();
        let (binary, _) = build_binary_fixture();
        let mut il2cpp = Il2Cpp::new(Box::new(binary), v(16, 0), 0);
        let result =
            Il2CppDumper::locate_registrations(&metadata, &mut il2cpp, ManualInputs::default());
        assert!(matches!(result, Err(Error::RegistrationNotFound)));
    }
}

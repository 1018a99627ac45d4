//! Dump configuration
//!
//! The on-disk format is the camelCase `config.json` used by the wider
//! IL2CPP dumper ecosystem; every field is optional.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::version::Version;

/// Options controlling what the sinks emit and how the loaders behave.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub dump_method: bool,
    pub dump_field: bool,
    pub dump_property: bool,
    pub dump_attribute: bool,
    pub dump_field_offset: bool,
    pub dump_method_offset: bool,
    pub dump_type_def_index: bool,

    pub generate_struct: bool,
    pub generate_script: bool,

    /// Override the version read from the metadata header.
    pub force_il2cpp_version: bool,
    pub force_version: Version,

    /// Treat the executable as a memory dump even if the heuristics disagree.
    pub force_dump: bool,
    /// Skip the address-map rebuild after setting a dump image base.
    pub no_redirected_pointer: bool,

    /// Override the v21 flat-vs-pointer field-offset heuristic.
    pub field_offsets_are_pointers: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dump_method: true,
            dump_field: true,
            dump_property: false,
            dump_attribute: false,
            dump_field_offset: true,
            dump_method_offset: true,
            dump_type_def_index: true,
            generate_struct: true,
            generate_script: true,
            force_il2cpp_version: false,
            force_version: Version::new(24, 3),
            force_dump: false,
            no_redirected_pointer: false,
            field_offsets_are_pointers: None,
        }
    }
}

impl Config {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| Error::config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data =
            serde_json::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_camel_case() {
        let json = r#"{"dumpMethod":false,"forceIl2cppVersion":true,"forceVersion":"24.5"}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(!config.dump_method);
        assert!(config.force_il2cpp_version);
        assert_eq!(config.force_version, Version::new(24, 5));
        // Unlisted keys keep their defaults.
        assert!(config.dump_field);

        let out = serde_json::to_string(&config).unwrap();
        assert!(out.contains("\"dumpField\":true"));
        assert!(out.contains("\"forceVersion\":\"24.5\""));
    }
}

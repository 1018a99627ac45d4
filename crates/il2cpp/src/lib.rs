//! IL2CPP metadata extraction
//!
//! Parses Unity IL2CPP `global-metadata.dat` files and the matching
//! native binaries, locates the registration structures, and resolves
//! managed type and method names for the output sinks.

pub mod binary;
pub mod dumper;
pub mod executor;
pub mod metadata;
pub mod output;
pub mod search;
pub mod structs;

#[cfg(test)]
mod testutil;

pub use binary::Il2Cpp;
pub use dumper::{Il2CppDumper, ManualInputs};
pub use executor::{DefaultValue, Il2CppExecutor};
pub use metadata::{Metadata, METADATA_MAGIC};
pub use search::SectionHelper;

//! Core types for the metadump IL2CPP toolchain
//!
//! This crate provides the foundational types used by every other
//! metadump crate: the error taxonomy, the IL2CPP version model and the
//! dump configuration.

pub mod config;
pub mod error;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use version::{v, Version, MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION};

//! IL2CPP metadata version handling
//!
//! IL2CPP format versions are written `24`, `24.2`, `27.1` and so on.
//! Field layouts change between fractional subversions, so the version
//! is an ordered `(major, minor)` pair rather than a float; this keeps
//! it usable as a cache key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Lowest metadata version this tool understands.
pub const MIN_SUPPORTED_VERSION: i32 = 16;
/// Highest metadata version this tool understands.
pub const MAX_SUPPORTED_VERSION: i32 = 31;

/// An IL2CPP format version such as `24`, `24.2` or `27.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    major: u16,
    minor: u16,
}

impl Version {
    /// Open lower bound for field applicability ranges.
    pub const MIN: Version = Version { major: 0, minor: 0 };
    /// Open upper bound for field applicability ranges.
    pub const MAX: Version = Version {
        major: u16::MAX,
        minor: u16::MAX,
    };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u16 {
        self.major
    }

    pub fn minor(&self) -> u16 {
        self.minor
    }

    /// True when `self` lies in the closed interval `[min, max]`.
    pub fn in_range(&self, min: Version, max: Version) -> bool {
        min <= *self && *self <= max
    }
}

/// Shorthand constructor used by the struct schema tables.
pub const fn v(major: u16, minor: u16) -> Version {
    Version::new(major, minor)
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{}", self.major)
        } else {
            write!(f, "{}.{}", self.major, self.minor)
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '.');
        let major = parts
            .next()
            .unwrap_or("")
            .parse::<u16>()
            .map_err(|_| Error::config(format!("invalid version: {s}")))?;
        let minor = match parts.next() {
            Some(m) => m
                .parse::<u16>()
                .map_err(|_| Error::config(format!("invalid version: {s}")))?,
            None => 0,
        };
        Ok(Version::new(major, minor))
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

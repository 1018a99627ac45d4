//! Error types for binary parsing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown binary format")]
    UnknownFormat,

    #[error("Invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Address out of range: {0:#x}")]
    AddressOutOfRange(u64),

    #[error("Truncated data: expected {expected} bytes, got {actual}")]
    TruncatedData { expected: usize, actual: usize },

    #[error("LZ4 decompression failed: {0}")]
    DecompressionFailed(String),
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

impl ParseError {
    pub fn invalid_header(msg: impl Into<String>) -> Self {
        Self::InvalidHeader(msg.into())
    }

    pub fn truncated(expected: usize, actual: usize) -> Self {
        Self::TruncatedData { expected, actual }
    }
}

impl From<ParseError> for metadump_core::Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Io(e) => metadump_core::Error::Io(e),
            ParseError::InvalidMagic { expected, actual } => {
                metadump_core::Error::InvalidMagic { expected, actual }
            }
            ParseError::AddressOutOfRange(addr) => metadump_core::Error::AddressOutOfRange(addr),
            other => metadump_core::Error::Parse(other.to_string()),
        }
    }
}

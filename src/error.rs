//! Error types, one enum per protocol layer.
//!
//! None of these are fatal: every stage reports its error through the log
//! and drops the offending unit.

use thiserror::Error;

/// A raw trace event lacks a field or carries one of the wrong shape.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event field missing: {0}")]
    MissingField(&'static str),
    #[error("event field {field} has unexpected value: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("fragment payload is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// SOAP chunking and envelope failures.
#[derive(Debug, Error)]
pub enum SoapError {
    #[error("out of order SOAP chunk: got index {got}, expected {expected}")]
    OutOfOrderChunk { got: u32, expected: u32 },
    #[error("malformed SOAP XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("SOAP envelope has no {0}")]
    MissingElement(&'static str),
    #[error("invalid base64 in {element}: {source}")]
    Base64 {
        element: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error(transparent)]
    Decompress(#[from] DecompressError),
}

/// Stream-object decompression failures.
#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("compressed block but no decompressor is configured")]
    Unavailable,
    #[error("compression block header truncated at offset {offset}")]
    TruncatedHeader { offset: usize },
    #[error("compression block at offset {offset} declares {declared} bytes, {available} available")]
    TruncatedBlock {
        offset: usize,
        declared: usize,
        available: usize,
    },
    #[error("decompressor failed: {0}")]
    Failed(String),
    #[error("decompressed {actual} bytes, block declared {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// PSRP fragment framing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment header truncated at offset {offset}: {available} bytes available")]
    TruncatedHeader { offset: usize, available: usize },
    #[error("fragment at offset {offset} declares {declared} payload bytes, {available} available")]
    TruncatedPayload {
        offset: usize,
        declared: usize,
        available: usize,
    },
}

/// PSRP message header failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is {len} bytes, shorter than the {header}-byte header")]
    Truncated { len: usize, header: usize },
    #[error("message payload is not UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
}

/// CLIXML document failures.
#[derive(Debug, Error)]
pub enum ClixmlError {
    #[error("empty serialized document")]
    Empty,
    #[error("malformed serialized document: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("serialized document has no {0}")]
    MissingElement(&'static str),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
}

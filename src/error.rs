//! Caller-facing parse and validation errors.
//!
//! Storage and I/O paths return `anyhow::Result`; this enum covers the values a
//! caller hands us as strings (tool parameters, CLI flags).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl Error {
    pub(crate) fn unknown(kind: &'static str, value: &str) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.to_string(),
        }
    }
}

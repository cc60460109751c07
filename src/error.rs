// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    serde::{DeserializeError, SerializeError},
    Checksum,
};

/// Errors produced by the block range index, page store and key-to-page index.
///
/// `NotFound` and a failed compare-and-set are represented as plain `Option`/`bool`
/// return values elsewhere in this crate, not as variants here: they are not errors,
/// just absence of a value or a lost race.
#[derive(Debug)]
pub enum Error {
    /// I/O error while talking to the underlying filesystem.
    Io(std::io::Error),

    /// Serialization failed.
    Serialize(SerializeError),

    /// Deserialization failed.
    Deserialize(DeserializeError),

    /// A page or manifest entry's checksum did not match its content.
    ChecksumMismatch {
        /// Checksum computed from the bytes actually read.
        got: Checksum,
        /// Checksum recorded alongside the bytes.
        expected: Checksum,
    },

    /// The on-disk data is structurally invalid and cannot be recovered from.
    ///
    /// This is fatal for the affected block/page/table file.
    Corrupt(String),

    /// The caller passed an argument that violates a documented precondition.
    ///
    /// This should never originate from the data plane itself; it indicates a bug
    /// in the caller.
    InvalidArgument(String),

    /// A schema-level invariant was violated (duplicate column/FK name, unknown
    /// ALTER column, auto-increment on more than one column, invalid primary key
    /// type, ...).
    ///
    /// Always a caller error; never produced by the data plane itself.
    InvariantViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Serialize(e) => write!(f, "serialize error: {e}"),
            Self::Deserialize(e) => write!(f, "deserialize error: {e}"),
            Self::ChecksumMismatch { got, expected } => {
                write!(f, "checksum mismatch: expected {expected}, got {got}")
            }
            Self::Corrupt(msg) => write!(f, "corrupted data: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SerializeError> for Error {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

impl From<DeserializeError> for Error {
    fn from(value: DeserializeError) -> Self {
        Self::Deserialize(value)
    }
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

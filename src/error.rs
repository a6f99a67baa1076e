// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Error kinds returned by the engine.
//!
//! Mirrors the `Error`/`Result` split used throughout the crate: a single
//! flat enum covering device failures, codec failures and the POSIX-ish
//! conditions the public filesystem API can report.

use crate::coding::{DecodeError, EncodeError};

/// Errors that can occur anywhere in the engine.
#[derive(Debug)]
pub enum Error {
    /// Invalid argument.
    Inval,

    /// Unsupported on-disk feature or version.
    NotSup,

    /// Block device I/O failure.
    Io(std::io::Error),

    /// Checksum mismatch or other irrecoverable on-disk inconsistency.
    Corrupt,

    /// Entry does not exist.
    NoEnt,

    /// Entry already exists.
    Exist,

    /// Expected a directory, found something else.
    NotDir,

    /// Expected a non-directory, found a directory.
    IsDir,

    /// Directory is not empty.
    NotEmpty,

    /// File would exceed the configured file size limit.
    FBig,

    /// Device is out of usable space.
    NoSpc,

    /// Host is out of memory.
    NoMem,

    /// Requested custom attribute does not exist.
    NoAttr,

    /// Name exceeds the configured name length limit.
    NameTooLong,

    /// Internal signal: the operation needs to be retried one level up
    /// (compact, split, or allocate a new root). Never escapes the crate.
    Range,

    /// A record could not be serialized.
    Encode(EncodeError),

    /// A record could not be parsed.
    Decode(DecodeError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inval => write!(f, "invalid argument"),
            Self::NotSup => write!(f, "unsupported feature or version"),
            Self::Io(e) => write!(f, "device I/O error: {e}"),
            Self::Corrupt => write!(f, "on-disk data is corrupt"),
            Self::NoEnt => write!(f, "no such entry"),
            Self::Exist => write!(f, "entry already exists"),
            Self::NotDir => write!(f, "not a directory"),
            Self::IsDir => write!(f, "is a directory"),
            Self::NotEmpty => write!(f, "directory not empty"),
            Self::FBig => write!(f, "file too big"),
            Self::NoSpc => write!(f, "no space left on device"),
            Self::NoMem => write!(f, "out of memory"),
            Self::NoAttr => write!(f, "no such attribute"),
            Self::NameTooLong => write!(f, "name too long"),
            Self::Range => write!(f, "internal: range signal escaped the commit engine"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps an error onto the negative-integer FFI surface described by the
    /// block device contract (§6). Only used at the outermost API boundary.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Inval => -1,
            Self::NotSup => -2,
            Self::Io(_) => -3,
            Self::Corrupt => -4,
            Self::NoEnt => -5,
            Self::Exist => -6,
            Self::NotDir => -7,
            Self::IsDir => -8,
            Self::NotEmpty => -9,
            Self::FBig => -10,
            Self::NoSpc => -11,
            Self::NoMem => -12,
            Self::NoAttr => -13,
            Self::NameTooLong => -14,
            Self::Range => -15,
            Self::Encode(_) | Self::Decode(_) => -4,
        }
    }
}

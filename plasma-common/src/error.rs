// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Error types for the plasma store and client.

use std::fmt;

/// The primary error type for plasma operations.
#[derive(Debug, thiserror::Error)]
pub enum PlasmaError {
    /// Create was issued for an id that is already present.
    #[error("object already exists")]
    ObjectExists,
    /// Operation on an unknown object id.
    #[error("object does not exist")]
    ObjectNonexistent,
    /// The store cannot satisfy a Create even after eviction.
    #[error("out of memory")]
    OutOfMemory,
    /// Malformed message, duplicate Seal, Abort with outstanding references.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Get/Wait returned partial or empty results because the deadline fired.
    #[error("operation timed out")]
    Timeout,
    /// Framing or socket failure; the connection is unusable.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlasmaError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn is_object_exists(&self) -> bool {
        matches!(self, Self::ObjectExists)
    }
    pub fn is_object_nonexistent(&self) -> bool {
        matches!(self, Self::ObjectNonexistent)
    }
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type PlasmaResult<T> = Result<T, PlasmaError>;

/// Error codes carried in reply bodies.
///
/// A closed enumeration; the discriminants are part of the wire format and
/// must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    ObjectExists = 1,
    ObjectNonexistent = 2,
    OutOfMemory = 3,
    Invalid = 4,
}

impl ErrorCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::ObjectExists),
            2 => Some(Self::ObjectNonexistent),
            3 => Some(Self::OutOfMemory),
            4 => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a reply code back to the API error kind. Each code maps to
    /// exactly one kind.
    pub fn into_result(self) -> Result<(), PlasmaError> {
        match self {
            Self::Ok => Ok(()),
            Self::ObjectExists => Err(PlasmaError::ObjectExists),
            Self::ObjectNonexistent => Err(PlasmaError::ObjectNonexistent),
            Self::OutOfMemory => Err(PlasmaError::OutOfMemory),
            Self::Invalid => Err(PlasmaError::invalid_argument("rejected by store")),
        }
    }

    /// Encode the outcome of a store-side operation.
    pub fn from_result(result: &Result<(), PlasmaError>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(e) => Self::from_error(e),
        }
    }

    pub fn from_error(error: &PlasmaError) -> Self {
        match error {
            PlasmaError::ObjectExists => Self::ObjectExists,
            PlasmaError::ObjectNonexistent => Self::ObjectNonexistent,
            PlasmaError::OutOfMemory => Self::OutOfMemory,
            _ => Self::Invalid,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::ObjectExists,
            ErrorCode::ObjectNonexistent,
            ErrorCode::OutOfMemory,
            ErrorCode::Invalid,
        ] {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ErrorCode::from_i32(99), None);
    }

    #[test]
    fn test_error_code_maps_to_one_api_kind() {
        assert!(ErrorCode::Ok.into_result().is_ok());
        assert!(matches!(
            ErrorCode::ObjectExists.into_result(),
            Err(PlasmaError::ObjectExists)
        ));
        assert!(matches!(
            ErrorCode::ObjectNonexistent.into_result(),
            Err(PlasmaError::ObjectNonexistent)
        ));
        assert!(matches!(
            ErrorCode::OutOfMemory.into_result(),
            Err(PlasmaError::OutOfMemory)
        ));
        assert!(matches!(
            ErrorCode::Invalid.into_result(),
            Err(PlasmaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_error_inverse() {
        let err = PlasmaError::OutOfMemory;
        let code = ErrorCode::from_error(&err);
        assert!(matches!(
            code.into_result(),
            Err(PlasmaError::OutOfMemory)
        ));
    }

    #[test]
    fn test_display() {
        let err = PlasmaError::invalid_argument("bad digest length");
        assert_eq!(err.to_string(), "invalid argument: bad digest length");
    }
}

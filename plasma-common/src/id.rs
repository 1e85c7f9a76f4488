// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Fixed-width opaque byte-string types.
//!
//! `ObjectId` identifies an object; it is assigned by callers, never by the
//! store. `Digest` is the integrity token stored with a sealed object. Both
//! are 20-byte values with bytewise equality and hashing.

use std::fmt;

use crate::constants::{DIGEST_SIZE, OBJECT_ID_SIZE};
use crate::error::PlasmaError;

/// Generates a fixed-size byte-string type.
///
/// Each type is a `[u8; N]` newtype with:
/// - `from_binary` / `try_from_slice` / `from_hex` / `from_random` constructors
/// - `as_bytes()` / `binary()` / `hex()` accessors
/// - derived `Hash`, `Eq`, `PartialEq`, `Clone`, `Copy`; hex `Debug`/`Display`
macro_rules! define_plasma_id {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(C)]
        pub struct $name {
            data: [u8; $size],
        }

        impl $name {
            /// The fixed byte size of this type.
            pub const SIZE: usize = $size;

            /// Create a value from raw bytes. Panics if `bytes.len() != SIZE`;
            /// use `try_from_slice` for untrusted input.
            pub fn from_binary(bytes: &[u8]) -> Self {
                assert_eq!(
                    bytes.len(),
                    $size,
                    "expected {} bytes for {}, got {}",
                    $size,
                    stringify!($name),
                    bytes.len()
                );
                let mut data = [0u8; $size];
                data.copy_from_slice(bytes);
                Self { data }
            }

            /// Fallible constructor for wire input.
            pub fn try_from_slice(bytes: &[u8]) -> Result<Self, PlasmaError> {
                if bytes.len() != $size {
                    return Err(PlasmaError::invalid_argument(format!(
                        "expected {} bytes for {}, got {}",
                        $size,
                        stringify!($name),
                        bytes.len()
                    )));
                }
                Ok(Self::from_binary(bytes))
            }

            /// Create a value from a hex string.
            pub fn from_hex(hex_str: &str) -> Result<Self, PlasmaError> {
                let bytes = hex::decode(hex_str).map_err(|_| {
                    PlasmaError::invalid_argument(format!(
                        "invalid hex string for {}",
                        stringify!($name)
                    ))
                })?;
                Self::try_from_slice(&bytes)
            }

            /// Create a random value. Callers mint object ids however they
            /// like; this is the convenience for tests and ad-hoc tools.
            pub fn from_random() -> Self {
                use rand::Rng;
                let mut data = [0u8; $size];
                rand::thread_rng().fill(&mut data[..]);
                Self { data }
            }

            /// Raw byte array reference.
            pub fn as_bytes(&self) -> &[u8] {
                &self.data
            }

            /// Owned copy of the bytes.
            pub fn binary(&self) -> Vec<u8> {
                self.data.to_vec()
            }

            /// Hex-encoded string (lowercase).
            pub fn hex(&self) -> String {
                hex::encode(self.data)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.data
            }
        }
    };
}

define_plasma_id!(ObjectId, OBJECT_ID_SIZE);
define_plasma_id!(Digest, DIGEST_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_binary_roundtrip() {
        let bytes: Vec<u8> = (0..20).collect();
        let id = ObjectId::from_binary(&bytes);
        assert_eq!(id.as_bytes(), &bytes[..]);
        assert_eq!(id.binary(), bytes);
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = ObjectId::from_random();
        let hex_str = id.hex();
        assert_eq!(hex_str.len(), 40);
        let id2 = ObjectId::from_hex(&hex_str).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_try_from_slice_rejects_bad_length() {
        assert!(ObjectId::try_from_slice(&[0u8; 19]).is_err());
        assert!(ObjectId::try_from_slice(&[0u8; 21]).is_err());
        assert!(Digest::try_from_slice(&[0u8; 20]).is_ok());
    }

    #[test]
    fn test_bytewise_equality() {
        let a = ObjectId::from_binary(&[7u8; 20]);
        let b = ObjectId::from_binary(&[7u8; 20]);
        let c = ObjectId::from_binary(&[8u8; 20]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

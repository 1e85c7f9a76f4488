// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Object digests.
//!
//! The digest is the integrity token agreed between peers: the sealing
//! client computes it over the payload and the store passes it around
//! verbatim.

use plasma_common::constants::DIGEST_SIZE;
use plasma_common::id::Digest;

/// Hash data and metadata into the fixed-width object digest.
pub fn compute_object_digest(data: &[u8], metadata: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    hasher.update(metadata);
    let hash = hasher.finalize();
    Digest::from_binary(&hash.as_bytes()[..DIGEST_SIZE])
}

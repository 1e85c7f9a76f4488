// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Constants shared between the store and its clients.

/// Length of an object identifier in bytes (enough to hold a SHA1 hash).
pub const OBJECT_ID_SIZE: usize = 20;

/// Length of an object digest in bytes.
pub const DIGEST_SIZE: usize = 20;

/// Alignment of every object payload inside a segment. Cache-line aligned
/// so digest computation over the payload can use aligned loads.
pub const BLOCK_SIZE: u64 = 64;

/// Granularity for new segment creation. A segment is at least this large
/// (capped by the remaining memory budget) so small objects share mappings.
pub const SEGMENT_GRANULARITY: u64 = 1024 * 1024;

/// Upper bound on file descriptors attached to a single message.
pub const MAX_FDS_PER_MESSAGE: usize = 32;

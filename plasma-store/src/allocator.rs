// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared-memory segment allocator.
//!
//! Objects are carved out of fixed backing **segments**: mmap-backed files
//! whose descriptors are the handles shared with clients. Segments are
//! append-only — once exposed, a segment is never resized or unmapped
//! while the store is running. Within a segment, allocation is best-fit
//! over a free list with coalescing of adjacent free blocks.
//!
//! # Safety
//!
//! This module contains `unsafe` code for mmap/munmap. All unsafe
//! operations are isolated in small, audited functions.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use plasma_common::constants::{BLOCK_SIZE, SEGMENT_GRANULARITY};
use plasma_common::error::{PlasmaError, PlasmaResult};

/// A carved-out range inside a segment.
///
/// Move-only — dropping an Allocation does NOT free the range; it must be
/// explicitly returned via `SegmentAllocator::free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub segment_index: i32,
    pub offset: u64,
    /// Aligned block size actually reserved.
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

/// One mmap-backed shared-memory region.
pub struct Segment {
    fd: OwnedFd,
    base: *mut u8,
    size: u64,
    /// Free ranges, sorted by offset, never adjacent (adjacent blocks are
    /// coalesced on free).
    free_blocks: Vec<FreeBlock>,
}

// The base pointer addresses shared memory accessed by multiple processes;
// cross-process writes are sequenced by the socket protocol.
unsafe impl Send for Segment {}

impl Segment {
    fn create(directory: &str, size: u64, huge_pages: bool) -> PlasmaResult<Self> {
        let fd = create_backing_file(directory, size)?;
        let base = mmap_shared(fd.as_raw_fd(), size, huge_pages)?;
        Ok(Self {
            fd,
            base,
            size,
            free_blocks: vec![FreeBlock { offset: 0, size }],
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    fn free_bytes(&self) -> u64 {
        self.free_blocks.iter().map(|b| b.size).sum()
    }

    /// Best-fit candidate: the smallest free block that fits `size`.
    fn best_fit(&self, size: u64) -> Option<(usize, u64)> {
        self.free_blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size >= size)
            .min_by_key(|(_, b)| b.size)
            .map(|(i, b)| (i, b.size))
    }

    fn carve(&mut self, block_index: usize, size: u64) -> u64 {
        let block = &mut self.free_blocks[block_index];
        let offset = block.offset;
        block.offset += size;
        block.size -= size;
        if block.size == 0 {
            self.free_blocks.remove(block_index);
        }
        offset
    }

    fn insert_free(&mut self, offset: u64, size: u64) {
        let pos = self
            .free_blocks
            .partition_point(|b| b.offset < offset);
        self.free_blocks.insert(pos, FreeBlock { offset, size });

        // Coalesce with the following block, then the preceding one.
        if pos + 1 < self.free_blocks.len()
            && self.free_blocks[pos].offset + self.free_blocks[pos].size
                == self.free_blocks[pos + 1].offset
        {
            self.free_blocks[pos].size += self.free_blocks[pos + 1].size;
            self.free_blocks.remove(pos + 1);
        }
        if pos > 0
            && self.free_blocks[pos - 1].offset + self.free_blocks[pos - 1].size
                == self.free_blocks[pos].offset
        {
            self.free_blocks[pos - 1].size += self.free_blocks[pos].size;
            self.free_blocks.remove(pos);
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Safety: base/size came from a successful mmap; the fd is closed
        // by OwnedFd afterwards.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size as usize);
        }
    }
}

/// Allocator over a growable set of segments, bounded by a byte budget.
pub struct SegmentAllocator {
    segments: Vec<Segment>,
    memory_capacity: i64,
    /// Cumulative size of all segments; never exceeds `memory_capacity`
    /// and never shrinks (segments are append-only).
    segment_bytes: i64,
    directory: String,
    huge_pages: bool,
}

impl SegmentAllocator {
    pub fn new(memory_capacity: i64, directory: &str, huge_pages: bool) -> Self {
        Self {
            segments: Vec::new(),
            memory_capacity,
            segment_bytes: 0,
            directory: directory.to_string(),
            huge_pages,
        }
    }

    pub fn align_up(size: u64) -> u64 {
        (size + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
    }

    /// Reserve `bytes` (rounded up to the block alignment) in some segment.
    ///
    /// Zero-byte requests still reserve one alignment unit so that no two
    /// live objects share an offset.
    pub fn allocate(&mut self, bytes: u64) -> Option<Allocation> {
        let aligned = Self::align_up(bytes.max(1));

        let candidate = self
            .segments
            .iter()
            .enumerate()
            .filter_map(|(i, seg)| seg.best_fit(aligned).map(|(block, size)| (i, block, size)))
            .min_by_key(|(_, _, size)| *size);

        if let Some((segment_index, block_index, _)) = candidate {
            let offset = self.segments[segment_index].carve(block_index, aligned);
            return Some(Allocation {
                segment_index: segment_index as i32,
                offset,
                size: aligned,
            });
        }

        // No segment has room; grow if the budget permits.
        if (aligned as i64) > self.memory_capacity - self.segment_bytes {
            return None;
        }
        let remaining = (self.memory_capacity - self.segment_bytes) as u64;
        let segment_size = SEGMENT_GRANULARITY.clamp(aligned, remaining);
        let mut segment = match Segment::create(&self.directory, segment_size, self.huge_pages) {
            Ok(segment) => segment,
            Err(e) => {
                tracing::warn!("failed to create a {segment_size}-byte segment: {e}");
                return None;
            }
        };
        let offset = segment.carve(0, aligned);
        self.segments.push(segment);
        self.segment_bytes += segment_size as i64;

        Some(Allocation {
            segment_index: (self.segments.len() - 1) as i32,
            offset,
            size: aligned,
        })
    }

    /// Return a previously-allocated range to its segment's free list.
    pub fn free(&mut self, allocation: Allocation) {
        let segment = &mut self.segments[allocation.segment_index as usize];
        segment.insert_free(allocation.offset, allocation.size);
    }

    pub fn segment(&self, index: i32) -> Option<&Segment> {
        self.segments.get(index as usize)
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_bytes(&self) -> i64 {
        self.segment_bytes
    }

    pub fn memory_capacity(&self) -> i64 {
        self.memory_capacity
    }

    pub fn free_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.free_bytes()).sum()
    }
}

/// Create an anonymous backing file of `size` bytes in `directory`.
/// The name is unlinked immediately so the file lives exactly as long as
/// its descriptors.
fn create_backing_file(directory: &str, size: u64) -> PlasmaResult<OwnedFd> {
    static SEGMENT_COUNTER: AtomicU64 = AtomicU64::new(0);
    let counter = SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = format!("{}/plasma-{}-{}", directory, std::process::id(), counter);

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    std::fs::remove_file(&path)?;
    file.set_len(size)?;
    Ok(OwnedFd::from(file))
}

fn mmap_shared(fd: RawFd, size: u64, huge_pages: bool) -> PlasmaResult<*mut u8> {
    #[allow(unused_mut)]
    let mut flags = libc::MAP_SHARED;
    if huge_pages {
        #[cfg(target_os = "linux")]
        {
            flags |= libc::MAP_HUGETLB;
        }
    }

    // Safety: fd is a valid descriptor sized to at least `size` bytes.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(PlasmaError::Io(std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

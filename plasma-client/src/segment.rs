// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Client-side mappings of store segments.
//!
//! A segment fd received from the store is mapped once and cached for the
//! life of the connection; dropping the last object view into a segment
//! does not unmap it.
//!
//! # Safety
//!
//! The mapping is shared memory written by whichever connection created
//! each object. Slice access is sound because the protocol enforces a
//! single writer per object before seal and immutability after.

use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr;

use plasma_common::error::{PlasmaError, PlasmaResult};

/// One mapped segment.
pub struct MappedSegment {
    base: *mut u8,
    size: usize,
    _fd: OwnedFd,
}

unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    /// Map `size` bytes of the segment behind `fd` read/write.
    pub fn map(fd: OwnedFd, size: usize) -> PlasmaResult<Self> {
        // Safety: the store sized the backing file to at least `size`.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(PlasmaError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self {
            base: base as *mut u8,
            size,
            _fd: fd,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn check_range(&self, offset: u64, len: i64) -> PlasmaResult<(usize, usize)> {
        let offset = offset as usize;
        let len = len.max(0) as usize;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(PlasmaError::invalid_argument(format!(
                "range {offset}+{len} outside a {}-byte segment",
                self.size
            )));
        }
        Ok((offset, len))
    }

    /// Immutable view of a range.
    ///
    /// Sound only for sealed objects (or the creator's own unsealed
    /// object); the caller is the protocol layer, which guarantees that.
    pub fn slice(&self, offset: u64, len: i64) -> PlasmaResult<&[u8]> {
        let (offset, len) = self.check_range(offset, len)?;
        // Safety: range checked above; writer exclusivity per the module
        // contract.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), len) })
    }

    /// Mutable view of a range, for the creator before seal.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, offset: u64, len: i64) -> PlasmaResult<&mut [u8]> {
        let (offset, len) = self.check_range(offset, len)?;
        // Safety: range checked above; the store grants one writer per
        // object and readers only appear after seal.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) })
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        // Safety: base/size came from a successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing_fd(size: u64) -> OwnedFd {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        OwnedFd::from(file)
    }

    #[test]
    fn test_map_and_rw() {
        let segment = MappedSegment::map(backing_fd(4096), 4096).unwrap();
        assert_eq!(segment.len(), 4096);

        segment.slice_mut(64, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(segment.slice(64, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let segment = MappedSegment::map(backing_fd(4096), 4096).unwrap();
        assert!(segment.slice(4000, 200).is_err());
        assert!(segment.slice(u64::MAX, 1).is_err());
        assert!(segment.slice(0, 4096).is_ok());
    }
}

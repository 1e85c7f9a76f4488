// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The object table: authoritative mapping from object id to entry state.
//!
//! Lifecycle: `Created` (writable by the creator) → `Sealed` (immutable,
//! visible to Get/Contains/List) → removed. Entries that cannot be removed
//! yet (still referenced, or not sealed) can be marked pending-delete; the
//! removal happens when the reference count reaches zero.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use plasma_common::error::{PlasmaError, PlasmaResult};
use plasma_common::id::{Digest, ObjectId};
use plasma_protocol::messages::{ObjectInfo, PlasmaObjectSpec};

use crate::allocator::Allocation;

/// State of an object in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Being written by its creator; invisible to Get/Contains/List.
    Created = 1,
    /// Immutable and readable.
    Sealed = 2,
}

/// One live object.
pub struct ObjectEntry {
    object_id: ObjectId,
    allocation: Allocation,
    state: ObjectState,
    data_size: i64,
    metadata_size: i64,
    device_num: i32,
    /// Opaque device IPC handle; empty for host objects.
    ipc_handle: Vec<u8>,
    /// Number of distinct connections holding this object.
    ref_count: i32,
    /// Valid iff `state == Sealed`.
    digest: Option<Digest>,
    /// Unix epoch ms when the object was created.
    create_time: i64,
    /// seal_time - create_time in ms; -1 until sealed.
    construct_duration: i64,
}

impl ObjectEntry {
    fn new(
        object_id: ObjectId,
        allocation: Allocation,
        data_size: i64,
        metadata_size: i64,
        device_num: i32,
    ) -> Self {
        Self {
            object_id,
            allocation,
            state: ObjectState::Created,
            data_size,
            metadata_size,
            device_num,
            ipc_handle: Vec::new(),
            ref_count: 0,
            digest: None,
            create_time: entry_timestamp_ms(),
            construct_duration: -1,
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn is_sealed(&self) -> bool {
        self.state == ObjectState::Sealed
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    pub fn data_size(&self) -> i64 {
        self.data_size
    }

    pub fn metadata_size(&self) -> i64 {
        self.metadata_size
    }

    /// Total object size: data + metadata.
    pub fn object_size(&self) -> i64 {
        self.data_size + self.metadata_size
    }

    pub fn device_num(&self) -> i32 {
        self.device_num
    }

    pub fn ipc_handle(&self) -> &[u8] {
        &self.ipc_handle
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Wire description of this object's location in shared memory.
    pub fn spec(&self) -> PlasmaObjectSpec {
        PlasmaObjectSpec {
            segment_index: self.allocation.segment_index,
            data_offset: self.allocation.offset,
            data_size: self.data_size,
            metadata_offset: self.allocation.offset + self.data_size as u64,
            metadata_size: self.metadata_size,
            device_num: self.device_num,
        }
    }

    pub fn object_info(&self) -> ObjectInfo {
        ObjectInfo {
            object_id: self.object_id,
            data_size: self.data_size,
            metadata_size: self.metadata_size,
            ref_count: self.ref_count,
            create_time: self.create_time,
            construct_duration: self.construct_duration,
            digest: self.digest,
            is_deletion: false,
        }
    }

    fn seal(&mut self, digest: Digest) {
        self.state = ObjectState::Sealed;
        self.digest = Some(digest);
        self.construct_duration = (entry_timestamp_ms() - self.create_time).max(0);
    }

    pub fn incr_ref(&mut self) {
        self.ref_count += 1;
    }

    pub fn decr_ref(&mut self) {
        debug_assert!(self.ref_count > 0, "negative reference count");
        self.ref_count -= 1;
    }
}

/// Wall-clock milliseconds for the entry timestamps that List and
/// subscription notifications report. Nothing in the store keys off these
/// values; a clock jump only skews the reported construct_duration, which
/// the seal path clamps at zero.
fn entry_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Map from object id to entry, with byte accounting and the pending-delete
/// set.
pub struct ObjectTable {
    objects: HashMap<ObjectId, ObjectEntry>,
    deletion_cache: HashSet<ObjectId>,
    num_bytes_sealed: i64,
    num_bytes_unsealed: i64,
    cumulative_created_bytes: i64,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            deletion_cache: HashSet::new(),
            num_bytes_sealed: 0,
            num_bytes_unsealed: 0,
            cumulative_created_bytes: 0,
        }
    }

    pub fn create_object(
        &mut self,
        object_id: ObjectId,
        allocation: Allocation,
        data_size: i64,
        metadata_size: i64,
        device_num: i32,
    ) -> PlasmaResult<&ObjectEntry> {
        if self.objects.contains_key(&object_id) {
            return Err(PlasmaError::ObjectExists);
        }

        let entry = ObjectEntry::new(object_id, allocation, data_size, metadata_size, device_num);
        let size = entry.object_size();
        self.objects.insert(object_id, entry);
        self.num_bytes_unsealed += size;
        self.cumulative_created_bytes += size;

        Ok(self.objects.get(&object_id).unwrap())
    }

    pub fn get(&self, object_id: &ObjectId) -> Option<&ObjectEntry> {
        self.objects.get(object_id)
    }

    pub fn get_mut(&mut self, object_id: &ObjectId) -> Option<&mut ObjectEntry> {
        self.objects.get_mut(object_id)
    }

    /// True iff the id is present and sealed; Created objects are invisible.
    pub fn contains_sealed(&self, object_id: &ObjectId) -> bool {
        self.objects
            .get(object_id)
            .is_some_and(|entry| entry.is_sealed())
    }

    pub fn seal_object(
        &mut self,
        object_id: &ObjectId,
        digest: Digest,
    ) -> PlasmaResult<&ObjectEntry> {
        let entry = self
            .objects
            .get_mut(object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if entry.is_sealed() {
            return Err(PlasmaError::invalid_argument(format!(
                "object {} is already sealed",
                object_id
            )));
        }

        let size = entry.object_size();
        entry.seal(digest);
        self.num_bytes_unsealed -= size;
        self.num_bytes_sealed += size;

        Ok(self.objects.get(object_id).unwrap())
    }

    /// Remove an entry with no outstanding references. Returns the
    /// allocation for the caller to free.
    pub fn remove_object(&mut self, object_id: &ObjectId) -> PlasmaResult<Allocation> {
        match self.objects.get(object_id) {
            Some(entry) if entry.ref_count() > 0 => {
                return Err(PlasmaError::invalid_argument(format!(
                    "object {} still has {} references",
                    object_id,
                    entry.ref_count()
                )));
            }
            Some(_) => {}
            None => return Err(PlasmaError::ObjectNonexistent),
        }

        let entry = self.objects.remove(object_id).unwrap();
        let size = entry.object_size();
        if entry.is_sealed() {
            self.num_bytes_sealed -= size;
        } else {
            self.num_bytes_unsealed -= size;
        }
        self.deletion_cache.remove(object_id);

        Ok(entry.allocation)
    }

    /// Defer deletion until the reference count reaches zero.
    pub fn mark_pending_delete(&mut self, object_id: ObjectId) {
        self.deletion_cache.insert(object_id);
    }

    pub fn is_pending_delete(&self, object_id: &ObjectId) -> bool {
        self.deletion_cache.contains(object_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.objects.values()
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn num_bytes_sealed(&self) -> i64 {
        self.num_bytes_sealed
    }

    pub fn num_bytes_unsealed(&self) -> i64 {
        self.num_bytes_unsealed
    }

    pub fn num_bytes_in_use(&self) -> i64 {
        self.num_bytes_sealed + self.num_bytes_unsealed
    }

    pub fn cumulative_created_bytes(&self) -> i64 {
        self.cumulative_created_bytes
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

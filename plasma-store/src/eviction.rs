// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! LRU eviction policy.
//!
//! Tracks the sealed, unpinned objects as candidates in least-recently-used
//! order. An object enters the candidate list when its reference count
//! drops to zero and leaves it when the count becomes positive again or the
//! entry is deleted.

use std::collections::{HashMap, VecDeque};

use plasma_common::id::ObjectId;

/// An LRU cache of evictable objects.
///
/// Uses a queue for eviction order and a map for O(1) membership; removal
/// tombstones the queue entry and the scan compacts periodically.
pub struct LruCache {
    /// Ids in LRU order (front = least recently used). May contain
    /// tombstones for removed ids.
    item_list: VecDeque<ObjectId>,
    /// Live members and their sizes.
    item_map: HashMap<ObjectId, i64>,
    used_bytes: i64,
    num_evictions_total: i64,
    bytes_evicted_total: i64,
}

impl LruCache {
    pub fn new() -> Self {
        Self {
            item_list: VecDeque::new(),
            item_map: HashMap::new(),
            used_bytes: 0,
            num_evictions_total: 0,
            bytes_evicted_total: 0,
        }
    }

    /// Add an object at the most-recently-used position.
    pub fn add(&mut self, key: ObjectId, size: i64) {
        if self.item_map.contains_key(&key) {
            return;
        }
        self.item_list.push_back(key);
        self.item_map.insert(key, size);
        self.used_bytes += size;
    }

    /// Remove an object. Returns its size, or 0 if it was not present.
    pub fn remove(&mut self, key: &ObjectId) -> i64 {
        match self.item_map.remove(key) {
            Some(size) => {
                self.used_bytes -= size;
                size
            }
            None => 0,
        }
    }

    /// Choose objects to evict, LRU first, until at least
    /// `num_bytes_required` would be freed or the candidates run out.
    /// Returns the total bytes chosen.
    pub fn choose_objects_to_evict(
        &mut self,
        num_bytes_required: i64,
        objects_to_evict: &mut Vec<ObjectId>,
    ) -> i64 {
        let mut bytes_chosen = 0i64;
        let mut chosen = Vec::new();

        for key in &self.item_list {
            if bytes_chosen >= num_bytes_required {
                break;
            }
            if let Some(&size) = self.item_map.get(key) {
                chosen.push(*key);
                bytes_chosen += size;
            }
        }

        for key in &chosen {
            let size = self.remove(key);
            self.num_evictions_total += 1;
            self.bytes_evicted_total += size;
        }
        objects_to_evict.extend(chosen);

        if self.item_list.len() > self.item_map.len() * 2 {
            self.compact();
        }

        bytes_chosen
    }

    fn compact(&mut self) {
        let map = &self.item_map;
        self.item_list.retain(|key| map.contains_key(key));
    }

    pub fn exists(&self, key: &ObjectId) -> bool {
        self.item_map.contains_key(key)
    }

    pub fn used_bytes(&self) -> i64 {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.item_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_map.is_empty()
    }

    pub fn debug_string(&self) -> String {
        format!(
            "LruCache(evictable_bytes={}, items={}, evictions={}, bytes_evicted={})",
            self.used_bytes,
            self.item_map.len(),
            self.num_evictions_total,
            self.bytes_evicted_total,
        )
    }
}

impl Default for LruCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Eviction policy over the LRU candidate set.
pub struct EvictionPolicy {
    /// Bytes held by pinned objects (refcount > 0).
    pinned_bytes: i64,
    cache: LruCache,
}

impl EvictionPolicy {
    pub fn new() -> Self {
        Self {
            pinned_bytes: 0,
            cache: LruCache::new(),
        }
    }

    /// A new object entered the table. It starts evictable; the creator's
    /// reference pins it immediately afterwards via `begin_object_access`.
    pub fn object_created(&mut self, object_id: ObjectId, size: i64) {
        self.cache.add(object_id, size);
    }

    /// Choose victims freeing at least `size` bytes. Returns bytes chosen.
    pub fn require_space(&mut self, size: i64, objects_to_evict: &mut Vec<ObjectId>) -> i64 {
        self.cache.choose_objects_to_evict(size, objects_to_evict)
    }

    /// The object became pinned (refcount 0 → 1); not evictable.
    pub fn begin_object_access(&mut self, object_id: &ObjectId) {
        let size = self.cache.remove(object_id);
        self.pinned_bytes += size;
    }

    /// The object became unpinned (refcount 1 → 0); evictable again.
    pub fn end_object_access(&mut self, object_id: ObjectId, size: i64) {
        self.cache.add(object_id, size);
        self.pinned_bytes = (self.pinned_bytes - size).max(0);
    }

    /// Forget an object entirely (deleted or aborted).
    pub fn remove_object(&mut self, object_id: &ObjectId) {
        self.cache.remove(object_id);
    }

    pub fn is_evictable(&self, object_id: &ObjectId) -> bool {
        self.cache.exists(object_id)
    }

    pub fn evictable_bytes(&self) -> i64 {
        self.cache.used_bytes()
    }

    pub fn pinned_bytes(&self) -> i64 {
        self.pinned_bytes
    }

    pub fn debug_string(&self) -> String {
        format!(
            "EvictionPolicy(pinned_bytes={}, {})",
            self.pinned_bytes,
            self.cache.debug_string()
        )
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

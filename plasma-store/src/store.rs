// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The plasma store: object lifecycle, reference counts, eviction,
//! waiter resolution, and subscriber notifications.
//!
//! All state lives behind one mutex and every operation runs to completion
//! under it, which gives the same serialization the original
//! single-threaded event loop provided. Connection threads call in; a Get
//! or Wait that cannot complete parks outside the lock on a completion
//! channel and assembles its own reply when woken.
//!
//! The identity that holds references is the *connection* (`ClientId`),
//! not the process: a connection holds at most one reference per object,
//! and releasing or disconnecting returns exactly what it took.

use std::collections::{HashMap, HashSet};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::mpsc::Receiver;

use parking_lot::Mutex;

use plasma_common::config::StoreConfig;
use plasma_common::error::{ErrorCode, PlasmaError, PlasmaResult};
use plasma_common::id::{Digest, ObjectId};
use plasma_protocol::messages::{
    ObjectInfo, ObjectReply, ObjectRequestSpec, ObjectStatus, PlasmaObjectSpec,
};

use crate::allocator::SegmentAllocator;
use crate::eviction::EvictionPolicy;
use crate::notifications::SubscriberTable;
use crate::object_table::ObjectTable;
use crate::waiters::{RequestId, ResolvedObject, WaiterTable};

pub type ClientId = u64;

/// Successful Create, ready to be encoded into a reply.
pub struct CreateResult {
    pub spec: PlasmaObjectSpec,
    pub store_fd_index: i32,
    pub mmap_size: i64,
    /// Segment fd to attach, present only the first time this connection
    /// references the segment.
    pub fd_to_send: Option<RawFd>,
    pub ipc_handle: Vec<u8>,
}

/// Assembled Get reply data.
pub struct GetResultData {
    pub object_ids: Vec<ObjectId>,
    pub specs: Vec<PlasmaObjectSpec>,
    pub store_fds: Vec<i32>,
    pub mmap_sizes: Vec<i64>,
    pub ipc_handles: Vec<Vec<u8>>,
    pub fds_to_send: Vec<RawFd>,
}

/// Assembled Wait reply data.
pub struct WaitResultData {
    pub object_replies: Vec<ObjectReply>,
    pub num_ready: i32,
}

/// A request that could not complete immediately. The connection thread
/// blocks on `receiver` (bounded by its deadline) and then calls the
/// matching `*_finish` to assemble the reply.
pub struct ParkedRequest {
    pub request_id: RequestId,
    pub receiver: Receiver<()>,
}

pub enum GetOutcome {
    Ready(GetResultData),
    Parked(ParkedRequest),
}

pub enum WaitOutcome {
    Ready(WaitResultData),
    Parked(ParkedRequest),
}

struct ClientState {
    /// Objects this connection holds a reference on.
    object_ids: HashSet<ObjectId>,
    /// Segments whose fd this connection has already been sent.
    segments_sent: HashSet<i32>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            object_ids: HashSet::new(),
            segments_sent: HashSet::new(),
        }
    }
}

struct StoreInner {
    allocator: SegmentAllocator,
    objects: ObjectTable,
    eviction: EvictionPolicy,
    waiters: WaiterTable,
    subscribers: SubscriberTable,
    clients: HashMap<ClientId, ClientState>,
}

/// The store. Shared across connection threads.
pub struct PlasmaStore {
    inner: Mutex<StoreInner>,
    memory_capacity: i64,
}

impl PlasmaStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                allocator: SegmentAllocator::new(
                    config.memory_capacity,
                    &config.plasma_directory,
                    config.huge_pages,
                ),
                objects: ObjectTable::new(),
                eviction: EvictionPolicy::new(),
                waiters: WaiterTable::new(),
                subscribers: SubscriberTable::new(),
                clients: HashMap::new(),
            }),
            memory_capacity: config.memory_capacity,
        }
    }

    pub fn memory_capacity(&self) -> i64 {
        self.memory_capacity
    }

    /// Register a new connection. Idempotent.
    pub fn register_client(&self, client_id: ClientId) {
        self.inner
            .lock()
            .clients
            .entry(client_id)
            .or_insert_with(ClientState::new);
    }

    pub fn create(
        &self,
        client_id: ClientId,
        object_id: ObjectId,
        data_size: i64,
        metadata_size: i64,
        device_num: i32,
    ) -> PlasmaResult<CreateResult> {
        if data_size < 0 || metadata_size < 0 || device_num < 0 {
            return Err(PlasmaError::invalid_argument(
                "negative size or device number",
            ));
        }
        tracing::debug!(object_id = %object_id, data_size, metadata_size, "creating object");
        self.inner
            .lock()
            .create(client_id, object_id, data_size, metadata_size, device_num)
    }

    pub fn seal(
        &self,
        client_id: ClientId,
        object_id: ObjectId,
        digest: Digest,
    ) -> PlasmaResult<()> {
        tracing::debug!(object_id = %object_id, "sealing object");
        self.inner.lock().seal(client_id, object_id, digest)
    }

    pub fn abort(&self, client_id: ClientId, object_id: ObjectId) -> PlasmaResult<()> {
        self.inner.lock().abort(client_id, object_id)
    }

    pub fn release(&self, client_id: ClientId, object_id: ObjectId) -> PlasmaResult<()> {
        self.inner.lock().remove_reference(client_id, &object_id)
    }

    /// Per-id outcomes, same length and order as the request.
    pub fn delete(&self, object_ids: &[ObjectId]) -> Vec<ErrorCode> {
        let mut inner = self.inner.lock();
        object_ids
            .iter()
            .map(|object_id| inner.delete_one(object_id))
            .collect()
    }

    /// True iff the id is present and sealed.
    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.inner.lock().objects.contains_sealed(object_id)
    }

    /// Snapshot of every entry, sealed or not.
    pub fn list(&self) -> Vec<ObjectInfo> {
        self.inner
            .lock()
            .objects
            .iter()
            .map(|entry| entry.object_info())
            .collect()
    }

    /// Evict unpinned sealed objects, LRU first, until at least
    /// `num_bytes` are freed or the candidates run out. Returns the bytes
    /// actually freed.
    pub fn evict(&self, num_bytes: i64) -> i64 {
        let mut inner = self.inner.lock();
        let mut victims = Vec::new();
        let freed = inner.eviction.require_space(num_bytes, &mut victims);
        for victim in &victims {
            inner.delete_now(victim, true);
        }
        freed
    }

    pub fn get_begin(
        &self,
        client_id: ClientId,
        object_ids: Vec<ObjectId>,
        timeout_ms: i64,
    ) -> GetOutcome {
        self.inner.lock().get_begin(client_id, object_ids, timeout_ms)
    }

    /// Assemble the reply for a previously parked Get. Returns None if the
    /// request was already swept away by a disconnect.
    pub fn get_finish(&self, request_id: RequestId) -> Option<GetResultData> {
        let mut inner = self.inner.lock();
        let request = inner.waiters.take_get(request_id)?;
        Some(inner.assemble_get(request.client_id, request.object_ids, request.resolved))
    }

    pub fn wait_begin(
        &self,
        client_id: ClientId,
        object_requests: Vec<ObjectRequestSpec>,
        num_ready: i32,
        timeout_ms: i64,
    ) -> WaitOutcome {
        self.inner
            .lock()
            .wait_begin(client_id, object_requests, num_ready, timeout_ms)
    }

    pub fn wait_finish(&self, request_id: RequestId) -> Option<WaitResultData> {
        let mut inner = self.inner.lock();
        let request = inner.waiters.take_wait(request_id)?;
        Some(StoreInner::assemble_wait(
            request.object_requests,
            request.satisfied,
        ))
    }

    /// Register a push channel and bring the subscriber up to date with
    /// every already-sealed object.
    pub fn subscribe(&self, client_id: ClientId, fd: OwnedFd) {
        let mut inner = self.inner.lock();
        inner.subscribers.add(client_id, fd);
        let catch_up: Vec<ObjectInfo> = inner
            .objects
            .iter()
            .filter(|entry| entry.is_sealed())
            .map(|entry| entry.object_info())
            .collect();
        for info in catch_up {
            if !inner.subscribers.push_to(client_id, &info) {
                break;
            }
        }
    }

    /// Local status for each id: `Local` when sealed here, otherwise
    /// `Nonexistent`. Remote knowledge belongs to the fetch manager.
    pub fn status(&self, object_ids: &[ObjectId]) -> Vec<ObjectStatus> {
        let inner = self.inner.lock();
        object_ids
            .iter()
            .map(|object_id| {
                if inner.objects.contains_sealed(object_id) {
                    ObjectStatus::Local
                } else {
                    ObjectStatus::Nonexistent
                }
            })
            .collect()
    }

    /// Sizes for a Data request: (object_size, metadata_size), or (-1, -1)
    /// when the object is not sealed here.
    pub fn data_info(&self, object_id: &ObjectId) -> (i64, i64) {
        let inner = self.inner.lock();
        match inner.objects.get(object_id) {
            Some(entry) if entry.is_sealed() => (entry.object_size(), entry.metadata_size()),
            _ => (-1, -1),
        }
    }

    /// Tear down a connection: drop its waiters and subscription, abort
    /// its unsealed objects, and release every reference it held.
    pub fn disconnect(&self, client_id: ClientId) {
        tracing::info!(client_id, "disconnecting client");
        self.inner.lock().disconnect(client_id)
    }

    // Introspection used by tests and the server's log lines.

    pub fn num_objects(&self) -> usize {
        self.inner.lock().objects.num_objects()
    }

    pub fn num_bytes_in_use(&self) -> i64 {
        self.inner.lock().objects.num_bytes_in_use()
    }

    pub fn segment_bytes(&self) -> i64 {
        self.inner.lock().allocator.segment_bytes()
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.lock();
        format!(
            "PlasmaStore(objects={}, bytes_in_use={}, segment_bytes={}/{}, parked_gets={}, parked_waits={}, subscribers={}, {})",
            inner.objects.num_objects(),
            inner.objects.num_bytes_in_use(),
            inner.allocator.segment_bytes(),
            self.memory_capacity,
            inner.waiters.num_parked_gets(),
            inner.waiters.num_parked_waits(),
            inner.subscribers.len(),
            inner.eviction.debug_string(),
        )
    }
}

/// Record that `client_id` holds `object_id`, pinning it on the 0 → 1
/// refcount transition. Free function over disjoint fields so waiter
/// resolution can call it while `waiters` is borrowed.
fn add_reference(
    clients: &mut HashMap<ClientId, ClientState>,
    objects: &mut ObjectTable,
    eviction: &mut EvictionPolicy,
    client_id: ClientId,
    object_id: &ObjectId,
) {
    let Some(client) = clients.get_mut(&client_id) else {
        return;
    };
    if !client.object_ids.insert(*object_id) {
        return; // this connection already holds the object
    }
    if let Some(entry) = objects.get_mut(object_id) {
        if entry.ref_count() == 0 {
            eviction.begin_object_access(object_id);
        }
        entry.incr_ref();
    }
}

impl StoreInner {
    fn create(
        &mut self,
        client_id: ClientId,
        object_id: ObjectId,
        data_size: i64,
        metadata_size: i64,
        device_num: i32,
    ) -> PlasmaResult<CreateResult> {
        if self.objects.get(&object_id).is_some() {
            return Err(PlasmaError::ObjectExists);
        }

        let total = (data_size + metadata_size) as u64;
        let allocation = match self.allocator.allocate(total) {
            Some(allocation) => allocation,
            None => {
                // Reclaim the shortfall between the aligned request and
                // what the allocator could still hand out (free ranges
                // plus unspent budget), then retry once. A non-positive
                // shortfall means the failure was fragmentation; evicting
                // a request-sized LRU prefix restores contiguity.
                let aligned = SegmentAllocator::align_up(total.max(1)) as i64;
                let available = self.allocator.free_bytes() as i64
                    + (self.allocator.memory_capacity() - self.allocator.segment_bytes());
                let shortfall = aligned - available;
                let target = if shortfall > 0 { shortfall } else { aligned };

                let mut victims = Vec::new();
                self.eviction.require_space(target, &mut victims);
                for victim in &victims {
                    self.delete_now(victim, true);
                }
                self.allocator
                    .allocate(total)
                    .ok_or(PlasmaError::OutOfMemory)?
            }
        };

        if let Err(e) =
            self.objects
                .create_object(object_id, allocation, data_size, metadata_size, device_num)
        {
            self.allocator.free(allocation);
            return Err(e);
        }
        self.eviction
            .object_created(object_id, allocation.size as i64);
        add_reference(
            &mut self.clients,
            &mut self.objects,
            &mut self.eviction,
            client_id,
            &object_id,
        );

        let spec = self.objects.get(&object_id).unwrap().spec();
        let (fd_to_send, mmap_size) = self.segment_handle_for(client_id, allocation.segment_index);
        Ok(CreateResult {
            spec,
            store_fd_index: allocation.segment_index,
            mmap_size,
            fd_to_send,
            ipc_handle: Vec::new(),
        })
    }

    fn seal(&mut self, client_id: ClientId, object_id: ObjectId, digest: Digest) -> PlasmaResult<()> {
        let (spec, info, ipc_handle) = {
            let entry = self.objects.seal_object(&object_id, digest)?;
            (entry.spec(), entry.object_info(), entry.ipc_handle().to_vec())
        };

        self.subscribers.push_all(&info);

        // Resolve parked Gets and Waits. Each Get that newly resolves this
        // object takes a reference for its own connection before the
        // creator's implicit reference is dropped below, so the refcount
        // never dips to zero with readers pending.
        let StoreInner {
            waiters,
            clients,
            objects,
            eviction,
            ..
        } = self;
        waiters.object_sealed(&object_id, spec, &ipc_handle, |waiter_client| {
            add_reference(clients, objects, eviction, waiter_client, &object_id);
        });

        // The creator's implicit reference is released by the seal itself.
        if self.remove_reference(client_id, &object_id).is_err() {
            tracing::warn!(object_id = %object_id, client_id, "seal from a non-creator connection");
        }
        Ok(())
    }

    fn abort(&mut self, client_id: ClientId, object_id: ObjectId) -> PlasmaResult<()> {
        let entry = self
            .objects
            .get(&object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if entry.is_sealed() {
            return Err(PlasmaError::invalid_argument(
                "cannot abort a sealed object",
            ));
        }
        if entry.ref_count() != 1 {
            return Err(PlasmaError::invalid_argument(
                "cannot abort an object with outstanding references",
            ));
        }
        let holds = self
            .clients
            .get(&client_id)
            .is_some_and(|c| c.object_ids.contains(&object_id));
        if !holds {
            return Err(PlasmaError::invalid_argument(
                "only the creator may abort an object",
            ));
        }

        if let Some(client) = self.clients.get_mut(&client_id) {
            client.object_ids.remove(&object_id);
        }
        self.objects.get_mut(&object_id).unwrap().decr_ref();
        self.delete_now(&object_id, false);
        Ok(())
    }

    /// Drop `client_id`'s reference on `object_id`. On the 1 → 0
    /// transition the object becomes evictable, or is removed outright if
    /// a Delete was deferred on it.
    fn remove_reference(
        &mut self,
        client_id: ClientId,
        object_id: &ObjectId,
    ) -> PlasmaResult<()> {
        let client = self
            .clients
            .get_mut(&client_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if !client.object_ids.remove(object_id) {
            return Err(PlasmaError::ObjectNonexistent);
        }
        let Some(entry) = self.objects.get_mut(object_id) else {
            return Err(PlasmaError::ObjectNonexistent);
        };
        entry.decr_ref();
        let (ref_count, is_sealed, size) =
            (entry.ref_count(), entry.is_sealed(), entry.allocation().size as i64);

        if ref_count == 0 {
            if self.objects.is_pending_delete(object_id) {
                self.delete_now(object_id, is_sealed);
            } else if is_sealed {
                self.eviction.end_object_access(*object_id, size);
            }
        }
        Ok(())
    }

    fn delete_one(&mut self, object_id: &ObjectId) -> ErrorCode {
        let Some(entry) = self.objects.get(object_id) else {
            return ErrorCode::ObjectNonexistent;
        };
        if entry.ref_count() > 0 || !entry.is_sealed() {
            // Deferred: removed when the last reference goes away.
            self.objects.mark_pending_delete(*object_id);
        } else {
            self.delete_now(object_id, true);
        }
        ErrorCode::Ok
    }

    /// Remove an unreferenced entry, free its range, and (for sealed
    /// objects) notify subscribers of the deletion.
    fn delete_now(&mut self, object_id: &ObjectId, notify: bool) {
        let info = self.objects.get(object_id).map(|entry| ObjectInfo {
            digest: None,
            is_deletion: true,
            ..entry.object_info()
        });
        match self.objects.remove_object(object_id) {
            Ok(allocation) => {
                tracing::debug!(object_id = %object_id, "deleting object");
                self.eviction.remove_object(object_id);
                self.allocator.free(allocation);
                if notify {
                    if let Some(info) = info {
                        self.subscribers.push_all(&info);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(object_id = %object_id, "delete failed: {e}");
            }
        }
    }

    fn get_begin(
        &mut self,
        client_id: ClientId,
        object_ids: Vec<ObjectId>,
        timeout_ms: i64,
    ) -> GetOutcome {
        let mut resolved: HashMap<ObjectId, ResolvedObject> = HashMap::new();
        let mut unique = HashSet::new();
        for object_id in &object_ids {
            if !unique.insert(*object_id) {
                continue;
            }
            if let Some(entry) = self.objects.get(object_id) {
                if entry.is_sealed() {
                    resolved.insert(
                        *object_id,
                        ResolvedObject {
                            spec: entry.spec(),
                            ipc_handle: entry.ipc_handle().to_vec(),
                        },
                    );
                }
            }
        }
        for object_id in resolved.keys() {
            add_reference(
                &mut self.clients,
                &mut self.objects,
                &mut self.eviction,
                client_id,
                object_id,
            );
        }

        if resolved.len() >= unique.len() || timeout_ms == 0 {
            return GetOutcome::Ready(self.assemble_get(client_id, object_ids, resolved));
        }

        let (request_id, receiver) = self.waiters.park_get(client_id, object_ids, resolved);
        GetOutcome::Parked(ParkedRequest {
            request_id,
            receiver,
        })
    }

    fn assemble_get(
        &mut self,
        client_id: ClientId,
        object_ids: Vec<ObjectId>,
        resolved: HashMap<ObjectId, ResolvedObject>,
    ) -> GetResultData {
        let mut specs = Vec::with_capacity(object_ids.len());
        let mut store_fds = Vec::new();
        let mut mmap_sizes = Vec::new();
        let mut fds_to_send = Vec::new();
        let mut ipc_handles = Vec::new();

        for object_id in &object_ids {
            match resolved.get(object_id) {
                Some(resolution) => {
                    specs.push(resolution.spec);
                    if resolution.spec.device_num > 0 {
                        ipc_handles.push(resolution.ipc_handle.clone());
                    }
                    let segment_index = resolution.spec.segment_index;
                    let (fd, mmap_size) = self.segment_handle_for(client_id, segment_index);
                    if let Some(fd) = fd {
                        store_fds.push(segment_index);
                        mmap_sizes.push(mmap_size);
                        fds_to_send.push(fd);
                    }
                }
                None => specs.push(PlasmaObjectSpec::sentinel()),
            }
        }

        GetResultData {
            object_ids,
            specs,
            store_fds,
            mmap_sizes,
            ipc_handles,
            fds_to_send,
        }
    }

    fn wait_begin(
        &mut self,
        client_id: ClientId,
        object_requests: Vec<ObjectRequestSpec>,
        num_ready: i32,
        timeout_ms: i64,
    ) -> WaitOutcome {
        let num_ready = (num_ready.max(0) as usize).min(object_requests.len());

        let mut satisfied = HashMap::new();
        for request in &object_requests {
            if self.objects.contains_sealed(&request.object_id) {
                satisfied.insert(request.object_id, ObjectStatus::Local);
            }
        }

        if satisfied.len() >= num_ready || timeout_ms == 0 {
            return WaitOutcome::Ready(Self::assemble_wait(object_requests, satisfied));
        }

        let (request_id, receiver) =
            self.waiters
                .park_wait(client_id, object_requests, satisfied, num_ready);
        WaitOutcome::Parked(ParkedRequest {
            request_id,
            receiver,
        })
    }

    fn assemble_wait(
        object_requests: Vec<ObjectRequestSpec>,
        satisfied: HashMap<ObjectId, ObjectStatus>,
    ) -> WaitResultData {
        let num_ready = satisfied.len() as i32;
        let object_replies = object_requests
            .into_iter()
            .map(|request| ObjectReply {
                object_id: request.object_id,
                status: satisfied
                    .get(&request.object_id)
                    .copied()
                    .unwrap_or_else(|| crate::waiters::unresolved_status(request.query)),
            })
            .collect();
        WaitResultData {
            object_replies,
            num_ready,
        }
    }

    /// Segment fd and mapping size for a reply, attaching the fd only the
    /// first time this connection references the segment.
    fn segment_handle_for(&mut self, client_id: ClientId, segment_index: i32) -> (Option<RawFd>, i64) {
        let segment = self
            .allocator
            .segment(segment_index)
            .expect("live object references a missing segment");
        let mmap_size = segment.size() as i64;
        let raw_fd = segment.raw_fd();
        let newly = self
            .clients
            .get_mut(&client_id)
            .map(|client| client.segments_sent.insert(segment_index))
            .unwrap_or(false);
        (newly.then_some(raw_fd), mmap_size)
    }

    fn disconnect(&mut self, client_id: ClientId) {
        self.waiters.remove_client(client_id);
        self.subscribers.remove(client_id);
        let Some(client) = self.clients.remove(&client_id) else {
            return;
        };

        for object_id in client.object_ids {
            let Some(entry) = self.objects.get_mut(&object_id) else {
                continue;
            };
            entry.decr_ref();
            let (ref_count, is_sealed, size) = (
                entry.ref_count(),
                entry.is_sealed(),
                entry.allocation().size as i64,
            );
            if ref_count > 0 {
                continue;
            }
            if !is_sealed {
                // The dying connection was the creator; abort the object.
                self.delete_now(&object_id, false);
            } else if self.objects.is_pending_delete(&object_id) {
                self.delete_now(&object_id, true);
            } else {
                self.eviction.end_object_access(object_id, size);
            }
        }
    }
}

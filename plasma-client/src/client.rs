// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The plasma client: connection, object cache, and zero-copy views.
//!
//! The client owns its socket exclusively; callers that share one client
//! across threads get serialization through its internal mutex, but a Get
//! parked in the store blocks the socket for everyone — use one client per
//! thread for independent blocking reads.
//!
//! Reference counting: each `Create`/`Get` bumps a per-object local count;
//! dropping a view (or calling `release`) decrements it, and the count
//! reaching zero sends the store a Release so the store-side count moves
//! in lockstep. Sealing drops the creator's reference on both sides at
//! once, so no Release is sent for it.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use plasma_common::error::{ErrorCode, PlasmaError, PlasmaResult};
use plasma_common::id::{Digest, ObjectId};
use plasma_protocol::frame;
use plasma_protocol::messages::{
    AbortReply, AbortRequest, ConnectReply, ContainsReply, ContainsRequest, CreateReply,
    CreateRequest, DataReply, DataRequest, DeleteReply, DeleteRequest, EvictReply, EvictRequest,
    FetchRequest, GetReply, GetRequest, ListReply, MessageTag, ObjectInfo, ObjectReply,
    ObjectRequestSpec, ObjectStatus, PlasmaObjectSpec, ReleaseReply, ReleaseRequest, SealReply,
    SealRequest, StatusReply, StatusRequest, WaitReply, WaitRequest,
};

use crate::digest::compute_object_digest;
use crate::segment::MappedSegment;

/// One held object: its location, its mapping, and the local view count.
struct ClientView {
    spec: PlasmaObjectSpec,
    segment: Arc<MappedSegment>,
    local_refs: i32,
    sealed: bool,
}

struct ClientInner {
    stream: UnixStream,
    memory_capacity: i64,
    /// Segment mappings, cached for the life of the connection.
    segments: HashMap<i32, Arc<MappedSegment>>,
    objects: HashMap<ObjectId, ClientView>,
}

impl ClientInner {
    /// Send a request and read its reply, which must carry `expected`.
    fn transact(
        &mut self,
        tag: MessageTag,
        body: &[u8],
        expected: MessageTag,
    ) -> PlasmaResult<(Vec<u8>, Vec<OwnedFd>)> {
        let conn = self.stream.as_raw_fd();
        frame::send_frame(conn, tag.as_u64(), body, &[])?;
        let (reply_tag, reply_body, fds) = frame::recv_frame(conn)?;
        if reply_tag != expected.as_u64() {
            return Err(PlasmaError::invalid_argument(format!(
                "expected {:?} reply, got tag {}",
                expected, reply_tag
            )));
        }
        Ok((reply_body, fds))
    }

    /// Map segments that arrived with a reply and cache them by index.
    fn install_segments(
        &mut self,
        store_fds: &[i32],
        mmap_sizes: &[i64],
        fds: Vec<OwnedFd>,
    ) -> PlasmaResult<()> {
        if store_fds.len() != fds.len() {
            return Err(PlasmaError::invalid_argument(format!(
                "reply names {} segments but attached {} fds",
                store_fds.len(),
                fds.len()
            )));
        }
        for ((segment_index, mmap_size), fd) in
            store_fds.iter().zip(mmap_sizes.iter()).zip(fds)
        {
            if self.segments.contains_key(segment_index) {
                continue; // already mapped; never remap
            }
            let segment = MappedSegment::map(fd, *mmap_size as usize)?;
            self.segments.insert(*segment_index, Arc::new(segment));
        }
        Ok(())
    }

    fn segment_for(&self, spec: &PlasmaObjectSpec) -> PlasmaResult<Arc<MappedSegment>> {
        self.segments
            .get(&spec.segment_index)
            .cloned()
            .ok_or_else(|| {
                PlasmaError::invalid_argument(format!(
                    "segment {} was never mapped on this connection",
                    spec.segment_index
                ))
            })
    }

    /// Decrement the local count; at zero, drop the view and tell the
    /// store.
    fn release_local(&mut self, object_id: &ObjectId) -> PlasmaResult<()> {
        let view = self
            .objects
            .get_mut(object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        view.local_refs -= 1;
        if view.local_refs > 0 {
            return Ok(());
        }
        self.objects.remove(object_id);

        let request = ReleaseRequest {
            object_id: *object_id,
        };
        let (body, _) = self.transact(
            MessageTag::ReleaseRequest,
            &request.encode(),
            MessageTag::ReleaseReply,
        )?;
        ReleaseReply::decode(&body)?.error.into_result()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = frame::send_frame(
            self.stream.as_raw_fd(),
            MessageTag::DisconnectClient.as_u64(),
            &[],
            &[],
        );
    }
}

/// Handle to the store. Cheap to clone views out of; serialize blocking
/// calls externally when shared.
pub struct PlasmaClient {
    inner: Arc<Mutex<ClientInner>>,
}

impl PlasmaClient {
    /// Connect to a store and learn its memory capacity.
    pub fn connect(socket_path: impl AsRef<Path>) -> PlasmaResult<Self> {
        let stream = UnixStream::connect(socket_path)?;
        let mut inner = ClientInner {
            stream,
            memory_capacity: 0,
            segments: HashMap::new(),
            objects: HashMap::new(),
        };
        let (body, _) =
            inner.transact(MessageTag::ConnectRequest, &[], MessageTag::ConnectReply)?;
        inner.memory_capacity = ConnectReply::decode(&body)?.memory_capacity;
        tracing::debug!(memory_capacity = inner.memory_capacity, "connected to store");
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn memory_capacity(&self) -> i64 {
        self.inner.lock().memory_capacity
    }

    /// Create an object and return a writable view of its buffers. The
    /// object stays invisible to other clients until sealed; call `seal`
    /// to publish it or `abort` to drop it.
    pub fn create(
        &self,
        object_id: ObjectId,
        data_size: i64,
        metadata_size: i64,
        device_num: i32,
    ) -> PlasmaResult<ObjectBuilder> {
        let mut inner = self.inner.lock();
        let request = CreateRequest {
            object_id,
            data_size,
            metadata_size,
            device_num,
        };
        let (body, fds) = inner.transact(
            MessageTag::CreateRequest,
            &request.encode(),
            MessageTag::CreateReply,
        )?;
        let reply = CreateReply::decode(&body)?;
        reply.error.into_result()?;

        if !fds.is_empty() {
            inner.install_segments(&[reply.store_fd_index], &[reply.mmap_size], fds)?;
        }
        let segment = inner.segment_for(&reply.spec)?;
        inner.objects.insert(
            object_id,
            ClientView {
                spec: reply.spec,
                segment: Arc::clone(&segment),
                local_refs: 1,
                sealed: false,
            },
        );

        Ok(ObjectBuilder {
            object_id,
            spec: reply.spec,
            segment,
        })
    }

    /// Compute the payload digest, seal the object, and drop the
    /// creator's reference. Returns the digest sent to the store.
    pub fn seal(&self, object_id: ObjectId) -> PlasmaResult<Digest> {
        let mut inner = self.inner.lock();
        let view = inner
            .objects
            .get(&object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if view.sealed {
            return Err(PlasmaError::invalid_argument("object is already sealed"));
        }

        let spec = view.spec;
        let data = view.segment.slice(spec.data_offset, spec.data_size)?;
        let metadata = view
            .segment
            .slice(spec.metadata_offset, spec.metadata_size)?;
        let digest = compute_object_digest(data, metadata);

        let request = SealRequest { object_id, digest };
        let (body, _) = inner.transact(
            MessageTag::SealRequest,
            &request.encode(),
            MessageTag::SealReply,
        )?;
        SealReply::decode(&body)?.error.into_result()?;

        // The store released the creator's reference as part of the seal;
        // drop the local view without sending a Release.
        inner.objects.remove(&object_id);
        Ok(digest)
    }

    /// Abort an object this client created and has not sealed.
    pub fn abort(&self, object_id: ObjectId) -> PlasmaResult<()> {
        let mut inner = self.inner.lock();
        let view = inner
            .objects
            .get(&object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if view.sealed {
            return Err(PlasmaError::invalid_argument("cannot abort a sealed object"));
        }
        if view.local_refs != 1 {
            return Err(PlasmaError::invalid_argument(
                "cannot abort an object with outstanding views",
            ));
        }

        let request = AbortRequest { object_id };
        let (body, _) = inner.transact(
            MessageTag::AbortRequest,
            &request.encode(),
            MessageTag::AbortReply,
        )?;
        AbortReply::decode(&body)?.error.into_result()?;
        inner.objects.remove(&object_id);
        Ok(())
    }

    /// Fetch read-only views of sealed objects, blocking up to
    /// `timeout_ms` (0 polls, negative blocks indefinitely). The result
    /// has one entry per requested id in order; `None` marks an id that
    /// was not sealed before the deadline.
    pub fn get(
        &self,
        object_ids: &[ObjectId],
        timeout_ms: i64,
    ) -> PlasmaResult<Vec<Option<ObjectBuffer>>> {
        let mut inner = self.inner.lock();
        let request = GetRequest {
            object_ids: object_ids.to_vec(),
            timeout_ms,
        };
        let (body, fds) = inner.transact(
            MessageTag::GetRequest,
            &request.encode(),
            MessageTag::GetReply,
        )?;
        let reply = GetReply::decode(&body)?;
        inner.install_segments(&reply.store_fds, &reply.mmap_sizes, fds)?;

        let mut resolved = Vec::with_capacity(reply.object_ids.len());
        for (object_id, spec) in reply.object_ids.iter().zip(reply.specs.iter()) {
            if spec.is_sentinel() {
                resolved.push(None);
                continue;
            }
            let segment = if inner.objects.contains_key(object_id) {
                let view = inner.objects.get_mut(object_id).unwrap();
                view.local_refs += 1;
                Arc::clone(&view.segment)
            } else {
                let segment = inner.segment_for(spec)?;
                inner.objects.insert(
                    *object_id,
                    ClientView {
                        spec: *spec,
                        segment: Arc::clone(&segment),
                        local_refs: 1,
                        sealed: true,
                    },
                );
                segment
            };
            resolved.push(Some((*object_id, *spec, segment)));
        }
        drop(inner);

        Ok(resolved
            .into_iter()
            .map(|entry| {
                entry.map(|(object_id, spec, segment)| ObjectBuffer {
                    inner: Arc::clone(&self.inner),
                    object_id,
                    spec,
                    segment,
                })
            })
            .collect())
    }

    /// Drop one local reference; the last one sends the store a Release.
    /// Views released automatically on drop do this for you.
    pub fn release(&self, object_id: ObjectId) -> PlasmaResult<()> {
        self.inner.lock().release_local(&object_id)
    }

    /// True iff the store holds a sealed object with this id.
    pub fn contains(&self, object_id: ObjectId) -> PlasmaResult<bool> {
        let mut inner = self.inner.lock();
        let request = ContainsRequest { object_id };
        let (body, _) = inner.transact(
            MessageTag::ContainsRequest,
            &request.encode(),
            MessageTag::ContainsReply,
        )?;
        Ok(ContainsReply::decode(&body)?.has_object)
    }

    /// Snapshot of every object in the store.
    pub fn list(&self) -> PlasmaResult<Vec<ObjectInfo>> {
        let mut inner = self.inner.lock();
        let (body, _) = inner.transact(MessageTag::ListRequest, &[], MessageTag::ListReply)?;
        Ok(ListReply::decode(&body)?.objects)
    }

    /// Delete objects; per-id outcomes come back in request order.
    pub fn delete(&self, object_ids: &[ObjectId]) -> PlasmaResult<Vec<ErrorCode>> {
        let mut inner = self.inner.lock();
        let request = DeleteRequest {
            object_ids: object_ids.to_vec(),
        };
        let (body, _) = inner.transact(
            MessageTag::DeleteRequest,
            &request.encode(),
            MessageTag::DeleteReply,
        )?;
        Ok(DeleteReply::decode(&body)?.errors)
    }

    /// Ask the store to evict roughly `num_bytes` of unpinned sealed
    /// objects; returns the bytes actually freed.
    pub fn evict(&self, num_bytes: i64) -> PlasmaResult<i64> {
        let mut inner = self.inner.lock();
        let request = EvictRequest { num_bytes };
        let (body, _) = inner.transact(
            MessageTag::EvictRequest,
            &request.encode(),
            MessageTag::EvictReply,
        )?;
        Ok(EvictReply::decode(&body)?.num_bytes)
    }

    /// Hint the fetch manager to pull remote objects. Fire-and-forget.
    pub fn fetch(&self, object_ids: &[ObjectId]) -> PlasmaResult<()> {
        let inner = self.inner.lock();
        let request = FetchRequest {
            object_ids: object_ids.to_vec(),
        };
        frame::send_frame(
            inner.stream.as_raw_fd(),
            MessageTag::FetchRequest.as_u64(),
            &request.encode(),
            &[],
        )?;
        Ok(())
    }

    /// Wait until at least `num_ready` of the requests are satisfied or
    /// the timeout fires. Does not take references.
    pub fn wait(
        &self,
        object_requests: &[ObjectRequestSpec],
        num_ready: i32,
        timeout_ms: i64,
    ) -> PlasmaResult<(Vec<ObjectReply>, i32)> {
        let mut inner = self.inner.lock();
        let request = WaitRequest {
            object_requests: object_requests.to_vec(),
            num_ready,
            timeout_ms,
        };
        let (body, _) = inner.transact(
            MessageTag::WaitRequest,
            &request.encode(),
            MessageTag::WaitReply,
        )?;
        let reply = WaitReply::decode(&body)?;
        Ok((reply.object_replies, reply.num_ready))
    }

    /// Local/nonexistent status for each id.
    pub fn status(&self, object_ids: &[ObjectId]) -> PlasmaResult<Vec<ObjectStatus>> {
        let mut inner = self.inner.lock();
        let request = StatusRequest {
            object_ids: object_ids.to_vec(),
        };
        let (body, _) = inner.transact(
            MessageTag::StatusRequest,
            &request.encode(),
            MessageTag::StatusReply,
        )?;
        Ok(StatusReply::decode(&body)?.statuses)
    }

    /// Sizes of a sealed object, for the transfer path.
    pub fn data_info(
        &self,
        object_id: ObjectId,
        address: &str,
        port: i32,
    ) -> PlasmaResult<DataReply> {
        let mut inner = self.inner.lock();
        let request = DataRequest {
            object_id,
            address: address.to_string(),
            port,
        };
        let (body, _) = inner.transact(
            MessageTag::DataRequest,
            &request.encode(),
            MessageTag::DataReply,
        )?;
        DataReply::decode(&body)
    }

    /// Open a push channel for seal/delete notifications. The store first
    /// replays an entry for every object already sealed.
    pub fn subscribe(&self) -> PlasmaResult<NotificationStream> {
        let (ours, theirs) = socket_pair()?;
        let inner = self.inner.lock();
        frame::send_frame(
            inner.stream.as_raw_fd(),
            MessageTag::SubscribeRequest.as_u64(),
            &[],
            &[theirs.as_raw_fd()],
        )?;
        drop(theirs); // the store holds its own duplicate now
        Ok(NotificationStream { fd: ours })
    }
}

/// Writable view of an object between Create and Seal. The creator is the
/// object's only writer; there is nothing to release — `seal` or `abort`
/// settles the object's fate.
pub struct ObjectBuilder {
    object_id: ObjectId,
    spec: PlasmaObjectSpec,
    segment: Arc<MappedSegment>,
}

impl ObjectBuilder {
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn data_size(&self) -> i64 {
        self.spec.data_size
    }

    pub fn metadata_size(&self) -> i64 {
        self.spec.metadata_size
    }

    pub fn data(&self) -> &[u8] {
        self.segment
            .slice(self.spec.data_offset, self.spec.data_size)
            .expect("object range verified at create")
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.segment
            .slice_mut(self.spec.data_offset, self.spec.data_size)
            .expect("object range verified at create")
    }

    pub fn metadata(&self) -> &[u8] {
        self.segment
            .slice(self.spec.metadata_offset, self.spec.metadata_size)
            .expect("object range verified at create")
    }

    pub fn metadata_mut(&mut self) -> &mut [u8] {
        self.segment
            .slice_mut(self.spec.metadata_offset, self.spec.metadata_size)
            .expect("object range verified at create")
    }
}

/// Read-only view of a sealed object. Dropping the view releases one
/// local reference (and, for the last one, the store-side reference).
pub struct ObjectBuffer {
    inner: Arc<Mutex<ClientInner>>,
    object_id: ObjectId,
    spec: PlasmaObjectSpec,
    segment: Arc<MappedSegment>,
}

impl ObjectBuffer {
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn data_size(&self) -> i64 {
        self.spec.data_size
    }

    pub fn metadata_size(&self) -> i64 {
        self.spec.metadata_size
    }

    pub fn data(&self) -> &[u8] {
        self.segment
            .slice(self.spec.data_offset, self.spec.data_size)
            .expect("object range verified at get")
    }

    pub fn metadata(&self) -> &[u8] {
        self.segment
            .slice(self.spec.metadata_offset, self.spec.metadata_size)
            .expect("object range verified at get")
    }
}

impl Drop for ObjectBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.inner.lock().release_local(&self.object_id) {
            tracing::debug!(object_id = %self.object_id, "release on drop failed: {e}");
        }
    }
}

/// Receiving end of a subscription.
pub struct NotificationStream {
    fd: OwnedFd,
}

impl NotificationStream {
    /// Block for the next seal/delete notification.
    pub fn next(&self) -> PlasmaResult<ObjectInfo> {
        let (tag, body, _) = frame::recv_frame(self.fd.as_raw_fd())?;
        if tag != MessageTag::Notification.as_u64() {
            return Err(PlasmaError::invalid_argument(format!(
                "unexpected tag {tag} on the notification socket"
            )));
        }
        ObjectInfo::decode(&body)
    }
}

fn socket_pair() -> PlasmaResult<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(PlasmaError::Io(std::io::Error::last_os_error()));
    }
    // Safety: socketpair returned two fresh descriptors we now own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

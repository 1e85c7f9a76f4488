// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Request and reply bodies for every protocol operation.
//!
//! Field order within a body is fixed and append-only: new fields may be
//! added at the end of a message and old decoders will ignore them.
//! Connect, List, Subscribe, and DisconnectClient requests have empty
//! bodies and are sent as bare tagged frames.

use plasma_common::error::{ErrorCode, PlasmaError, PlasmaResult};
use plasma_common::id::{Digest, ObjectId};

use crate::wire::{WireReader, WireWriter};

/// Message tags. A closed, versioned enumeration; values are part of the
/// wire format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageTag {
    ConnectRequest = 1,
    ConnectReply = 2,
    CreateRequest = 3,
    CreateReply = 4,
    SealRequest = 5,
    SealReply = 6,
    AbortRequest = 7,
    AbortReply = 8,
    ReleaseRequest = 9,
    ReleaseReply = 10,
    DeleteRequest = 11,
    DeleteReply = 12,
    ContainsRequest = 13,
    ContainsReply = 14,
    ListRequest = 15,
    ListReply = 16,
    GetRequest = 17,
    GetReply = 18,
    FetchRequest = 19,
    WaitRequest = 20,
    WaitReply = 21,
    EvictRequest = 22,
    EvictReply = 23,
    SubscribeRequest = 24,
    StatusRequest = 25,
    StatusReply = 26,
    DataRequest = 27,
    DataReply = 28,
    DisconnectClient = 29,
    Notification = 30,
}

impl MessageTag {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::ConnectRequest),
            2 => Some(Self::ConnectReply),
            3 => Some(Self::CreateRequest),
            4 => Some(Self::CreateReply),
            5 => Some(Self::SealRequest),
            6 => Some(Self::SealReply),
            7 => Some(Self::AbortRequest),
            8 => Some(Self::AbortReply),
            9 => Some(Self::ReleaseRequest),
            10 => Some(Self::ReleaseReply),
            11 => Some(Self::DeleteRequest),
            12 => Some(Self::DeleteReply),
            13 => Some(Self::ContainsRequest),
            14 => Some(Self::ContainsReply),
            15 => Some(Self::ListRequest),
            16 => Some(Self::ListReply),
            17 => Some(Self::GetRequest),
            18 => Some(Self::GetReply),
            19 => Some(Self::FetchRequest),
            20 => Some(Self::WaitRequest),
            21 => Some(Self::WaitReply),
            22 => Some(Self::EvictRequest),
            23 => Some(Self::EvictReply),
            24 => Some(Self::SubscribeRequest),
            25 => Some(Self::StatusRequest),
            26 => Some(Self::StatusReply),
            27 => Some(Self::DataRequest),
            28 => Some(Self::DataReply),
            29 => Some(Self::DisconnectClient),
            30 => Some(Self::Notification),
            _ => None,
        }
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// Where an object may live, as requested by Wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ObjectQuery {
    /// Satisfied only by a sealed object in the local store.
    Local = 1,
    /// Satisfied by a sealed object anywhere (local or remote).
    Anywhere = 2,
}

impl ObjectQuery {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Local),
            2 => Some(Self::Anywhere),
            _ => None,
        }
    }
}

/// Where an object was found, as reported by Wait and Status replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ObjectStatus {
    Local = 1,
    Remote = 2,
    Nonexistent = 3,
    Transfer = 4,
}

impl ObjectStatus {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Local),
            2 => Some(Self::Remote),
            3 => Some(Self::Nonexistent),
            4 => Some(Self::Transfer),
            _ => None,
        }
    }
}

fn get_error_code(r: &mut WireReader<'_>) -> PlasmaResult<ErrorCode> {
    let raw = r.get_i32()?;
    ErrorCode::from_i32(raw)
        .ok_or_else(|| PlasmaError::invalid_argument(format!("unknown error code {raw}")))
}

fn get_object_status(r: &mut WireReader<'_>) -> PlasmaResult<ObjectStatus> {
    let raw = r.get_i32()?;
    ObjectStatus::from_i32(raw)
        .ok_or_else(|| PlasmaError::invalid_argument(format!("unknown object status {raw}")))
}

/// Location of an object's payload inside a shared segment.
///
/// The data and metadata regions are contiguous:
/// `metadata_offset == data_offset + data_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlasmaObjectSpec {
    /// Index of the backing segment; -1 marks a sentinel (object absent).
    pub segment_index: i32,
    pub data_offset: u64,
    pub data_size: i64,
    pub metadata_offset: u64,
    pub metadata_size: i64,
    /// 0 for host memory; nonzero for device memory.
    pub device_num: i32,
}

impl PlasmaObjectSpec {
    /// Placeholder for an object that was not resolved.
    pub fn sentinel() -> Self {
        Self {
            segment_index: -1,
            ..Default::default()
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.segment_index < 0
    }

    fn encode_into(&self, w: &mut WireWriter) {
        w.put_i32(self.segment_index);
        w.put_u64(self.data_offset);
        w.put_i64(self.data_size);
        w.put_u64(self.metadata_offset);
        w.put_i64(self.metadata_size);
        w.put_i32(self.device_num);
    }

    fn decode_from(r: &mut WireReader<'_>) -> PlasmaResult<Self> {
        Ok(Self {
            segment_index: r.get_i32()?,
            data_offset: r.get_u64()?,
            data_size: r.get_i64()?,
            metadata_offset: r.get_u64()?,
            metadata_size: r.get_i64()?,
            device_num: r.get_i32()?,
        })
    }
}

/// Snapshot of one object table entry, used by List replies and
/// subscription notifications. An empty digest means the object has not
/// been sealed; `is_deletion` marks a deletion notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub object_id: ObjectId,
    pub data_size: i64,
    pub metadata_size: i64,
    pub ref_count: i32,
    pub create_time: i64,
    pub construct_duration: i64,
    pub digest: Option<Digest>,
    pub is_deletion: bool,
}

impl ObjectInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode_into(&mut w);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        Self::decode_from(&mut WireReader::new(body))
    }

    fn encode_into(&self, w: &mut WireWriter) {
        w.put_object_id(&self.object_id);
        w.put_i64(self.data_size);
        w.put_i64(self.metadata_size);
        w.put_i32(self.ref_count);
        w.put_i64(self.create_time);
        w.put_i64(self.construct_duration);
        w.put_digest_opt(self.digest.as_ref());
        w.put_bool(self.is_deletion);
    }

    fn decode_from(r: &mut WireReader<'_>) -> PlasmaResult<Self> {
        Ok(Self {
            object_id: r.get_object_id()?,
            data_size: r.get_i64()?,
            metadata_size: r.get_i64()?,
            ref_count: r.get_i32()?,
            create_time: r.get_i64()?,
            construct_duration: r.get_i64()?,
            digest: r.get_digest_opt()?,
            is_deletion: r.get_bool()?,
        })
    }
}

// ─── Connect ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReply {
    pub memory_capacity: i64,
}

impl ConnectReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_i64(self.memory_capacity);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            memory_capacity: r.get_i64()?,
        })
    }
}

// ─── Create ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateRequest {
    pub object_id: ObjectId,
    pub data_size: i64,
    pub metadata_size: i64,
    pub device_num: i32,
}

impl CreateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.put_i64(self.data_size);
        w.put_i64(self.metadata_size);
        w.put_i32(self.device_num);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
            data_size: r.get_i64()?,
            metadata_size: r.get_i64()?,
            device_num: r.get_i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReply {
    pub object_id: ObjectId,
    pub spec: PlasmaObjectSpec,
    /// Index of the segment whose fd may ride on this reply.
    pub store_fd_index: i32,
    /// Total size of that segment's mapping.
    pub mmap_size: i64,
    pub error: ErrorCode,
    /// Opaque device IPC handle; empty for host objects.
    pub ipc_handle: Vec<u8>,
}

impl CreateReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        self.spec.encode_into(&mut w);
        w.put_i32(self.store_fd_index);
        w.put_i64(self.mmap_size);
        w.put_i32(self.error.as_i32());
        w.put_bytes(&self.ipc_handle);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
            spec: PlasmaObjectSpec::decode_from(&mut r)?,
            store_fd_index: r.get_i32()?,
            mmap_size: r.get_i64()?,
            error: get_error_code(&mut r)?,
            ipc_handle: r.get_bytes()?,
        })
    }
}

// ─── Seal ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealRequest {
    pub object_id: ObjectId,
    pub digest: Digest,
}

impl SealRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.put_bytes(self.digest.as_bytes());
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        let object_id = r.get_object_id()?;
        let digest_bytes = r.get_bytes()?;
        Ok(Self {
            object_id,
            digest: Digest::try_from_slice(&digest_bytes)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealReply {
    pub object_id: ObjectId,
    pub error: ErrorCode,
}

impl SealReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.put_i32(self.error.as_i32());
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
            error: get_error_code(&mut r)?,
        })
    }
}

// ─── Abort ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortRequest {
    pub object_id: ObjectId,
}

impl AbortRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortReply {
    pub object_id: ObjectId,
    pub error: ErrorCode,
}

impl AbortReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.put_i32(self.error.as_i32());
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
            error: get_error_code(&mut r)?,
        })
    }
}

// ─── Release ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub object_id: ObjectId,
}

impl ReleaseRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseReply {
    pub object_id: ObjectId,
    pub error: ErrorCode,
}

impl ReleaseReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.put_i32(self.error.as_i32());
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
            error: get_error_code(&mut r)?,
        })
    }
}

// ─── Delete ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub object_ids: Vec<ObjectId>,
}

impl DeleteRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_ids(&self.object_ids);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_ids: r.get_object_ids()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReply {
    pub object_ids: Vec<ObjectId>,
    /// Per-id outcome, same length and order as `object_ids`.
    pub errors: Vec<ErrorCode>,
}

impl DeleteReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_ids(&self.object_ids);
        w.put_count(self.errors.len());
        for error in &self.errors {
            w.put_i32(error.as_i32());
        }
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        let object_ids = r.get_object_ids()?;
        let count = r.get_count()?;
        let mut errors = Vec::with_capacity(count);
        for _ in 0..count {
            errors.push(get_error_code(&mut r)?);
        }
        if errors.len() != object_ids.len() {
            return Err(PlasmaError::invalid_argument(
                "delete reply id and error counts differ",
            ));
        }
        Ok(Self { object_ids, errors })
    }
}

// ─── Contains ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainsRequest {
    pub object_id: ObjectId,
}

impl ContainsRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainsReply {
    pub object_id: ObjectId,
    pub has_object: bool,
}

impl ContainsReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.put_bool(self.has_object);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
            has_object: r.get_bool()?,
        })
    }
}

// ─── List ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListReply {
    pub objects: Vec<ObjectInfo>,
}

impl ListReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_count(self.objects.len());
        for info in &self.objects {
            info.encode_into(&mut w);
        }
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        let count = r.get_count()?;
        let mut objects = Vec::with_capacity(count);
        for _ in 0..count {
            objects.push(ObjectInfo::decode_from(&mut r)?);
        }
        Ok(Self { objects })
    }
}

// ─── Get ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub object_ids: Vec<ObjectId>,
    /// Milliseconds to block; 0 polls, negative blocks indefinitely.
    pub timeout_ms: i64,
}

impl GetRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_ids(&self.object_ids);
        w.put_i64(self.timeout_ms);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_ids: r.get_object_ids()?,
            timeout_ms: r.get_i64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReply {
    pub object_ids: Vec<ObjectId>,
    /// One spec per requested id, in request order; sentinels for ids that
    /// were not resolved before the deadline.
    pub specs: Vec<PlasmaObjectSpec>,
    /// Segment indexes whose fds ride on this reply, in ancillary order.
    pub store_fds: Vec<i32>,
    pub mmap_sizes: Vec<i64>,
    /// Device IPC handles for specs with `device_num > 0`, in spec order.
    pub ipc_handles: Vec<Vec<u8>>,
}

impl GetReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_ids(&self.object_ids);
        w.put_count(self.specs.len());
        for spec in &self.specs {
            spec.encode_into(&mut w);
        }
        w.put_count(self.store_fds.len());
        for fd_index in &self.store_fds {
            w.put_i32(*fd_index);
        }
        w.put_count(self.mmap_sizes.len());
        for size in &self.mmap_sizes {
            w.put_i64(*size);
        }
        w.put_count(self.ipc_handles.len());
        for handle in &self.ipc_handles {
            w.put_bytes(handle);
        }
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        let object_ids = r.get_object_ids()?;

        let count = r.get_count()?;
        let mut specs = Vec::with_capacity(count);
        for _ in 0..count {
            specs.push(PlasmaObjectSpec::decode_from(&mut r)?);
        }

        let count = r.get_count()?;
        let mut store_fds = Vec::with_capacity(count);
        for _ in 0..count {
            store_fds.push(r.get_i32()?);
        }

        let count = r.get_count()?;
        let mut mmap_sizes = Vec::with_capacity(count);
        for _ in 0..count {
            mmap_sizes.push(r.get_i64()?);
        }

        let count = r.get_count()?;
        let mut ipc_handles = Vec::with_capacity(count);
        for _ in 0..count {
            ipc_handles.push(r.get_bytes()?);
        }

        if specs.len() != object_ids.len() || store_fds.len() != mmap_sizes.len() {
            return Err(PlasmaError::invalid_argument(
                "get reply vector lengths are inconsistent",
            ));
        }
        Ok(Self {
            object_ids,
            specs,
            store_fds,
            mmap_sizes,
            ipc_handles,
        })
    }
}

// ─── Fetch ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub object_ids: Vec<ObjectId>,
}

impl FetchRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_ids(&self.object_ids);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_ids: r.get_object_ids()?,
        })
    }
}

// ─── Wait ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRequestSpec {
    pub object_id: ObjectId,
    pub query: ObjectQuery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    pub object_requests: Vec<ObjectRequestSpec>,
    pub num_ready: i32,
    pub timeout_ms: i64,
}

impl WaitRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_count(self.object_requests.len());
        for request in &self.object_requests {
            w.put_object_id(&request.object_id);
            w.put_i32(request.query as i32);
        }
        w.put_i32(self.num_ready);
        w.put_i64(self.timeout_ms);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        let count = r.get_count()?;
        let mut object_requests = Vec::with_capacity(count);
        for _ in 0..count {
            let object_id = r.get_object_id()?;
            let raw = r.get_i32()?;
            let query = ObjectQuery::from_i32(raw).ok_or_else(|| {
                PlasmaError::invalid_argument(format!("unknown object query {raw}"))
            })?;
            object_requests.push(ObjectRequestSpec { object_id, query });
        }
        Ok(Self {
            object_requests,
            num_ready: r.get_i32()?,
            timeout_ms: r.get_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectReply {
    pub object_id: ObjectId,
    pub status: ObjectStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitReply {
    pub object_replies: Vec<ObjectReply>,
    pub num_ready: i32,
}

impl WaitReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_count(self.object_replies.len());
        for reply in &self.object_replies {
            w.put_object_id(&reply.object_id);
            w.put_i32(reply.status as i32);
        }
        w.put_i32(self.num_ready);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        let count = r.get_count()?;
        let mut object_replies = Vec::with_capacity(count);
        for _ in 0..count {
            object_replies.push(ObjectReply {
                object_id: r.get_object_id()?,
                status: get_object_status(&mut r)?,
            });
        }
        Ok(Self {
            object_replies,
            num_ready: r.get_i32()?,
        })
    }
}

// ─── Evict ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictRequest {
    pub num_bytes: i64,
}

impl EvictRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_i64(self.num_bytes);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            num_bytes: r.get_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictReply {
    /// Bytes actually freed.
    pub num_bytes: i64,
}

impl EvictReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_i64(self.num_bytes);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            num_bytes: r.get_i64()?,
        })
    }
}

// ─── Status ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest {
    pub object_ids: Vec<ObjectId>,
}

impl StatusRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_ids(&self.object_ids);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_ids: r.get_object_ids()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub object_ids: Vec<ObjectId>,
    pub statuses: Vec<ObjectStatus>,
}

impl StatusReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_ids(&self.object_ids);
        w.put_count(self.statuses.len());
        for status in &self.statuses {
            w.put_i32(*status as i32);
        }
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        let object_ids = r.get_object_ids()?;
        let count = r.get_count()?;
        let mut statuses = Vec::with_capacity(count);
        for _ in 0..count {
            statuses.push(get_object_status(&mut r)?);
        }
        if statuses.len() != object_ids.len() {
            return Err(PlasmaError::invalid_argument(
                "status reply id and status counts differ",
            ));
        }
        Ok(Self {
            object_ids,
            statuses,
        })
    }
}

// ─── Data ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub object_id: ObjectId,
    pub address: String,
    pub port: i32,
}

impl DataRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.put_string(&self.address);
        w.put_i32(self.port);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
            address: r.get_string()?,
            port: r.get_i32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataReply {
    pub object_id: ObjectId,
    /// -1 when the object is unknown to this store.
    pub object_size: i64,
    pub metadata_size: i64,
}

impl DataReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_object_id(&self.object_id);
        w.put_i64(self.object_size);
        w.put_i64(self.metadata_size);
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> PlasmaResult<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            object_id: r.get_object_id()?,
            object_size: r.get_i64()?,
            metadata_size: r.get_i64()?,
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_oid(val: u8) -> ObjectId {
        let mut data = [0u8; 20];
        data[0] = val;
        ObjectId::from_binary(&data)
    }

    fn make_digest(val: u8) -> Digest {
        Digest::from_binary(&[val; 20])
    }

    fn make_spec(segment: i32) -> PlasmaObjectSpec {
        PlasmaObjectSpec {
            segment_index: segment,
            data_offset: 128,
            data_size: 64,
            metadata_offset: 192,
            metadata_size: 16,
            device_num: 0,
        }
    }

    #[test]
    fn test_message_tag_roundtrip() {
        for raw in 1..=30u64 {
            let tag = MessageTag::from_u64(raw).unwrap();
            assert_eq!(tag.as_u64(), raw);
        }
        assert_eq!(MessageTag::from_u64(0), None);
        assert_eq!(MessageTag::from_u64(31), None);
    }

    #[test]
    fn test_connect_reply() {
        let reply = ConnectReply {
            memory_capacity: 1024 * 1024,
        };
        assert_eq!(ConnectReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_create_request() {
        let request = CreateRequest {
            object_id: make_oid(1),
            data_size: 1024,
            metadata_size: 64,
            device_num: 0,
        };
        assert_eq!(CreateRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_create_reply() {
        let reply = CreateReply {
            object_id: make_oid(2),
            spec: make_spec(0),
            store_fd_index: 0,
            mmap_size: 1024 * 1024,
            error: ErrorCode::Ok,
            ipc_handle: Vec::new(),
        };
        assert_eq!(CreateReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_create_reply_with_error() {
        let reply = CreateReply {
            object_id: make_oid(2),
            spec: PlasmaObjectSpec::sentinel(),
            store_fd_index: -1,
            mmap_size: 0,
            error: ErrorCode::OutOfMemory,
            ipc_handle: Vec::new(),
        };
        let decoded = CreateReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded.error, ErrorCode::OutOfMemory);
        assert!(decoded.spec.is_sentinel());
    }

    #[test]
    fn test_seal_roundtrip() {
        let request = SealRequest {
            object_id: make_oid(3),
            digest: make_digest(0xAA),
        };
        assert_eq!(SealRequest::decode(&request.encode()).unwrap(), request);

        let reply = SealReply {
            object_id: make_oid(3),
            error: ErrorCode::ObjectNonexistent,
        };
        assert_eq!(SealReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_abort_roundtrip() {
        let request = AbortRequest {
            object_id: make_oid(4),
        };
        assert_eq!(AbortRequest::decode(&request.encode()).unwrap(), request);

        let reply = AbortReply {
            object_id: make_oid(4),
            error: ErrorCode::Ok,
        };
        assert_eq!(AbortReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_release_roundtrip() {
        let request = ReleaseRequest {
            object_id: make_oid(5),
        };
        assert_eq!(ReleaseRequest::decode(&request.encode()).unwrap(), request);

        let reply = ReleaseReply {
            object_id: make_oid(5),
            error: ErrorCode::Ok,
        };
        assert_eq!(ReleaseReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_delete_roundtrip() {
        let request = DeleteRequest {
            object_ids: vec![make_oid(1), make_oid(2)],
        };
        assert_eq!(DeleteRequest::decode(&request.encode()).unwrap(), request);

        let reply = DeleteReply {
            object_ids: vec![make_oid(1), make_oid(2)],
            errors: vec![ErrorCode::Ok, ErrorCode::ObjectNonexistent],
        };
        assert_eq!(DeleteReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_delete_reply_mismatched_lengths_rejected() {
        let reply = DeleteReply {
            object_ids: vec![make_oid(1), make_oid(2)],
            errors: vec![ErrorCode::Ok],
        };
        assert!(DeleteReply::decode(&reply.encode()).is_err());
    }

    #[test]
    fn test_contains_roundtrip() {
        let reply = ContainsReply {
            object_id: make_oid(6),
            has_object: true,
        };
        assert_eq!(ContainsReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_list_reply_roundtrip() {
        let reply = ListReply {
            objects: vec![
                ObjectInfo {
                    object_id: make_oid(1),
                    data_size: 100,
                    metadata_size: 20,
                    ref_count: 1,
                    create_time: 1_700_000_000_000,
                    construct_duration: 10,
                    digest: Some(make_digest(0xBB)),
                    is_deletion: false,
                },
                ObjectInfo {
                    object_id: make_oid(2),
                    data_size: 50,
                    metadata_size: 0,
                    ref_count: 0,
                    create_time: 1_700_000_000_001,
                    construct_duration: -1,
                    digest: None,
                    is_deletion: false,
                },
            ],
        };
        assert_eq!(ListReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_get_roundtrip() {
        let request = GetRequest {
            object_ids: vec![make_oid(1), make_oid(2)],
            timeout_ms: -1,
        };
        assert_eq!(GetRequest::decode(&request.encode()).unwrap(), request);

        let reply = GetReply {
            object_ids: vec![make_oid(1), make_oid(2)],
            specs: vec![make_spec(0), PlasmaObjectSpec::sentinel()],
            store_fds: vec![0],
            mmap_sizes: vec![1024 * 1024],
            ipc_handles: Vec::new(),
        };
        let decoded = GetReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded, reply);
        assert!(decoded.specs[1].is_sentinel());
    }

    #[test]
    fn test_fetch_roundtrip() {
        let request = FetchRequest {
            object_ids: vec![make_oid(9)],
        };
        assert_eq!(FetchRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_wait_roundtrip() {
        let request = WaitRequest {
            object_requests: vec![
                ObjectRequestSpec {
                    object_id: make_oid(1),
                    query: ObjectQuery::Local,
                },
                ObjectRequestSpec {
                    object_id: make_oid(2),
                    query: ObjectQuery::Anywhere,
                },
            ],
            num_ready: 1,
            timeout_ms: 500,
        };
        assert_eq!(WaitRequest::decode(&request.encode()).unwrap(), request);

        let reply = WaitReply {
            object_replies: vec![
                ObjectReply {
                    object_id: make_oid(1),
                    status: ObjectStatus::Local,
                },
                ObjectReply {
                    object_id: make_oid(2),
                    status: ObjectStatus::Nonexistent,
                },
            ],
            num_ready: 1,
        };
        assert_eq!(WaitReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_evict_roundtrip() {
        let request = EvictRequest { num_bytes: 4096 };
        assert_eq!(EvictRequest::decode(&request.encode()).unwrap(), request);

        let reply = EvictReply { num_bytes: 8192 };
        assert_eq!(EvictReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_status_roundtrip() {
        let reply = StatusReply {
            object_ids: vec![make_oid(1), make_oid(2)],
            statuses: vec![ObjectStatus::Local, ObjectStatus::Nonexistent],
        };
        assert_eq!(StatusReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_data_roundtrip() {
        let request = DataRequest {
            object_id: make_oid(7),
            address: "127.0.0.1".to_string(),
            port: 12345,
        };
        assert_eq!(DataRequest::decode(&request.encode()).unwrap(), request);

        let reply = DataReply {
            object_id: make_oid(7),
            object_size: 256,
            metadata_size: 16,
        };
        assert_eq!(DataReply::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_notification_roundtrip() {
        let info = ObjectInfo {
            object_id: make_oid(8),
            data_size: 64,
            metadata_size: 4,
            ref_count: 0,
            create_time: 1_700_000_000_000,
            construct_duration: 3,
            digest: Some(make_digest(0xCC)),
            is_deletion: false,
        };
        assert_eq!(ObjectInfo::decode(&info.encode()).unwrap(), info);

        let deletion = ObjectInfo {
            digest: None,
            is_deletion: true,
            ..info
        };
        assert_eq!(ObjectInfo::decode(&deletion.encode()).unwrap(), deletion);
    }

    #[test]
    fn test_decoder_ignores_appended_fields() {
        // A newer peer appends a field the current decoder does not know.
        let mut body = SealReply {
            object_id: make_oid(1),
            error: ErrorCode::Ok,
        }
        .encode();
        body.extend_from_slice(&42i64.to_le_bytes());

        let decoded = SealReply::decode(&body).unwrap();
        assert_eq!(decoded.object_id, make_oid(1));
        assert_eq!(decoded.error, ErrorCode::Ok);
    }

    #[test]
    fn test_truncated_request_rejected() {
        let body = CreateRequest {
            object_id: make_oid(1),
            data_size: 10,
            metadata_size: 0,
            device_num: 0,
        }
        .encode();
        let result = CreateRequest::decode(&body[..body.len() - 2]);
        assert!(matches!(result, Err(PlasmaError::InvalidArgument(_))));
    }
}

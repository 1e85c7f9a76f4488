// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Parked Get and Wait requests.
//!
//! A Get or Wait that cannot complete immediately is parked here, indexed
//! both by request id and by the object ids it still needs. Seal events
//! resolve waiters; the parked connection thread blocks on the request's
//! completion channel and assembles the reply itself, whether woken by a
//! resolution, a timeout, or its peer going away. Entries do not point
//! back at connections, so no cycles arise; disconnect sweeps a client's
//! requests out of both indexes.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};

use plasma_common::id::ObjectId;
use plasma_protocol::messages::{ObjectQuery, ObjectRequestSpec, ObjectStatus, PlasmaObjectSpec};

pub type RequestId = u64;
pub type ClientId = u64;

/// A resolved member of a Get request.
#[derive(Debug, Clone)]
pub struct ResolvedObject {
    pub spec: PlasmaObjectSpec,
    pub ipc_handle: Vec<u8>,
}

/// A parked Get.
pub struct GetRequestState {
    pub client_id: ClientId,
    /// Requested ids in request order; duplicates allowed.
    pub object_ids: Vec<ObjectId>,
    pub resolved: HashMap<ObjectId, ResolvedObject>,
    /// Number of distinct ids that must resolve.
    pub num_to_wait_for: usize,
    sender: Sender<()>,
}

impl GetRequestState {
    pub fn is_complete(&self) -> bool {
        self.resolved.len() >= self.num_to_wait_for
    }
}

/// A parked Wait.
pub struct WaitRequestState {
    pub client_id: ClientId,
    pub object_requests: Vec<ObjectRequestSpec>,
    /// Ids whose requested condition is currently met.
    pub satisfied: HashMap<ObjectId, ObjectStatus>,
    pub num_ready: usize,
    sender: Sender<()>,
}

impl WaitRequestState {
    pub fn is_complete(&self) -> bool {
        self.satisfied.len() >= self.num_ready
    }
}

/// Both waiter indexes: by request id and by awaited object id.
pub struct WaiterTable {
    next_request_id: RequestId,
    get_requests: HashMap<RequestId, GetRequestState>,
    object_get_waiters: HashMap<ObjectId, Vec<RequestId>>,
    wait_requests: HashMap<RequestId, WaitRequestState>,
    object_wait_waiters: HashMap<ObjectId, Vec<RequestId>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self {
            next_request_id: 1,
            get_requests: HashMap::new(),
            object_get_waiters: HashMap::new(),
            wait_requests: HashMap::new(),
            object_wait_waiters: HashMap::new(),
        }
    }

    /// Park a Get whose `resolved` map is still short of every distinct id.
    pub fn park_get(
        &mut self,
        client_id: ClientId,
        object_ids: Vec<ObjectId>,
        resolved: HashMap<ObjectId, ResolvedObject>,
    ) -> (RequestId, Receiver<()>) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let (sender, receiver) = channel();

        let mut num_to_wait_for = 0;
        let mut seen = std::collections::HashSet::new();
        for object_id in &object_ids {
            if !seen.insert(*object_id) {
                continue;
            }
            num_to_wait_for += 1;
            if !resolved.contains_key(object_id) {
                self.object_get_waiters
                    .entry(*object_id)
                    .or_default()
                    .push(request_id);
            }
        }

        self.get_requests.insert(
            request_id,
            GetRequestState {
                client_id,
                object_ids,
                resolved,
                num_to_wait_for,
                sender,
            },
        );
        (request_id, receiver)
    }

    /// Park a Wait that has not yet reached `num_ready` satisfied ids.
    pub fn park_wait(
        &mut self,
        client_id: ClientId,
        object_requests: Vec<ObjectRequestSpec>,
        satisfied: HashMap<ObjectId, ObjectStatus>,
        num_ready: usize,
    ) -> (RequestId, Receiver<()>) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let (sender, receiver) = channel();

        for request in &object_requests {
            if !satisfied.contains_key(&request.object_id) {
                self.object_wait_waiters
                    .entry(request.object_id)
                    .or_default()
                    .push(request_id);
            }
        }

        self.wait_requests.insert(
            request_id,
            WaitRequestState {
                client_id,
                object_requests,
                satisfied,
                num_ready,
                sender,
            },
        );
        (request_id, receiver)
    }

    /// An object was sealed: resolve every Get parked on it (invoking
    /// `add_reference(client_id)` the first time each request resolves it)
    /// and mark every Wait parked on it satisfied. Completed requests are
    /// signaled; their parked threads assemble the replies.
    pub fn object_sealed(
        &mut self,
        object_id: &ObjectId,
        spec: PlasmaObjectSpec,
        ipc_handle: &[u8],
        mut add_reference: impl FnMut(ClientId),
    ) {
        for request_id in self.object_get_waiters.remove(object_id).unwrap_or_default() {
            let Some(request) = self.get_requests.get_mut(&request_id) else {
                continue;
            };
            let newly = request
                .resolved
                .insert(
                    *object_id,
                    ResolvedObject {
                        spec,
                        ipc_handle: ipc_handle.to_vec(),
                    },
                )
                .is_none();
            if newly {
                add_reference(request.client_id);
            }
            if request.is_complete() {
                let _ = request.sender.send(());
            }
        }

        for request_id in self
            .object_wait_waiters
            .remove(object_id)
            .unwrap_or_default()
        {
            let Some(request) = self.wait_requests.get_mut(&request_id) else {
                continue;
            };
            // Local satisfies both Local and Anywhere queries.
            request.satisfied.insert(*object_id, ObjectStatus::Local);
            if request.is_complete() {
                let _ = request.sender.send(());
            }
        }
    }

    /// Remove and return a Get, scrubbing it from the per-object index.
    /// The parked thread calls this exactly once, on wake-up or timeout.
    pub fn take_get(&mut self, request_id: RequestId) -> Option<GetRequestState> {
        let request = self.get_requests.remove(&request_id)?;
        for object_id in &request.object_ids {
            Self::scrub(&mut self.object_get_waiters, object_id, request_id);
        }
        Some(request)
    }

    /// Remove and return a Wait, scrubbing it from the per-object index.
    pub fn take_wait(&mut self, request_id: RequestId) -> Option<WaitRequestState> {
        let request = self.wait_requests.remove(&request_id)?;
        for spec in &request.object_requests {
            Self::scrub(&mut self.object_wait_waiters, &spec.object_id, request_id);
        }
        Some(request)
    }

    /// Drop every request owned by a disconnecting client.
    pub fn remove_client(&mut self, client_id: ClientId) {
        let get_ids: Vec<RequestId> = self
            .get_requests
            .iter()
            .filter(|(_, r)| r.client_id == client_id)
            .map(|(id, _)| *id)
            .collect();
        for request_id in get_ids {
            self.take_get(request_id);
        }

        let wait_ids: Vec<RequestId> = self
            .wait_requests
            .iter()
            .filter(|(_, r)| r.client_id == client_id)
            .map(|(id, _)| *id)
            .collect();
        for request_id in wait_ids {
            self.take_wait(request_id);
        }
    }

    pub fn num_parked_gets(&self) -> usize {
        self.get_requests.len()
    }

    pub fn num_parked_waits(&self) -> usize {
        self.wait_requests.len()
    }

    fn scrub(
        index: &mut HashMap<ObjectId, Vec<RequestId>>,
        object_id: &ObjectId,
        request_id: RequestId,
    ) {
        if let Some(waiters) = index.get_mut(object_id) {
            waiters.retain(|id| *id != request_id);
            if waiters.is_empty() {
                index.remove(object_id);
            }
        }
    }
}

impl Default for WaiterTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the statuses a Wait reply reports for ids that never resolved.
pub fn unresolved_status(query: ObjectQuery) -> ObjectStatus {
    match query {
        ObjectQuery::Local | ObjectQuery::Anywhere => ObjectStatus::Nonexistent,
    }
}

// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Seal/delete notifications pushed to subscribers.
//!
//! Each subscriber registers a dedicated socket (one end of a socketpair
//! the client created). Pushes are fire-and-forget: a subscriber whose
//! socket is full or closed is dropped.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};

use plasma_protocol::frame;
use plasma_protocol::messages::{MessageTag, ObjectInfo};

pub type ClientId = u64;

/// Registry of per-client push channels.
pub struct SubscriberTable {
    subscribers: HashMap<ClientId, OwnedFd>,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
        }
    }

    /// Register a push channel for a client. The socket is switched to
    /// non-blocking so a slow subscriber can never stall the store.
    pub fn add(&mut self, client_id: ClientId, fd: OwnedFd) {
        set_nonblocking(&fd);
        tracing::debug!(client_id, "subscriber registered");
        self.subscribers.insert(client_id, fd);
    }

    pub fn remove(&mut self, client_id: ClientId) {
        self.subscribers.remove(&client_id);
    }

    pub fn is_subscribed(&self, client_id: ClientId) -> bool {
        self.subscribers.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Push one notification to every subscriber, dropping any whose
    /// socket rejects the write.
    pub fn push_all(&mut self, info: &ObjectInfo) {
        let body = info.encode();
        self.subscribers.retain(|client_id, fd| {
            match frame::send_frame(fd.as_raw_fd(), MessageTag::Notification.as_u64(), &body, &[])
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(client_id, "dropping subscriber: {e}");
                    false
                }
            }
        });
    }

    /// Push one notification to a single subscriber. Returns false (and
    /// removes the subscription) if the push failed.
    pub fn push_to(&mut self, client_id: ClientId, info: &ObjectInfo) -> bool {
        let Some(fd) = self.subscribers.get(&client_id) else {
            return false;
        };
        let body = info.encode();
        match frame::send_frame(fd.as_raw_fd(), MessageTag::Notification.as_u64(), &body, &[]) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(client_id, "dropping subscriber: {e}");
                self.subscribers.remove(&client_id);
                false
            }
        }
    }
}

impl Default for SubscriberTable {
    fn default() -> Self {
        Self::new()
    }
}

fn set_nonblocking(fd: &OwnedFd) {
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plasma_common::id::{Digest, ObjectId};
    use std::os::fd::FromRawFd;

    fn socket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        let ret =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn make_info(val: u8, is_deletion: bool) -> ObjectInfo {
        ObjectInfo {
            object_id: ObjectId::from_binary(&[val; 20]),
            data_size: 10,
            metadata_size: 0,
            ref_count: 0,
            create_time: 0,
            construct_duration: 0,
            digest: (!is_deletion).then(|| Digest::from_binary(&[val; 20])),
            is_deletion,
        }
    }

    #[test]
    fn test_push_reaches_subscriber() {
        let mut table = SubscriberTable::new();
        let (store_end, client_end) = socket_pair();
        table.add(1, store_end);

        let info = make_info(5, false);
        table.push_all(&info);
        assert_eq!(table.len(), 1);

        let (tag, body, _) = frame::recv_frame(client_end.as_raw_fd()).unwrap();
        assert_eq!(tag, MessageTag::Notification.as_u64());
        assert_eq!(ObjectInfo::decode(&body).unwrap(), info);
    }

    #[test]
    fn test_closed_subscriber_is_dropped() {
        let mut table = SubscriberTable::new();
        let (store_end, client_end) = socket_pair();
        table.add(1, store_end);
        drop(client_end);

        table.push_all(&make_info(5, false));
        assert!(table.is_empty());
    }

    #[test]
    fn test_push_to_single_subscriber() {
        let mut table = SubscriberTable::new();
        let (store_a, client_a) = socket_pair();
        let (store_b, client_b) = socket_pair();
        table.add(1, store_a);
        table.add(2, store_b);

        assert!(table.push_to(1, &make_info(9, true)));

        let (_, body, _) = frame::recv_frame(client_a.as_raw_fd()).unwrap();
        let info = ObjectInfo::decode(&body).unwrap();
        assert!(info.is_deletion);
        assert_eq!(info.digest, None);

        // Client B saw nothing.
        assert!(frame::peer_closed(client_b.as_raw_fd()) == false);
    }
}

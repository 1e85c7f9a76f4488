// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The store server: accepts connections on a UNIX-domain socket and
//! drives one request loop per connection.
//!
//! Request handling is synchronous and in arrival order per connection;
//! a Get or Wait that cannot complete parks its connection thread on the
//! request's completion channel, so later replies on that connection
//! serialize behind it. Any framing error tears the connection down and
//! releases everything it held.

use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use plasma_common::error::{ErrorCode, PlasmaError, PlasmaResult};
use plasma_protocol::frame;
use plasma_protocol::messages::{
    AbortReply, AbortRequest, ConnectReply, ContainsReply, ContainsRequest, CreateReply,
    CreateRequest, DataReply, DataRequest, DeleteReply, DeleteRequest, EvictReply, EvictRequest,
    FetchRequest, GetReply, GetRequest, ListReply, MessageTag, PlasmaObjectSpec, ReleaseReply,
    ReleaseRequest, SealReply, SealRequest, StatusReply, StatusRequest, WaitReply, WaitRequest,
};

use crate::store::{ClientId, GetOutcome, ParkedRequest, PlasmaStore, WaitOutcome};

/// How often a parked request checks whether its peer went away.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Listener plus the shared store.
pub struct StoreServer {
    store: Arc<PlasmaStore>,
    listener: UnixListener,
}

impl StoreServer {
    /// Bind the listening socket, replacing a stale socket file if one is
    /// left over from a previous run.
    pub fn bind(store: Arc<PlasmaStore>, socket_name: &str) -> PlasmaResult<Self> {
        let path = Path::new(socket_name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        tracing::info!(socket_name, "plasma store listening");
        Ok(Self { store, listener })
    }

    /// Accept connections until the listener fails. Each connection gets
    /// its own thread and client identity.
    pub fn run(self) {
        let mut next_client_id: ClientId = 1;
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let client_id = next_client_id;
                    next_client_id += 1;
                    self.store.register_client(client_id);
                    tracing::info!(client_id, "new connection");

                    let store = Arc::clone(&self.store);
                    std::thread::spawn(move || serve_connection(store, stream, client_id));
                }
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

fn serve_connection(store: Arc<PlasmaStore>, stream: UnixStream, client_id: ClientId) {
    let conn = stream.as_raw_fd();
    loop {
        let (raw_tag, body, fds) = match frame::recv_frame(conn) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(client_id, "connection closed: {e}");
                break;
            }
        };
        match handle_message(&store, conn, client_id, raw_tag, &body, fds) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::warn!(client_id, "dropping connection: {e}");
                break;
            }
        }
    }
    store.disconnect(client_id);
}

/// Handle one request. `Ok(false)` ends the connection cleanly; an error
/// drops it.
fn handle_message(
    store: &Arc<PlasmaStore>,
    conn: i32,
    client_id: ClientId,
    raw_tag: u64,
    body: &[u8],
    fds: Vec<std::os::fd::OwnedFd>,
) -> PlasmaResult<bool> {
    let Some(tag) = MessageTag::from_u64(raw_tag) else {
        return Err(PlasmaError::invalid_argument(format!(
            "unknown message tag {raw_tag}"
        )));
    };

    match tag {
        MessageTag::ConnectRequest => {
            let reply = ConnectReply {
                memory_capacity: store.memory_capacity(),
            };
            send_reply(conn, MessageTag::ConnectReply, reply.encode(), &[])?;
        }
        MessageTag::CreateRequest => {
            let request = CreateRequest::decode(body)?;
            let reply = match store.create(
                client_id,
                request.object_id,
                request.data_size,
                request.metadata_size,
                request.device_num,
            ) {
                Ok(result) => {
                    let fds_to_send: Vec<i32> = result.fd_to_send.into_iter().collect();
                    let reply = CreateReply {
                        object_id: request.object_id,
                        spec: result.spec,
                        store_fd_index: result.store_fd_index,
                        mmap_size: result.mmap_size,
                        error: ErrorCode::Ok,
                        ipc_handle: result.ipc_handle,
                    };
                    send_reply(conn, MessageTag::CreateReply, reply.encode(), &fds_to_send)?;
                    return Ok(true);
                }
                Err(e) => CreateReply {
                    object_id: request.object_id,
                    spec: PlasmaObjectSpec::sentinel(),
                    store_fd_index: -1,
                    mmap_size: 0,
                    error: ErrorCode::from_error(&e),
                    ipc_handle: Vec::new(),
                },
            };
            send_reply(conn, MessageTag::CreateReply, reply.encode(), &[])?;
        }
        MessageTag::SealRequest => {
            let request = SealRequest::decode(body)?;
            let result = store.seal(client_id, request.object_id, request.digest);
            let reply = SealReply {
                object_id: request.object_id,
                error: ErrorCode::from_result(&result),
            };
            send_reply(conn, MessageTag::SealReply, reply.encode(), &[])?;
        }
        MessageTag::AbortRequest => {
            let request = AbortRequest::decode(body)?;
            let result = store.abort(client_id, request.object_id);
            let reply = AbortReply {
                object_id: request.object_id,
                error: ErrorCode::from_result(&result),
            };
            send_reply(conn, MessageTag::AbortReply, reply.encode(), &[])?;
        }
        MessageTag::ReleaseRequest => {
            let request = ReleaseRequest::decode(body)?;
            let result = store.release(client_id, request.object_id);
            let reply = ReleaseReply {
                object_id: request.object_id,
                error: ErrorCode::from_result(&result),
            };
            send_reply(conn, MessageTag::ReleaseReply, reply.encode(), &[])?;
        }
        MessageTag::DeleteRequest => {
            let request = DeleteRequest::decode(body)?;
            let errors = store.delete(&request.object_ids);
            let reply = DeleteReply {
                object_ids: request.object_ids,
                errors,
            };
            send_reply(conn, MessageTag::DeleteReply, reply.encode(), &[])?;
        }
        MessageTag::ContainsRequest => {
            let request = ContainsRequest::decode(body)?;
            let reply = ContainsReply {
                object_id: request.object_id,
                has_object: store.contains(&request.object_id),
            };
            send_reply(conn, MessageTag::ContainsReply, reply.encode(), &[])?;
        }
        MessageTag::ListRequest => {
            let reply = ListReply {
                objects: store.list(),
            };
            send_reply(conn, MessageTag::ListReply, reply.encode(), &[])?;
        }
        MessageTag::GetRequest => {
            let request = GetRequest::decode(body)?;
            let result = match store.get_begin(client_id, request.object_ids, request.timeout_ms)
            {
                GetOutcome::Ready(result) => result,
                GetOutcome::Parked(parked) => {
                    park(conn, &parked, request.timeout_ms);
                    store.get_finish(parked.request_id).ok_or_else(|| {
                        PlasmaError::invalid_argument("parked get vanished")
                    })?
                }
            };
            let reply = GetReply {
                object_ids: result.object_ids,
                specs: result.specs,
                store_fds: result.store_fds,
                mmap_sizes: result.mmap_sizes,
                ipc_handles: result.ipc_handles,
            };
            send_reply(conn, MessageTag::GetReply, reply.encode(), &result.fds_to_send)?;
        }
        MessageTag::WaitRequest => {
            let request = WaitRequest::decode(body)?;
            let result = match store.wait_begin(
                client_id,
                request.object_requests,
                request.num_ready,
                request.timeout_ms,
            ) {
                WaitOutcome::Ready(result) => result,
                WaitOutcome::Parked(parked) => {
                    park(conn, &parked, request.timeout_ms);
                    store.wait_finish(parked.request_id).ok_or_else(|| {
                        PlasmaError::invalid_argument("parked wait vanished")
                    })?
                }
            };
            let reply = WaitReply {
                object_replies: result.object_replies,
                num_ready: result.num_ready,
            };
            send_reply(conn, MessageTag::WaitReply, reply.encode(), &[])?;
        }
        MessageTag::FetchRequest => {
            // Remote fetches belong to the fetch manager; Fetch has no
            // reply.
            let request = FetchRequest::decode(body)?;
            tracing::debug!(
                client_id,
                num_objects = request.object_ids.len(),
                "fetch request delegated to the fetch manager"
            );
        }
        MessageTag::EvictRequest => {
            let request = EvictRequest::decode(body)?;
            let reply = EvictReply {
                num_bytes: store.evict(request.num_bytes),
            };
            send_reply(conn, MessageTag::EvictReply, reply.encode(), &[])?;
        }
        MessageTag::SubscribeRequest => {
            // The client sends its push socket as ancillary data.
            match fds.into_iter().next() {
                Some(fd) => store.subscribe(client_id, fd),
                None => {
                    return Err(PlasmaError::invalid_argument(
                        "subscribe request carried no socket",
                    ));
                }
            }
        }
        MessageTag::StatusRequest => {
            let request = StatusRequest::decode(body)?;
            let statuses = store.status(&request.object_ids);
            let reply = StatusReply {
                object_ids: request.object_ids,
                statuses,
            };
            send_reply(conn, MessageTag::StatusReply, reply.encode(), &[])?;
        }
        MessageTag::DataRequest => {
            let request = DataRequest::decode(body)?;
            let (object_size, metadata_size) = store.data_info(&request.object_id);
            let reply = DataReply {
                object_id: request.object_id,
                object_size,
                metadata_size,
            };
            send_reply(conn, MessageTag::DataReply, reply.encode(), &[])?;
        }
        MessageTag::DisconnectClient => return Ok(false),
        _ => {
            return Err(PlasmaError::invalid_argument(format!(
                "unexpected {tag:?} from a client"
            )));
        }
    }
    Ok(true)
}

/// Block until the parked request completes, its deadline fires, or the
/// peer goes away. A negative timeout waits indefinitely.
fn park(conn: i32, parked: &ParkedRequest, timeout_ms: i64) {
    let deadline =
        (timeout_ms >= 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
    loop {
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return;
                }
                (deadline - now).min(LIVENESS_POLL)
            }
            None => LIVENESS_POLL,
        };
        match parked.receiver.recv_timeout(slice) {
            Ok(()) => return,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if frame::peer_closed(conn) {
                    return;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn send_reply(conn: i32, tag: MessageTag, body: Vec<u8>, fds: &[i32]) -> PlasmaResult<()> {
    frame::send_frame(conn, tag.as_u64(), &body, fds).map_err(PlasmaError::Io)
}

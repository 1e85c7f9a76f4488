// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end tests: a real store server on a UNIX socket, driven by real
//! clients over the wire protocol, shared memory included.

use std::sync::Arc;
use std::time::{Duration, Instant};

use plasma_client::PlasmaClient;
use plasma_common::config::StoreConfig;
use plasma_common::error::{ErrorCode, PlasmaError};
use plasma_common::id::ObjectId;
use plasma_protocol::messages::{ObjectQuery, ObjectRequestSpec, ObjectStatus};
use plasma_store::server::StoreServer;
use plasma_store::store::PlasmaStore;

fn make_oid(val: u8) -> ObjectId {
    ObjectId::from_binary(&[val; 20])
}

/// Start a store on a fresh socket. The TempDir must outlive the test.
fn start_store(capacity: i64) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let socket_name = dir.path().join("plasma.sock").to_str().unwrap().to_string();
    let config = StoreConfig {
        socket_name: socket_name.clone(),
        memory_capacity: capacity,
        plasma_directory: dir.path().to_str().unwrap().to_string(),
        huge_pages: false,
    };
    let store = Arc::new(PlasmaStore::new(&config));
    let server = StoreServer::bind(store, &socket_name).unwrap();
    std::thread::spawn(move || server.run());
    (dir, socket_name)
}

/// Create, fill with a byte pattern, and seal one object.
fn put_object(client: &PlasmaClient, oid: ObjectId, data_size: i64) {
    let mut builder = client.create(oid, data_size, 0, 0).unwrap();
    builder.data_mut().fill(0x5A);
    client.seal(oid).unwrap();
}

#[test]
fn test_connect_reports_capacity() {
    let (_dir, socket) = start_store(4 * 1024 * 1024);
    let client = PlasmaClient::connect(&socket).unwrap();
    assert_eq!(client.memory_capacity(), 4 * 1024 * 1024);
}

#[test]
fn test_round_trip() {
    let (_dir, socket) = start_store(4 * 1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let b = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(0x01);

    // A writes 16 data bytes and 4 metadata bytes straight into shared
    // memory, then seals.
    let mut builder = a.create(oid, 16, 4, 0).unwrap();
    for (i, byte) in builder.data_mut().iter_mut().enumerate() {
        *byte = i as u8;
    }
    builder
        .metadata_mut()
        .copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    let digest = a.seal(oid).unwrap();
    assert_eq!(digest.as_bytes().len(), 20);

    // B sees the sealed object and reads A's exact bytes, zero-copy.
    assert!(b.contains(oid).unwrap());
    let buffers = b.get(&[oid], 100).unwrap();
    let buffer = buffers[0].as_ref().unwrap();
    assert_eq!(buffer.data(), (0..16).collect::<Vec<u8>>().as_slice());
    assert_eq!(buffer.metadata(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    drop(buffers); // releases B's reference

    assert_eq!(a.delete(&[oid]).unwrap(), vec![ErrorCode::Ok]);
    assert!(!b.contains(oid).unwrap());
}

#[test]
fn test_out_of_memory_with_eviction() {
    // Capacity 1024: three sealed-and-released 256-byte objects, then a
    // 768-byte create. The two least-recently-used are evicted and the
    // most recently used survives.
    let (_dir, socket) = start_store(1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let o1 = make_oid(1);
    let o2 = make_oid(2);
    let o3 = make_oid(3);
    for oid in [o3, o1, o2] {
        put_object(&a, oid, 256);
    }
    // Touch o3 so the LRU order becomes o1, o2, o3.
    let touched = a.get(&[o3], 100).unwrap();
    drop(touched);

    let big = make_oid(9);
    let _builder = a.create(big, 768, 0, 0).unwrap();
    assert!(!a.contains(o1).unwrap());
    assert!(!a.contains(o2).unwrap());
    assert!(a.contains(o3).unwrap());
}

#[test]
fn test_out_of_memory_when_everything_is_pinned() {
    let (_dir, socket) = start_store(1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let b = PlasmaClient::connect(&socket).unwrap();

    put_object(&a, make_oid(1), 256);
    let pinned = b.get(&[make_oid(1)], 100).unwrap();

    let _unsealed = a.create(make_oid(2), 256, 0, 0).unwrap();

    let result = a.create(make_oid(3), 768, 0, 0);
    assert!(matches!(result, Err(PlasmaError::OutOfMemory)));
    drop(pinned);
}

#[test]
fn test_blocking_get_resolves_on_seal() {
    let (_dir, socket) = start_store(4 * 1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let b = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(0x02);

    let reader = std::thread::spawn(move || {
        let start = Instant::now();
        let buffers = b.get(&[oid], 2000).unwrap();
        (start.elapsed(), buffers[0].is_some())
    });

    std::thread::sleep(Duration::from_millis(50));
    put_object(&a, oid, 32);

    let (elapsed, resolved) = reader.join().unwrap();
    assert!(resolved, "get should return the sealed object");
    assert!(
        elapsed < Duration::from_millis(1900),
        "reply should arrive at seal time, not at the deadline (took {elapsed:?})"
    );
}

#[test]
fn test_get_timeout_returns_sentinel() {
    let (_dir, socket) = start_store(1024 * 1024);
    let b = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(0x03);

    let start = Instant::now();
    let buffers = b.get(&[oid], 50).unwrap();
    let elapsed = start.elapsed();

    assert!(buffers[0].is_none());
    assert!(elapsed >= Duration::from_millis(50));
}

#[test]
fn test_nonblocking_get_on_unsealed_object() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let b = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(7);
    let _builder = a.create(oid, 16, 0, 0).unwrap();

    // Created but unsealed: a poll comes back immediately empty-handed.
    let buffers = b.get(&[oid], 0).unwrap();
    assert!(buffers[0].is_none());
    assert!(!b.contains(oid).unwrap());
}

#[test]
fn test_abort_frees_the_range() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let b = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(0x04);

    let _builder = a.create(oid, 8, 0, 0).unwrap();
    a.abort(oid).unwrap();
    assert!(!b.contains(oid).unwrap());

    // The backing range is reusable by a subsequent create of the same id.
    put_object(&a, oid, 8);
    assert!(b.contains(oid).unwrap());
}

#[test]
fn test_subscription_sees_seal_and_delete() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let c = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(0x05);

    let notifications = c.subscribe().unwrap();

    let mut builder = a.create(oid, 16, 0, 0).unwrap();
    builder.data_mut().fill(1);
    let digest = a.seal(oid).unwrap();

    let sealed = notifications.next().unwrap();
    assert_eq!(sealed.object_id, oid);
    assert_eq!(sealed.digest, Some(digest));
    assert!(!sealed.is_deletion);
    assert_eq!(sealed.data_size, 16);

    assert_eq!(a.delete(&[oid]).unwrap(), vec![ErrorCode::Ok]);
    let deleted = notifications.next().unwrap();
    assert_eq!(deleted.object_id, oid);
    assert_eq!(deleted.digest, None);
    assert!(deleted.is_deletion);
}

#[test]
fn test_subscription_replays_existing_objects() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    put_object(&a, make_oid(1), 16);
    put_object(&a, make_oid(2), 16);

    let notifications = a.subscribe().unwrap();
    let first = notifications.next().unwrap();
    let second = notifications.next().unwrap();
    let mut seen = [first.object_id, second.object_id];
    seen.sort();
    assert_eq!(seen, [make_oid(1), make_oid(2)]);
}

#[test]
fn test_zero_size_object_is_sealable() {
    let (_dir, socket) = start_store(1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(6);

    a.create(oid, 0, 0, 0).unwrap();
    a.seal(oid).unwrap();
    assert!(a.contains(oid).unwrap());

    let buffers = a.get(&[oid], 100).unwrap();
    let buffer = buffers[0].as_ref().unwrap();
    assert!(buffer.data().is_empty());
    assert!(buffer.metadata().is_empty());
}

#[test]
fn test_delete_mixed_outcomes_in_order() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let present = make_oid(1);
    let absent = make_oid(2);
    put_object(&a, present, 32);

    assert_eq!(
        a.delete(&[present, absent]).unwrap(),
        vec![ErrorCode::Ok, ErrorCode::ObjectNonexistent]
    );
}

#[test]
fn test_delete_defers_while_pinned() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let b = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(1);
    put_object(&a, oid, 32);

    let buffers = b.get(&[oid], 100).unwrap();
    assert_eq!(a.delete(&[oid]).unwrap(), vec![ErrorCode::Ok]);
    // Still visible while B holds it.
    assert!(a.contains(oid).unwrap());

    drop(buffers);
    assert!(!a.contains(oid).unwrap());
}

#[test]
fn test_release_balances_refcounts_across_gets() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let b = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(1);
    put_object(&a, oid, 32);

    // Two views on one connection: one store-side reference, released
    // when the last view drops.
    let first = b.get(&[oid], 100).unwrap();
    let second = b.get(&[oid], 100).unwrap();
    assert_eq!(a.delete(&[oid]).unwrap(), vec![ErrorCode::Ok]);

    drop(first);
    assert!(a.contains(oid).unwrap());
    drop(second);
    assert!(!a.contains(oid).unwrap());
}

#[test]
fn test_disconnect_releases_references() {
    use plasma_protocol::frame;
    use plasma_protocol::messages::{GetRequest, MessageTag};
    use std::os::fd::AsRawFd;

    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(1);
    put_object(&a, oid, 32);

    {
        // A bare connection that takes a reference and then dies without
        // releasing it — the crashed-client case.
        let stream = std::os::unix::net::UnixStream::connect(&socket).unwrap();
        let conn = stream.as_raw_fd();
        let request = GetRequest {
            object_ids: vec![oid],
            timeout_ms: 100,
        };
        frame::send_frame(conn, MessageTag::GetRequest.as_u64(), &request.encode(), &[]).unwrap();
        let (tag, _body, _fds) = frame::recv_frame(conn).unwrap();
        assert_eq!(tag, MessageTag::GetReply.as_u64());

        assert_eq!(a.delete(&[oid]).unwrap(), vec![ErrorCode::Ok]);
        assert!(a.contains(oid).unwrap()); // pinned by the raw connection
    } // stream closed here, reference never released

    // The store notices the closed socket, releases the dead connection's
    // references, and the deferred delete proceeds.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if !a.contains(oid).unwrap() {
            break;
        }
        assert!(Instant::now() < deadline, "deferred delete never ran");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_wait_reports_local_and_nonexistent() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let sealed = make_oid(1);
    let missing = make_oid(2);
    put_object(&a, sealed, 16);

    let requests = vec![
        ObjectRequestSpec {
            object_id: sealed,
            query: ObjectQuery::Local,
        },
        ObjectRequestSpec {
            object_id: missing,
            query: ObjectQuery::Anywhere,
        },
    ];
    let (replies, num_ready) = a.wait(&requests, 1, 500).unwrap();
    assert_eq!(num_ready, 1);
    assert_eq!(replies[0].status, ObjectStatus::Local);
    assert_eq!(replies[1].status, ObjectStatus::Nonexistent);
}

#[test]
fn test_wait_unblocks_on_seal() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let b = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(1);

    let waiter = std::thread::spawn(move || {
        let requests = vec![ObjectRequestSpec {
            object_id: oid,
            query: ObjectQuery::Local,
        }];
        b.wait(&requests, 1, 2000).unwrap()
    });

    std::thread::sleep(Duration::from_millis(50));
    put_object(&a, oid, 16);

    let (replies, num_ready) = waiter.join().unwrap();
    assert_eq!(num_ready, 1);
    assert_eq!(replies[0].status, ObjectStatus::Local);
}

#[test]
fn test_explicit_evict_frees_released_objects() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    put_object(&a, make_oid(1), 256);
    put_object(&a, make_oid(2), 256);

    let freed = a.evict(1).unwrap();
    assert_eq!(freed, 256);
    assert!(!a.contains(make_oid(1)).unwrap());
    assert!(a.contains(make_oid(2)).unwrap());
}

#[test]
fn test_list_reflects_lifecycle() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    put_object(&a, make_oid(1), 64);
    let _builder = a.create(make_oid(2), 32, 8, 0).unwrap();

    let mut infos = a.list().unwrap();
    infos.sort_by_key(|info| info.object_id);
    assert_eq!(infos.len(), 2);

    assert!(infos[0].digest.is_some());
    assert_eq!(infos[0].ref_count, 0); // sealed and released

    assert_eq!(infos[1].digest, None); // still being written
    assert_eq!(infos[1].ref_count, 1); // creator's implicit reference
    assert_eq!(infos[1].data_size, 32);
    assert_eq!(infos[1].metadata_size, 8);
}

#[test]
fn test_status_of_sealed_and_unknown() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    put_object(&a, make_oid(1), 16);

    let statuses = a.status(&[make_oid(1), make_oid(2)]).unwrap();
    assert_eq!(statuses, vec![ObjectStatus::Local, ObjectStatus::Nonexistent]);
}

#[test]
fn test_data_info_sizes() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(1);
    let mut builder = a.create(oid, 48, 16, 0).unwrap();
    builder.data_mut().fill(3);
    a.seal(oid).unwrap();

    let reply = a.data_info(oid, "127.0.0.1", 7000).unwrap();
    assert_eq!(reply.object_size, 64); // data + metadata
    assert_eq!(reply.metadata_size, 16);

    let missing = a.data_info(make_oid(2), "127.0.0.1", 7000).unwrap();
    assert_eq!(missing.object_size, -1);
}

#[test]
fn test_objects_across_multiple_segments() {
    // Two objects larger than the segment granularity land in separate
    // segments; one Get carries both fds to a fresh client.
    let (_dir, socket) = start_store(8 * 1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let o1 = make_oid(1);
    let o2 = make_oid(2);
    const BIG: i64 = 2 * 1024 * 1024;

    for (oid, fill) in [(o1, 0x11u8), (o2, 0x22u8)] {
        let mut builder = a.create(oid, BIG, 0, 0).unwrap();
        builder.data_mut().fill(fill);
        a.seal(oid).unwrap();
    }

    let b = PlasmaClient::connect(&socket).unwrap();
    let buffers = b.get(&[o1, o2], 500).unwrap();
    let first = buffers[0].as_ref().unwrap();
    let second = buffers[1].as_ref().unwrap();
    assert_eq!(first.data().len(), BIG as usize);
    assert!(first.data().iter().all(|&b| b == 0x11));
    assert!(second.data().iter().all(|&b| b == 0x22));
}

#[test]
fn test_create_duplicate_id_rejected() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    let oid = make_oid(1);
    let _builder = a.create(oid, 16, 0, 0).unwrap();

    let result = a.create(oid, 16, 0, 0);
    assert!(matches!(result, Err(PlasmaError::ObjectExists)));
}

#[test]
fn test_fetch_is_fire_and_forget() {
    let (_dir, socket) = start_store(1024 * 1024);
    let a = PlasmaClient::connect(&socket).unwrap();
    a.fetch(&[make_oid(1), make_oid(2)]).unwrap();
    // The connection is still healthy afterwards.
    assert!(!a.contains(make_oid(1)).unwrap());
}

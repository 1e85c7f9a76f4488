// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Message framing and file descriptor passing over UNIX domain sockets.
//!
//! A frame on the wire is exactly `u64 tag (LE) || u64 body_len (LE) ||
//! body`. File descriptors ride as a single `SCM_RIGHTS` control message on
//! the `sendmsg` call that carries the frame's first bytes. Reads are
//! strict: a short read or EOF mid-frame is an error and the caller must
//! drop the connection.
//!
//! # Safety
//!
//! Uses `unsafe` for the low-level cmsg/sendmsg/recvmsg operations required
//! by `SCM_RIGHTS` fd passing. The unsafe code is confined to this module.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use plasma_common::constants::MAX_FDS_PER_MESSAGE;

/// Size of the tag + length header.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Largest body the receiver will accept. Bodies are object *descriptions*,
/// never payloads, so anything near this size is a corrupt frame.
pub const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// Send one frame, attaching `fds` as ancillary data on the same `sendmsg`.
///
/// Never partial: on return the full frame has been written or an error is
/// reported and the connection must be considered dead.
pub fn send_frame(conn: RawFd, tag: u64, body: &[u8], fds: &[RawFd]) -> io::Result<()> {
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} fds exceeds per-message limit", fds.len()),
        ));
    }

    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[..8].copy_from_slice(&tag.to_le_bytes());
    header[8..].copy_from_slice(&(body.len() as u64).to_le_bytes());

    let sent = sendmsg_with_fds(conn, &header, body, fds)?;
    if sent == 0 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "peer closed during frame send",
        ));
    }

    // The ancillary block went out with the first byte; finish the rest
    // with plain writes.
    let total = FRAME_HEADER_SIZE + body.len();
    let mut written = sent;
    while written < total {
        let chunk = if written < FRAME_HEADER_SIZE {
            &header[written..]
        } else {
            &body[written - FRAME_HEADER_SIZE..]
        };
        written += write_some(conn, chunk)?;
    }
    Ok(())
}

/// Receive one frame. Returns the tag, the body, and any file descriptors
/// that arrived as ancillary data.
pub fn recv_frame(conn: RawFd) -> io::Result<(u64, Vec<u8>, Vec<OwnedFd>)> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut fds = Vec::new();

    // The sender attaches fds to the frame's first bytes, but a stream
    // socket may hand the header over in pieces; collect ancillary data on
    // every recvmsg until the header is complete.
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = recvmsg_with_fds(conn, &mut header[filled..], &mut fds)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
        filled += n;
    }

    let tag = u64::from_le_bytes(header[..8].try_into().unwrap());
    let body_len = u64::from_le_bytes(header[8..].try_into().unwrap());
    if body_len > MAX_BODY_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body of {body_len} bytes exceeds limit"),
        ));
    }

    let mut body = vec![0u8; body_len as usize];
    let mut filled = 0;
    while filled < body.len() {
        let n = recvmsg_with_fds(conn, &mut body[filled..], &mut fds)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
        filled += n;
    }

    Ok((tag, body, fds))
}

/// One `sendmsg` carrying `header` and `body` as an iovec pair plus an
/// optional `SCM_RIGHTS` block. Returns the number of payload bytes sent.
fn sendmsg_with_fds(conn: RawFd, header: &[u8], body: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    use libc::{c_void, iovec, msghdr, CMSG_DATA, CMSG_FIRSTHDR, CMSG_LEN, CMSG_SPACE};
    use std::mem;
    use std::ptr;

    let mut iov = [
        iovec {
            iov_base: header.as_ptr() as *mut c_void,
            iov_len: header.len(),
        },
        iovec {
            iov_base: body.as_ptr() as *mut c_void,
            iov_len: body.len(),
        },
    ];

    let fd_bytes = mem::size_of::<RawFd>() * fds.len();
    let cmsg_space = unsafe { CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = if body.is_empty() { 1 } else { 2 };
    if !fds.is_empty() {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cmsg_space as _;

        let cmsg = unsafe { CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return Err(io::Error::other("CMSG_FIRSTHDR returned null"));
        }
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = CMSG_LEN(fd_bytes as u32) as _;
            ptr::copy_nonoverlapping(fds.as_ptr() as *const u8, CMSG_DATA(cmsg), fd_bytes);
        }
    }

    loop {
        let ret = unsafe { libc::sendmsg(conn, &msg, libc::MSG_NOSIGNAL) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One `recvmsg` into `buf`, appending any `SCM_RIGHTS` fds to `fds`.
/// Returns the number of payload bytes received (0 on EOF).
fn recvmsg_with_fds(conn: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    use libc::{c_void, iovec, msghdr, CMSG_DATA, CMSG_FIRSTHDR, CMSG_LEN, CMSG_NXTHDR, CMSG_SPACE};
    use std::mem;
    use std::ptr;

    let mut iov = iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };

    let fd_bytes = mem::size_of::<RawFd>() * MAX_FDS_PER_MESSAGE;
    let cmsg_space = unsafe { CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_space as _;

    let nread = loop {
        let ret = unsafe { libc::recvmsg(conn, &mut msg, 0) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    unsafe {
        let mut cmsg = CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                for i in 0..count {
                    let mut fd: RawFd = -1;
                    ptr::copy_nonoverlapping(
                        CMSG_DATA(cmsg).add(i * mem::size_of::<RawFd>()),
                        &mut fd as *mut RawFd as *mut u8,
                        mem::size_of::<RawFd>(),
                    );
                    if fd >= 0 {
                        fds.push(OwnedFd::from_raw_fd(fd));
                    }
                }
            }
            cmsg = CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(nread)
}

fn write_some(conn: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let ret = unsafe {
            libc::send(
                conn,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if ret > 0 {
            return Ok(ret as usize);
        }
        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "peer closed during frame send",
            ));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// True if the peer end of the socket has shut down. Used to notice a dead
/// client while its request is parked in the store.
pub fn peer_closed(conn: RawFd) -> bool {
    #[cfg(target_os = "linux")]
    let hangup = libc::POLLRDHUP | libc::POLLHUP;
    #[cfg(not(target_os = "linux"))]
    let hangup = libc::POLLHUP;

    let mut pfd = libc::pollfd {
        fd: conn,
        events: hangup,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
    ret > 0 && (pfd.revents & (hangup | libc::POLLERR)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn socket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds: [RawFd; 2] = [0; 2];
        let ret =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "socketpair failed");
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_frame_roundtrip() {
        let (a, b) = socket_pair();
        let body: Vec<u8> = (0..255).collect();

        send_frame(a.as_raw_fd(), 42, &body, &[]).unwrap();
        let (tag, received, fds) = recv_frame(b.as_raw_fd()).unwrap();
        assert_eq!(tag, 42);
        assert_eq!(received, body);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_empty_body() {
        let (a, b) = socket_pair();
        send_frame(a.as_raw_fd(), 7, &[], &[]).unwrap();
        let (tag, body, fds) = recv_frame(b.as_raw_fd()).unwrap();
        assert_eq!(tag, 7);
        assert!(body.is_empty());
        assert!(fds.is_empty());
    }

    #[test]
    fn test_fd_passing_roundtrip() {
        let (a, b) = socket_pair();

        // Write a marker into a temp file, pass its fd across the socket,
        // and read the marker back through the received fd.
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"plasma").unwrap();
        tmp.flush().unwrap();

        send_frame(a.as_raw_fd(), 1, b"with-fd", &[tmp.as_raw_fd()]).unwrap();
        let (tag, body, mut fds) = recv_frame(b.as_raw_fd()).unwrap();
        assert_eq!(tag, 1);
        assert_eq!(body, b"with-fd");
        assert_eq!(fds.len(), 1);

        let received = fds.pop().unwrap();
        assert_ne!(received.as_raw_fd(), tmp.as_raw_fd());
        let mut file = unsafe { std::fs::File::from_raw_fd(received.into_raw_fd()) };
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "plasma");
    }

    #[test]
    fn test_multiple_fds_one_message() {
        let (a, b) = socket_pair();
        let t1 = tempfile::tempfile().unwrap();
        let t2 = tempfile::tempfile().unwrap();
        let t3 = tempfile::tempfile().unwrap();

        send_frame(
            a.as_raw_fd(),
            9,
            &[1, 2, 3],
            &[t1.as_raw_fd(), t2.as_raw_fd(), t3.as_raw_fd()],
        )
        .unwrap();
        let (_, _, fds) = recv_frame(b.as_raw_fd()).unwrap();
        assert_eq!(fds.len(), 3);
    }

    #[test]
    fn test_eof_is_error() {
        let (a, b) = socket_pair();
        drop(a);
        let err = recv_frame(b.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let (a, b) = socket_pair();
        // A header promising 100 bytes, then close.
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[..8].copy_from_slice(&5u64.to_le_bytes());
        header[8..].copy_from_slice(&100u64.to_le_bytes());
        let n = unsafe {
            libc::write(
                a.as_raw_fd(),
                header.as_ptr() as *const libc::c_void,
                header.len(),
            )
        };
        assert_eq!(n, FRAME_HEADER_SIZE as isize);
        drop(a);

        let err = recv_frame(b.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}

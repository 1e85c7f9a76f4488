// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Primitive wire encoding rules.
//!
//! Integers are little-endian two's-complement. Byte strings are
//! `u32 len || bytes`. Vectors are `u32 count || count x element`. Readers
//! never touch bytes past the fields they understand, so new trailing
//! fields can be added without breaking old decoders.

use bytes::{Buf, BufMut, BytesMut};

use plasma_common::error::{PlasmaError, PlasmaResult};
use plasma_common::id::{Digest, ObjectId};

/// Writer for message bodies.
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub fn put_string(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_object_id(&mut self, id: &ObjectId) {
        self.put_bytes(id.as_bytes());
    }

    pub fn put_object_ids(&mut self, ids: &[ObjectId]) {
        self.put_count(ids.len());
        for id in ids {
            self.put_object_id(id);
        }
    }

    /// An absent digest encodes as a zero-length byte string.
    pub fn put_digest_opt(&mut self, digest: Option<&Digest>) {
        match digest {
            Some(d) => self.put_bytes(d.as_bytes()),
            None => self.put_bytes(&[]),
        }
    }

    pub fn put_count(&mut self, count: usize) {
        self.buf.put_u32_le(count as u32);
    }
}

/// Reader over a message body.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> PlasmaResult<()> {
        if self.buf.len() < n {
            return Err(PlasmaError::invalid_argument(format!(
                "truncated message body: need {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> PlasmaResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self) -> PlasmaResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_i32(&mut self) -> PlasmaResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn get_u32(&mut self) -> PlasmaResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_i64(&mut self) -> PlasmaResult<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn get_u64(&mut self) -> PlasmaResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_bytes(&mut self) -> PlasmaResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    pub fn get_string(&mut self) -> PlasmaResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| PlasmaError::invalid_argument("string field is not valid UTF-8"))
    }

    pub fn get_object_id(&mut self) -> PlasmaResult<ObjectId> {
        let bytes = self.get_bytes()?;
        ObjectId::try_from_slice(&bytes)
    }

    pub fn get_object_ids(&mut self) -> PlasmaResult<Vec<ObjectId>> {
        let count = self.get_count()?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.get_object_id()?);
        }
        Ok(ids)
    }

    pub fn get_digest_opt(&mut self) -> PlasmaResult<Option<Digest>> {
        let bytes = self.get_bytes()?;
        if bytes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Digest::try_from_slice(&bytes)?))
        }
    }

    /// Vector counts are bounded by the body length: every element takes at
    /// least one byte, so a count beyond `remaining` is corrupt, not big.
    pub fn get_count(&mut self) -> PlasmaResult<usize> {
        let count = self.get_u32()? as usize;
        if count > self.remaining() {
            return Err(PlasmaError::invalid_argument(format!(
                "vector count {} exceeds remaining body size {}",
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }
}

// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Client for the plasma shared-memory object store.
//!
//! A [`client::PlasmaClient`] connects to the store's UNIX socket, maps
//! the shared-memory segments the store hands it, and exposes zero-copy
//! object views. Writers create an object, fill its buffers in place, and
//! seal it; readers get sealed objects and hold them alive through
//! reference counts that the client releases as views are dropped.

pub mod client;
pub mod digest;
pub mod segment;

pub use client::{NotificationStream, ObjectBuffer, ObjectBuilder, PlasmaClient};

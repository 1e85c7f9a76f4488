// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Wire protocol between plasma clients and the store.
//!
//! Three layers:
//! 1. **frame** — length-prefixed tagged frames over a UNIX stream socket,
//!    with file descriptors passed as `SCM_RIGHTS` ancillary data on the
//!    same `sendmsg` that carries the frame bytes.
//! 2. **wire** — primitive encoding rules: little-endian integers,
//!    length-prefixed byte strings, count-prefixed vectors.
//! 3. **messages** — the request/reply bodies for every protocol operation.

pub mod frame;
pub mod messages;
pub mod wire;

// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging for the plasma binaries, on the `tracing` stack.

use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber for a plasma process.
///
/// The store serves each client connection from a dedicated thread, so
/// thread ids go into every line — they are what ties a log line back to
/// the connection that produced it. The filter comes from
/// `PLASMA_LOG_LEVEL`, then `RUST_LOG`, then defaults to `info`; lines go
/// to `log_file` when one is given, stderr otherwise.
pub fn init_plasma_logging(process: &str, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_env("PLASMA_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(true);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("cannot open log file {}: {e}", path.display()));
            builder.with_writer(std::sync::Mutex::new(file)).init();
        }
        None => builder.init(),
    }

    tracing::info!(process, "logging ready");
}

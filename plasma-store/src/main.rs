// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Plasma store server binary.

use std::sync::Arc;

use clap::Parser;

use plasma_common::config::StoreConfig;
use plasma_store::server::StoreServer;
use plasma_store::store::PlasmaStore;

#[derive(Parser, Debug)]
#[command(name = "plasma-store-server", about = "Plasma shared-memory object store")]
struct Args {
    /// Path of the UNIX socket to listen on
    #[arg(short = 's', long)]
    socket_name: String,

    /// Memory capacity of the store in bytes
    #[arg(short = 'm', long)]
    memory_capacity: i64,

    /// Directory for segment backing files (default: /dev/shm on Linux)
    #[arg(short = 'd', long)]
    directory: Option<String>,

    /// Map segments with huge pages (requires a hugetlbfs directory)
    #[arg(long)]
    huge_pages: bool,

    /// Log directory
    #[arg(long)]
    log_dir: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_file = args
        .log_dir
        .as_ref()
        .map(|dir| std::path::Path::new(dir).join("plasma-store-server.log"));
    plasma_util::logging::init_plasma_logging("plasma-store-server", log_file.as_deref());

    // A write to a dead client must surface as EPIPE, not kill the store.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if args.memory_capacity <= 0 {
        return Err("memory capacity must be positive".into());
    }
    if args.huge_pages && args.directory.is_none() {
        return Err("huge pages require a hugetlbfs directory (-d)".into());
    }

    let directory = args
        .directory
        .unwrap_or_else(|| StoreConfig::default_plasma_directory().to_string());

    if let Some(available) = filesystem_available_bytes(&directory) {
        if args.memory_capacity > available {
            return Err(format!(
                "memory capacity of {} bytes exceeds the {} bytes available in {} \
                 (inside a container, the --shm-size may need to be raised)",
                args.memory_capacity, available, directory
            )
            .into());
        }
    }

    tracing::info!(
        socket_name = args.socket_name,
        memory_capacity = args.memory_capacity,
        directory,
        huge_pages = args.huge_pages,
        "starting plasma store"
    );

    let config = StoreConfig {
        socket_name: args.socket_name.clone(),
        memory_capacity: args.memory_capacity,
        plasma_directory: directory,
        huge_pages: args.huge_pages,
    };
    let store = Arc::new(PlasmaStore::new(&config));
    let server = StoreServer::bind(store, &args.socket_name)?;
    server.run();
    Ok(())
}

/// Free bytes on the filesystem backing `path`, if it can be determined.
fn filesystem_available_bytes(path: &str) -> Option<i64> {
    let c_path = std::ffi::CString::new(path).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    (ret == 0).then(|| stats.f_bsize as i64 * stats.f_bavail as i64)
}

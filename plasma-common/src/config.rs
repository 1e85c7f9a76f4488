// Copyright 2024 The Plasma Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Store configuration.

/// Configuration for the plasma store server.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the UNIX-domain socket the store listens on.
    pub socket_name: String,
    /// Maximum cumulative size of all shared-memory segments, in bytes.
    pub memory_capacity: i64,
    /// Directory for segment backing files (e.g. /dev/shm).
    pub plasma_directory: String,
    /// Whether to map segments with huge pages.
    pub huge_pages: bool,
}

impl StoreConfig {
    /// Platform default for the segment directory.
    pub fn default_plasma_directory() -> &'static str {
        if cfg!(target_os = "linux") {
            "/dev/shm"
        } else {
            "/tmp"
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            socket_name: String::new(),
            memory_capacity: -1,
            plasma_directory: Self::default_plasma_directory().to_string(),
            huge_pages: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directory_is_absolute() {
        let config = StoreConfig::default();
        assert!(config.plasma_directory.starts_with('/'));
        assert_eq!(config.memory_capacity, -1);
    }
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Hash of a user key, used by the routing filters
pub type KeyHash = u64;

/// Hashes a user key.
#[must_use]
pub fn hash_key(key: &[u8]) -> KeyHash {
    xxhash_rust::xxh3::xxh3_64(key)
}

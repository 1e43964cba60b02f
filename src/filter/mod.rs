// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Routing filter: a bucketed fingerprint table partitioned by branch.
//!
//! Where a bloom filter answers "is the key maybe here", the routing
//! filter answers "*which branches* of this trunk node may contain the
//! key", as a bitset over branch slots. Zero false negatives; the false
//! positive rate is bounded by the fingerprint width.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::hash::KeyHash;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

mod pages;

pub use pages::{read_filter, write_filter};

const MAGIC_BYTES: [u8; 4] = *b"TKF1";

/// Maximum branch slots per filter (bitset width)
pub const MAX_BRANCH_SLOTS: usize = 64;

/// Default fingerprint width; 16 bits keeps the per-entry collision
/// rate around 2^-16, comfortably below one percent even with busy
/// buckets.
pub const DEFAULT_FINGERPRINT_BITS: u8 = 16;

/// Compact membership structure mapping key hashes to branch slots
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutingFilter {
    bucket_mask: u64,
    fp_bits: u8,
    buckets: Vec<Vec<(u16, u8)>>,
}

impl RoutingFilter {
    /// Creates a filter sized for roughly `expected_keys` entries.
    #[must_use]
    pub fn new(expected_keys: usize, fp_bits: u8) -> Self {
        // ~4 resident fingerprints per bucket
        let bucket_count = (expected_keys / 4).next_power_of_two().max(16);

        Self {
            bucket_mask: bucket_count as u64 - 1,
            fp_bits: fp_bits.clamp(4, 16),
            buckets: vec![Vec::new(); bucket_count],
        }
    }

    fn bucket_of(&self, hash: KeyHash) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (hash & self.bucket_mask) as usize;
        idx
    }

    fn fingerprint(&self, hash: KeyHash) -> u16 {
        // Fingerprint bits come from the top so they stay independent
        // of the bucket index bits.
        #[allow(clippy::cast_possible_truncation)]
        let fp = (hash >> (64 - u32::from(self.fp_bits))) as u16;
        fp
    }

    /// Tags `hash` as possibly present in branch `slot`.
    pub fn add(&mut self, hash: KeyHash, slot: u8) {
        debug_assert!((slot as usize) < MAX_BRANCH_SLOTS);

        let bucket = self.bucket_of(hash);
        let fp = self.fingerprint(hash);

        let entries = &mut self.buckets[bucket];
        if !entries.contains(&(fp, slot)) {
            entries.push((fp, slot));
        }
    }

    /// Tags every hash of a freshly packed branch.
    pub fn add_branch(&mut self, hashes: &[KeyHash], slot: u8) {
        for hash in hashes {
            self.add(*hash, slot);
        }
    }

    /// Returns the bitset of branch slots that may contain `hash`.
    ///
    /// Never produces a false negative.
    #[must_use]
    pub fn query(&self, hash: KeyHash) -> u64 {
        let bucket = self.bucket_of(hash);
        let fp = self.fingerprint(hash);

        let mut slots = 0u64;
        for (entry_fp, slot) in &self.buckets[bucket] {
            if *entry_fp == fp {
                slots |= 1u64 << slot;
            }
        }
        slots
    }

    /// Drops every fingerprint tagged with `slot` (branch retired).
    pub fn remove_slot(&mut self, slot: u8) {
        for bucket in &mut self.buckets {
            bucket.retain(|(_, s)| *s != slot);
        }
    }

    /// Number of resident fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Encode for RoutingFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u8(self.fp_bits)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.buckets.len() as u32)?;

        for bucket in &self.buckets {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u16::<LittleEndian>(bucket.len() as u16)?;
            for (fp, slot) in bucket {
                writer.write_u16::<LittleEndian>(*fp)?;
                writer.write_u8(*slot)?;
            }
        }

        Ok(())
    }
}

impl Decode for RoutingFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("RoutingFilter"));
        }

        let fp_bits = reader.read_u8()?;
        let bucket_count = reader.read_u32::<LittleEndian>()? as usize;

        let mut buckets = Vec::with_capacity(bucket_count);
        for _ in 0..bucket_count {
            let len = reader.read_u16::<LittleEndian>()? as usize;
            let mut bucket = Vec::with_capacity(len);
            for _ in 0..len {
                let fp = reader.read_u16::<LittleEndian>()?;
                let slot = reader.read_u8()?;
                bucket.push((fp, slot));
            }
            buckets.push(bucket);
        }

        Ok(Self {
            bucket_mask: bucket_count as u64 - 1,
            fp_bits,
            buckets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_key;
    use test_log::test;

    #[test]
    fn no_false_negatives() {
        let mut filter = RoutingFilter::new(1_000, DEFAULT_FINGERPRINT_BITS);

        for i in 0..1_000u32 {
            let key = format!("key-{i}");
            filter.add(hash_key(key.as_bytes()), u8::try_from(i % 4).unwrap_or(0));
        }

        for i in 0..1_000u32 {
            let key = format!("key-{i}");
            let slots = filter.query(hash_key(key.as_bytes()));
            let expected = 1u64 << (i % 4);
            assert_eq!(expected, slots & expected, "lost key-{i}");
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut filter = RoutingFilter::new(10_000, DEFAULT_FINGERPRINT_BITS);

        for i in 0..10_000u32 {
            let key = format!("present-{i}");
            filter.add(hash_key(key.as_bytes()), 0);
        }

        let mut false_positives = 0u32;
        for i in 0..10_000u32 {
            let key = format!("absent-{i}");
            if filter.query(hash_key(key.as_bytes())) != 0 {
                false_positives += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let fpr = f64::from(false_positives) / 10_000.0;
        assert!(fpr < 0.01, "fpr = {fpr}");
    }

    #[test]
    fn remove_slot_clears_branch() {
        let mut filter = RoutingFilter::new(100, DEFAULT_FINGERPRINT_BITS);

        let hash = hash_key(b"some-key");
        filter.add(hash, 3);
        filter.add(hash, 7);

        assert_eq!((1 << 3) | (1 << 7), filter.query(hash));

        filter.remove_slot(3);
        assert_eq!(1 << 7, filter.query(hash));
    }

    #[test]
    fn query_returns_bitset_over_branches() {
        let mut filter = RoutingFilter::new(100, DEFAULT_FINGERPRINT_BITS);

        filter.add(hash_key(b"a"), 0);
        filter.add(hash_key(b"b"), 1);
        filter.add(hash_key(b"c"), 63);

        assert_ne!(0, filter.query(hash_key(b"a")) & 1);
        assert_ne!(0, filter.query(hash_key(b"b")) & 2);
        assert_ne!(0, filter.query(hash_key(b"c")) & (1 << 63));
    }

    #[test]
    fn encode_round_trip() -> Result<(), DecodeError> {
        let mut filter = RoutingFilter::new(500, 12);
        for i in 0..500u32 {
            filter.add(hash_key(format!("k{i}").as_bytes()), u8::try_from(i % 8).unwrap_or(0));
        }

        let bytes = filter.encode_into_vec();
        let decoded = RoutingFilter::decode_from(&mut &bytes[..])?;
        assert_eq!(filter, decoded);

        Ok(())
    }
}

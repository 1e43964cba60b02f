// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Persists a routing filter across a chain of filter pages.
//!
//! Page layout: `type u8 | flags u8 | chunk_len u16 LE | unused u32 |
//! next u64 LE | chunk bytes`.

use super::RoutingFilter;
use crate::alloc::MiniAllocator;
use crate::cache::PageCache;
use crate::coding::{Decode, Encode};
use crate::store::{PageAddr, PageType, NIL_ADDR};
use std::sync::Arc;

const PAGE_HEADER: usize = 16;

/// Writes the filter into a page chain; returns the head address.
pub fn write_filter(
    cache: &Arc<PageCache>,
    mini: &MiniAllocator,
    filter: &RoutingFilter,
) -> crate::Result<PageAddr> {
    let bytes = filter.encode_into_vec();
    let chunk_size = cache.page_size() - PAGE_HEADER;

    let chunks: Vec<&[u8]> = bytes.chunks(chunk_size).collect();

    let mut head = NIL_ADDR;
    let mut prev: Option<PageAddr> = None;

    for chunk in &chunks {
        let addr = mini.alloc_page(0)?;

        let handle = cache.alloc_at(addr, PageType::Filter)?;
        {
            let mut guard = handle.lock();

            #[allow(clippy::cast_possible_truncation)]
            let len = chunk.len() as u16;
            guard[2..4].copy_from_slice(&len.to_le_bytes());
            guard[PAGE_HEADER..PAGE_HEADER + chunk.len()].copy_from_slice(chunk);
        }
        drop(handle);

        if let Some(prev_addr) = prev {
            let prev_handle = cache.get(prev_addr)?;
            prev_handle.claim_wait();
            let mut guard = prev_handle.lock();
            guard[8..16].copy_from_slice(&addr.to_le_bytes());
        }

        if head == NIL_ADDR {
            head = addr;
        }
        prev = Some(addr);
    }

    Ok(head)
}

/// Reads a filter back from its page chain.
pub fn read_filter(cache: &Arc<PageCache>, head: PageAddr) -> crate::Result<RoutingFilter> {
    let mut bytes = Vec::new();
    let mut addr = head;

    while addr != NIL_ADDR {
        let handle = cache.get(addr)?;
        let guard = handle.read();

        if guard[0] != u8::from(PageType::Filter) {
            return Err(crate::Error::Corrupt("page type mismatch"));
        }

        let len = u16::from_le_bytes([guard[2], guard[3]]) as usize;
        bytes.extend_from_slice(&guard[PAGE_HEADER..PAGE_HEADER + len]);

        let mut next = [0u8; 8];
        next.copy_from_slice(&guard[8..16]);
        addr = u64::from_le_bytes(next);
    }

    RoutingFilter::decode_from(&mut &bytes[..]).map_err(crate::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BlockAllocator;
    use crate::filter::DEFAULT_FINGERPRINT_BITS;
    use crate::hash_key;
    use crate::store::{DramStore, PageStore};
    use test_log::test;

    #[test]
    fn filter_page_round_trip() -> crate::Result<()> {
        let store = PageStore::Dram(DramStore::new(32 * 1_024 * 1_024));
        let cache = PageCache::new(store, 4 * 1_024 * 1_024, 4_096);
        let block = Arc::new(BlockAllocator::new(4_096, 32, 32 * 1_024 * 1_024));
        let mini = MiniAllocator::new(block.clone(), 4_096, 1);

        let mut filter = RoutingFilter::new(20_000, DEFAULT_FINGERPRINT_BITS);
        for i in 0..20_000u32 {
            filter.add(hash_key(format!("key-{i}").as_bytes()), u8::try_from(i % 3).unwrap_or(0));
        }

        let head = write_filter(&cache, &mini, &filter)?;
        let decoded = read_filter(&cache, head)?;
        assert_eq!(filter, decoded);

        for extent in mini.release() {
            block.dec_ref(extent);
        }

        Ok(())
    }
}

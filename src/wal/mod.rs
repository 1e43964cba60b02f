// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Sharded write-ahead log.
//!
//! Every registered thread appends to its own page chain, so the hot
//! path takes no shared lock. Entries are stamped with a global
//! generation; recovery walks all shard chains and stitches the
//! entries back into one stream by sorting on it.
//!
//! Log page layout: `type u8 | flags u8 | used u16 LE | reserved u32 |
//! next u64 LE | entries`. Entry: `generation varint | key_len varint |
//! kind u8 | val_len varint | key | value`.

use crate::alloc::{BlockAllocator, MiniAllocator};
use crate::cache::PageCache;
use crate::registry::MAX_THREADS;
use crate::store::{PageAddr, PageIo, PageType, NIL_ADDR};
use crate::{Generation, Message, MessageKind, UserKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use varint_rs::{VarintReader, VarintWriter};

const PAGE_HEADER: usize = 16;

struct LogShard {
    mini: Option<MiniAllocator>,
    head: PageAddr,
    current: PageAddr,
    cursor: usize,
    appended_since_sync: u64,
}

/// Sharded append-only log of `(key, message)` entries
pub struct Wal {
    cache: Arc<PageCache>,
    block: Arc<BlockAllocator>,
    commit_every_n: u64,
    generation: AtomicU64,
    shards: Vec<Mutex<LogShard>>,
}

impl Wal {
    pub fn new(
        cache: Arc<PageCache>,
        block: Arc<BlockAllocator>,
        commit_every_n: u64,
        last_generation: Generation,
    ) -> Self {
        let shards = (0..MAX_THREADS)
            .map(|_| {
                Mutex::new(LogShard {
                    mini: None,
                    head: NIL_ADDR,
                    current: NIL_ADDR,
                    cursor: PAGE_HEADER,
                    appended_since_sync: 0,
                })
            })
            .collect();

        Self {
            cache,
            block,
            commit_every_n: commit_every_n.max(1),
            generation: AtomicU64::new(last_generation),
            shards,
        }
    }

    /// Highest generation handed out so far.
    pub fn last_generation(&self) -> Generation {
        self.generation.load(Ordering::Acquire)
    }

    /// Head page of each shard chain (0 = shard unused), for the super
    /// page.
    #[allow(clippy::expect_used)]
    pub fn shard_heads(&self) -> Vec<PageAddr> {
        self.shards
            .iter()
            .map(|shard| shard.lock().expect("lock is poisoned").head)
            .collect()
    }

    fn encode_entry(generation: Generation, key: &[u8], msg: &Message) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + key.len() + msg.value.len());

        #[allow(clippy::expect_used)]
        {
            buf.write_u64_varint(generation).expect("vec write");

            #[allow(clippy::cast_possible_truncation)]
            buf.write_u32_varint(key.len() as u32).expect("vec write");

            buf.push(u8::from(msg.kind));

            #[allow(clippy::cast_possible_truncation)]
            buf.write_u32_varint(msg.value.len() as u32)
                .expect("vec write");
        }

        buf.extend_from_slice(key);
        buf.extend_from_slice(&msg.value);
        buf
    }

    /// Appends an entry to the calling thread's shard.
    ///
    /// Every `commit_every_n` appends, the shard's current page is
    /// flushed and the store synced.
    #[allow(clippy::expect_used)]
    pub fn append(&self, tid: usize, key: &[u8], msg: &Message) -> crate::Result<Generation> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let entry = Self::encode_entry(generation, key, msg);

        let page_size = self.cache.page_size();
        if entry.len() > page_size - PAGE_HEADER {
            return Err(crate::Error::BadParam("log entry exceeds page capacity"));
        }

        let mut shard = self.shards[tid % MAX_THREADS]
            .lock()
            .expect("lock is poisoned");

        if shard.mini.is_none() {
            shard.mini = Some(MiniAllocator::new(
                self.block.clone(),
                page_size as u64,
                1,
            ));
        }

        // Roll to a fresh page if the entry does not fit.
        if shard.current == NIL_ADDR || shard.cursor + entry.len() > page_size {
            let addr = shard
                .mini
                .as_ref()
                .expect("mini allocator was just created")
                .alloc_page(0)?;

            let handle = self.cache.alloc_at(addr, PageType::Log)?;
            drop(handle);

            if shard.current != NIL_ADDR {
                let prev = self.cache.get(shard.current)?;
                prev.claim_wait();
                let mut guard = prev.lock();
                guard[8..16].copy_from_slice(&addr.to_le_bytes());
            }

            if shard.head == NIL_ADDR {
                shard.head = addr;
            }
            shard.current = addr;
            shard.cursor = PAGE_HEADER;
        }

        {
            let handle = self.cache.get(shard.current)?;
            handle.claim_wait();
            let mut guard = handle.lock();

            let start = shard.cursor;
            guard[start..start + entry.len()].copy_from_slice(&entry);

            #[allow(clippy::cast_possible_truncation)]
            let used = (start + entry.len() - PAGE_HEADER) as u16;
            guard[2..4].copy_from_slice(&used.to_le_bytes());
        }

        shard.cursor += entry.len();
        shard.appended_since_sync += 1;

        if shard.appended_since_sync >= self.commit_every_n {
            shard.appended_since_sync = 0;
            let current = shard.current;
            drop(shard);

            self.cache.flush(current)?;
            self.cache.store().sync()?;
        }

        Ok(generation)
    }

    /// Flushes all shard pages and syncs the store.
    #[allow(clippy::expect_used)]
    pub fn sync(&self) -> crate::Result<()> {
        let currents: Vec<PageAddr> = self
            .shards
            .iter()
            .map(|shard| shard.lock().expect("lock is poisoned").current)
            .filter(|addr| *addr != NIL_ADDR)
            .collect();

        for addr in currents {
            self.cache.flush(addr)?;
        }

        self.cache.store().sync()
    }
}

/// A recovered log entry
pub struct ReplayEntry {
    pub generation: Generation,
    pub key: UserKey,
    pub msg: Message,
}

/// Walks all shard chains and returns the entries sorted by generation
/// (the original append order).
pub fn replay(cache: &Arc<PageCache>, heads: &[PageAddr]) -> crate::Result<Vec<ReplayEntry>> {
    let mut entries = Vec::new();

    for head in heads {
        let mut addr = *head;

        while addr != NIL_ADDR {
            let handle = cache.get(addr)?;
            let guard = handle.read();

            if guard[0] != u8::from(PageType::Log) {
                return Err(crate::Error::Corrupt("page type mismatch"));
            }

            let used = u16::from_le_bytes([guard[2], guard[3]]) as usize;
            let mut reader: &[u8] = &guard[PAGE_HEADER..PAGE_HEADER + used];

            while !reader.is_empty() {
                let generation = reader.read_u64_varint()?;
                let key_len = reader.read_u32_varint()? as usize;

                let mut kind = [0u8; 1];
                std::io::Read::read_exact(&mut reader, &mut kind)?;
                let kind = MessageKind::try_from(kind[0])
                    .map_err(|()| crate::Error::Corrupt("invalid message kind in log"))?;

                let val_len = reader.read_u32_varint()? as usize;

                let key = crate::Slice::from_reader(&mut reader, key_len)?;
                let value = crate::Slice::from_reader(&mut reader, val_len)?;

                entries.push(ReplayEntry {
                    generation,
                    key,
                    msg: Message { kind, value },
                });
            }

            let mut next = [0u8; 8];
            next.copy_from_slice(&guard[8..16]);
            addr = u64::from_le_bytes(next);
        }
    }

    entries.sort_by_key(|e| e.generation);

    log::info!("log replay recovered {} entries", entries.len());
    Ok(entries)
}

/// Releases the extents of replayed shard chains.
pub fn release_chains(
    cache: &Arc<PageCache>,
    block: &BlockAllocator,
    heads: &[PageAddr],
) -> crate::Result<()> {
    let mut extents = std::collections::BTreeSet::new();

    for head in heads {
        let mut addr = *head;
        while addr != NIL_ADDR {
            extents.insert(block.extent_base(addr));

            let handle = cache.get(addr)?;
            let guard = handle.read();
            let mut next = [0u8; 8];
            next.copy_from_slice(&guard[8..16]);
            addr = u64::from_le_bytes(next);
        }
    }

    for extent in extents {
        block.dec_ref(extent);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DramStore, PageStore};
    use test_log::test;

    fn fixture() -> (Arc<PageCache>, Arc<BlockAllocator>) {
        let store = PageStore::Dram(DramStore::new(64 * 1_024 * 1_024));
        let cache = PageCache::new(store, 8 * 1_024 * 1_024, 4_096);
        let block = Arc::new(BlockAllocator::new(4_096, 32, 64 * 1_024 * 1_024));
        (cache, block)
    }

    #[test]
    fn append_replay_round_trip() -> crate::Result<()> {
        let (cache, block) = fixture();
        let wal = Wal::new(cache.clone(), block, 16, 0);

        for i in 0..5_000u32 {
            let key = format!("key-{i:08}");
            let value = format!("value-{i}");
            wal.append(0, key.as_bytes(), &Message::insert(value.into_bytes()))?;
        }
        wal.sync()?;

        let heads: Vec<PageAddr> = wal
            .shard_heads()
            .into_iter()
            .filter(|h| *h != NIL_ADDR)
            .collect();
        assert_eq!(1, heads.len());

        let entries = replay(&cache, &heads)?;
        assert_eq!(5_000, entries.len());

        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(u64::try_from(i).unwrap_or(0) + 1, entry.generation);
            assert_eq!(format!("key-{i:08}").as_bytes(), &*entry.key);
        }

        Ok(())
    }

    #[test]
    fn shards_stitch_by_generation() -> crate::Result<()> {
        let (cache, block) = fixture();
        let wal = Wal::new(cache.clone(), block, 1_000, 0);

        // Interleave appends across two shards
        for i in 0..100u32 {
            let shard = usize::try_from(i % 2).unwrap_or(0);
            let key = format!("key-{i:04}");
            wal.append(shard, key.as_bytes(), &Message::insert(*b"v"))?;
        }
        wal.sync()?;

        let heads: Vec<PageAddr> = wal
            .shard_heads()
            .into_iter()
            .filter(|h| *h != NIL_ADDR)
            .collect();
        assert_eq!(2, heads.len());

        let entries = replay(&cache, &heads)?;
        assert_eq!(100, entries.len());

        // Generations reconstruct the global append order
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(format!("key-{i:04}").as_bytes(), &*entry.key);
        }

        Ok(())
    }

    #[test]
    fn tombstones_replay_as_tombstones() -> crate::Result<()> {
        let (cache, block) = fixture();
        let wal = Wal::new(cache.clone(), block, 1, 0);

        wal.append(0, b"k", &Message::insert(*b"v"))?;
        wal.append(0, b"k", &Message::delete())?;

        let heads: Vec<PageAddr> = wal
            .shard_heads()
            .into_iter()
            .filter(|h| *h != NIL_ADDR)
            .collect();

        let entries = replay(&cache, &heads)?;
        assert_eq!(2, entries.len());
        assert_eq!(MessageKind::Delete, entries[1].msg.kind);
        assert!(entries[1].msg.value.is_empty());

        Ok(())
    }

    #[test]
    fn release_chains_frees_extents() -> crate::Result<()> {
        let (cache, block) = fixture();
        let wal = Wal::new(cache.clone(), block.clone(), 1_000, 0);

        for i in 0..2_000u32 {
            let key = format!("key-{i:08}");
            wal.append(0, key.as_bytes(), &Message::insert([0u8; 64]))?;
        }
        wal.sync()?;
        assert!(block.live_references() > 0);

        let heads: Vec<PageAddr> = wal
            .shard_heads()
            .into_iter()
            .filter(|h| *h != NIL_ADDR)
            .collect();

        release_chains(&cache, &block, &heads)?;
        assert_eq!(0, block.live_references());

        Ok(())
    }
}

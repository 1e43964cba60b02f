// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::node;
use crate::cache::{AsyncGet, FillTicket, PageCache};
use crate::store::{PageAddr, PageType, NIL_ADDR};
use crate::{Message, Schema, SchemaRef, UserKey};
use std::collections::VecDeque;
use std::sync::Arc;

/// Point lookup in an immutable packed tree.
pub fn lookup(
    cache: &Arc<PageCache>,
    schema: &dyn Schema,
    root: PageAddr,
    height: u8,
    key: &[u8],
) -> crate::Result<Option<Message>> {
    let mut addr = root;
    let mut height = height;

    loop {
        let handle = cache.get(addr)?;
        let guard = handle.read();

        if height == 0 {
            node::expect_type(&guard, PageType::BtreeLeaf)?;

            return Ok(match node::find(&guard, key, schema) {
                Ok(i) => Some(node::leaf_message(&guard, i)),
                Err(_) => None,
            });
        }

        node::expect_type(&guard, PageType::BtreeIndex)?;
        let i = node::index_find_child(&guard, key, schema);
        addr = node::index_child(&guard, i);
        height -= 1;
    }
}

/// One step of a suspendable lookup (async-lookup contexts)
pub enum ProbeStep {
    /// Descend further from this position
    Descend {
        /// Next page to visit
        addr: PageAddr,
        /// Levels left below the root
        height: u8,
    },

    /// Probe finished
    Done(Option<Message>),

    /// Page miss; resume when the ticket fires
    Pending(FillTicket),
}

/// Performs one descent step without blocking on I/O.
///
/// On a cache miss, the fill is kicked off in the background and a
/// ticket is returned; the caller re-runs the same step once it fires.
pub fn lookup_step(
    cache: &Arc<PageCache>,
    schema: &dyn Schema,
    addr: PageAddr,
    height: u8,
    key: &[u8],
) -> crate::Result<ProbeStep> {
    let handle = match cache.get_async(addr)? {
        AsyncGet::Ready(handle) => handle,
        AsyncGet::Pending(ticket) => return Ok(ProbeStep::Pending(ticket)),
    };

    let guard = handle.read();

    if height == 0 {
        node::expect_type(&guard, PageType::BtreeLeaf)?;

        return Ok(ProbeStep::Done(match node::find(&guard, key, schema) {
            Ok(i) => Some(node::leaf_message(&guard, i)),
            Err(_) => None,
        }));
    }

    node::expect_type(&guard, PageType::BtreeIndex)?;
    let i = node::index_find_child(&guard, key, schema);

    Ok(ProbeStep::Descend {
        addr: node::index_child(&guard, i),
        height: height - 1,
    })
}

/// Leaf-chain iterator over a packed tree, optionally clipped to
/// `[start, end)`
///
/// One page is pinned at a time; entries of the current page are
/// decoded eagerly so the pin is dropped before yielding.
pub struct PackedIter {
    cache: Arc<PageCache>,
    schema: SchemaRef,
    entries: VecDeque<(UserKey, Message)>,
    next_addr: PageAddr,
    end: Option<UserKey>,
    done: bool,
}

impl PackedIter {
    /// Positions an iterator at `start` (or the smallest key).
    pub fn new(
        cache: Arc<PageCache>,
        schema: SchemaRef,
        root: PageAddr,
        height: u8,
        start: Option<&[u8]>,
        end: Option<UserKey>,
    ) -> crate::Result<Self> {
        let mut addr = root;
        let mut height = height;

        while height > 0 {
            let handle = cache.get(addr)?;
            let guard = handle.read();
            node::expect_type(&guard, PageType::BtreeIndex)?;

            let i = match start {
                Some(key) => node::index_find_child(&guard, key, &*schema),
                None => 0,
            };
            addr = node::index_child(&guard, i);
            height -= 1;
        }

        let mut iter = Self {
            cache,
            schema,
            entries: VecDeque::new(),
            next_addr: addr,
            end,
            done: false,
        };

        iter.load_next()?;

        if let Some(start) = start {
            while let Some((key, _)) = iter.entries.front() {
                if iter.schema.compare(key, start) == std::cmp::Ordering::Less {
                    iter.entries.pop_front();
                } else {
                    break;
                }
            }
        }

        Ok(iter)
    }

    fn load_next(&mut self) -> crate::Result<()> {
        while self.entries.is_empty() && self.next_addr != NIL_ADDR {
            let handle = self.cache.get(self.next_addr)?;
            let guard = handle.read();
            node::expect_type(&guard, PageType::BtreeLeaf)?;

            self.entries = node::leaf_entries(&guard)
                .into_iter()
                .map(|e| (e.key, e.msg))
                .collect();
            self.next_addr = node::next_leaf(&guard);
        }
        Ok(())
    }
}

impl Iterator for PackedIter {
    type Item = crate::Result<(UserKey, Message)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.entries.is_empty() {
            fail_iter!(self.load_next());
        }

        let (key, msg) = self.entries.pop_front()?;

        if let Some(end) = &self.end {
            if self.schema.compare(&key, end) != std::cmp::Ordering::Less {
                self.done = true;
                return None;
            }
        }

        Some(Ok((key, msg)))
    }
}

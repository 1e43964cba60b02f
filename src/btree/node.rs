// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Slotted-page layout shared by the dynamic and the packed B-tree.
//!
//! ```text
//! 0      type tag (u8)
//! 1      flags (u8, unused)
//! 2..4   entry count (u16 LE)
//! 4..6   cell start: lowest used cell byte (u16 LE)
//! 8..16  right sibling address (leaves only, u64 LE)
//! 16..   slot array (u16 LE cell offsets, sorted by key)
//! ...    cells, growing down from the page end
//! ```
//!
//! Leaf cell: `key_len u16 | kind u8 | val_len u32 | key | value`.
//! Index cell: `key_len u16 | child u64 | entry_count u64 | key`.
//!
//! An index entry `(pivot, child)` routes keys in `[pivot, next_pivot)`,
//! so a key equal to a pivot goes to the right child of the split that
//! promoted it. The root's first pivot is the empty key, which sorts
//! before every user key (keys may not be empty).

use crate::store::{PageAddr, PageType};
use crate::{Message, MessageKind, Schema, UserKey};
use std::cmp::Ordering;

pub const HEADER_LEN: usize = 16;
const SLOT_LEN: usize = 2;
const LEAF_CELL_OVERHEAD: usize = 7;
const INDEX_CELL_OVERHEAD: usize = 18;

#[inline]
fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Initializes an empty node of the given type.
#[allow(clippy::cast_possible_truncation)]
pub fn init(buf: &mut [u8], page_type: PageType) {
    debug_assert!(buf.len() <= u16::MAX as usize + 1, "page too large for u16 offsets");

    buf[0] = u8::from(page_type);
    buf[1] = 0;
    write_u16(buf, 2, 0);
    write_u16(buf, 4, (buf.len() - 1) as u16);
    write_u64(buf, 8, 0);
}

/// Checks the page type tag.
pub fn expect_type(buf: &[u8], expected: PageType) -> crate::Result<()> {
    let tag = buf[0];
    match PageType::try_from(tag) {
        Ok(t) if t == expected => Ok(()),
        _ => Err(crate::Error::Corrupt("page type mismatch")),
    }
}

#[must_use]
pub fn is_leaf(buf: &[u8]) -> bool {
    buf[0] == u8::from(PageType::BtreeLeaf)
}

#[must_use]
pub fn entry_count(buf: &[u8]) -> usize {
    read_u16(buf, 2) as usize
}

fn cell_start(buf: &[u8]) -> usize {
    read_u16(buf, 4) as usize + 1
}

fn slot(buf: &[u8], i: usize) -> usize {
    read_u16(buf, HEADER_LEN + SLOT_LEN * i) as usize
}

/// Right sibling of a leaf (0 = none).
#[must_use]
pub fn next_leaf(buf: &[u8]) -> PageAddr {
    read_u64(buf, 8)
}

pub fn set_next_leaf(buf: &mut [u8], addr: PageAddr) {
    write_u64(buf, 8, addr);
}

/// Free bytes between the slot array and the cell area.
#[must_use]
pub fn free_space(buf: &[u8]) -> usize {
    cell_start(buf) - (HEADER_LEN + SLOT_LEN * entry_count(buf))
}

/// Key of the i-th entry (leaf or index).
#[must_use]
pub fn key_at(buf: &[u8], i: usize) -> &[u8] {
    let off = slot(buf, i);
    let key_len = read_u16(buf, off) as usize;

    if is_leaf(buf) {
        &buf[off + LEAF_CELL_OVERHEAD..off + LEAF_CELL_OVERHEAD + key_len]
    } else {
        &buf[off + INDEX_CELL_OVERHEAD..off + INDEX_CELL_OVERHEAD + key_len]
    }
}

/// Message of the i-th leaf entry.
#[must_use]
pub fn leaf_message(buf: &[u8], i: usize) -> Message {
    let off = slot(buf, i);
    let key_len = read_u16(buf, off) as usize;
    let kind = MessageKind::try_from(buf[off + 2]).unwrap_or(MessageKind::Insert);
    let val_len = read_u32(buf, off + 3) as usize;

    let val_off = off + LEAF_CELL_OVERHEAD + key_len;
    Message {
        kind,
        value: buf[val_off..val_off + val_len].into(),
    }
}

/// Binary search over entry keys.
///
/// `Ok(i)` if the key is at slot `i`, `Err(i)` with the insertion point
/// otherwise.
pub fn find(buf: &[u8], key: &[u8], schema: &dyn Schema) -> Result<usize, usize> {
    let mut lo = 0;
    let mut hi = entry_count(buf);

    while lo < hi {
        let mid = lo + (hi - lo) / 2;

        match schema.compare(key_at(buf, mid), key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(mid),
        }
    }

    Err(lo)
}

/// Child index for `key`: the last entry whose pivot is `<= key`.
///
/// A key equal to a pivot lands on that pivot's child (the right child
/// of the split that created it).
pub fn index_find_child(buf: &[u8], key: &[u8], schema: &dyn Schema) -> usize {
    match find(buf, key, schema) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

/// Child address of the i-th index entry.
#[must_use]
pub fn index_child(buf: &[u8], i: usize) -> PageAddr {
    let off = slot(buf, i);
    read_u64(buf, off + 2)
}

/// Entry count statistic of the i-th index entry's subtree.
#[must_use]
pub fn index_tuple_count(buf: &[u8], i: usize) -> u64 {
    let off = slot(buf, i);
    read_u64(buf, off + 10)
}

/// Returns `true` if a leaf cell for `(key, msg)` fits.
#[must_use]
pub fn leaf_has_room(buf: &[u8], key_len: usize, val_len: usize) -> bool {
    free_space(buf) >= SLOT_LEN + LEAF_CELL_OVERHEAD + key_len + val_len
}

/// Returns `true` if an index cell for `key` fits.
#[must_use]
pub fn index_has_room(buf: &[u8], key_len: usize) -> bool {
    free_space(buf) >= SLOT_LEN + INDEX_CELL_OVERHEAD + key_len
}

/// Inserts a leaf cell at slot position `pos` (caller found via [`find`]).
///
/// Returns `false` without modification if the page is full.
#[allow(clippy::cast_possible_truncation)]
pub fn leaf_insert_at(buf: &mut [u8], pos: usize, key: &[u8], msg: &Message) -> bool {
    let cell_len = LEAF_CELL_OVERHEAD + key.len() + msg.value.len();
    if free_space(buf) < SLOT_LEN + cell_len {
        return false;
    }

    let cell_off = cell_start(buf) - cell_len;

    write_u16(buf, cell_off, key.len() as u16);
    buf[cell_off + 2] = u8::from(msg.kind);
    write_u32(buf, cell_off + 3, msg.value.len() as u32);
    buf[cell_off + LEAF_CELL_OVERHEAD..cell_off + LEAF_CELL_OVERHEAD + key.len()]
        .copy_from_slice(key);
    buf[cell_off + LEAF_CELL_OVERHEAD + key.len()..cell_off + cell_len]
        .copy_from_slice(&msg.value);

    insert_slot(buf, pos, cell_off);
    write_u16(buf, 4, (cell_off - 1) as u16);
    true
}

/// Inserts an index cell at slot position `pos`.
#[allow(clippy::cast_possible_truncation)]
pub fn index_insert_at(
    buf: &mut [u8],
    pos: usize,
    pivot: &[u8],
    child: PageAddr,
    tuple_count: u64,
) -> bool {
    let cell_len = INDEX_CELL_OVERHEAD + pivot.len();
    if free_space(buf) < SLOT_LEN + cell_len {
        return false;
    }

    let cell_off = cell_start(buf) - cell_len;

    write_u16(buf, cell_off, pivot.len() as u16);
    write_u64(buf, cell_off + 2, child);
    write_u64(buf, cell_off + 10, tuple_count);
    buf[cell_off + INDEX_CELL_OVERHEAD..cell_off + cell_len].copy_from_slice(pivot);

    insert_slot(buf, pos, cell_off);
    write_u16(buf, 4, (cell_off - 1) as u16);
    true
}

#[allow(clippy::cast_possible_truncation)]
fn insert_slot(buf: &mut [u8], pos: usize, cell_off: usize) {
    let n = entry_count(buf);
    debug_assert!(pos <= n);

    for i in (pos..n).rev() {
        let v = read_u16(buf, HEADER_LEN + SLOT_LEN * i);
        write_u16(buf, HEADER_LEN + SLOT_LEN * (i + 1), v);
    }

    write_u16(buf, HEADER_LEN + SLOT_LEN * pos, cell_off as u16);
    write_u16(buf, 2, (n + 1) as u16);
}

/// Removes the slot at `pos`.
///
/// The cell bytes become garbage until the next [`compact`].
#[allow(clippy::cast_possible_truncation)]
pub fn remove_at(buf: &mut [u8], pos: usize) {
    let n = entry_count(buf);
    debug_assert!(pos < n);

    for i in pos..n - 1 {
        let v = read_u16(buf, HEADER_LEN + SLOT_LEN * (i + 1));
        write_u16(buf, HEADER_LEN + SLOT_LEN * i, v);
    }

    write_u16(buf, 2, (n - 1) as u16);
}

/// Decoded leaf entry
pub struct LeafEntry {
    pub key: UserKey,
    pub msg: Message,
}

/// Decodes all leaf entries (used by iterators, splits and packing).
#[must_use]
pub fn leaf_entries(buf: &[u8]) -> Vec<LeafEntry> {
    (0..entry_count(buf))
        .map(|i| LeafEntry {
            key: key_at(buf, i).into(),
            msg: leaf_message(buf, i),
        })
        .collect()
}

/// Rewrites the page tightly, reclaiming garbage cell space.
pub fn compact(buf: &mut [u8]) {
    if is_leaf(buf) {
        let entries = leaf_entries(buf);
        let next = next_leaf(buf);

        init(buf, PageType::BtreeLeaf);
        set_next_leaf(buf, next);

        for (i, entry) in entries.iter().enumerate() {
            let ok = leaf_insert_at(buf, i, &entry.key, &entry.msg);
            debug_assert!(ok, "compacted entries must fit");
        }
    } else {
        let entries: Vec<(UserKey, PageAddr, u64)> = (0..entry_count(buf))
            .map(|i| (key_at(buf, i).into(), index_child(buf, i), index_tuple_count(buf, i)))
            .collect();

        init(buf, PageType::BtreeIndex);

        for (i, (pivot, child, count)) in entries.iter().enumerate() {
            let ok = index_insert_at(buf, i, pivot, *child, *count);
            debug_assert!(ok, "compacted entries must fit");
        }
    }
}

/// Splits a full leaf near the size median into `right` (a fresh page).
///
/// Returns the promoted pivot: the first key of the right half.
pub fn leaf_split(buf: &mut [u8], right: &mut [u8]) -> UserKey {
    let entries = leaf_entries(buf);
    debug_assert!(entries.len() >= 2, "splitting a near-empty leaf");

    let total: usize = entries
        .iter()
        .map(|e| LEAF_CELL_OVERHEAD + e.key.len() + e.msg.value.len())
        .sum();

    let mut split_at = entries.len() / 2;
    let mut acc = 0;
    for (i, e) in entries.iter().enumerate() {
        acc += LEAF_CELL_OVERHEAD + e.key.len() + e.msg.value.len();
        if acc * 2 >= total {
            split_at = i.max(1).min(entries.len() - 1);
            break;
        }
    }

    let next = next_leaf(buf);

    init(right, PageType::BtreeLeaf);
    set_next_leaf(right, next);

    for (i, e) in entries[split_at..].iter().enumerate() {
        let ok = leaf_insert_at(right, i, &e.key, &e.msg);
        debug_assert!(ok);
    }

    init(buf, PageType::BtreeLeaf);
    for (i, e) in entries[..split_at].iter().enumerate() {
        let ok = leaf_insert_at(buf, i, &e.key, &e.msg);
        debug_assert!(ok);
    }

    entries[split_at].key.clone()
}

/// Splits a full index node; the promoted pivot routes to `right`.
pub fn index_split(buf: &mut [u8], right: &mut [u8]) -> UserKey {
    let entries: Vec<(UserKey, PageAddr, u64)> = (0..entry_count(buf))
        .map(|i| (key_at(buf, i).into(), index_child(buf, i), index_tuple_count(buf, i)))
        .collect();
    debug_assert!(entries.len() >= 2);

    let split_at = entries.len() / 2;

    init(right, PageType::BtreeIndex);
    for (i, (pivot, child, count)) in entries[split_at..].iter().enumerate() {
        let ok = index_insert_at(right, i, pivot, *child, *count);
        debug_assert!(ok);
    }

    init(buf, PageType::BtreeIndex);
    for (i, (pivot, child, count)) in entries[..split_at].iter().enumerate() {
        let ok = index_insert_at(buf, i, pivot, *child, *count);
        debug_assert!(ok);
    }

    entries[split_at].0.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ByteSchema;
    use test_log::test;

    const PAGE: usize = 4_096;

    fn leaf_page() -> Vec<u8> {
        let mut buf = vec![0; PAGE];
        init(&mut buf, PageType::BtreeLeaf);
        buf
    }

    fn insert(buf: &mut [u8], key: &[u8], value: &[u8]) -> bool {
        match find(buf, key, &ByteSchema) {
            Ok(_) => panic!("duplicate key in test"),
            Err(pos) => leaf_insert_at(buf, pos, key, &Message::insert(value)),
        }
    }

    #[test]
    fn leaf_insert_find_round_trip() {
        let mut buf = leaf_page();

        assert!(insert(&mut buf, b"banana", b"1"));
        assert!(insert(&mut buf, b"apple", b"2"));
        assert!(insert(&mut buf, b"cherry", b"3"));

        assert_eq!(3, entry_count(&buf));
        assert_eq!(b"apple", key_at(&buf, 0));
        assert_eq!(b"banana", key_at(&buf, 1));
        assert_eq!(b"cherry", key_at(&buf, 2));

        let i = find(&buf, b"banana", &ByteSchema).expect("should exist");
        assert_eq!(*b"1", &*leaf_message(&buf, i).value);

        assert_eq!(Err(1), find(&buf, b"avocado", &ByteSchema));
    }

    #[test]
    fn leaf_fills_then_rejects() {
        let mut buf = leaf_page();

        let mut count = 0;
        loop {
            let key = format!("key{count:08}");
            if !insert(&mut buf, key.as_bytes(), &[0u8; 16]) {
                break;
            }
            count += 1;
        }

        assert!(count > 50, "a 4K page should hold a bunch of small entries");
        assert_eq!(count, entry_count(&buf));
    }

    #[test]
    fn leaf_split_preserves_order() {
        let mut buf = leaf_page();

        let mut i = 0;
        loop {
            let key = format!("key{i:08}");
            if !insert(&mut buf, key.as_bytes(), &[0u8; 16]) {
                break;
            }
            i += 1;
        }

        let n = entry_count(&buf);
        let mut right = vec![0; PAGE];
        let pivot = leaf_split(&mut buf, &mut right);

        assert_eq!(n, entry_count(&buf) + entry_count(&right));
        assert_eq!(key_at(&right, 0), &*pivot);

        // Keys at the boundary route right: pivot itself is in the right page
        assert!(find(&buf, &pivot, &ByteSchema).is_err());
        assert!(find(&right, &pivot, &ByteSchema).is_ok());

        // Strictly increasing across the boundary
        let last_left = key_at(&buf, entry_count(&buf) - 1).to_vec();
        assert!(last_left.as_slice() < &*pivot);
    }

    #[test]
    fn remove_and_compact_reclaims_space() {
        let mut buf = leaf_page();

        assert!(insert(&mut buf, b"a", &[0u8; 64]));
        assert!(insert(&mut buf, b"b", &[0u8; 64]));

        let free_before = free_space(&buf);
        remove_at(&mut buf, 0);
        compact(&mut buf);

        assert_eq!(1, entry_count(&buf));
        assert_eq!(b"b", key_at(&buf, 0));
        assert!(free_space(&buf) > free_before);
    }

    #[test]
    fn index_routing_ties_go_right() {
        let mut buf = vec![0; PAGE];
        init(&mut buf, PageType::BtreeIndex);

        // Root layout: ["" -> 100, "m" -> 200]
        assert!(index_insert_at(&mut buf, 0, b"", 100, 0));
        assert!(index_insert_at(&mut buf, 1, b"m", 200, 0));

        assert_eq!(0, index_find_child(&buf, b"a", &ByteSchema));
        assert_eq!(1, index_find_child(&buf, b"m", &ByteSchema));
        assert_eq!(1, index_find_child(&buf, b"z", &ByteSchema));
        assert_eq!(100, index_child(&buf, 0));
        assert_eq!(200, index_child(&buf, 1));
    }

    #[test]
    fn next_leaf_link() {
        let mut buf = leaf_page();
        assert_eq!(0, next_leaf(&buf));
        set_next_leaf(&mut buf, 12_345);
        assert_eq!(12_345, next_leaf(&buf));
    }

    #[test]
    fn type_check() {
        let buf = leaf_page();
        assert!(expect_type(&buf, PageType::BtreeLeaf).is_ok());
        assert!(expect_type(&buf, PageType::BtreeIndex).is_err());
    }
}

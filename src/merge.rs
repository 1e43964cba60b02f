// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::schema::fold_step;
use crate::{Message, SchemaRef, UserKey};
use interval_heap::IntervalHeap as Heap;

/// Source iterator for the merger; index 0 is the newest source.
pub type BoxedIterator<'a> = Box<dyn Iterator<Item = crate::Result<(UserKey, Message)>> + 'a>;

struct HeapItem {
    schema: SchemaRef,
    src: usize,
    key: UserKey,
    msg: Message,
}

impl Eq for HeapItem {}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.schema
            .compare(&self.key, &other.key)
            .then(self.src.cmp(&other.src))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple sorted KV iterators
///
/// Yields `(source index, key, message)` in key order; within one key,
/// sources come out in index order, i.e. newest first.
pub struct Merger<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: Heap<HeapItem>,
    schema: SchemaRef,
    initialized: bool,
}

impl<'a> Merger<'a> {
    #[must_use]
    pub fn new(schema: SchemaRef, iterators: Vec<BoxedIterator<'a>>) -> Self {
        let heap = Heap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            schema,
            initialized: false,
        }
    }

    #[allow(clippy::indexing_slicing)]
    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            if let Some(item) = self.iterators[idx].next() {
                let (key, msg) = item?;
                self.heap.push(HeapItem {
                    schema: self.schema.clone(),
                    src: idx,
                    key,
                    msg,
                });
            }
        }
        self.initialized = true;
        Ok(())
    }
}

impl Iterator for Merger<'_> {
    type Item = crate::Result<(usize, UserKey, Message)>;

    #[allow(clippy::indexing_slicing)]
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        let min_item = self.heap.pop_min()?;

        if let Some(next_item) = self.iterators[min_item.src].next() {
            let (key, msg) = fail_iter!(next_item);
            self.heap.push(HeapItem {
                schema: self.schema.clone(),
                src: min_item.src,
                key,
                msg,
            });
        }

        Some(Ok((min_item.src, min_item.key, min_item.msg)))
    }
}

/// Folds same-key runs of a [`Merger`] into one message per key
///
/// Messages arrive newest first; the fold stops at the first definitive
/// message and skips the remainder of the run. The folded message is
/// *not* finalized: the caller decides between [`crate::Schema::merge_final`]
/// (reads) and keeping the open chain (compaction onto older branches).
pub struct FoldedIter<'a> {
    merger: std::iter::Peekable<Merger<'a>>,
    schema: SchemaRef,
}

impl<'a> FoldedIter<'a> {
    #[must_use]
    pub fn new(schema: SchemaRef, merger: Merger<'a>) -> Self {
        Self {
            merger: merger.peekable(),
            schema,
        }
    }
}

impl Iterator for FoldedIter<'_> {
    type Item = crate::Result<(UserKey, Message)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, key, mut acc) = match self.merger.next()? {
            Ok(item) => item,
            Err(e) => return Some(Err(e)),
        };

        // Consume the rest of the run for this key.
        loop {
            let same_key = match self.merger.peek() {
                Some(Ok((_, next_key, _))) => {
                    self.schema.compare(next_key, &key) == std::cmp::Ordering::Equal
                }
                Some(Err(_)) => {
                    // Surface the error now.
                    #[allow(clippy::expect_used)]
                    let e = self
                        .merger
                        .next()
                        .expect("peeked")
                        .expect_err("peeked error");
                    return Some(Err(e));
                }
                None => false,
            };

            if !same_key {
                break;
            }

            #[allow(clippy::expect_used)]
            let (_, _, older) = self.merger.next().expect("peeked").expect("peeked ok");

            if !acc.is_definitive() {
                acc = fold_step(&*self.schema, &key, &acc, &older);
            }
        }

        Some(Ok((key, acc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteSchema, MessageKind};
    use std::sync::Arc;
    use test_log::test;

    fn src(items: Vec<(&str, Message)>) -> BoxedIterator<'static> {
        Box::new(
            items
                .into_iter()
                .map(|(k, m)| Ok((UserKey::from(k), m)))
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }

    #[test]
    fn merges_in_key_order() -> crate::Result<()> {
        let schema: SchemaRef = Arc::new(ByteSchema);

        let merger = Merger::new(
            schema,
            vec![
                src(vec![("a", Message::insert(*b"0")), ("c", Message::insert(*b"0"))]),
                src(vec![("b", Message::insert(*b"1"))]),
            ],
        );

        let keys: Vec<String> = merger
            .map(|item| item.map(|(_, k, _)| String::from_utf8_lossy(&k).into_owned()))
            .collect::<crate::Result<_>>()?;

        assert_eq!(vec!["a", "b", "c"], keys);
        Ok(())
    }

    #[test]
    fn newest_source_wins_at_equal_keys() -> crate::Result<()> {
        let schema: SchemaRef = Arc::new(ByteSchema);

        let merger = Merger::new(
            schema.clone(),
            vec![
                src(vec![("k", Message::insert(*b"new"))]),
                src(vec![("k", Message::insert(*b"old"))]),
            ],
        );

        let folded: Vec<_> = FoldedIter::new(schema, merger).collect::<crate::Result<_>>()?;

        assert_eq!(1, folded.len());
        assert_eq!(*b"new", &*folded[0].1.value);
        Ok(())
    }

    #[test]
    fn update_folds_over_older_insert() -> crate::Result<()> {
        let schema: SchemaRef = Arc::new(ByteSchema);

        let merger = Merger::new(
            schema.clone(),
            vec![
                src(vec![("k", Message::update(*b"v2"))]),
                src(vec![("k", Message::insert(*b"v1"))]),
            ],
        );

        let folded: Vec<_> = FoldedIter::new(schema, merger).collect::<crate::Result<_>>()?;

        assert_eq!(MessageKind::Insert, folded[0].1.kind);
        assert_eq!(*b"v2", &*folded[0].1.value);
        Ok(())
    }

    #[test]
    fn tombstones_stay_in_fold_output() -> crate::Result<()> {
        let schema: SchemaRef = Arc::new(ByteSchema);

        let merger = Merger::new(
            schema.clone(),
            vec![
                src(vec![("k", Message::delete())]),
                src(vec![("k", Message::insert(*b"v"))]),
            ],
        );

        let folded: Vec<_> = FoldedIter::new(schema, merger).collect::<crate::Result<_>>()?;

        // Compaction needs the tombstone; dropping it is the scan layer's job
        assert_eq!(MessageKind::Delete, folded[0].1.kind);
        Ok(())
    }
}

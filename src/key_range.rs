// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::{Schema, Slice, UserKey};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::{Read, Write};

/// A key range in the format of [min, max] (inclusive on both sides)
///
/// Comparisons go through the schema's key order, which is not
/// necessarily lexicographic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange(UserKey, UserKey);

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}<=>{}]",
            String::from_utf8_lossy(self.min()),
            String::from_utf8_lossy(self.max())
        )
    }
}

impl KeyRange {
    /// Creates a new key range.
    #[must_use]
    pub fn new((min, max): (UserKey, UserKey)) -> Self {
        Self(min, max)
    }

    /// Creates an empty key range.
    #[must_use]
    pub fn empty() -> Self {
        Self(Slice::empty(), Slice::empty())
    }

    /// Returns the lower bound.
    #[must_use]
    pub fn min(&self) -> &UserKey {
        &self.0
    }

    /// Returns the upper bound.
    #[must_use]
    pub fn max(&self) -> &UserKey {
        &self.1
    }

    /// Returns `true` if the key falls within this key range.
    #[must_use]
    pub fn contains_key(&self, key: &[u8], schema: &dyn Schema) -> bool {
        schema.compare(key, self.min()) != Ordering::Less
            && schema.compare(key, self.max()) != Ordering::Greater
    }

    /// Returns `true` if the `other` overlaps at least partially with this range.
    #[must_use]
    pub fn overlaps_with_key_range(&self, other: &Self, schema: &dyn Schema) -> bool {
        schema.compare(self.max(), other.min()) != Ordering::Less
            && schema.compare(self.min(), other.max()) != Ordering::Greater
    }

    /// Returns `true` if `other` is fully contained in this range.
    #[must_use]
    pub fn contains_range(&self, other: &Self, schema: &dyn Schema) -> bool {
        schema.compare(self.min(), other.min()) != Ordering::Greater
            && schema.compare(self.max(), other.max()) != Ordering::Less
    }

    /// Aggregates a key range.
    pub fn aggregate<'a>(mut iter: impl Iterator<Item = &'a Self>, schema: &dyn Schema) -> Self {
        let Some(first) = iter.next() else {
            return Self::empty();
        };

        let mut min = first.min();
        let mut max = first.max();

        for other in iter {
            let x = other.min();
            if schema.compare(x, min) == Ordering::Less {
                min = x;
            }

            let x = other.max();
            if schema.compare(x, max) == Ordering::Greater {
                max = x;
            }
        }

        Self(min.clone(), max.clone())
    }
}

impl Encode for KeyRange {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Max key size = u16
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<LittleEndian>(self.min().len() as u16)?;
        writer.write_all(self.min())?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<LittleEndian>(self.max().len() as u16)?;
        writer.write_all(self.max())?;

        Ok(())
    }
}

impl Decode for KeyRange {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key_min_len = reader.read_u16::<LittleEndian>()?;
        let key_min: UserKey = Slice::from_reader(reader, key_min_len.into())?;

        let key_max_len = reader.read_u16::<LittleEndian>()?;
        let key_max: UserKey = Slice::from_reader(reader, key_max_len.into())?;

        Ok(Self::new((key_min, key_max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ByteSchema;
    use test_log::test;

    fn string_key_range(a: &str, b: &str) -> KeyRange {
        KeyRange::new((a.as_bytes().into(), b.as_bytes().into()))
    }

    #[test]
    fn key_range_contains() {
        let range = string_key_range("b", "d");
        assert!(range.contains_key(b"b", &ByteSchema));
        assert!(range.contains_key(b"c", &ByteSchema));
        assert!(range.contains_key(b"d", &ByteSchema));
        assert!(!range.contains_key(b"a", &ByteSchema));
        assert!(!range.contains_key(b"e", &ByteSchema));
    }

    #[test]
    fn key_range_overlap() {
        let a = string_key_range("a", "f");
        assert!(a.overlaps_with_key_range(&string_key_range("b", "h"), &ByteSchema));
        assert!(a.overlaps_with_key_range(&string_key_range("f", "t"), &ByteSchema));
        assert!(!a.overlaps_with_key_range(&string_key_range("g", "t"), &ByteSchema));
    }

    #[test]
    fn key_range_aggregate() {
        let ranges = [
            string_key_range("d", "f"),
            string_key_range("a", "b"),
            string_key_range("c", "z"),
        ];
        let aggregated = KeyRange::aggregate(ranges.iter(), &ByteSchema);
        assert_eq!(b"a", &**aggregated.min());
        assert_eq!(b"z", &**aggregated.max());
    }

    #[test]
    fn key_range_encode_round_trip() -> Result<(), DecodeError> {
        let range = string_key_range("abc", "xyz");
        let bytes = range.encode_into_vec();
        let decoded = KeyRange::decode_from(&mut &bytes[..])?;
        assert_eq!(range, decoded);
        Ok(())
    }
}

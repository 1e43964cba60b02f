// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tuple header embedding timestamps into stored values, plus the
//! schema wrapper that threads them through merges.
//!
//! Layout (little-endian): `flags u8 | wts u64 | delta u64 | payload`.
//! Flag bit 0 marks a *timestamp-only update*: a message that carries
//! fresh timestamps for an evicted cache entry and must not disturb the
//! payload it merges into.

use super::timestamp::TimestampSet;
use crate::{Message, Schema, SchemaRef, UserValue};

pub const TUPLE_HEADER_LEN: usize = 17;

const FLAG_TS_UPDATE: u8 = 0b1;

/// Parsed tuple header
#[derive(Copy, Clone, Debug)]
pub struct TupleHeader {
    pub is_ts_update: bool,
    pub wts: u64,
    pub delta: u64,
}

impl TupleHeader {
    #[must_use]
    pub fn timestamps(&self) -> TimestampSet {
        TimestampSet::new(self.wts, self.delta)
    }
}

/// Prefixes `payload` with a tuple header.
#[must_use]
pub fn encode_tuple(wts: u64, delta: u64, is_ts_update: bool, payload: &[u8]) -> UserValue {
    let mut buf = Vec::with_capacity(TUPLE_HEADER_LEN + payload.len());
    buf.push(if is_ts_update { FLAG_TS_UPDATE } else { 0 });
    buf.extend_from_slice(&wts.to_le_bytes());
    buf.extend_from_slice(&delta.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.into()
}

/// Parses the header of a stored tuple.
///
/// Headerless values (tombstones have no payload) read as zero
/// timestamps.
#[must_use]
pub fn decode_header(value: &[u8]) -> TupleHeader {
    if value.len() < TUPLE_HEADER_LEN {
        return TupleHeader {
            is_ts_update: false,
            wts: 0,
            delta: 0,
        };
    }

    let mut wts = [0u8; 8];
    wts.copy_from_slice(&value[1..9]);
    let mut delta = [0u8; 8];
    delta.copy_from_slice(&value[9..17]);

    TupleHeader {
        is_ts_update: value[0] & FLAG_TS_UPDATE != 0,
        wts: u64::from_le_bytes(wts),
        delta: u64::from_le_bytes(delta),
    }
}

/// Application payload of a stored tuple.
#[must_use]
pub fn payload(value: &[u8]) -> &[u8] {
    value.get(TUPLE_HEADER_LEN..).unwrap_or(&[])
}

/// Wraps the application schema so that every stored message carries a
/// tuple header and timestamp-only updates merge into the header alone
pub struct TxnSchema {
    app: SchemaRef,
}

impl TxnSchema {
    #[must_use]
    pub fn new(app: SchemaRef) -> Self {
        Self { app }
    }
}

impl Schema for TxnSchema {
    fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        self.app.compare(a, b)
    }

    fn merge(&self, key: &[u8], newer: &Message, older: &Message) -> Message {
        let newer_hdr = decode_header(&newer.value);
        let older_hdr = decode_header(&older.value);

        // A stale ts-update below a real message carries nothing new.
        if older_hdr.is_ts_update {
            return newer.clone();
        }

        // A ts-update refreshes the older tuple's timestamps in place.
        if newer_hdr.is_ts_update {
            return Message {
                kind: older.kind,
                value: encode_tuple(
                    newer_hdr.wts,
                    newer_hdr.delta,
                    false,
                    payload(&older.value),
                ),
            };
        }

        // Regular merge: strip headers, compose payloads, keep the
        // newest timestamps. The result takes the older message's kind,
        // so an update chain over an insert stays definitive.
        let app_newer = Message {
            kind: newer.kind,
            value: payload(&newer.value).into(),
        };
        let app_older = Message {
            kind: older.kind,
            value: payload(&older.value).into(),
        };

        let merged = self.app.merge(key, &app_newer, &app_older);

        Message {
            kind: merged.kind,
            value: encode_tuple(newer_hdr.wts, newer_hdr.delta, false, &merged.value),
        }
    }

    fn merge_final(&self, key: &[u8], msg: Message) -> Option<UserValue> {
        // A chain that resolved to timestamps only has no value.
        if decode_header(&msg.value).is_ts_update {
            return None;
        }

        let app_msg = Message {
            kind: msg.kind,
            value: payload(&msg.value).into(),
        };
        self.app.merge_final(key, app_msg)
    }

    fn key_to_string(&self, key: &[u8]) -> String {
        self.app.key_to_string(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteSchema, MessageKind};
    use std::sync::Arc;
    use test_log::test;

    fn schema() -> TxnSchema {
        TxnSchema::new(Arc::new(ByteSchema))
    }

    #[test]
    fn header_round_trip() {
        let tuple = encode_tuple(42, 7, false, b"hello");
        let hdr = decode_header(&tuple);

        assert!(!hdr.is_ts_update);
        assert_eq!(42, hdr.wts);
        assert_eq!(7, hdr.delta);
        assert_eq!(b"hello", payload(&tuple));
    }

    #[test]
    fn ts_update_refreshes_header_only() {
        let schema = schema();

        let ts_update = Message::update(encode_tuple(99, 3, true, &[]));
        let stored = Message::insert(encode_tuple(10, 0, false, b"value"));

        let merged = schema.merge(b"k", &ts_update, &stored);

        let hdr = decode_header(&merged.value);
        assert_eq!(99, hdr.wts);
        assert_eq!(3, hdr.delta);
        assert!(!hdr.is_ts_update);
        assert_eq!(b"value", payload(&merged.value));
        assert_eq!(MessageKind::Insert, merged.kind);
    }

    #[test]
    fn stale_ts_update_is_discarded() {
        let schema = schema();

        let newer = Message::update(encode_tuple(50, 0, false, b"new"));
        let stale = Message::update(encode_tuple(10, 5, true, &[]));

        let merged = schema.merge(b"k", &newer, &stale);
        assert_eq!(newer.value, merged.value);
    }

    #[test]
    fn regular_merge_keeps_newest_timestamps() {
        let schema = schema();

        let newer = Message::update(encode_tuple(20, 1, false, b"v2"));
        let older = Message::insert(encode_tuple(10, 0, false, b"v1"));

        let merged = schema.merge(b"k", &newer, &older);

        let hdr = decode_header(&merged.value);
        assert_eq!(20, hdr.wts);
        assert_eq!(MessageKind::Insert, merged.kind);
        assert_eq!(b"v2", payload(&merged.value));
    }

    #[test]
    fn final_merge_strips_header() {
        let schema = schema();

        let msg = Message::insert(encode_tuple(5, 0, false, b"value"));
        assert_eq!(
            Some(UserValue::from(*b"value")),
            schema.merge_final(b"k", msg)
        );

        let ts_only = Message::update(encode_tuple(5, 0, true, &[]));
        assert_eq!(None, schema.merge_final(b"k", ts_only));
    }
}

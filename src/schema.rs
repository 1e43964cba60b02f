// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Message, UserValue};
use std::cmp::Ordering;
use std::sync::Arc;

/// Shared schema handle, injected at database open
pub type SchemaRef = Arc<dyn Schema>;

/// User-supplied data semantics: key order and message composition
///
/// Message chains are folded from newest to oldest. `merge` must be
/// associative in that direction; it is never called with a definitive
/// `newer` message because folding stops there.
pub trait Schema: Send + Sync {
    /// Total order over user keys.
    ///
    /// Defaults to lexicographic byte order.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    /// Composes a non-definitive `newer` message over an `older` one.
    fn merge(&self, key: &[u8], newer: &Message, older: &Message) -> Message;

    /// Resolves a chain that ended without a definitive message.
    ///
    /// Returns `None` if the chain resolves to "no value".
    fn merge_final(&self, key: &[u8], msg: Message) -> Option<UserValue>;

    /// Renders a key for diagnostics.
    fn key_to_string(&self, key: &[u8]) -> String {
        String::from_utf8_lossy(key).into_owned()
    }

    /// Renders a message for diagnostics.
    fn message_to_string(&self, msg: &Message) -> String {
        format!("{msg:?}")
    }
}

/// Default schema: opaque byte values, updates overwrite
///
/// `Update` behaves like a blind set, so `merge` keeps the newer payload
/// and only upgrades the message kind when the older message was
/// definitive.
#[derive(Copy, Clone, Default, Debug)]
pub struct ByteSchema;

impl Schema for ByteSchema {
    fn merge(&self, _key: &[u8], newer: &Message, older: &Message) -> Message {
        debug_assert!(!newer.is_definitive(), "definitive messages stop the fold");

        // The older message decides whether the key exists at all;
        // an update over a definitive state resolves to a definitive state.
        if older.is_definitive() {
            Message::insert(newer.value.clone())
        } else {
            Message::update(newer.value.clone())
        }
    }

    fn merge_final(&self, _key: &[u8], msg: Message) -> Option<UserValue> {
        match msg.kind {
            crate::MessageKind::Delete => None,
            _ => Some(msg.value),
        }
    }
}

/// Folds `newer` over `older`, honoring definitive messages.
///
/// This is the single fold step used by lookups, scans and compaction:
/// a definitive `newer` message shadows `older` entirely.
pub fn fold_step(schema: &dyn Schema, key: &[u8], newer: &Message, older: &Message) -> Message {
    if newer.is_definitive() {
        newer.clone()
    } else {
        schema.merge(key, newer, older)
    }
}

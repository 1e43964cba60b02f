// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
pub type UserValue = Slice;

/// Log generation number - a monotonically increasing counter
///
/// Every write-ahead log entry is stamped with a generation;
/// replay stitches the per-thread log shards back together by
/// sorting on it.
pub type Generation = u64;

/// Message kind
///
/// `Insert` and `Delete` are *definitive*: folding a message chain for a
/// key stops as soon as one is reached. `Update` is not; it composes with
/// older messages through [`crate::Schema::merge`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageKind {
    /// Sets the value, replacing whatever was there before
    Insert,

    /// Composes with the previous value via the schema's merge function
    Update,

    /// Removes the value (tombstone)
    Delete,
}

impl MessageKind {
    /// Returns `true` if the message terminates a merge chain.
    #[must_use]
    pub fn is_definitive(self) -> bool {
        matches!(self, Self::Insert | Self::Delete)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Insert),
            1 => Ok(Self::Update),
            2 => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(value: MessageKind) -> Self {
        match value {
            MessageKind::Insert => 0,
            MessageKind::Update => 1,
            MessageKind::Delete => 2,
        }
    }
}

/// A tagged value as stored in memtables, branches and the log
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    /// Message kind
    pub kind: MessageKind,

    /// Payload bytes
    ///
    /// Empty for tombstones.
    pub value: UserValue,
}

impl Message {
    /// Creates an insert message.
    pub fn insert<V: Into<UserValue>>(value: V) -> Self {
        Self {
            kind: MessageKind::Insert,
            value: value.into(),
        }
    }

    /// Creates an update message.
    pub fn update<V: Into<UserValue>>(value: V) -> Self {
        Self {
            kind: MessageKind::Update,
            value: value.into(),
        }
    }

    /// Creates a tombstone.
    #[must_use]
    pub fn delete() -> Self {
        Self {
            kind: MessageKind::Delete,
            value: UserValue::empty(),
        }
    }

    /// Returns `true` if the message terminates a merge chain.
    #[must_use]
    pub fn is_definitive(&self) -> bool {
        self.kind.is_definitive()
    }

    /// Returns `true` if the message is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.kind == MessageKind::Delete
    }

    /// Size of the message when encoded into a leaf cell.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + self.value.len()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {}",
            self.kind,
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_definitive() {
        assert!(Message::insert(*b"v").is_definitive());
        assert!(Message::delete().is_definitive());
        assert!(!Message::update(*b"v").is_definitive());
    }

    #[test]
    fn message_kind_round_trip() {
        for kind in [MessageKind::Insert, MessageKind::Update, MessageKind::Delete] {
            assert_eq!(Ok(kind), MessageKind::try_from(u8::from(kind)));
        }
        assert!(MessageKind::try_from(3).is_err());
    }
}

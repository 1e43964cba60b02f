// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crossbeam::atomic::AtomicCell;

const WTS_BITS: u32 = 63;
const WTS_MASK: u128 = (1u128 << WTS_BITS) - 1;
const DELTA_SHIFT: u32 = WTS_BITS;
const DELTA_MASK: u128 = (u64::MAX as u128) << DELTA_SHIFT;
const LOCK_BIT: u128 = 1u128 << 127;

/// A tuple's timestamps: `{wts: 63 bits, delta: 64 bits, lock: 1 bit}`
/// packed into one 128-bit word
///
/// `rts = wts + delta`. The wide delta avoids the overflow the original
/// 15-bit layout suffered under read-heavy workloads.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TimestampSet(u128);

impl TimestampSet {
    #[must_use]
    pub fn new(wts: u64, delta: u64) -> Self {
        debug_assert!(u128::from(wts) <= WTS_MASK);

        Self((u128::from(wts) & WTS_MASK) | (u128::from(delta) << DELTA_SHIFT))
    }

    /// Write timestamp.
    #[must_use]
    pub fn wts(self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let wts = (self.0 & WTS_MASK) as u64;
        wts
    }

    /// Read-timestamp extension over `wts`.
    #[must_use]
    pub fn delta(self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let delta = ((self.0 & DELTA_MASK) >> DELTA_SHIFT) as u64;
        delta
    }

    /// Read timestamp.
    #[must_use]
    pub fn rts(self) -> u64 {
        self.wts().saturating_add(self.delta())
    }

    #[must_use]
    pub fn locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    #[must_use]
    pub fn with_lock(self, locked: bool) -> Self {
        if locked {
            Self(self.0 | LOCK_BIT)
        } else {
            Self(self.0 & !LOCK_BIT)
        }
    }

    #[must_use]
    pub fn with_delta(self, delta: u64) -> Self {
        Self((self.0 & !DELTA_MASK) | (u128::from(delta) << DELTA_SHIFT))
    }

    /// The later of two timestamp sets, ordered by `(wts, delta)`.
    ///
    /// Used to fold a tuple's on-disk timestamps into the cache entry.
    #[must_use]
    pub fn newest(self, other: Self) -> Self {
        if (other.wts(), other.delta()) > (self.wts(), self.delta()) {
            other.with_lock(self.locked())
        } else {
            self
        }
    }
}

/// CAS cell over a [`TimestampSet`]
#[derive(Default)]
pub struct AtomicTimestampSet(AtomicCell<TimestampSet>);

impl AtomicTimestampSet {
    #[must_use]
    pub fn new(ts: TimestampSet) -> Self {
        Self(AtomicCell::new(ts))
    }

    #[must_use]
    pub fn load(&self) -> TimestampSet {
        self.0.load()
    }

    /// Single compare-and-swap attempt.
    pub fn cas(&self, current: TimestampSet, new: TimestampSet) -> bool {
        self.0.compare_exchange(current, new).is_ok()
    }

    /// Tries to set the lock bit; fails if it is already set.
    pub fn try_lock(&self) -> bool {
        let v = self.0.load();
        if v.locked() {
            return false;
        }
        self.cas(v, v.with_lock(true))
    }

    /// Clears the lock bit.
    pub fn unlock(&self) {
        loop {
            let v = self.0.load();
            debug_assert!(v.locked(), "unlock without lock");
            if self.cas(v, v.with_lock(false)) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn pack_unpack() {
        let ts = TimestampSet::new(123_456, 789);
        assert_eq!(123_456, ts.wts());
        assert_eq!(789, ts.delta());
        assert_eq!(124_245, ts.rts());
        assert!(!ts.locked());
    }

    #[test]
    fn lock_bit_is_separate() {
        let ts = TimestampSet::new(5, 7).with_lock(true);
        assert!(ts.locked());
        assert_eq!(5, ts.wts());
        assert_eq!(7, ts.delta());
        assert!(!ts.with_lock(false).locked());
    }

    #[test]
    fn wide_delta_does_not_overflow() {
        let ts = TimestampSet::new(1, u64::MAX - 1);
        assert_eq!(u64::MAX - 1, ts.delta());
        assert_eq!(u64::MAX, ts.rts());
    }

    #[test]
    fn newest_prefers_later_wts() {
        let a = TimestampSet::new(10, 0);
        let b = TimestampSet::new(7, 100);
        assert_eq!(a, a.newest(b));
        assert_eq!(a, b.newest(a));

        let c = TimestampSet::new(10, 5);
        assert_eq!(c, a.newest(c));
    }

    #[test]
    fn atomic_lock_cycle() {
        let cell = AtomicTimestampSet::new(TimestampSet::new(1, 0));
        assert!(cell.try_lock());
        assert!(!cell.try_lock());
        cell.unlock();
        assert!(cell.try_lock());
    }
}

//! The timer wheel (spec §3 "Timer heap", §4.4).
//!
//! A single min-heap per loop, ordered by absolute deadline with ties
//! broken by insertion order. Represented as a `BTreeSet` of
//! `(deadline, sequence, handle)` triples rather than a binary heap: both
//! give O(log n) insert and O(1) peek, but only the set supports the
//! arbitrary-element `remove` spec §4.4's "relink" needs (cancel-then-
//! reinsert after every I/O completion on an idle-timed handle) without
//! the lazy-tombstone bookkeeping a `BinaryHeap` would require.

use std::collections::BTreeSet;

use crate::handle::HandleId;

/// Handle to a single entry in the wheel, returned by `insert` and
/// required by `remove`/`relink` — the `(deadline, sequence)` pair that
/// makes the entry's `Ord` key unique.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct TimerKey {
    pub deadline: i64,
    pub sequence: u64,
}

#[derive(Default)]
pub struct TimerWheel {
    entries: BTreeSet<(i64, u64, HandleId)>,
    next_sequence: u64,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `handle` with the given absolute `deadline` (milliseconds).
    pub fn insert(&mut self, deadline: i64, handle: HandleId) -> TimerKey {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert((deadline, sequence, handle));
        TimerKey { deadline, sequence }
    }

    /// Remove a previously-inserted entry. No-op if already popped.
    pub fn remove(&mut self, key: TimerKey, handle: HandleId) {
        self.entries.remove(&(key.deadline, key.sequence, handle));
    }

    /// Cancel `key` and reinsert `handle` at `new_deadline` (spec §4.4's
    /// per-completion relink, used to implement idle timeouts).
    pub fn relink(&mut self, key: TimerKey, handle: HandleId, new_deadline: i64) -> TimerKey {
        self.remove(key, handle);
        self.insert(new_deadline, handle)
    }

    /// The earliest deadline currently in the wheel, if any.
    pub fn peek_deadline(&self) -> Option<i64> {
        self.entries.iter().next().map(|(d, _, _)| *d)
    }

    /// Pop and return every entry whose deadline is `<= now`, in deadline
    /// (then insertion) order — the firing policy of spec §4.4.
    pub fn pop_expired(&mut self, now: i64) -> Vec<(TimerKey, HandleId)> {
        let mut expired = Vec::new();
        while let Some(&(deadline, sequence, handle)) = self.entries.iter().next() {
            if deadline > now {
                break;
            }
            self.entries.remove(&(deadline, sequence, handle));
            expired.push((TimerKey { deadline, sequence }, handle));
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_order_with_fifo_ties() {
        let mut wheel = TimerWheel::new();
        let a = wheel.insert(100, HandleId(1));
        let _b = wheel.insert(50, HandleId(2));
        let _c = wheel.insert(100, HandleId(3));
        assert_eq!(wheel.peek_deadline(), Some(50));

        let expired = wheel.pop_expired(100);
        let order: Vec<_> = expired.iter().map(|(_, h)| h.0).collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert!(wheel.is_empty());
        let _ = a;
    }

    #[test]
    fn relink_moves_deadline_without_changing_handle() {
        let mut wheel = TimerWheel::new();
        let key = wheel.insert(10, HandleId(7));
        let key2 = wheel.relink(key, HandleId(7), 200);
        assert_eq!(wheel.peek_deadline(), Some(200));
        assert_eq!(key2.deadline, 200);
    }

    #[test]
    fn top_is_always_le_every_other_deadline() {
        let mut wheel = TimerWheel::new();
        for (i, d) in [40, 10, 90, 20, 5].into_iter().enumerate() {
            wheel.insert(d, HandleId(i));
        }
        let top = wheel.peek_deadline().unwrap();
        for &(d, _, _) in wheel.entries.iter() {
            assert!(top <= d);
        }
    }
}

//! Deferred coalescing of free intervals.
//!
//! Freed blocks are not merged with their neighbors when they are freed.
//! Instead, every `merge_interval` operations the whole free-interval index is
//! folded and rebuilt, and the period is halved (down to a floor) so that
//! coalescing becomes more frequent as the run goes on.

use alloc::vec::Vec;

use crate::FreeInterval;

/// Decides when the next coalescing round is due.
#[derive(Clone, Debug)]
pub(super) struct Scheduler {
    merge_interval: u64,
    floor: u64,
    request_count: u64,
    merges: u64,
}

impl Scheduler {
    pub(super) const fn new(merge_interval: u64, floor: u64) -> Self {
        Scheduler {
            merge_interval,
            floor,
            request_count: 0,
            merges: 0,
        }
    }

    /// Count one completed operation. Returns `true` when a coalescing round
    /// is due, in which case the count is reset and the period shortened.
    pub(super) fn tick(&mut self) -> bool {
        self.request_count += 1;
        if self.request_count < self.merge_interval {
            return false;
        }

        self.request_count = 0;
        self.merge_interval = core::cmp::max(self.floor, self.merge_interval / 2);
        self.merges += 1;
        true
    }

    pub(super) fn merge_interval(&self) -> u64 {
        self.merge_interval
    }

    pub(super) fn request_count(&self) -> u64 {
        self.request_count
    }

    pub(super) fn merges(&self) -> u64 {
        self.merges
    }
}

/// Fold address-adjacent intervals together.
///
/// `intervals` must be sorted by start address. An interval that begins
/// exactly where the last accepted one ends is absorbed into it; anything else
/// starts a new entry.
pub(super) fn coalesce(intervals: impl IntoIterator<Item = FreeInterval>) -> Vec<FreeInterval> {
    let mut merged: Vec<FreeInterval> = Vec::new();
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if last.end() == interval.start => last.size += interval.size,
            _ => merged.push(interval),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn period_halves_down_to_the_floor() {
        let mut scheduler = Scheduler::new(100, 10);

        let mut periods = vec![];
        for _ in 0..6 {
            let period = scheduler.merge_interval();
            for _ in 1..period {
                assert!(!scheduler.tick());
            }
            assert!(scheduler.tick());
            assert_eq!(scheduler.request_count(), 0);
            periods.push(period);
        }

        assert_eq!(periods, [100, 50, 25, 12, 10, 10]);
        assert_eq!(scheduler.merges(), 6);
    }

    #[test]
    fn coalesce_folds_runs() {
        let merged = coalesce([
            FreeInterval::new(0, 10),
            FreeInterval::new(10, 5),
            FreeInterval::new(15, 1),
            FreeInterval::new(20, 4),
            FreeInterval::new(30, 2),
            FreeInterval::new(32, 8),
        ]);
        assert_eq!(
            merged,
            [
                FreeInterval::new(0, 16),
                FreeInterval::new(20, 4),
                FreeInterval::new(30, 10),
            ]
        );
    }

    #[test]
    fn coalesce_leaves_gaps_alone() {
        let intervals = [FreeInterval::new(0, 4), FreeInterval::new(5, 4)];
        assert_eq!(coalesce(intervals), intervals);
        assert!(coalesce([]).is_empty());
    }
}

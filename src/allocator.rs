//! The allocator core.
//!
//! Requests are served from the free-interval tree whenever its fit search
//! turns something up. When it doesn't, the arena grows by one chunk, placed
//! at the current high-water mark, and the search is retried. A fitting
//! interval larger than the request is split, and the remainder goes back
//! into the tree.
//!
//! Every completed operation, and every growth step, ticks the coalescing
//! scheduler. Freed intervals are not merged with their neighbors until the
//! next coalescing round, so between rounds the tree may hold several
//! address-contiguous intervals.
//!
//! Allocated blocks never move.

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{Error, FreeInterval, FreeTree, InvariantViolation, Iter, Result, Stats};

mod coalesce;
use coalesce::{coalesce, Scheduler};

/// The default arena growth quantum: 16 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024;

/// The default number of operations before the first coalescing round.
pub const DEFAULT_MERGE_INTERVAL: u64 = 100;

/// The default lower bound on the coalescing period.
pub const DEFAULT_MERGE_INTERVAL_FLOOR: u64 = 10;

/// Tunables for an [`Allocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    chunk_size: u64,
    initial_merge_interval: u64,
    merge_interval_floor: u64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaConfig {
    /// The default configuration: 16 KiB chunks, a first coalescing round
    /// after 100 operations, and a coalescing period no shorter than 10.
    pub const fn new() -> Self {
        ArenaConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_merge_interval: DEFAULT_MERGE_INTERVAL,
            merge_interval_floor: DEFAULT_MERGE_INTERVAL_FLOOR,
        }
    }

    /// Set the number of bytes the arena grows by at a time.
    pub const fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the number of operations before the first coalescing round.
    pub const fn with_merge_interval(mut self, interval: u64) -> Self {
        self.initial_merge_interval = interval;
        self
    }

    /// Set the shortest coalescing period. Clamped to at least one.
    pub const fn with_merge_interval_floor(mut self, floor: u64) -> Self {
        self.merge_interval_floor = if floor == 0 { 1 } else { floor };
        self
    }

    /// The arena growth quantum.
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// The number of operations before the first coalescing round.
    pub const fn merge_interval(&self) -> u64 {
        self.initial_merge_interval
    }

    /// The shortest coalescing period.
    pub const fn merge_interval_floor(&self) -> u64 {
        self.merge_interval_floor
    }
}

/// One request from an allocation trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// Allocate `size` bytes under `id`.
    Allocate {
        /// The caller's name for the allocation.
        id: u64,
        /// The number of bytes requested.
        size: u64,
    },
    /// Free the allocation named `id`.
    Free {
        /// The caller's name for the allocation.
        id: u64,
    },
}

/// What happened while replaying a trace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// The number of operations applied.
    pub operations: usize,
    /// The number of frees that named no live allocation and were skipped.
    pub unknown_frees: usize,
}

/// A simulated allocator over a growable arena of addresses.
#[derive(Clone, Debug)]
pub struct Allocator {
    config: ArenaConfig,

    /// Every free byte of the arena, as intervals keyed by start address.
    free_tree: FreeTree,

    /// Live allocations: id to `(start, size)`. This is the only way back
    /// from an id to its address range.
    allocations: BTreeMap<u64, (u64, u64)>,

    /// The arena high-water mark.
    total_memory: u64,

    /// The sum of live allocation sizes, including leaked blocks.
    used_memory: u64,

    /// Blocks whose id was allocated again while still live, as
    /// `(start, size)`. They stay in use forever.
    leaked: Vec<(u64, u64)>,

    /// The sum of leaked block sizes.
    leaked_memory: u64,

    scheduler: Scheduler,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    /// Create an allocator with the default [`ArenaConfig`].
    pub const fn new() -> Self {
        Self::from_valid_config(ArenaConfig::new())
    }

    /// Create an allocator with the given configuration.
    ///
    /// Fails with [`Error::ZeroChunkSize`] if the chunk size is zero, since
    /// such an arena could never grow.
    pub fn with_config(config: ArenaConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(Error::ZeroChunkSize);
        }
        Ok(Self::from_valid_config(config))
    }

    const fn from_valid_config(config: ArenaConfig) -> Self {
        Allocator {
            config,
            free_tree: FreeTree::new(),
            allocations: BTreeMap::new(),
            total_memory: 0,
            used_memory: 0,
            leaked: Vec::new(),
            leaked_memory: 0,
            scheduler: Scheduler::new(
                config.initial_merge_interval,
                config.merge_interval_floor,
            ),
        }
    }

    /// This allocator's configuration.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// The size of the arena in bytes. Never shrinks.
    #[inline]
    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// The number of bytes in live allocations, including leaked blocks.
    #[inline]
    pub fn used_memory(&self) -> u64 {
        self.used_memory
    }

    /// The number of bytes in blocks that were orphaned by allocating their
    /// id again. These count as used and are never freed.
    #[inline]
    pub fn leaked_memory(&self) -> u64 {
        self.leaked_memory
    }

    /// `used_memory / total_memory`, or zero for an empty arena.
    pub fn utilization(&self) -> f64 {
        self.stats().utilization()
    }

    /// The current coalescing period.
    pub fn merge_interval(&self) -> u64 {
        self.scheduler.merge_interval()
    }

    /// Operations counted since the last coalescing round.
    pub fn request_count(&self) -> u64 {
        self.scheduler.request_count()
    }

    /// The free-interval index.
    pub fn free_tree(&self) -> &FreeTree {
        &self.free_tree
    }

    /// Iterate over free intervals in ascending address order.
    pub fn free_intervals(&self) -> Iter<'_> {
        self.free_tree.iter()
    }

    /// The `(start, size)` of the live allocation named `id`.
    pub fn allocation(&self, id: u64) -> Option<(u64, u64)> {
        self.allocations.get(&id).copied()
    }

    /// Iterate over live allocations as `(id, (start, size))`, in id order.
    pub fn allocations(&self) -> impl Iterator<Item = (u64, (u64, u64))> + '_ {
        self.allocations.iter().map(|(id, range)| (*id, *range))
    }

    /// A snapshot of the allocator's counters.
    pub fn stats(&self) -> Stats {
        Stats {
            total_memory: self.total_memory,
            used_memory: self.used_memory,
            free_intervals: self.free_tree.len(),
            live_allocations: self.allocations.len(),
            leaked_memory: self.leaked_memory,
            merges: self.scheduler.merges(),
        }
    }

    /// Allocate `size` bytes under `id`, returning the start address.
    ///
    /// Growing the arena when the fit search comes up empty means this never
    /// fails. If `id` is already live, its record is overwritten and the old
    /// block is leaked: it stays counted in [`used_memory`][Self::used_memory]
    /// and never returns to the free index.
    pub fn allocate(&mut self, id: u64, size: u64) -> u64 {
        log::trace!("allocate id{id} size={size}");

        loop {
            let Some(block) = self.free_tree.search_for_fit(size) else {
                self.grow();
                self.tick();
                continue;
            };

            let removed = self.free_tree.delete(block.start);
            debug_assert_eq!(removed, Some(block));

            if block.size > size {
                let remainder = FreeInterval::new(block.start + size, block.size - size);
                log::debug!(
                    "splitting {:#x}+{} into {size} used and {} free",
                    block.start,
                    block.size,
                    remainder.size
                );
                self.free_tree.insert(remainder.start, remainder.size);
            }

            if let Some((old_start, old_size)) = self.allocations.insert(id, (block.start, size))
            {
                log::warn!(
                    "id{id} was still allocated; leaking its {old_size} bytes at {old_start:#x}"
                );
                self.leaked.push((old_start, old_size));
                self.leaked_memory += old_size;
            }
            self.used_memory += size;
            self.tick();
            return block.start;
        }
    }

    /// Free the allocation named `id`, returning its range to the free
    /// index.
    ///
    /// Freeing an id that is not live reports
    /// [`Error::UnknownAllocationId`] and changes nothing.
    pub fn free(&mut self, id: u64) -> Result<()> {
        log::trace!("free id{id}");

        let Some((start, size)) = self.allocations.remove(&id) else {
            log::warn!("free of unknown allocation id{id}");
            return Err(Error::UnknownAllocationId(id));
        };

        self.used_memory -= size;
        // A zero-size block owns no bytes to give back.
        if size > 0 {
            self.free_tree.insert(start, size);
        }
        self.tick();
        Ok(())
    }

    /// Apply one trace operation.
    pub fn apply(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Allocate { id, size } => {
                self.allocate(id, size);
                Ok(())
            }
            Op::Free { id } => self.free(id),
        }
    }

    /// Apply every operation in `ops`, skipping frees of unknown ids.
    pub fn replay(&mut self, ops: impl IntoIterator<Item = Op>) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        for op in ops {
            summary.operations += 1;
            match op {
                Op::Allocate { id, size } => {
                    self.allocate(id, size);
                }
                Op::Free { id } => {
                    if self.free(id).is_err() {
                        summary.unknown_frees += 1;
                    }
                }
            }
        }
        log::debug!(
            "replayed {} operations ({} unknown frees)",
            summary.operations,
            summary.unknown_frees
        );
        summary
    }

    /// Parse a whole trace (see [`crate::trace`]) and replay it.
    ///
    /// Nothing is applied unless every line parses.
    #[cfg(feature = "trace")]
    pub fn replay_trace(&mut self, text: &str) -> Result<ReplaySummary> {
        let ops = crate::trace::parse_trace(text).collect::<Result<Vec<_>, _>>()?;
        Ok(self.replay(ops))
    }

    /// Fold all address-adjacent free intervals together and rebuild the
    /// free-interval tree from the result.
    ///
    /// This runs automatically on the coalescing schedule; calling it directly
    /// does not affect that schedule.
    pub fn merge(&mut self) {
        let before = self.free_tree.len();
        let merged = coalesce(self.free_tree.iter());
        self.free_tree = merged.into_iter().collect();

        log::debug!(
            "coalesced {before} free intervals into {}; next round in {} operations",
            self.free_tree.len(),
            self.scheduler.merge_interval()
        );
        debug_assert!(self.check_coalesced().is_ok());
    }

    /// Check that no two free intervals are address-adjacent. Holds right
    /// after a [`merge`][Self::merge].
    pub fn check_coalesced(&self) -> Result<()> {
        let mut prev: Option<FreeInterval> = None;
        for interval in self.free_tree.iter() {
            if let Some(prev) = prev.filter(|p| p.end() == interval.start) {
                return Err(InvariantViolation::AdjacentAfterMerge {
                    first: prev.start,
                    second: interval.start,
                }
                .into());
            }
            prev = Some(interval);
        }
        Ok(())
    }

    /// Check every structural property of the allocator:
    ///
    /// * the free-interval tree is a valid red-black tree of non-overlapping
    ///   intervals,
    ///
    /// * the arena size equals used bytes (live and leaked) plus free bytes,
    ///
    /// * no live or leaked block overlaps a free interval or another block,
    ///   and everything lies inside the arena.
    ///
    /// Failures are reported as [`Error::InvariantViolation`].
    pub fn check_invariants(&self) -> Result<()> {
        self.free_tree.validate()?;

        let free = self.free_tree.free_bytes();
        let live: u64 = self.allocations.values().map(|(_, size)| size).sum();
        let leaked: u64 = self.leaked.iter().map(|(_, size)| size).sum();
        if leaked != self.leaked_memory
            || live + leaked != self.used_memory
            || self.used_memory + free != self.total_memory
        {
            return Err(InvariantViolation::ConservationMismatch {
                total: self.total_memory,
                used: self.used_memory,
                free,
            }
            .into());
        }

        // Sweep free, live and leaked ranges together in address order.
        // Leaked blocks have no id left; they are reported by start address.
        let mut ranges: Vec<(u64, u64, Option<u64>)> = self
            .free_tree
            .iter()
            .map(|i| (i.start, i.end(), None))
            .chain(
                self.allocations
                    .iter()
                    .filter(|(_, (_, size))| *size > 0)
                    .map(|(id, (start, size))| (*start, start + size, Some(*id))),
            )
            .chain(
                self.leaked
                    .iter()
                    .filter(|(_, size)| *size > 0)
                    .map(|(start, size)| (*start, start + size, Some(*start))),
            )
            .collect();
        ranges.sort_unstable();

        let mut prev: Option<(u64, u64, Option<u64>)> = None;
        for range in ranges {
            let (start, end, owner) = range;
            if end > self.total_memory {
                return Err(match owner {
                    Some(id) => InvariantViolation::LiveOverlapsFree { id },
                    None => InvariantViolation::OverlappingIntervals {
                        first: start,
                        second: self.total_memory,
                    },
                }
                .into());
            }
            if let Some((prev_start, prev_end, prev_owner)) = prev {
                if prev_end > start {
                    return Err(match (owner, prev_owner) {
                        (Some(id), _) | (None, Some(id)) => {
                            InvariantViolation::LiveOverlapsFree { id }
                        }
                        (None, None) => InvariantViolation::OverlappingIntervals {
                            first: prev_start,
                            second: start,
                        },
                    }
                    .into());
                }
            }
            prev = Some(range);
        }

        Ok(())
    }

    /// Claim one more chunk at the top of the arena.
    fn grow(&mut self) {
        let chunk = self.config.chunk_size;
        self.free_tree.insert(self.total_memory, chunk);
        self.total_memory += chunk;
        log::debug!("grew arena by {chunk} bytes to {}", self.total_memory);
    }

    fn tick(&mut self) {
        if self.scheduler.tick() {
            self.merge();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunks() -> Allocator {
        Allocator::with_config(ArenaConfig::new().with_chunk_size(4096)).unwrap()
    }

    #[test]
    fn empty_allocator() {
        let allocator = Allocator::new();
        assert_eq!(allocator.total_memory(), 0);
        assert_eq!(allocator.used_memory(), 0);
        assert_eq!(allocator.utilization(), 0.0);
        allocator.check_invariants().unwrap();
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert_eq!(
            Allocator::with_config(ArenaConfig::new().with_chunk_size(0)).unwrap_err(),
            Error::ZeroChunkSize
        );
    }

    #[test]
    fn whole_chunk_then_split() {
        let mut a = small_chunks();

        assert_eq!(a.allocate(1, 4096), 0);
        assert_eq!(a.used_memory(), 4096);
        assert_eq!(a.total_memory(), 4096);
        assert!(a.free_tree().is_empty());

        assert_eq!(a.allocate(2, 100), 4096);
        assert_eq!(a.total_memory(), 8192);
        assert_eq!(a.free_intervals().collect::<Vec<_>>(), [FreeInterval::new(4196, 3996)]);

        a.free(1).unwrap();
        assert_eq!(a.used_memory(), 100);
        assert_eq!(
            a.free_intervals().collect::<Vec<_>>(),
            [FreeInterval::new(0, 4096), FreeInterval::new(4196, 3996)]
        );
        a.check_invariants().unwrap();
    }

    #[test]
    fn large_request_grows_repeatedly() {
        let mut a = Allocator::new();
        let start = a.allocate(3, 20_000);

        assert!(a.total_memory() >= 20_000);
        assert!(a.total_memory() >= 2 * DEFAULT_CHUNK_SIZE);
        assert_eq!(a.total_memory() % DEFAULT_CHUNK_SIZE, 0);
        assert_eq!(a.allocation(3), Some((start, 20_000)));
        assert!(a.stats().merges >= 1);
        a.check_invariants().unwrap();
    }

    #[test]
    fn unknown_free_changes_nothing() {
        let mut a = small_chunks();
        a.allocate(1, 10);
        let before = a.stats();
        let request_count = a.request_count();

        assert_eq!(a.free(42), Err(Error::UnknownAllocationId(42)));
        assert_eq!(a.stats(), before);
        assert_eq!(a.request_count(), request_count);
    }

    #[test]
    fn double_free_is_reported() {
        let mut a = small_chunks();
        a.allocate(7, 64);
        a.free(7).unwrap();
        assert_eq!(a.free(7), Err(Error::UnknownAllocationId(7)));
        a.check_invariants().unwrap();
    }

    #[test]
    fn allocate_then_free_restores_used_memory() {
        let mut a = small_chunks();
        a.allocate(1, 300);
        let used = a.used_memory();
        a.allocate(2, 5000);
        a.free(2).unwrap();
        assert_eq!(a.used_memory(), used);
        a.check_invariants().unwrap();
    }

    #[test]
    fn zero_size_allocation() {
        let mut a = small_chunks();
        let start = a.allocate(1, 0);
        assert_eq!(a.used_memory(), 0);
        assert_eq!(a.total_memory(), 4096);
        assert_eq!(a.free_intervals().collect::<Vec<_>>(), [FreeInterval::new(start, 4096)]);

        a.free(1).unwrap();
        assert_eq!(a.free_tree().len(), 1);
        a.check_invariants().unwrap();
    }

    #[test]
    fn reallocating_a_live_id_leaks_the_old_block() {
        let mut a = small_chunks();
        a.allocate(1, 100);
        let request_count = a.request_count();

        let start = a.allocate(1, 200);
        assert_eq!(a.request_count(), request_count + 1);
        assert_eq!(a.allocation(1), Some((start, 200)));
        assert_eq!(a.used_memory(), 300);
        assert_eq!(a.leaked_memory(), 100);
        assert_eq!(a.stats().live_allocations, 1);
        assert!(a.free_intervals().all(|i| i.start >= 100));
        a.check_invariants().unwrap();

        // Only the newest block comes back.
        a.free(1).unwrap();
        assert_eq!(a.used_memory(), 100);
        a.merge();
        assert_eq!(a.free_intervals().collect::<Vec<_>>(), [FreeInterval::new(100, 3996)]);
        a.check_invariants().unwrap();
    }

    #[test]
    fn broken_bookkeeping_is_reported_as_an_invariant_violation() {
        let mut a = small_chunks();
        a.allocate(1, 100);
        a.used_memory += 1;
        assert!(matches!(
            a.check_invariants(),
            Err(Error::InvariantViolation(
                InvariantViolation::ConservationMismatch { .. }
            ))
        ));
    }

    #[test]
    fn adjacent_free_intervals_fail_the_coalesced_check() {
        let mut a = small_chunks();
        a.allocate(1, 100);
        a.free(1).unwrap();
        assert_eq!(
            a.check_coalesced(),
            Err(Error::InvariantViolation(
                InvariantViolation::AdjacentAfterMerge {
                    first: 0,
                    second: 100
                }
            ))
        );
        a.merge();
        a.check_coalesced().unwrap();
    }

    #[cfg(feature = "trace")]
    #[test]
    fn replay_trace_applies_parsed_ops() {
        let mut a = small_chunks();
        let summary = a.replay_trace("a 1 4096\na 2 100\nf 1\nf 5\n").unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                operations: 4,
                unknown_frees: 1
            }
        );
        assert_eq!(a.used_memory(), 100);
    }

    #[cfg(feature = "trace")]
    #[test]
    fn replay_trace_rejects_bad_lines_without_applying_anything() {
        let mut a = small_chunks();
        let err = a.replay_trace("a 1 10\nq 2\n").unwrap_err();
        assert_eq!(
            err,
            Error::Trace(crate::TraceError {
                line: 2,
                kind: crate::TraceErrorKind::UnknownOperation
            })
        );
        assert_eq!(a.total_memory(), 0);
        assert_eq!(a.stats().live_allocations, 0);
    }

    #[test]
    fn merge_folds_freed_neighbors() {
        let mut a = small_chunks();
        for id in 0..4 {
            a.allocate(id, 1024);
        }
        for id in 0..4 {
            a.free(id).unwrap();
        }
        assert_eq!(a.free_tree().len(), 4);

        a.merge();
        assert_eq!(a.free_intervals().collect::<Vec<_>>(), [FreeInterval::new(0, 4096)]);
        a.check_coalesced().unwrap();
        a.check_invariants().unwrap();
    }

    #[test]
    fn scheduled_merge_runs_and_shortens_period() {
        let mut a = Allocator::with_config(
            ArenaConfig::new()
                .with_chunk_size(4096)
                .with_merge_interval(4)
                .with_merge_interval_floor(2),
        )
        .unwrap();

        // grow, allocate
        a.allocate(1, 16);
        assert_eq!(a.request_count(), 2);
        // allocate, free: the fourth tick coalesces
        a.allocate(2, 16);
        a.free(1).unwrap();

        assert_eq!(a.stats().merges, 1);
        assert_eq!(a.request_count(), 0);
        assert_eq!(a.merge_interval(), 2);
        a.check_coalesced().unwrap();
        a.check_invariants().unwrap();
    }

    #[test]
    fn replay_counts_unknown_frees() {
        let mut a = small_chunks();
        let summary = a.replay([
            Op::Allocate { id: 1, size: 10 },
            Op::Free { id: 2 },
            Op::Free { id: 1 },
            Op::Free { id: 1 },
        ]);
        assert_eq!(
            summary,
            ReplaySummary {
                operations: 4,
                unknown_frees: 2
            }
        );
        assert_eq!(a.used_memory(), 0);
    }

    #[test]
    fn churn_keeps_invariants() {
        let mut a = small_chunks();
        for i in 0..2000u64 {
            let id = (i * 31) % 97;
            if a.allocation(id).is_some() && i % 3 != 0 {
                a.free(id).unwrap();
            } else {
                a.allocate(id, (i * 977) % 9000);
            }
            a.check_invariants().unwrap();
        }
        assert!(a.stats().merges > 0);
        assert!(a.merge_interval() >= DEFAULT_MERGE_INTERVAL_FLOOR);
    }
}

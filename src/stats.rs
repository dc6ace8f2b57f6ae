use core::fmt;

const MIB: f64 = (1 << 20) as f64;

/// A snapshot of an [`Allocator`][crate::Allocator]'s counters.
///
/// The `Display` implementation renders the arena and in-use sizes in
/// megabytes (2^20 bytes) and the utilization as a percentage:
///
/// ```text
/// Arena: 1.50 MB
/// In-use: 0.75 MB
/// Utilization: 50.00%
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// The size of the arena in bytes.
    pub total_memory: u64,
    /// The number of bytes in live allocations, including leaked blocks.
    pub used_memory: u64,
    /// The number of bytes orphaned by allocating a live id again.
    pub leaked_memory: u64,
    /// The number of intervals in the free-interval tree.
    pub free_intervals: usize,
    /// The number of live allocations.
    pub live_allocations: usize,
    /// The number of scheduled coalescing rounds so far.
    pub merges: u64,
}

impl Stats {
    /// `used_memory / total_memory`, or zero for an empty arena.
    pub fn utilization(&self) -> f64 {
        if self.total_memory == 0 {
            0.0
        } else {
            self.used_memory as f64 / self.total_memory as f64
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Arena: {:.2} MB", self.total_memory as f64 / MIB)?;
        writeln!(f, "In-use: {:.2} MB", self.used_memory as f64 / MIB)?;
        write!(f, "Utilization: {:.2}%", self.utilization() * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn display_matches_report_format() {
        let stats = Stats {
            total_memory: 3 << 19,
            used_memory: 3 << 18,
            ..Stats::default()
        };
        assert_eq!(
            stats.to_string(),
            "Arena: 1.50 MB\nIn-use: 0.75 MB\nUtilization: 50.00%"
        );
    }

    #[test]
    fn empty_arena_has_zero_utilization() {
        assert_eq!(Stats::default().utilization(), 0.0);
        assert_eq!(
            Stats::default().to_string(),
            "Arena: 0.00 MB\nIn-use: 0.00 MB\nUtilization: 0.00%"
        );
    }
}

use core::fmt;

/// A `Result` type defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors reported by the allocator.
///
/// Failing to find a fitting free interval is not an error: the allocator
/// grows the arena instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// `free` was called with an id that is not currently allocated. The
    /// allocator's state is unchanged.
    UnknownAllocationId(u64),

    /// The arena cannot grow in chunks of zero bytes.
    ZeroChunkSize,

    /// An internal invariant does not hold. Should never happen; if it does,
    /// the free-interval index can no longer be trusted.
    InvariantViolation(InvariantViolation),

    /// A trace could not be parsed.
    #[cfg(feature = "trace")]
    Trace(crate::TraceError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownAllocationId(id) => write!(f, "no live allocation with id {id}"),
            Error::ZeroChunkSize => f.write_str("arena chunk size must be non-zero"),
            Error::InvariantViolation(v) => write!(f, "allocator invariant violated: {v}"),
            #[cfg(feature = "trace")]
            Error::Trace(e) => write!(f, "bad trace: {e}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::InvariantViolation(v) => Some(v),
            #[cfg(feature = "trace")]
            Error::Trace(e) => Some(e),
            _ => None,
        }
    }
}

impl From<InvariantViolation> for Error {
    fn from(v: InvariantViolation) -> Self {
        Error::InvariantViolation(v)
    }
}

#[cfg(feature = "trace")]
impl From<crate::TraceError> for Error {
    fn from(e: crate::TraceError) -> Self {
        Error::Trace(e)
    }
}

/// A broken structural property of the free-interval tree or of the
/// allocator's bookkeeping.
///
/// Intervals are identified by their start address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The root of the tree is red.
    RedRoot,

    /// A red node has a red child.
    RedRedEdge {
        /// The start of the red child.
        start: u64,
    },

    /// The two subtrees of a node have different black-heights.
    BlackHeightMismatch {
        /// The start of the node whose subtrees disagree.
        start: u64,
    },

    /// An in-order walk of the tree is not sorted by start address.
    OutOfOrder {
        /// The start of the first out-of-order node.
        start: u64,
    },

    /// A child's parent link does not point back at its parent.
    BrokenParentLink {
        /// The start of the child.
        start: u64,
    },

    /// Two free intervals overlap.
    OverlappingIntervals {
        /// The start of the lower interval.
        first: u64,
        /// The start of the higher interval.
        second: u64,
    },

    /// The arena size is not the sum of live and free bytes.
    ConservationMismatch {
        /// The arena high-water mark.
        total: u64,
        /// Bytes in live allocations.
        used: u64,
        /// Bytes in free intervals.
        free: u64,
    },

    /// A live allocation overlaps a free interval, or another live
    /// allocation.
    LiveOverlapsFree {
        /// The id of the offending live allocation.
        id: u64,
    },

    /// Two free intervals are address-adjacent right after a merge.
    AdjacentAfterMerge {
        /// The start of the lower interval.
        first: u64,
        /// The start of the higher interval.
        second: u64,
    },

    /// The tree's cached length disagrees with its node count.
    LengthMismatch {
        /// The cached length.
        expected: usize,
        /// The number of reachable nodes.
        actual: usize,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            InvariantViolation::RedRoot => f.write_str("the root is red"),
            InvariantViolation::RedRedEdge { start } => {
                write!(f, "red node {start:#x} has a red parent")
            }
            InvariantViolation::BlackHeightMismatch { start } => {
                write!(f, "subtrees of {start:#x} have different black-heights")
            }
            InvariantViolation::OutOfOrder { start } => {
                write!(f, "node {start:#x} is out of address order")
            }
            InvariantViolation::BrokenParentLink { start } => {
                write!(f, "node {start:#x} has a stale parent link")
            }
            InvariantViolation::OverlappingIntervals { first, second } => {
                write!(f, "free intervals {first:#x} and {second:#x} overlap")
            }
            InvariantViolation::ConservationMismatch { total, used, free } => write!(
                f,
                "arena size {total} != used {used} + free {free}"
            ),
            InvariantViolation::LiveOverlapsFree { id } => {
                write!(f, "live allocation {id} overlaps other memory")
            }
            InvariantViolation::AdjacentAfterMerge { first, second } => write!(
                f,
                "free intervals {first:#x} and {second:#x} are adjacent after a merge"
            ),
            InvariantViolation::LengthMismatch { expected, actual } => {
                write!(f, "tree records {expected} nodes but {actual} are reachable")
            }
        }
    }
}

impl core::error::Error for InvariantViolation {}

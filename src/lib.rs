#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

use cfg_if::cfg_if;

mod allocator;
mod error;
mod free_tree;
mod stats;

pub use allocator::{
    Allocator, ArenaConfig, Op, ReplaySummary, DEFAULT_CHUNK_SIZE, DEFAULT_MERGE_INTERVAL,
    DEFAULT_MERGE_INTERVAL_FLOOR,
};
pub use error::{Error, InvariantViolation, Result};
pub use free_tree::{FreeInterval, FreeTree, Iter};
pub use stats::Stats;

cfg_if! {
    if #[cfg(feature = "trace")] {
        pub mod trace;
        pub use trace::{TraceError, TraceErrorKind};
    }
}

cfg_if! {
    if #[cfg(feature = "lock")] {
        mod lock;
        pub use lock::{Lock, LockedAllocator, SingleThreadedLock};
    }
}

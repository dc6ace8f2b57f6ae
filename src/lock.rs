//! Sharing one allocator between callers.
//!
//! [`Allocator`] takes `&mut self` for every request and does no
//! synchronization of its own. [`LockedAllocator`] puts the whole allocator
//! state (free-interval tree, live-allocation map and arena counters) behind a
//! single exclusive lock. The crate is `no_std`, so the locking mechanism is
//! supplied by the caller through the [`Lock`] trait.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

use crate::{Allocator, Op, ReplaySummary, Result, Stats};

/// A trait for providing mutual exclusion.
///
/// If you do not need to share the allocator between threads, you may use
/// [`SingleThreadedLock`], which is the moral equivalent of a `RefCell`.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then a [`LockedAllocator`] using
///   it will be `Sync`, and therefore this trait must provide actual mutual
///   exclusion and prevent unsynchronized accesses.
///
/// * Even in single-threaded contexts, the implementation must prevent
///   recursive locking. The prevention may be a panic, an abort, an infinite
///   loop, etc...
pub unsafe trait Lock {
    /// Acquire the lock.
    ///
    /// If it is already held, this must panic, abort, loop forever, etc...
    /// and must not succeed.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// Re-entrant locking panics.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "allocator lock is already held");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new, unlocked `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// An [`Allocator`] guarded by one exclusive lock of type `L`.
///
/// Every method acquires the lock for the duration of the call.
pub struct LockedAllocator<L>
where
    L: Lock,
{
    lock: L,
    allocator: UnsafeCell<Allocator>,
}

// Safety: if `L` can be sent between threads then so can the allocator, which
// owns all of its state.
unsafe impl<L> Send for LockedAllocator<L> where L: Lock + Send {}

// Safety: upheld by the `Lock` trait's implementation contract.
unsafe impl<L> Sync for LockedAllocator<L> where L: Lock + Sync {}

impl<L> Default for LockedAllocator<L>
where
    L: Lock + Default,
{
    fn default() -> Self {
        Self::new(Allocator::new(), L::default())
    }
}

impl<L> LockedAllocator<L>
where
    L: Lock,
{
    /// Guard `allocator` with `lock`.
    #[inline]
    pub const fn new(allocator: Allocator, lock: L) -> Self {
        LockedAllocator {
            lock,
            allocator: UnsafeCell::new(allocator),
        }
    }

    /// Take the allocator back out.
    pub fn into_inner(self) -> Allocator {
        self.allocator.into_inner()
    }

    /// Get exclusive access without locking, since `&mut self` already
    /// guarantees it.
    pub fn get_mut(&mut self) -> &mut Allocator {
        self.allocator.get_mut()
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut Allocator) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// See [`Allocator::allocate`].
    pub fn allocate(&self, id: u64, size: u64) -> u64 {
        self.lock().allocate(id, size)
    }

    /// See [`Allocator::free`].
    pub fn free(&self, id: u64) -> Result<()> {
        self.lock().free(id)
    }

    /// See [`Allocator::apply`].
    pub fn apply(&self, op: Op) -> Result<()> {
        self.lock().apply(op)
    }

    /// See [`Allocator::replay`]. The lock is held for the whole replay.
    pub fn replay(&self, ops: impl IntoIterator<Item = Op>) -> ReplaySummary {
        self.lock().replay(ops)
    }

    /// See [`Allocator::stats`].
    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }

    /// See [`Allocator::total_memory`].
    pub fn total_memory(&self) -> u64 {
        self.lock().total_memory()
    }

    /// See [`Allocator::used_memory`].
    pub fn used_memory(&self) -> u64 {
        self.lock().used_memory()
    }

    /// See [`Allocator::utilization`].
    pub fn utilization(&self) -> f64 {
        self.lock().utilization()
    }

    fn lock(&self) -> Guard<'_, L> {
        self.lock.lock();
        Guard { locked: self }
    }
}

struct Guard<'a, L>
where
    L: Lock,
{
    locked: &'a LockedAllocator<L>,
}

impl<L> Drop for Guard<'_, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.locked.lock.unlock();
    }
}

impl<L> Deref for Guard<'_, L>
where
    L: Lock,
{
    type Target = Allocator;

    #[inline]
    fn deref(&self) -> &Allocator {
        // Safety: the lock is held for the guard's lifetime.
        unsafe { &*self.locked.allocator.get() }
    }
}

impl<L> DerefMut for Guard<'_, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Allocator {
        // Safety: the lock is held for the guard's lifetime.
        unsafe { &mut *self.locked.allocator.get() }
    }
}

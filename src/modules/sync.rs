//! Ranked locks for the shared VFS tables.
//!
//! Every lock protecting a VFS-wide table carries a [`LockRank`]. Locks must
//! be acquired in strictly increasing rank order:
//!
//! 1. **FileBackedFileSystemList** - blocking; held across filesystem construction
//! 2. **FileSystemList** - spin; the generic list of live instances
//! 3. **ContextList** - spin; every namespace context in the system
//! 4. **MountList** - spin; one per namespace context
//!
//! Debug builds keep a per-thread stack of held ranks and panic on an
//! out-of-order acquisition. Release builds compile the bookkeeping away.
//!
//! Spin locks must never be held across driver calls that can sleep.

#[cfg(debug_assertions)]
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockRank {
    /// File-backed filesystem list (blocking mutex)
    FileBackedFileSystemList = 1,
    /// Generic filesystem instance list
    FileSystemList = 2,
    /// Global namespace context list
    ContextList = 3,
    /// Per-context mount list
    MountList = 4,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD_RANKS: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

#[cfg(debug_assertions)]
fn note_acquire(rank: LockRank) {
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(&highest) = held.iter().max() {
            assert!(
                rank > highest,
                "lock rank violation: acquiring {:?} while holding {:?}",
                rank,
                highest
            );
        }
        held.push(rank);
    });
}

#[cfg(debug_assertions)]
fn note_release(rank: LockRank) {
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|r| *r == rank) {
            held.remove(pos);
        }
    });
}

#[cfg(not(debug_assertions))]
#[inline(always)]
fn note_acquire(_rank: LockRank) {}

#[cfg(not(debug_assertions))]
#[inline(always)]
fn note_release(_rank: LockRank) {}

/// Non-sleeping mutual exclusion for tables whose critical sections never block.
pub struct SpinLock<T> {
    rank: LockRank,
    inner: spin::Mutex<T>,
}

/// Guard returned by [`SpinLock::lock`].
pub struct SpinLockGuard<'a, T> {
    rank: LockRank,
    guard: spin::MutexGuard<'a, T>,
}

impl<T> SpinLock<T> {
    /// Creates a spin lock at the given rank.
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: spin::Mutex::new(value),
        }
    }

    /// Spins until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        note_acquire(self.rank);
        SpinLockGuard {
            rank: self.rank,
            guard: self.inner.lock(),
        }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        note_release(self.rank);
    }
}

/// Sleeping mutual exclusion for critical sections that may perform I/O.
pub struct BlockingMutex<T> {
    rank: LockRank,
    inner: parking_lot::Mutex<T>,
}

/// Guard returned by [`BlockingMutex::lock`].
pub struct BlockingMutexGuard<'a, T> {
    rank: LockRank,
    guard: parking_lot::MutexGuard<'a, T>,
}

impl<T> BlockingMutex<T> {
    /// Creates a blocking mutex at the given rank.
    pub fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: parking_lot::Mutex::new(value),
        }
    }

    /// Blocks the calling thread until the mutex is acquired.
    pub fn lock(&self) -> BlockingMutexGuard<'_, T> {
        note_acquire(self.rank);
        BlockingMutexGuard {
            rank: self.rank,
            guard: self.inner.lock(),
        }
    }
}

impl<T> Deref for BlockingMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for BlockingMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for BlockingMutexGuard<'_, T> {
    fn drop(&mut self) {
        note_release(self.rank);
    }
}

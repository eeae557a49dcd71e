//! Lock ordering and the ACPI global lock (spec.md §5).
//!
//! The canonical acquisition order given in spec.md §5 is Tables -> Namespace -> Parser ->
//! Interpreter. We encode that as a small newtype wrapping `spin::Mutex` (the same crate
//! `theseus-os-Theseus`'s `tlibc` uses for `#![no_std]` synchronization) plus a debug-only
//! counter that asserts a thread never tries to acquire a lower-ranked lock while already holding
//! a higher-ranked one. In release builds the assertion is compiled out; the ordering itself is
//! still the one a caller is expected to follow.

use core::cell::Cell;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::{Mutex, MutexGuard};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum LockRank {
    Tables = 0,
    Namespace = 1,
    Parser = 2,
    Interpreter = 3,
}

// `no_std` has no portable thread-locals without OS support; the highest rank currently held is
// instead tracked via a process-wide atomic "high water mark". This is weaker than true
// per-thread tracking but still catches the single-walk misuse this crate cares about: code
// taking `MTX_NAMESPACE` and then, before releasing it, trying to take `MTX_TABLES`.
static HELD_RANK: AtomicU8 = AtomicU8::new(u8::MAX);

/// A lock tagged with its position in the canonical acquisition order.
pub struct OrderedLock<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> OrderedLock<T> {
    pub const fn new(rank: LockRank, value: T) -> OrderedLock<T> {
        OrderedLock { rank, inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> OrderedGuard<T> {
        let previous = HELD_RANK.load(Ordering::Acquire);
        debug_assert!(
            previous == u8::MAX || (self.rank as u8) >= previous,
            "lock ordering violation: tried to acquire {:?} while holding a higher-ranked lock",
            self.rank
        );
        let guard = self.inner.lock();
        HELD_RANK.store(self.rank as u8, Ordering::Release);
        OrderedGuard { guard, previous }
    }
}

pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    previous: u8,
}

impl<'a, T> core::ops::Deref for OrderedGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> core::ops::DerefMut for OrderedGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for OrderedGuard<'a, T> {
    fn drop(&mut self) {
        HELD_RANK.store(self.previous, Ordering::Release);
    }
}

/// The ACPI global lock: a lock co-owned with firmware, acquired around field accesses whose
/// `lock_rule` is `Lock` (spec.md §4.5, §4.6). The actual firmware handshake (pending-bit
/// spin/wait against the FACS) is an OS-adapter/hardware-register concern, out of scope here;
/// this models the host-side mutual exclusion that serializes concurrent AML-side acquirers, and
/// counts recursive acquisitions the way the real global lock allows.
pub struct GlobalLock {
    depth: Mutex<u32>,
    owner: Cell<Option<u64>>,
}

unsafe impl Sync for GlobalLock {}

impl GlobalLock {
    pub const fn new() -> GlobalLock {
        GlobalLock { depth: Mutex::new(0), owner: Cell::new(None) }
    }

    /// Acquires the lock for `thread_id`, blocking (by spinning - there is no OS wait queue at
    /// this layer) until available. Recursive acquisition by the same thread is allowed and
    /// tracked by depth, matching a mutex's `sync_level` recursion semantics in spec.md §4.6.
    pub fn acquire(&self, thread_id: u64) -> GlobalLockGuard<'_> {
        loop {
            let mut depth = self.depth.lock();
            if *depth == 0 || self.owner.get() == Some(thread_id) {
                *depth += 1;
                self.owner.set(Some(thread_id));
                return GlobalLockGuard { lock: self, thread_id };
            }
            drop(depth);
            core::hint::spin_loop();
        }
    }
}

pub struct GlobalLockGuard<'a> {
    lock: &'a GlobalLock,
    thread_id: u64,
}

impl<'a> Drop for GlobalLockGuard<'a> {
    fn drop(&mut self) {
        let mut depth = self.lock.depth.lock();
        debug_assert!(self.lock.owner.get() == Some(self.thread_id));
        *depth -= 1;
        if *depth == 0 {
            self.lock.owner.set(None);
        }
    }
}

/// A mutex's synchronization level (0-15), used to validate acquire ordering between nested AML
/// mutexes (§5.5.3 of the ACPI spec: a thread may only acquire a mutex with `sync_level` >= the
/// highest it currently holds). We don't enforce the ordering (that needs per-walk state the
/// interpreter tracks in `walk.rs`); this just carries the declared level.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct SyncLevel(pub u8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_lock_is_reentrant_for_same_thread() {
        let lock = GlobalLock::new();
        let guard1 = lock.acquire(1);
        let guard2 = lock.acquire(1);
        drop(guard2);
        drop(guard1);
    }

    #[test]
    fn ordered_lock_tracks_rank() {
        let lock = OrderedLock::new(LockRank::Namespace, 0u32);
        let guard = lock.lock();
        assert_eq!(*guard, 0);
    }
}

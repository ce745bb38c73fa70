// Copyright (c) 2025 Weft Contributors
//
// Stack mirroring over a shared address space
//
// The runtime never remaps pages: worker threads share one address
// space, so every activation's locals stay readable and writable from
// any worker. What remains of the mirroring contract is arena traffic:
//
// - `install`   binds a fresh execution arena to a worker's deque.
// - `setup`     re-arms a thief that gave its arena away.
// - `uninstall` detaches the arena at suspension and turns it into the
//               joint's canonical commit buffer ("export").
// - `reinstall` replays the canonical buffer into the live locals at
//               resume and recycles the arena ("import").
//
// A per-worker cache fronts the global pool so the common
// suspend/resume cycle touches no shared state.

use std::cell::RefCell;

use crate::deque::Deque;
use crate::joint::CanonicalFrame;
use crate::pool::{Arena, StackPool, POOL_PRIVATE_SIZE};

/// Per-worker arena cache, the private tier in front of the pool.
pub struct ArenaCache {
    slots: RefCell<Vec<Arena>>,
}

impl ArenaCache {
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::with_capacity(POOL_PRIVATE_SIZE)),
        }
    }

    fn take(&self, pool: &StackPool) -> Arena {
        self.slots.borrow_mut().pop().unwrap_or_else(|| pool.take())
    }

    fn put(&self, pool: &StackPool, arena: Arena) {
        let mut slots = self.slots.borrow_mut();
        if slots.len() < POOL_PRIVATE_SIZE {
            slots.push(arena);
        } else {
            pool.put(arena);
        }
    }

    /// Hand every cached arena back to the global tier.
    pub fn drain(&self, pool: &StackPool) {
        for arena in self.slots.borrow_mut().drain(..) {
            pool.put(arena);
        }
    }
}

impl Default for ArenaCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared-address-space mirror.
pub struct SharedMirror {
    pool: StackPool,
}

impl SharedMirror {
    pub fn new() -> Self {
        Self {
            pool: StackPool::new(),
        }
    }

    pub fn pool(&self) -> &StackPool {
        &self.pool
    }

    /// Bind an initial execution arena to a starting worker.
    ///
    /// # Safety
    ///
    /// Must run on the deque owner's thread.
    pub unsafe fn install(&self, cache: &ArenaCache, deque: &Deque) {
        debug_assert!(!deque.has_stack());
        deque.set_stack(Some(cache.take(&self.pool)));
    }

    /// Ensure a thief holds an execution arena before it runs a stolen
    /// continuation.
    ///
    /// # Safety
    ///
    /// Must run on the deque owner's thread.
    pub unsafe fn setup(&self, cache: &ArenaCache, deque: &Deque) {
        if !deque.has_stack() {
            deque.set_stack(Some(cache.take(&self.pool)));
        }
    }

    /// Export: detach the worker's arena so it can serve as the joint's
    /// canonical commit buffer while the parent is suspended.
    ///
    /// # Safety
    ///
    /// Must run on the deque owner's thread.
    pub unsafe fn uninstall(&self, cache: &ArenaCache, deque: &Deque) -> CanonicalFrame {
        let arena = match deque.take_stack() {
            Some(arena) => arena,
            None => cache.take(&self.pool),
        };
        CanonicalFrame::new(arena)
    }

    /// Import: replay the canonical buffer into the live locals and
    /// recycle its arena, preferring to re-arm the worker.
    ///
    /// # Safety
    ///
    /// Must run on the deque owner's thread, after the joint's count
    /// reached zero (no concurrent committers).
    pub unsafe fn reinstall(&self, cache: &ArenaCache, deque: &Deque, canonical: CanonicalFrame) {
        let arena = canonical.replay();
        if deque.has_stack() {
            cache.put(&self.pool, arena);
        } else {
            deque.set_stack(Some(arena));
        }
    }

    /// Release a retiring worker's arena and cache.
    ///
    /// # Safety
    ///
    /// Must run on the deque owner's thread.
    pub unsafe fn retire(&self, cache: &ArenaCache, deque: &Deque) {
        if let Some(arena) = deque.take_stack() {
            self.pool.put(arena);
        }
        cache.drain(&self.pool);
    }
}

impl Default for SharedMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_setup_retire_cycle() {
        let mirror = SharedMirror::new();
        let cache = ArenaCache::new();
        let deque = Deque::new();

        unsafe {
            mirror.install(&cache, &deque);
            assert!(deque.has_stack());

            // setup is a no-op while the worker still holds its arena
            mirror.setup(&cache, &deque);
            assert!(deque.has_stack());

            mirror.retire(&cache, &deque);
            assert!(!deque.has_stack());
        }
        assert_eq!(mirror.pool().stats().alloc_count, 1);
    }

    #[test]
    fn test_uninstall_reinstall_roundtrip() {
        let mirror = SharedMirror::new();
        let cache = ArenaCache::new();
        let deque = Deque::new();

        let mut slot: u64 = 0;
        unsafe {
            mirror.install(&cache, &deque);

            let mut canonical = mirror.uninstall(&cache, &deque);
            assert!(!deque.has_stack());

            let value: u64 = 41;
            assert!(canonical.append(
                &mut slot as *mut u64 as *mut u8,
                &value as *const u64 as *const u8,
                8
            ));

            mirror.reinstall(&cache, &deque, canonical);
            // The arena went back to the worker, not the pool.
            assert!(deque.has_stack());

            mirror.retire(&cache, &deque);
        }
        assert_eq!(slot, 41);
    }
}

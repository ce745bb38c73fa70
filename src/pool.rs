// Copyright (c) 2025 Weft Contributors
//
// Arena pool
//
// Recycles the fixed-size, page-aligned arenas that workers use as
// scratch regions and joints use as canonical commit buffers. The global
// tier is a Treiber free list whose head word packs a 16-bit version
// counter above the 48-bit pointer, preventing ABA without a double-wide
// CAS. The list link is intrusive: the first word of a free arena stores
// the next pointer. Workers keep a small private cache in front of the
// global tier.
//
// Reference: "Systems Programming: Coping with Parallelism" by
// R.K. Treiber (1986)

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::sync::Backoff;

/// Arena size in bytes
pub const ARENA_SIZE: usize = 1 << 16;

/// Arena alignment (page)
pub const ARENA_ALIGN: usize = 4096;

/// Upper bound on arenas parked in the global tier
const POOL_GLOBAL_SIZE: usize = 2048 - 3;

/// Capacity of a worker's private cache
pub const POOL_PRIVATE_SIZE: usize = 7;

const ADDRESS_BITS: usize = 48;
const ADDRESS_MASK: usize = (1 << ADDRESS_BITS) - 1;
const VERSION_MASK: usize = (1 << 16) - 1;

fn fold(ptr: usize, version: usize) -> usize {
    debug_assert_eq!(ptr & !ADDRESS_MASK, 0, "pointer exceeds 48 bits");
    ((version & VERSION_MASK) << ADDRESS_BITS) | ptr
}

fn unfold_ptr(tagged: usize) -> usize {
    tagged & ADDRESS_MASK
}

fn unfold_version(tagged: usize) -> usize {
    tagged >> ADDRESS_BITS
}

fn layout() -> Layout {
    // Safety: size and alignment are nonzero powers of two.
    unsafe { Layout::from_size_align_unchecked(ARENA_SIZE, ARENA_ALIGN) }
}

/// A pooled, page-aligned, fixed-size buffer.
pub struct Arena {
    ptr: NonNull<u8>,
}

// Safety: an arena is exclusively owned wherever it travels.
unsafe impl Send for Arena {}

impl Arena {
    fn alloc() -> Self {
        let ptr = unsafe { alloc(layout()) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout());
        };
        Self { ptr }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn into_raw(self) -> usize {
        let addr = self.ptr.as_ptr() as usize;
        std::mem::forget(self);
        addr
    }

    /// # Safety
    ///
    /// `addr` must come from `into_raw` and not be reconstructed twice.
    unsafe fn from_raw(addr: usize) -> Self {
        Self {
            ptr: NonNull::new_unchecked(addr as *mut u8),
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Backstop so an arena dropped outside the pool never leaks.
        unsafe { dealloc(self.ptr.as_ptr(), layout()) };
    }
}

/// Global arena pool
pub struct StackPool {
    /// Tagged head of the Treiber free list
    head: AtomicUsize,
    /// Approximate number of arenas parked in the list
    available: AtomicUsize,
    /// Statistics
    alloc_count: AtomicU64,
    take_count: AtomicU64,
    put_count: AtomicU64,
    release_count: AtomicU64,
}

impl StackPool {
    pub fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            available: AtomicUsize::new(0),
            alloc_count: AtomicU64::new(0),
            take_count: AtomicU64::new(0),
            put_count: AtomicU64::new(0),
            release_count: AtomicU64::new(0),
        }
    }

    /// Take an arena from the pool, or allocate a fresh one if the list
    /// is empty.
    pub fn take(&self) -> Arena {
        self.take_count.fetch_add(1, Ordering::Relaxed);

        let mut backoff = Backoff::new();
        let mut current = self.head.load(Ordering::Acquire);

        loop {
            let ptr = unfold_ptr(current);
            if ptr == 0 {
                self.alloc_count.fetch_add(1, Ordering::Relaxed);
                return Arena::alloc();
            }

            // Safety: a listed arena is not owned by anyone else, and the
            // version tag in the head word keeps a stale `next` read from
            // being installed (the CAS below fails instead). The link is
            // read atomically because a racing taker may already be
            // reusing the arena.
            let next = unsafe { (*(ptr as *const AtomicUsize)).load(Ordering::Relaxed) };
            let replacement = fold(next, unfold_version(current) + 1);

            match self.head.compare_exchange_weak(
                current,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.available.fetch_sub(1, Ordering::Relaxed);
                    // Safety: the CAS detached this arena from the list.
                    return unsafe { Arena::from_raw(ptr) };
                }
                Err(observed) => {
                    current = observed;
                    backoff.spin();
                }
            }
        }
    }

    /// Return an arena to the pool. Beyond the global bound the arena is
    /// released to the allocator instead, so an idle runtime's footprint
    /// stabilizes.
    pub fn put(&self, arena: Arena) {
        self.put_count.fetch_add(1, Ordering::Relaxed);

        if self.available.load(Ordering::Relaxed) >= POOL_GLOBAL_SIZE {
            self.release_count.fetch_add(1, Ordering::Relaxed);
            drop(arena);
            return;
        }

        let ptr = arena.into_raw();
        let mut backoff = Backoff::new();
        let mut current = self.head.load(Ordering::Acquire);

        loop {
            // Safety: the arena is exclusively ours until the CAS links it.
            unsafe { (*(ptr as *const AtomicUsize)).store(unfold_ptr(current), Ordering::Relaxed) };
            let replacement = fold(ptr, unfold_version(current) + 1);

            match self.head.compare_exchange_weak(
                current,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.available.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(observed) => {
                    current = observed;
                    backoff.spin();
                }
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            take_count: self.take_count.load(Ordering::Relaxed),
            put_count: self.put_count.load(Ordering::Relaxed),
            release_count: self.release_count.load(Ordering::Relaxed),
            available: self.available.load(Ordering::Relaxed),
        }
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        // Single-threaded by &mut: drain and release the whole list.
        let mut current = unfold_ptr(*self.head.get_mut());
        while current != 0 {
            let next = unsafe { (current as *const usize).read() };
            drop(unsafe { Arena::from_raw(current) });
            current = next;
        }
        *self.head.get_mut() = 0;
    }
}

/// Statistics for the pool
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub alloc_count: u64,
    pub take_count: u64,
    pub put_count: u64,
    pub release_count: u64,
    pub available: usize,
}

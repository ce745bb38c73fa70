// Copyright (c) 2025 Weft Contributors
//
// Joint records and commit propagation
//
// A joint is the heap-allocated synchronization record shared between a
// parent frame and every thief that stole from it. It carries the signed
// completion counter and, while the parent is suspended, the canonical
// commit buffer: child writes are appended under the joint lock and
// replayed into the live locals when the parent resumes.
//
// Counter discipline: a thief credits 2 per steal (one for the child's
// completion, one for the parent's arrival), a completing child subtracts
// 1, and the parent subtracts its steal count at join. The counter hits
// zero exactly once, at the true completion point, under every
// interleaving; whoever observes zero owns completion.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::pool::{Arena, ARENA_SIZE};
use crate::sync::{SpinGuard, SpinLock};

pub struct Joint {
    /// Signed completion counter; see the module comment.
    count: AtomicI64,
    /// Commit state, guarded by a test-and-set lock.
    inner: SpinLock<JointInner>,
}

pub struct JointInner {
    /// The canonical commit buffer, present exactly while the parent is
    /// suspended ("exported").
    canonical: Option<CanonicalFrame>,
}

impl Joint {
    pub fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            inner: SpinLock::new(JointInner { canonical: None }),
        }
    }

    /// Credit one steal: one count for the child, one for the parent.
    pub fn credit_steal(&self) {
        self.count.fetch_add(2, Ordering::Relaxed);
    }

    /// Subtract `n` and return the remaining count.
    pub fn arrive(&self, n: i64) -> i64 {
        self.count.fetch_sub(n, Ordering::AcqRel) - n
    }

    pub fn lock(&self) -> SpinGuard<'_, JointInner> {
        self.inner.lock()
    }
}

impl Default for Joint {
    fn default() -> Self {
        Self::new()
    }
}

impl JointInner {
    /// Export: install the canonical buffer. The parent's live locals
    /// stop being the commit target until `take_canonical`.
    pub fn export(&mut self, canonical: CanonicalFrame) {
        debug_assert!(self.canonical.is_none());
        self.canonical = Some(canonical);
    }

    pub fn canonical_mut(&mut self) -> Option<&mut CanonicalFrame> {
        self.canonical.as_mut()
    }

    /// Import: detach the canonical buffer for replay.
    pub fn take_canonical(&mut self) -> Option<CanonicalFrame> {
        self.canonical.take()
    }
}

/// The canonical image of a suspended parent's writable locals, realized
/// as a log of commit records inside a pooled arena.
///
/// Record layout, packed and unaligned: `[addr: usize][len: usize][bytes]`.
pub struct CanonicalFrame {
    arena: Arena,
    len: usize,
}

const HEADER: usize = 2 * size_of::<usize>();

impl CanonicalFrame {
    pub fn new(arena: Arena) -> Self {
        Self { arena, len: 0 }
    }

    /// Append one commit record. Returns `false` if the arena is full;
    /// the caller then applies the record directly (the live locals are
    /// still mapped in a shared address space, so nothing is lost).
    pub fn append(&mut self, addr: *mut u8, bytes: *const u8, len: usize) -> bool {
        if self.len + HEADER + len > ARENA_SIZE {
            return false;
        }

        // Safety: bounds checked above; the arena is exclusively ours
        // under the joint lock.
        unsafe {
            let base = self.arena.as_mut_ptr().add(self.len);
            (base as *mut usize).write_unaligned(addr as usize);
            (base.add(size_of::<usize>()) as *mut usize).write_unaligned(len);
            std::ptr::copy_nonoverlapping(bytes, base.add(HEADER), len);
        }

        self.len += HEADER + len;
        true
    }

    /// Replay every record into the live locals, in commit order, and
    /// hand the arena back.
    ///
    /// # Safety
    ///
    /// Every recorded address must still be live, which the join protocol
    /// guarantees: the activations owning them cannot unwind past their
    /// join while children are outstanding.
    pub unsafe fn replay(self) -> Arena {
        let mut off = 0;
        while off < self.len {
            let base = self.arena.as_ptr().add(off);
            let addr = (base as *const usize).read_unaligned() as *mut u8;
            let len = (base.add(size_of::<usize>()) as *const usize).read_unaligned();
            apply_bytes(addr, base.add(HEADER), len);
            off += HEADER + len;
        }
        self.arena
    }

    #[cfg(test)]
    fn records(&self) -> usize {
        let mut off = 0;
        let mut n = 0;
        while off < self.len {
            let base = unsafe { self.arena.as_ptr().add(off) };
            let len = unsafe { (base.add(size_of::<usize>()) as *const usize).read_unaligned() };
            off += HEADER + len;
            n += 1;
        }
        n
    }
}

/// Apply `len` bytes from `src` to `dst`. Word sizes are single stores,
/// anything else is a byte-wise copy.
///
/// # Safety
///
/// `dst` must be valid for `len` writes and `src` for `len` reads.
pub unsafe fn apply_bytes(dst: *mut u8, src: *const u8, len: usize) {
    match len {
        0 => {}
        1 => dst.write(src.read()),
        2 => (dst as *mut u16).write_unaligned((src as *const u16).read_unaligned()),
        4 => (dst as *mut u32).write_unaligned((src as *const u32).read_unaligned()),
        8 => (dst as *mut u64).write_unaligned((src as *const u64).read_unaligned()),
        _ => std::ptr::copy_nonoverlapping(src, dst, len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::StackPool;

    #[test]
    fn test_append_and_replay_word_sizes() {
        let pool = StackPool::new();
        let mut canonical = CanonicalFrame::new(pool.take());

        let mut b: u8 = 0;
        let mut h: u16 = 0;
        let mut w: u32 = 0;
        let mut d: u64 = 0;
        let mut blob = [0u8; 24];

        let vb: u8 = 0xa5;
        let vh: u16 = 0xbeef;
        let vw: u32 = 0xdead_beef;
        let vd: u64 = f64::to_bits(1.000_000_000_000_000_2);
        let vblob = [7u8; 24];

        assert!(canonical.append(&mut b as *mut u8, &vb as *const u8, 1));
        assert!(canonical.append(&mut h as *mut u16 as *mut u8, &vh as *const u16 as *const u8, 2));
        assert!(canonical.append(&mut w as *mut u32 as *mut u8, &vw as *const u32 as *const u8, 4));
        assert!(canonical.append(&mut d as *mut u64 as *mut u8, &vd as *const u64 as *const u8, 8));
        assert!(canonical.append(blob.as_mut_ptr(), vblob.as_ptr(), 24));
        assert_eq!(canonical.records(), 5);

        let arena = unsafe { canonical.replay() };
        pool.put(arena);

        assert_eq!(b, vb);
        assert_eq!(h, vh);
        assert_eq!(w, vw);
        assert_eq!(d, vd);
        assert_eq!(blob, vblob);
    }

    #[test]
    fn test_replay_applies_in_commit_order() {
        let pool = StackPool::new();
        let mut canonical = CanonicalFrame::new(pool.take());

        let mut slot: u64 = 0;
        for value in [1u64, 2, 3] {
            assert!(canonical.append(
                &mut slot as *mut u64 as *mut u8,
                &value as *const u64 as *const u8,
                8
            ));
        }

        let arena = unsafe { canonical.replay() };
        pool.put(arena);

        // Last write wins.
        assert_eq!(slot, 3);
    }

    #[test]
    fn test_full_arena_rejects_append() {
        let pool = StackPool::new();
        let mut canonical = CanonicalFrame::new(pool.take());

        let mut sink = [0u8; 4096];
        let payload = [1u8; 4096];
        let mut appended = 0;
        while canonical.append(sink.as_mut_ptr(), payload.as_ptr(), payload.len()) {
            appended += 1;
        }
        assert_eq!(appended, ARENA_SIZE / (HEADER + payload.len()));

        let arena = unsafe { canonical.replay() };
        pool.put(arena);
    }

    #[test]
    fn test_joint_counter_reaches_zero_once() {
        let joint = Joint::new();

        // Two steals, children finish before the parent joins.
        joint.credit_steal();
        joint.credit_steal();
        assert_eq!(joint.arrive(1), 3);
        assert_eq!(joint.arrive(1), 2);
        // Parent arrives last and owns completion.
        assert_eq!(joint.arrive(2), 0);
    }
}

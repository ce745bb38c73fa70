// Copyright (c) 2025 Weft Contributors
//
// Per-fork frames
//
// A `Frame` is the stack-allocated record behind one fork point (or one
// scope). The owner publishes jobs against it, thieves attach a `Joint`
// to it on first steal, and the join synchronizes through it. The frame
// is consumed by its join and must not be joined again.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};

use crate::joint::Joint;

/// `resumable` states for the parent/last-child handshake.
pub const NEUTRAL: i32 = 0;
/// Last child finished before the parent suspended.
pub const CHILD_FIRST: i32 = 1;
/// Parent suspended before the last child finished.
pub const PARENT_SUSPENDED: i32 = -1;
/// Terminal state: the last child handed completion to the suspended parent.
pub const RESUME_GRANTED: i32 = 2;

/// Sentinel stored in `steals` once the frame has been joined.
const JOINED: u32 = u32::MAX;

pub struct Frame {
    /// Owner-local count of pushes not yet matched by an owner pop.
    pending: Cell<u32>,
    /// Number of jobs stolen from this frame (thief-incremented).
    steals: AtomicU32,
    /// Tri-state handshake between the suspending parent and the last
    /// completing child, plus the terminal resume grant.
    resumable: AtomicI32,
    /// Synchronization record, installed by the first thief.
    joint: AtomicPtr<Joint>,
}

// Safety: `pending` is only touched by the owning worker's thread; the
// shared fields are atomics.
unsafe impl Sync for Frame {}

impl Frame {
    pub fn new() -> Self {
        Self {
            pending: Cell::new(0),
            steals: AtomicU32::new(0),
            resumable: AtomicI32::new(NEUTRAL),
            joint: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending.get()
    }

    /// Record a push against this frame (owner only).
    pub fn add_pending(&self) {
        debug_assert_ne!(self.steals.load(Ordering::Relaxed), JOINED, "fork after join");
        self.pending.set(self.pending.get() + 1);
    }

    /// Record an owner pop against this frame (owner only).
    pub fn sub_pending(&self) {
        debug_assert!(self.pending.get() > 0);
        self.pending.set(self.pending.get() - 1);
    }

    /// Hand the remaining pushes over to the steal accounting (owner only).
    pub fn clear_pending(&self) {
        self.pending.set(0);
    }

    pub fn steals(&self) -> &AtomicU32 {
        &self.steals
    }

    pub fn resumable(&self) -> &AtomicI32 {
        &self.resumable
    }

    /// Get the frame's joint, installing a fresh one if no thief has
    /// touched this frame yet. Called by thieves after a successful
    /// steal, before any other bookkeeping.
    pub fn ensure_joint(&self) -> &Joint {
        let current = self.joint.load(Ordering::Acquire);
        if !current.is_null() {
            // Safety: a joint is only freed by the completing join, which
            // cannot run while our steal is unaccounted.
            return unsafe { &*current };
        }

        let fresh = Box::into_raw(Box::new(Joint::new()));
        match self.joint.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(installed) => {
                // Another thief won the installation race.
                unsafe { drop(Box::from_raw(fresh)) };
                unsafe { &*installed }
            }
        }
    }

    /// The joint installed by thieves, if any.
    pub fn joint(&self) -> Option<&Joint> {
        let ptr = self.joint.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // Safety: see `ensure_joint`.
            Some(unsafe { &*ptr })
        }
    }

    /// Assert the frame has not been joined yet (debug builds).
    pub fn assert_joinable(&self) {
        debug_assert_ne!(
            self.steals.load(Ordering::Relaxed),
            JOINED,
            "frame joined twice"
        );
    }

    /// Consume the frame after a successful join: free the joint and arm
    /// the reuse sentinel.
    pub fn consume(&self) {
        let ptr = self.joint.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            // Safety: the join completed, so no child can touch the joint
            // any more; the parent is its single deallocation point.
            unsafe { drop(Box::from_raw(ptr)) };
        }
        self.steals.store(JOINED, Ordering::Relaxed);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

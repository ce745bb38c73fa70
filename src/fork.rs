// Copyright (c) 2025 Weft Contributors
//
// Fork/join front end
//
// `join` is the two-way fork: it publishes the deferred half on the
// worker's deque, runs the other half inline, and reclaims the deferred
// half with a pop on the sequential path. `scope` covers the
// many-forks/one-join pattern. Both degrade to plain sequential calls on
// a thread that is not a worker, which is also the single-worker
// semantics: depth-first, left to right.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

use crate::frame::Frame;
use crate::job::{ExecMode, HeapJob, StackJob};
use crate::scheduler::{self, JoinOutcome};

/// Fork `a` and `b` and return both results.
///
/// `a` runs immediately on the calling worker; `b` is published for
/// idle workers and reclaimed with a single pop when nobody steals it.
/// The sequential overhead of an unstolen fork is one push, one pop and
/// no allocation.
///
/// If `a` panics, `b` is reclaimed or awaited before the panic resumes;
/// a panic in a *stolen* `b` aborts the process.
pub fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    // Safety: the reference dies before this call returns, and the
    // runtime outlives it (it is bound to this very thread).
    let worker = match unsafe { scheduler::current_worker() } {
        Some(worker) => worker,
        None => {
            let ra = a();
            return (ra, b());
        }
    };

    let frame = Frame::new();
    let job = StackJob::new(b);

    frame.add_pending();
    // Safety: `job` outlives the join below, which consumes the JobRef.
    if let Some(overflow) = worker.deque().push(unsafe { job.as_job_ref(&frame) }) {
        // The ring is full; laziness degrades to a plain nested call.
        frame.sub_pending();
        let ra = a();
        // Safety: executed exactly once, storage is live.
        unsafe {
            overflow.execute(ExecMode::Sequential);
            return (ra, job.into_result());
        }
    }

    let ra = panic::catch_unwind(AssertUnwindSafe(a));
    let outcome = scheduler::join_frame(worker, &frame, ra.is_ok());

    match ra {
        Ok(ra) => {
            if let Some(payload) = outcome.panic {
                panic::resume_unwind(payload);
            }
            // Safety: `b` completed (inline or via a thief's commit).
            (ra, unsafe { job.into_result() })
        }
        Err(payload) => {
            if !outcome.aborted && outcome.panic.is_none() {
                // A thief completed `b`; release its result properly.
                unsafe { drop(job.into_result()) };
            }
            panic::resume_unwind(payload);
        }
    }
}

/// A fork scope: every job forked into it is joined before `scope`
/// returns.
pub struct Scope<'scope> {
    frame: Frame,
    // Not `Sync`: only the owning worker may publish against the frame.
    marker: PhantomData<Box<dyn FnOnce() + Send + 'scope>>,
}

/// Run `op` with a fork scope.
///
/// Forked jobs may borrow anything that outlives the scope. The join at
/// the end runs even if `op` panics; the panic resumes afterwards.
pub fn scope<'scope, OP, R>(op: OP) -> R
where
    OP: FnOnce(&Scope<'scope>) -> R,
{
    let s = Scope {
        frame: Frame::new(),
        marker: PhantomData,
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| op(&s)));

    // Safety: as in `join`.
    let outcome = match unsafe { scheduler::current_worker() } {
        Some(worker) => scheduler::join_frame(worker, &s.frame, true),
        // Off-runtime the forks already ran inline.
        None => JoinOutcome::default(),
    };

    match result {
        Ok(value) => {
            if let Some(payload) = outcome.panic {
                panic::resume_unwind(payload);
            }
            value
        }
        Err(payload) => panic::resume_unwind(payload),
    }
}

impl<'scope> Scope<'scope> {
    /// Fork `f` into the scope.
    ///
    /// The job runs at the latest when the scope joins; an idle worker
    /// may steal and run it earlier. Results travel through
    /// [`CommitSlot`]s or other `Sync` cells captured by the closure.
    pub fn fork<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        // Safety: as in `join`.
        let worker = match unsafe { scheduler::current_worker() } {
            Some(worker) => worker,
            None => return f(),
        };

        let job = HeapJob::new(&self.frame, f);
        self.frame.add_pending();
        if let Some(overflow) = worker.deque().push(job) {
            // Ring full: run inline at the fork point.
            self.frame.sub_pending();
            // Safety: executed exactly once.
            unsafe { overflow.execute(ExecMode::Sequential) };
        }
    }
}

/// A write-back cell for results a forked child leaves in its parent's
/// locals.
///
/// A sequential child writes straight through. A stolen child's write
/// becomes a commit descriptor that is applied under the joint lock when
/// the child resumes its parent, landing either in the live cell or in
/// the suspended parent's canonical buffer. Reading requires `&mut`,
/// which the borrow checker only grants once the borrowing forks are
/// joined.
pub struct CommitSlot<T> {
    value: UnsafeCell<T>,
}

// Safety: shared writes are serialized by the commit protocol and reads
// require exclusive access.
unsafe impl<T: Send> Sync for CommitSlot<T> {}

impl<T: Copy + Send> CommitSlot<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Write `value`, committing through the joint protocol when called
    /// from a stolen child.
    pub fn put(&self, value: T) {
        // Safety: as in `join`.
        match unsafe { scheduler::current_worker() } {
            Some(worker) if worker.mode() == ExecMode::Stolen => {
                scheduler::stage_commit(self.value.get() as *mut u8, value);
            }
            // Sequential path: the cell is owner-local.
            _ => unsafe { *self.value.get() = value },
        }
    }

    /// Read the committed value.
    pub fn get(&mut self) -> T {
        unsafe { *self.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run off-runtime, exercising the sequential fallback paths.

    #[test]
    fn test_join_sequential_fallback_orders_left_to_right() {
        let mut order = vec![];
        let (a, b) = join(|| 1, || 2);
        order.push(a);
        order.push(b);
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_scope_fallback_runs_forks_inline() {
        let slot = CommitSlot::new(0u64);
        scope(|s| {
            s.fork(|| slot.put(7));
        });
        let mut slot = slot;
        assert_eq!(slot.get(), 7);
    }

    #[test]
    fn test_join_propagates_panic_from_first_closure() {
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            join(|| panic!("left"), || 2);
        }));
        assert!(caught.is_err());
    }
}

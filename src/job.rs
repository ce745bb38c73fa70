// Copyright (c) 2025 Weft Contributors
//
// Erased job objects
//
// A `JobRef` is the unit published on a deque: the owning frame plus a
// type-erased closure. Jobs forked by `join` live on the forking
// function's stack (`StackJob`); jobs forked into a scope must outlive
// the forking statement and are boxed (`HeapJob`).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crate::frame::Frame;
use crate::scheduler;

/// How a job is being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Reclaimed by the owner's pop: results are written directly, no
    /// synchronization beyond the pop itself.
    Sequential,
    /// Taken by a thief: results are staged as commit descriptors and
    /// applied under the owning joint's lock at resume.
    Stolen,
    /// Reclaimed by the owner while unwinding: drop the closure without
    /// running it.
    Abort,
}

/// Type-erased reference to a job and the frame it was forked from.
#[derive(Clone, Copy)]
pub struct JobRef {
    frame: *const Frame,
    data: *const (),
    exec: unsafe fn(*const (), ExecMode),
}

// Safety: a job crosses threads only through a successful steal, which
// transfers exclusive ownership of `data`.
unsafe impl Send for JobRef {}

impl JobRef {
    pub fn new(frame: *const Frame, data: *const (), exec: unsafe fn(*const (), ExecMode)) -> Self {
        Self { frame, data, exec }
    }

    pub fn frame(&self) -> *const Frame {
        self.frame
    }

    /// # Safety
    ///
    /// Must be called exactly once, and `data` must still be live.
    pub unsafe fn execute(self, mode: ExecMode) {
        (self.exec)(self.data, mode)
    }
}

/// A job whose storage lives in the forking function's stack frame.
///
/// `join` keeps the `StackJob` alive until the frame's join completes,
/// so the sequential fast path performs no allocation at all.
pub struct StackJob<F, R> {
    func: UnsafeCell<Option<F>>,
    result: UnsafeCell<MaybeUninit<R>>,
}

impl<F, R> StackJob<F, R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func: UnsafeCell::new(Some(func)),
            result: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    ///
    /// The returned reference must be consumed before `self` moves or
    /// goes out of scope.
    pub unsafe fn as_job_ref(&self, frame: &Frame) -> JobRef {
        JobRef::new(frame, self as *const Self as *const (), Self::execute)
    }

    /// Read the result after the frame's join completed.
    ///
    /// # Safety
    ///
    /// The job must have been executed (not aborted).
    pub unsafe fn into_result(self) -> R {
        self.result.into_inner().assume_init()
    }

    unsafe fn execute(data: *const (), mode: ExecMode) {
        let this = &*(data as *const Self);
        let func = (*this.func.get()).take().expect("job executed twice");

        match mode {
            ExecMode::Abort => drop(func),
            ExecMode::Sequential => {
                (*this.result.get()).write(func());
            }
            ExecMode::Stolen => {
                let value = func();
                // The result lives in the owner's stack; propagate it as
                // a commit descriptor instead of writing through.
                scheduler::stage_commit(this.result.get() as *mut u8, value);
            }
        }
    }
}

/// A heap-allocated job for scope forks.
pub struct HeapJob<F> {
    func: F,
}

impl<F> HeapJob<F>
where
    F: FnOnce() + Send,
{
    /// Box the closure and erase it into a `JobRef`.
    pub fn new(frame: &Frame, func: F) -> JobRef {
        let data = Box::into_raw(Box::new(HeapJob { func }));
        JobRef::new(frame, data as *const (), Self::execute)
    }

    unsafe fn execute(data: *const (), mode: ExecMode) {
        let HeapJob { func } = *Box::from_raw(data as *mut Self);

        match mode {
            ExecMode::Abort => drop(func),
            ExecMode::Sequential | ExecMode::Stolen => func(),
        }
    }
}

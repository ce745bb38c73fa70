// Copyright (c) 2025 Weft Contributors
//
// Per-worker scheduler
//
// A worker alternates between user code and scheduler code. User code is
// entered by reclaiming a job with a pop (sequential path) or by a
// successful steal; scheduler code runs when a worker is idle or when a
// join stalls on stolen children. Victims are chosen uniformly at random
// and a failed sweep yields the OS thread as a penalty.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::trace;

use crate::deque::Deque;
use crate::frame::{Frame, CHILD_FIRST, NEUTRAL, PARENT_SUSPENDED, RESUME_GRANTED};
use crate::job::{ExecMode, JobRef};
use crate::joint::{apply_bytes, Joint};
use crate::mirror::ArenaCache;
use crate::runtime::Registry;
use crate::sync::Backoff;

thread_local! {
    static WORKER: Cell<*const WorkerThread> = const { Cell::new(std::ptr::null()) };
}

/// One commit descriptor staged by a stolen child: `len` bytes at
/// `bytes[off..]` destined for `addr` in some ancestor's locals.
struct StagedRecord {
    addr: *mut u8,
    len: usize,
    off: usize,
}

/// Worker-local staging area for commit descriptors, reused across jobs.
struct CommitStaging {
    records: Vec<StagedRecord>,
    bytes: Vec<u8>,
}

/// Per-worker state. Lives on the worker thread's own stack (workers
/// 1..n) or boxed inside the `Runtime` (worker 0), and is reached from
/// user code through the thread-local pointer above.
pub(crate) struct WorkerThread {
    index: usize,
    registry: Arc<Registry>,
    deque: Arc<Deque>,
    cache: ArenaCache,
    rng: RefCell<fastrand::Rng>,
    staging: RefCell<CommitStaging>,
    /// How the innermost job on this worker is being consumed.
    mode: Cell<ExecMode>,
}

impl WorkerThread {
    pub(crate) fn new(registry: Arc<Registry>, index: usize) -> Self {
        let deque = registry.deque(index).clone();
        Self {
            index,
            registry,
            deque,
            cache: ArenaCache::new(),
            rng: RefCell::new(fastrand::Rng::new()),
            staging: RefCell::new(CommitStaging {
                records: Vec::new(),
                bytes: Vec::new(),
            }),
            mode: Cell::new(ExecMode::Sequential),
        }
    }

    pub(crate) fn deque(&self) -> &Deque {
        &self.deque
    }

    pub(crate) fn mode(&self) -> ExecMode {
        self.mode.get()
    }

    fn stage_bytes(&self, addr: *mut u8, src: *const u8, len: usize) {
        let staging = &mut *self.staging.borrow_mut();
        let off = staging.bytes.len();
        // Safety: the caller hands us `len` readable bytes.
        staging
            .bytes
            .extend_from_slice(unsafe { std::slice::from_raw_parts(src, len) });
        staging.records.push(StagedRecord { addr, len, off });
    }

    fn staging_mark(&self) -> (usize, usize) {
        let staging = self.staging.borrow();
        (staging.records.len(), staging.bytes.len())
    }
}

/// Register `worker` as this thread's worker.
///
/// # Safety
///
/// `worker` must outlive the registration; pair with `clear_current`.
pub(crate) unsafe fn set_current(worker: &WorkerThread) {
    WORKER.with(|cell| {
        debug_assert!(cell.get().is_null(), "worker already bound to this thread");
        cell.set(worker);
    });
}

pub(crate) fn clear_current() {
    WORKER.with(|cell| cell.set(std::ptr::null()));
}

/// The worker bound to this thread, if any.
///
/// # Safety
///
/// The returned reference is only valid while the runtime that bound it
/// is alive; callers on the binding thread between init and exit are
/// always safe.
pub(crate) unsafe fn current_worker<'a>() -> Option<&'a WorkerThread> {
    WORKER.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            None
        } else {
            Some(&*ptr)
        }
    })
}

/// Bind worker 0 (the thread that started the runtime).
pub(crate) fn bind_worker0(worker: &WorkerThread) {
    // Safety: the runtime keeps worker 0 boxed until shutdown, and
    // shutdown runs on this thread (`Runtime` is not `Send`).
    unsafe {
        set_current(worker);
        worker.registry.mirror().install(&worker.cache, &worker.deque);
    }
}

/// Unbind worker 0 and release its arenas.
pub(crate) fn retire_worker0(worker: &WorkerThread) {
    // Safety: called on the binding thread during shutdown.
    unsafe {
        worker.registry.mirror().retire(&worker.cache, &worker.deque);
    }
    clear_current();
}

/// Main loop for workers 1..n: steal until the stop sentinel is set,
/// then synchronize on the termination barrier.
pub(crate) fn main_loop(registry: Arc<Registry>, index: usize) {
    let worker = WorkerThread::new(registry.clone(), index);
    // Safety: `worker` lives on this stack frame until after
    // `clear_current` below.
    unsafe {
        set_current(&worker);
        registry.mirror().install(&worker.cache, &worker.deque);
    }
    trace!(worker = index, "worker started");

    while !registry.stopped() {
        match steal_once(&worker) {
            // Safety: the steal transferred the job to us.
            Some(job) => unsafe { run_stolen(&worker, job) },
            None => thread::yield_now(),
        }
    }

    // Safety: this is the owner's thread.
    unsafe {
        registry.mirror().retire(&worker.cache, &worker.deque);
    }
    registry.barrier().wait();
    clear_current();
    trace!(worker = index, "worker stopped");
}

/// Steal one job from a uniformly random victim (never self).
fn steal_once(worker: &WorkerThread) -> Option<JobRef> {
    let nprocs = worker.registry.nprocs();
    if nprocs <= 1 {
        return None;
    }

    let mut victim = worker.rng.borrow_mut().usize(0..nprocs - 1);
    if victim >= worker.index {
        victim += 1;
    }

    worker.registry.deque(victim).steal()
}

/// Run a stolen job with thief semantics: attach the joint, execute,
/// commit the staged descriptors, then arrive at the joint.
///
/// # Safety
///
/// The job must have been obtained from a successful steal.
pub(crate) unsafe fn run_stolen(worker: &WorkerThread, job: JobRef) {
    let frame = &*job.frame();

    // First steal against a frame installs its joint. The count credit
    // is published before the `steals` increment so the owner's quiesce
    // spin (join) observes both.
    let joint = frame.ensure_joint();
    joint.credit_steal();
    frame.steals().fetch_add(1, Ordering::Release);

    worker.registry.mirror().setup(&worker.cache, &worker.deque);
    trace!(worker = worker.index, frame = ?job.frame(), "steal");

    // A panic crossing a steal cannot be propagated to the parent;
    // abort rather than tear the protocol.
    let guard = AbortOnPanic;

    let mark = worker.staging_mark();
    let prev = worker.mode.replace(ExecMode::Stolen);
    job.execute(ExecMode::Stolen);
    worker.mode.set(prev);

    flush_commits(worker, joint, mark);

    if joint.arrive(1) == 0 {
        // We are the last arrival; hand completion to the parent.
        match frame.resumable().swap(CHILD_FIRST, Ordering::AcqRel) {
            NEUTRAL => {}
            PARENT_SUSPENDED => frame.resumable().store(RESUME_GRANTED, Ordering::Release),
            other => debug_assert!(false, "resumable handshake corrupted: {other}"),
        }
    }

    std::mem::forget(guard);
}

/// Apply the staged commit descriptors of the job that just finished.
/// While the parent is suspended the joint's canonical buffer is the
/// commit target; otherwise the live locals are.
fn flush_commits(worker: &WorkerThread, joint: &Joint, mark: (usize, usize)) {
    let staging = &mut *worker.staging.borrow_mut();
    if staging.records.len() > mark.0 {
        let mut inner = joint.lock();
        for record in &staging.records[mark.0..] {
            let src = staging.bytes[record.off..].as_ptr();
            // Safety: the destination is a live local of an activation
            // that cannot unwind past its join while we are outstanding.
            unsafe {
                match inner.canonical_mut() {
                    Some(canon) => {
                        // A full buffer falls back to the live locals,
                        // which stay mapped in the shared address space.
                        if !canon.append(record.addr, src, record.len) {
                            apply_bytes(record.addr, src, record.len);
                        }
                    }
                    None => apply_bytes(record.addr, src, record.len),
                }
            }
        }
    }
    staging.records.truncate(mark.0);
    staging.bytes.truncate(mark.1);
}

/// Stage the bytes of `value` as a commit descriptor for `dst`.
///
/// Called from a stolen job's execution; the value is moved into the
/// worker's staging buffer and applied at resume.
pub(crate) fn stage_commit<T>(dst: *mut u8, value: T) {
    // Safety: stolen jobs only execute on workers.
    let worker = unsafe { current_worker() }.expect("commit staged outside a worker");
    debug_assert_eq!(worker.mode(), ExecMode::Stolen);
    worker.stage_bytes(dst, &value as *const T as *const u8, size_of::<T>());
    std::mem::forget(value);
}

/// Result of joining a frame.
#[derive(Default)]
pub(crate) struct JoinOutcome {
    /// First panic raised by a job run on the sequential path.
    pub panic: Option<Box<dyn std::any::Any + Send>>,
    /// The pending job was reclaimed and dropped without running.
    pub aborted: bool,
}

/// Join a frame: drain the owner's unmatched pushes, then synchronize
/// with whatever was stolen.
pub(crate) fn join_frame(worker: &WorkerThread, frame: &Frame, execute: bool) -> JoinOutcome {
    frame.assert_joinable();
    let mut outcome = JoinOutcome::default();

    // Sequential path: reclaim pushes in LIFO order. The top job may
    // belong to an enclosing scope whose forks interleaved with ours;
    // it is reclaimed for its own frame, which lives further up this
    // worker's call stack.
    while frame.pending() > 0 {
        match worker.deque().pop() {
            Some(job) => {
                // Safety: a frame with unmatched pushes on this deque is
                // a live activation record of this thread.
                let owner = unsafe { &*job.frame() };
                owner.sub_pending();
                // An unwinding join only discards its own pending job;
                // an enclosing scope's job still has to run.
                let run = execute || !std::ptr::eq(owner, frame);
                run_local(worker, job, run, &mut outcome);
            }
            // A failed pop proves the remaining pushes were stolen.
            None => break,
        }
    }

    let stolen = frame.pending();
    if stolen == 0 {
        frame.consume();
        return outcome;
    }
    frame.clear_pending();

    // The steal CAS already committed for each unmatched push; wait out
    // the short window before the thief publishes its bookkeeping.
    let mut backoff = Backoff::new();
    while frame.steals().load(Ordering::Acquire) != stolen {
        backoff.snooze();
    }

    let joint = frame.joint().expect("stolen frame has no joint");

    // The parent's own arrival contributes `stolen` to the counter.
    if joint.arrive(stolen as i64) == 0 {
        // Every child completed before we got here.
        frame.consume();
        return outcome;
    }

    // Suspend: export the canonical buffer, then race the last child on
    // the handshake word.
    trace!(worker = worker.index, "suspend at join");
    {
        let canonical = unsafe {
            worker
                .registry
                .mirror()
                .uninstall(&worker.cache, &worker.deque)
        };
        joint.lock().export(canonical);
    }

    match frame.resumable().swap(PARENT_SUSPENDED, Ordering::AcqRel) {
        // The last child finished in the window above; completion is ours.
        CHILD_FIRST => {}
        NEUTRAL => wait_resume(worker, frame),
        other => debug_assert!(false, "resumable handshake corrupted: {other}"),
    }

    // Import: replay buffered commits into the live locals.
    let canonical = joint.lock().take_canonical();
    if let Some(canonical) = canonical {
        unsafe {
            worker
                .registry
                .mirror()
                .reinstall(&worker.cache, &worker.deque, canonical);
        }
    }

    frame.consume();
    outcome
}

/// Steal mode of a suspended parent: keep the worker busy on other
/// people's work until the last child grants resume.
fn wait_resume(worker: &WorkerThread, frame: &Frame) {
    let mut backoff = Backoff::new();
    loop {
        if frame.resumable().load(Ordering::Acquire) == RESUME_GRANTED {
            trace!(worker = worker.index, "resume");
            return;
        }

        match steal_once(worker) {
            // Safety: the steal transferred the job to us.
            Some(job) => unsafe {
                run_stolen(worker, job);
                backoff.reset();
            },
            None => backoff.snooze(),
        }
    }
}

/// Run a job reclaimed by the owner's pop.
fn run_local(worker: &WorkerThread, job: JobRef, execute: bool, outcome: &mut JoinOutcome) {
    let prev = worker.mode.replace(ExecMode::Sequential);
    if execute {
        // Safety: the pop transferred the job to us.
        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            job.execute(ExecMode::Sequential)
        }));
        if let Err(payload) = result {
            if outcome.panic.is_none() {
                outcome.panic = Some(payload);
            }
        }
    } else {
        // The caller is already unwinding; reclaim without running.
        // Safety: as above.
        unsafe { job.execute(ExecMode::Abort) };
        outcome.aborted = true;
    }
    worker.mode.set(prev);
}

/// Aborts the process if dropped during an unwind.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        tracing::error!("panic crossed a steal; aborting");
        std::process::abort();
    }
}

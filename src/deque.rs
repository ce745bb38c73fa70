// Copyright (c) 2025 Weft Contributors
//
// Work-stealing deque
//
// Fixed-capacity variant of the Chase-Lev work-stealing deque. The owner
// pushes and pops at the tail; thieves steal at the head. Head and tail
// are monotonic 64-bit counters, which makes the steal CAS ABA-free over
// the life of the program without per-slot generation tags.
//
// Reference: "Dynamic Circular Work-Stealing Deque" by Chase and Lev (2005)

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::job::JobRef;
use crate::pool::Arena;
use crate::sync::CACHE_LINE_SIZE;

/// Number of job slots per worker deque
pub const DEQUE_SIZE: usize = 1024;

/// Per-worker work-stealing deque of job references
///
/// The owner's push/pop pair is the sequential fast path of a fork: one
/// release store and one fenced decrement, no locks, no allocation. A
/// thief serializes against the owner and against other thieves on a
/// single CAS of `head`.
///
/// # Ordering
///
/// - The slot write in `push` is published by the release store of
///   `tail`; a thief's acquire load of `tail` therefore observes it.
/// - `pop` decrements `tail`, fences, then loads `head`, so it cannot
///   miss a steal that already committed.
/// - The `head == tail` tie between the owner and a thief is resolved by
///   a CAS on `head`; the loser backs off without double-consumption.
#[repr(C, align(64))]
pub struct Deque {
    /// Next index to steal from (shared)
    head: AtomicU64,
    /// Padding to separate head and tail into different cache lines
    _pad: [u8; CACHE_LINE_SIZE - size_of::<AtomicU64>()],
    /// Next index for the owner to push into (owner writes, thieves read)
    tail: AtomicU64,
    /// Job slots, indexed modulo `DEQUE_SIZE`
    buff: Box<[UnsafeCell<MaybeUninit<JobRef>>]>,
    /// The owner's current execution arena (owner only)
    stack: UnsafeCell<Option<Arena>>,
    /// Statistics
    push_count: AtomicU64,
    pop_count: AtomicU64,
    steal_count: AtomicU64,
    steal_attempt_count: AtomicU64,
}

// Safety: `buff` slots are handed over by the head/tail protocol above;
// `stack` is only touched by the owning worker's thread.
unsafe impl Send for Deque {}
unsafe impl Sync for Deque {}

impl Deque {
    /// Create a new empty deque
    ///
    /// Indices start at 1 so the owner's speculative tail decrement can
    /// never wrap below zero.
    pub fn new() -> Self {
        let mut buff = Vec::with_capacity(DEQUE_SIZE);
        for _ in 0..DEQUE_SIZE {
            buff.push(UnsafeCell::new(MaybeUninit::uninit()));
        }

        Self {
            head: AtomicU64::new(1),
            _pad: [0; CACHE_LINE_SIZE - size_of::<AtomicU64>()],
            tail: AtomicU64::new(1),
            buff: buff.into_boxed_slice(),
            stack: UnsafeCell::new(None),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            steal_count: AtomicU64::new(0),
            steal_attempt_count: AtomicU64::new(0),
        }
    }

    /// Push a job at the tail (owner only)
    ///
    /// Returns the job back to the caller if the ring is full; the caller
    /// must then execute it inline, which preserves the at-most-one
    /// consumer property at the cost of laziness.
    pub fn push(&self, job: JobRef) -> Option<JobRef> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail - head >= DEQUE_SIZE as u64 {
            return Some(job);
        }

        // Safety: `tail - head < DEQUE_SIZE`, so no thief can be reading
        // this slot, and we are the only writer of tail-side slots.
        unsafe {
            (*self.buff[(tail % DEQUE_SIZE as u64) as usize].get()).write(job);
        }

        self.tail.store(tail + 1, Ordering::Release);
        self.push_count.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Pop a job from the tail (owner only)
    ///
    /// Returns `None` when every remaining slot has been (or is being)
    /// consumed by thieves: a failed pop is proof that the matching push
    /// was stolen.
    pub fn pop(&self) -> Option<JobRef> {
        let tail = self.tail.load(Ordering::Relaxed) - 1;
        self.tail.store(tail, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let head = self.head.load(Ordering::Relaxed);

        if head < tail {
            // The popped slot is private; no thief can reach it.
            self.pop_count.fetch_add(1, Ordering::Relaxed);
            // Safety: slot `tail` was published by a prior push and is
            // now below every thief's reach.
            return Some(unsafe { (*self.buff[(tail % DEQUE_SIZE as u64) as usize].get()).assume_init_read() });
        }

        if head > tail {
            // Thieves consumed everything, including the slot we just
            // claimed. `head` can pass our decremented tail by at most 1.
            debug_assert_eq!(head, tail + 1);
            self.tail.store(head, Ordering::Relaxed);
            return None;
        }

        // head == tail: race with thieves for the last slot.
        let won = self
            .head
            .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.tail.store(tail + 1, Ordering::Relaxed);

        if won {
            self.pop_count.fetch_add(1, Ordering::Relaxed);
            // Safety: the CAS serialized us against all thieves; the slot
            // content was untouched since the push.
            Some(unsafe { (*self.buff[(tail % DEQUE_SIZE as u64) as usize].get()).assume_init_read() })
        } else {
            None
        }
    }

    /// Steal a job from the head (any thread)
    ///
    /// Retries internally on CAS contention and returns `None` only when
    /// the deque is observed empty.
    pub fn steal(&self) -> Option<JobRef> {
        self.steal_attempt_count.fetch_add(1, Ordering::Relaxed);

        let mut head = self.head.load(Ordering::Acquire);

        loop {
            fence(Ordering::SeqCst);
            let tail = self.tail.load(Ordering::Acquire);

            if tail <= head {
                return None;
            }

            // Safety: a torn or stale read is impossible here: the owner
            // only overwrites a slot once `tail - head >= DEQUE_SIZE`,
            // which the push capacity check rules out. The CAS below is
            // the serialization point that makes the read ours.
            let job = unsafe { (*self.buff[(head % DEQUE_SIZE as u64) as usize].get()).assume_init_read() };

            match self
                .head
                .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => {
                    self.steal_count.fetch_add(1, Ordering::Relaxed);
                    return Some(job);
                }
                Err(current) => head = current,
            }
        }
    }

    /// Check if the deque is empty
    pub fn is_empty(&self) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail <= head
    }

    /// Take the owner's execution arena token
    ///
    /// # Safety
    ///
    /// Only the owning worker's thread may call this.
    pub unsafe fn take_stack(&self) -> Option<Arena> {
        (*self.stack.get()).take()
    }

    /// Install the owner's execution arena token
    ///
    /// # Safety
    ///
    /// Only the owning worker's thread may call this.
    pub unsafe fn set_stack(&self, arena: Option<Arena>) -> Option<Arena> {
        std::mem::replace(&mut *self.stack.get(), arena)
    }

    /// # Safety
    ///
    /// Only the owning worker's thread may call this.
    pub unsafe fn has_stack(&self) -> bool {
        (*self.stack.get()).is_some()
    }

    /// Get statistics
    pub fn stats(&self) -> DequeStats {
        DequeStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            steal_count: self.steal_count.load(Ordering::Relaxed),
            steal_attempt_count: self.steal_attempt_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for Deque {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        // Every push must have been matched by a pop or a steal before
        // the runtime tears the deque down.
        debug_assert!(self.is_empty(), "deque dropped with unconsumed jobs");
    }
}

/// Statistics for a deque
#[derive(Debug, Clone, Copy)]
pub struct DequeStats {
    pub push_count: u64,
    pub pop_count: u64,
    pub steal_count: u64,
    pub steal_attempt_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::sync::atomic::AtomicU64;
    use std::sync::{Arc, Barrier};
    use std::thread;

    // A job that bumps a counter by a tag value when executed. The deque
    // never runs jobs itself, so the tests only need stable identities.
    fn counting_job(frame: &Frame, counter: &AtomicU64, tag: u64) -> JobRef {
        unsafe fn execute(data: *const (), _mode: crate::job::ExecMode) {
            let (counter, tag) = unsafe { *(data as *const (*const AtomicU64, u64)) };
            unsafe { (*counter).fetch_add(tag, Ordering::Relaxed) };
        }
        let data = Box::into_raw(Box::new((counter as *const AtomicU64, tag)));
        JobRef::new(frame, data as *const (), execute)
    }

    fn run(job: JobRef) {
        unsafe { job.execute(crate::job::ExecMode::Sequential) };
    }

    #[test]
    fn test_push_pop_lifo() {
        let deque = Deque::new();
        let frame = Frame::new();
        let counter = AtomicU64::new(0);

        assert!(deque.push(counting_job(&frame, &counter, 1)).is_none());
        assert!(deque.push(counting_job(&frame, &counter, 2)).is_none());
        assert!(deque.push(counting_job(&frame, &counter, 4)).is_none());

        run(deque.pop().unwrap());
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        run(deque.pop().unwrap());
        assert_eq!(counter.load(Ordering::Relaxed), 6);
        run(deque.pop().unwrap());
        assert_eq!(counter.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_steal_fifo() {
        let deque = Deque::new();
        let frame = Frame::new();
        let counter = AtomicU64::new(0);

        assert!(deque.push(counting_job(&frame, &counter, 1)).is_none());
        assert!(deque.push(counting_job(&frame, &counter, 2)).is_none());

        // Thieves take the oldest job first.
        run(deque.steal().unwrap());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        run(deque.pop().unwrap());
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert!(deque.steal().is_none());
    }

    #[test]
    fn test_full_deque_rejects_push() {
        let deque = Deque::new();
        let frame = Frame::new();
        let counter = AtomicU64::new(0);

        for _ in 0..DEQUE_SIZE {
            assert!(deque.push(counting_job(&frame, &counter, 1)).is_none());
        }
        let rejected = deque.push(counting_job(&frame, &counter, 1));
        assert!(rejected.is_some());
        run(rejected.unwrap());

        while let Some(job) = deque.pop() {
            run(job);
        }
        assert_eq!(counter.load(Ordering::Relaxed), DEQUE_SIZE as u64 + 1);
    }

    #[test]
    fn test_concurrent_steal_consumes_each_job_once() {
        let deque = Arc::new(Deque::new());
        let frame = Box::leak(Box::new(Frame::new()));
        let counter: &'static AtomicU64 = Box::leak(Box::new(AtomicU64::new(0)));

        const JOBS: u64 = 1000;
        let barrier = Arc::new(Barrier::new(5));
        let mut handles = vec![];

        // Owner interleaves pushes and pops.
        {
            let deque = deque.clone();
            let barrier = barrier.clone();
            let frame: &'static Frame = frame;
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..JOBS {
                    while let Some(job) = deque.push(counting_job(frame, counter, 1)) {
                        run(job);
                    }
                }
                while let Some(job) = deque.pop() {
                    run(job);
                }
            }));
        }

        // Thieves drain until the owner is done.
        for _ in 0..4 {
            let deque = deque.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                loop {
                    match deque.steal() {
                        Some(job) => run(job),
                        None => {
                            if counter.load(Ordering::Relaxed) == JOBS {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // Exactly-once consumption: every job ran exactly one time.
        assert_eq!(counter.load(Ordering::Relaxed), JOBS);
        assert!(deque.is_empty());
    }
}

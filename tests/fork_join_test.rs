// Copyright (c) 2025 Weft Contributors
//
// End-to-end fork/join correctness: recursive forks, commit
// propagation, deep join chains and steal storms, across worker counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use weft::{CommitSlot, Runtime};

fn with_big_stack<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .stack_size(32 << 20)
        .spawn(f)
        .unwrap()
        .join()
        .unwrap();
}

fn fib(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let (a, b) = weft::join(|| fib(n - 1), || fib(n - 2));
    a + b
}

fn fib_sequential(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

#[test]
fn test_fibonacci_on_all_worker_counts() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    for workers in [1, 2, 4, 8] {
        with_big_stack(move || {
            let rt = Runtime::start(workers);
            for n in 0..=20 {
                assert_eq!(fib(n), fib_sequential(n), "fib({n}) on {workers} workers");
            }
            rt.shutdown();
        });
    }
}

fn parallel_sum(slice: &[u64]) -> u64 {
    if slice.len() <= 1024 {
        return slice.iter().sum();
    }
    let mid = slice.len() / 2;
    let (left, right) = weft::join(|| parallel_sum(&slice[..mid]), || parallel_sum(&slice[mid..]));
    left + right
}

#[test]
fn test_parallel_sum_of_a_million_ones() {
    let ones = vec![1u64; 1_000_000];

    for workers in [1, 2, 4, 8] {
        let rt = Runtime::start(workers);
        assert_eq!(parallel_sum(&ones), 1_000_000, "{workers} workers");
        rt.shutdown();
    }
}

#[test]
fn test_every_push_is_consumed_exactly_once() {
    let ones = vec![1u64; 1_000_000];

    let rt = Runtime::start(4);
    assert_eq!(parallel_sum(&ones), 1_000_000);
    let stats = rt.stats();
    rt.shutdown();

    let pushes: u64 = stats.deques.iter().map(|d| d.push_count).sum();
    let pops: u64 = stats.deques.iter().map(|d| d.pop_count).sum();
    let steals: u64 = stats.deques.iter().map(|d| d.steal_count).sum();
    assert_eq!(pushes, pops + steals);
}

#[test]
fn test_commit_slots_are_bit_exact_after_join() {
    let values: [f64; 8] = [
        1.000_000_000_000_000_2,
        -0.0,
        f64::MIN_POSITIVE,
        std::f64::consts::PI,
        f64::from_bits(0x0000_0000_0000_0001),
        f64::from_bits(0x7ff0_0000_0000_0000), // +inf
        -std::f64::consts::E,
        f64::MAX,
    ];

    for workers in [1, 2, 4] {
        let rt = Runtime::start(workers);

        for _ in 0..100 {
            let mut slots: Vec<CommitSlot<f64>> = (0..8).map(|_| CommitSlot::new(0.0)).collect();

            {
                let slots = &slots;
                weft::scope(|s| {
                    s.fork(move || {
                        for (slot, value) in slots.iter().zip(values) {
                            slot.put(value);
                        }
                    });
                    // Give a thief a window to take the fork while the
                    // parent is still busy.
                    std::hint::black_box(fib_sequential(64));
                });
            }

            for (slot, value) in slots.iter_mut().zip(values) {
                assert_eq!(slot.get().to_bits(), value.to_bits(), "{workers} workers");
            }
        }

        rt.shutdown();
    }
}

fn chain(depth: u64) -> u64 {
    if depth == 0 {
        return 0;
    }
    // Fork a constant-time leaf, continue down the chain, join.
    let (leaf, rest) = weft::join(|| 1u64, || chain(depth - 1));
    leaf + rest
}

#[test]
fn test_deep_join_chain() {
    for workers in [1, 2, 4, 8] {
        with_big_stack(move || {
            let rt = Runtime::start(workers);
            assert_eq!(chain(1024), 1024, "{workers} workers");
            rt.shutdown();
        });
    }
}

#[test]
fn test_steal_storm_single_producer() {
    let rt = Runtime::start(8);

    let total = AtomicU64::new(0);
    weft::scope(|s| {
        for i in 0..10_000u64 {
            let total = &total;
            s.fork(move || {
                total.fetch_add(i, Ordering::Relaxed);
            });
        }
    });

    assert_eq!(total.load(Ordering::Relaxed), 10_000 * 9_999 / 2);
    rt.shutdown();
}

#[test]
fn test_single_worker_is_depth_first_left_to_right() {
    let rt = Runtime::start(1);

    let log = event_log::Log::default();
    let (_, _) = weft::join(
        || {
            log.push(1);
            let _ = weft::join(|| log.push(2), || log.push(3));
        },
        || log.push(4),
    );

    assert_eq!(log.take(), vec![1, 2, 3, 4]);
    rt.shutdown();
}

// With one worker no steal can occur, so a locked vector is enough to
// observe the execution order.
mod event_log {
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Log(Mutex<Vec<u32>>);

    impl Log {
        pub fn push(&self, value: u32) {
            self.0.lock().unwrap().push(value);
        }

        pub fn take(&self) -> Vec<u32> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }
}

#[test]
fn test_panic_in_left_closure_propagates_and_runtime_survives() {
    let rt = Runtime::start(2);

    let caught = std::panic::catch_unwind(|| {
        weft::join(|| panic!("left side"), || 2u64);
    });
    assert!(caught.is_err());

    // The deque is balanced again: ordinary joins keep working.
    let (a, b) = weft::join(|| 20u64, || 22u64);
    assert_eq!(a + b, 42);

    rt.shutdown();
}

#[test]
fn test_interleaved_forks_across_nested_scopes() {
    // A fork onto an enclosing scope after a fork onto the inner scope:
    // the inner join reclaims the enclosing scope's job from the top of
    // the deque on its own sequential path.
    for workers in [1, 4] {
        let rt = Runtime::start(workers);

        let mut first = CommitSlot::new(0u64);
        let mut second = CommitSlot::new(0u64);
        let mut third = CommitSlot::new(0u64);
        {
            let (first, second, third) = (&first, &second, &third);
            weft::scope(|outer| {
                outer.fork(move || first.put(1));
                weft::scope(|inner| {
                    inner.fork(move || second.put(2));
                    outer.fork(move || third.put(3));
                });
            });
        }
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);
        assert_eq!(third.get(), 3);

        rt.shutdown();
    }
}

#[test]
fn test_nested_scopes_commit_to_outer_slots() {
    let rt = Runtime::start(4);

    let mut outer = CommitSlot::new(0u64);
    {
        let outer = &outer;
        weft::scope(|s| {
            s.fork(move || {
                weft::scope(|inner| {
                    inner.fork(move || outer.put(99));
                });
            });
        });
    }
    assert_eq!(outer.get(), 99);

    rt.shutdown();
}

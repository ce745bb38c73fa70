// Copyright (c) 2025 Weft Contributors
//
// Runtime front end
//
// `Runtime::start` spawns the worker threads and turns the calling
// thread into worker 0; user code then forks and joins directly on it.
// `shutdown` raises the stop sentinel, meets the workers at the
// termination barrier and joins their threads. A process-wide
// `init`/`exit` pair guards a single global runtime for embedders that
// do not want to thread a handle around.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::debug;

use crate::deque::{Deque, DequeStats};
use crate::error::{Result, RuntimeError};
use crate::mirror::SharedMirror;
use crate::pool::PoolStats;
use crate::scheduler::{self, WorkerThread};

/// Environment variable selecting the worker count when none is given.
pub const ENV_WORKERS: &str = "WEFT_WORKERS";

/// Stack size for spawned workers.
const WORKER_STACK_SIZE: usize = 8 << 20;

/// Shared state of one runtime: the deque vector, the mirror (with its
/// arena pool), the stop sentinel and the termination barrier.
pub(crate) struct Registry {
    deques: Vec<Arc<Deque>>,
    mirror: SharedMirror,
    stop: AtomicBool,
    barrier: Barrier,
    nprocs: usize,
}

impl Registry {
    fn new(nprocs: usize) -> Self {
        Self {
            deques: (0..nprocs).map(|_| Arc::new(Deque::new())).collect(),
            mirror: SharedMirror::new(),
            stop: AtomicBool::new(false),
            barrier: Barrier::new(nprocs),
            nprocs,
        }
    }

    pub(crate) fn deque(&self, index: usize) -> &Arc<Deque> {
        &self.deques[index]
    }

    pub(crate) fn mirror(&self) -> &SharedMirror {
        &self.mirror
    }

    pub(crate) fn nprocs(&self) -> usize {
        self.nprocs
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn set_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn barrier(&self) -> &Barrier {
        &self.barrier
    }
}

/// A running worker pool.
///
/// The thread that calls [`Runtime::start`] becomes worker 0 and must be
/// the thread that forks, joins and eventually shuts the runtime down
/// (`Runtime` is deliberately not `Send`).
pub struct Runtime {
    registry: Arc<Registry>,
    handles: Vec<thread::JoinHandle<()>>,
    worker0: Option<Box<WorkerThread>>,
    // Pins the runtime to its starting thread.
    _not_send: PhantomData<*mut ()>,
}

impl Runtime {
    /// Start a runtime with `nworkers` workers. Zero means "decide from
    /// the environment": `WEFT_WORKERS` if set and positive, otherwise
    /// all available CPUs.
    ///
    /// Worker thread spawn failure is resource exhaustion and aborts the
    /// process; there is no partial runtime.
    pub fn start(nworkers: usize) -> Runtime {
        let nprocs = resolve_workers(nworkers);
        let registry = Arc::new(Registry::new(nprocs));

        let mut handles = Vec::with_capacity(nprocs.saturating_sub(1));
        for index in 1..nprocs {
            let registry = registry.clone();
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{index}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || scheduler::main_loop(registry, index));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    tracing::error!(%err, "failed to spawn worker thread");
                    std::process::abort();
                }
            }
        }

        let worker0 = Box::new(WorkerThread::new(registry.clone(), 0));
        scheduler::bind_worker0(&worker0);

        debug!(nprocs, "runtime started");
        Runtime {
            registry,
            handles,
            worker0: Some(worker0),
            _not_send: PhantomData,
        }
    }

    /// Number of active workers.
    pub fn nprocs(&self) -> usize {
        self.registry.nprocs()
    }

    /// Per-deque and pool operation counters.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            nprocs: self.registry.nprocs(),
            deques: self.registry.deques.iter().map(|d| d.stats()).collect(),
            pool: self.registry.mirror().pool().stats(),
        }
    }

    /// Stop the workers, meet them at the termination barrier and join
    /// their threads. All outstanding joins must have completed.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(worker0) = self.worker0.take() else {
            return;
        };

        scheduler::retire_worker0(&worker0);
        self.registry.set_stop();
        self.registry.barrier().wait();

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Aggregated operation counters.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    pub nprocs: usize,
    pub deques: Vec<DequeStats>,
    pub pool: PoolStats,
}

fn resolve_workers(nworkers: usize) -> usize {
    if nworkers > 0 {
        return nworkers;
    }
    std::env::var(ENV_WORKERS)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|&value| value > 0)
        .map(|value| value as usize)
        .unwrap_or_else(num_cpus::get)
}

struct GlobalRuntime {
    runtime: Runtime,
    thread: ThreadId,
}

// Safety: the slot below may be touched from any thread, but the
// runtime inside is only shut down after the owning-thread check in
// `exit`; `Runtime`'s thread affinity is enforced there at runtime.
unsafe impl Send for GlobalRuntime {}

static GLOBAL: Mutex<Option<GlobalRuntime>> = Mutex::new(None);

/// Start the global runtime on the calling thread (which becomes worker
/// 0). See [`Runtime::start`] for the worker-count rules.
pub fn init(nworkers: usize) -> Result<()> {
    let mut slot = GLOBAL.lock();
    if slot.is_some() {
        return Err(RuntimeError::AlreadyInitialized);
    }
    *slot = Some(GlobalRuntime {
        runtime: Runtime::start(nworkers),
        thread: thread::current().id(),
    });
    Ok(())
}

/// Shut the global runtime down. Must be called from the thread that
/// called [`init`].
pub fn exit() -> Result<()> {
    let mut slot = GLOBAL.lock();
    match slot.take() {
        None => Err(RuntimeError::NotInitialized),
        Some(global) if global.thread != thread::current().id() => {
            *slot = Some(global);
            Err(RuntimeError::WrongThread)
        }
        Some(global) => {
            global.runtime.shutdown();
            Ok(())
        }
    }
}

/// Number of active workers of the global runtime, or 0 when it is not
/// running.
pub fn nprocs() -> usize {
    GLOBAL
        .lock()
        .as_ref()
        .map(|global| global.runtime.nprocs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_explicit_count_wins() {
        // An explicit count beats the environment and CPU detection.
        assert_eq!(resolve_workers(3), 3);
    }
}

//! The heap worker thread.
//!
//! Finalizers and reference `clear()`/`enqueue()` calls run here, after the
//! collection that scheduled them has resumed the world. The worker also
//! performs the idle-time trim a collection schedules.
//!
//! Lock order: heap lock, then worker lock, then list lock. A thread holding
//! the worker lock must not take the heap lock; the worker releases its lock
//! and re-acquires it behind the heap lock when it needs both.

use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{fatal, fatal_payload, FatalError, HeapError};
use crate::globals::{FINALIZABLE_TABLE_DEFAULT, NON_COLLECTABLE_TABLE_DEFAULT};
use crate::heap::{GcHeap, HeapLocked};
use crate::mutator::Mutator;
use crate::object::{HeapCall, ObjectModel, ObjectRef};
use crate::ref_table::{LargeHeapRefTable, ReferenceOpTable, ReferenceOps};
use crate::statistics::{formatted_size, TrimStats};

/// Work handed from the collector to the heap worker. Every object in here
/// is a GC root.
pub struct WorkerLists {
    pub pending_finalization: LargeHeapRefTable,
    pub reference_ops: ReferenceOpTable,
}

impl WorkerLists {
    pub fn is_empty(&self) -> bool {
        self.pending_finalization.is_empty() && self.reference_ops.is_empty()
    }
}

/// The call the worker is currently blocked in, for the watchdog.
#[derive(Debug, Clone, Copy)]
pub struct InFlight {
    pub obj: ObjectRef,
    pub call: HeapCall,
    pub started: Instant,
}

#[derive(Default)]
pub struct WorkerState {
    pub current: Option<InFlight>,
    /// When set, the next time the worker should trim the heap.
    pub next_trim: Option<Instant>,
    pub halt: bool,
    pub ready: bool,
    thread: Option<ThreadId>,
    handle: Option<JoinHandle<()>>,
}

pub struct WorkerLock {
    state: Mutex<WorkerState>,
    lists: Mutex<WorkerLists>,
    /// Wakes the worker; also used by the worker to announce it is ready.
    cond: Condvar,
    /// Broadcast by the worker every time it runs out of work.
    idle: Condvar,
}

impl WorkerLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::default()),
            lists: Mutex::new(WorkerLists {
                pending_finalization: LargeHeapRefTable::with_capacity(FINALIZABLE_TABLE_DEFAULT),
                reference_ops: LargeHeapRefTable::with_capacity(NON_COLLECTABLE_TABLE_DEFAULT),
            }),
            cond: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// Takes the worker lock behind the heap lock.
    pub(crate) fn lock<'a>(&'a self, _heap: &HeapLocked<'_>) -> WorkerGuard<'a> {
        WorkerGuard {
            lock: self,
            guard: self.state.lock(),
        }
    }

    /// Takes the worker lock on its own. The caller must not hold the heap
    /// lock, and must not take it before the guard is dropped.
    pub(crate) fn lock_alone(&self) -> WorkerGuard<'_> {
        WorkerGuard {
            lock: self,
            guard: self.state.lock(),
        }
    }
}

impl Default for WorkerLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkerGuard<'a> {
    lock: &'a WorkerLock,
    guard: MutexGuard<'a, WorkerState>,
}

impl<'a> WorkerGuard<'a> {
    /// The list lock is only reachable through the worker lock.
    pub fn lists(&self) -> MutexGuard<'_, WorkerLists> {
        self.lock.lists.lock()
    }

    pub fn signal(&self) {
        self.lock.cond.notify_all();
    }

    fn wait(&mut self) {
        self.lock.cond.wait(&mut self.guard);
    }

    fn wait_until(&mut self, deadline: Instant) {
        self.lock.cond.wait_until(&mut self.guard, deadline);
    }

    fn wait_idle(&mut self) {
        self.lock.idle.wait(&mut self.guard);
    }

    fn broadcast_idle(&self) {
        self.lock.idle.notify_all();
    }

    fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        MutexGuard::unlocked(&mut self.guard, f)
    }

    /// Asks the worker to trim the heap `delay` from now, replacing any trim
    /// already scheduled. A zero delay just cancels.
    pub fn schedule_trim(&mut self, delay: Duration) {
        self.next_trim = if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        };
        self.signal();
    }

    /// True while a worker thread is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.ready
    }

    fn is_drained(&self) -> bool {
        self.current.is_none() && self.lists().is_empty()
    }

    fn on_worker_thread(&self) -> bool {
        self.thread == Some(thread::current().id())
    }
}

impl Deref for WorkerGuard<'_> {
    type Target = WorkerState;
    fn deref(&self) -> &WorkerState {
        &self.guard
    }
}

impl DerefMut for WorkerGuard<'_> {
    fn deref_mut(&mut self) -> &mut WorkerState {
        &mut self.guard
    }
}

/// Makes sure the worker hasn't spent an inordinate amount of time inside a
/// single callback. Must be called with the worker lock held.
pub fn assert_worker_running(
    worker: &mut WorkerGuard<'_>,
    timeout: Duration,
    debugger_active: bool,
    model: &dyn ObjectModel,
) {
    let Some(in_flight) = worker.current.as_mut() else {
        return;
    };
    let delta = in_flight.started.elapsed();
    if delta > timeout && debugger_active {
        log::info!("Debugger is attached -- suppressing HeapWorker watchdog");
        in_flight.started = Instant::now();
    } else if delta > timeout {
        log::error!(
            "HeapWorker is wedged: {}ms spent inside {}.{}",
            delta.as_millis(),
            model.describe(in_flight.obj),
            in_flight.call
        );
        fatal(FatalError::WorkerWedged {
            elapsed: delta,
            call: in_flight.call,
        });
    } else if delta > timeout / 2 {
        log::warn!(
            "HeapWorker may be wedged: {}ms spent inside {}.{}",
            delta.as_millis(),
            model.describe(in_flight.obj),
            in_flight.call
        );
    }
}

/// Spawns the worker thread and waits until it is ready for work. Does
/// nothing if it is already running.
pub(crate) fn start(heap: &Arc<GcHeap>) -> Result<(), HeapError> {
    heap.while_safe(|| {
        let mut worker = heap.worker.lock_alone();
        if worker.handle.is_some() {
            return Ok(());
        }
        worker.halt = false;
        let gc = heap.clone();
        let handle = thread::Builder::new()
            .name("HeapWorker".to_string())
            .spawn(move || heap_worker_main(gc))
            .map_err(HeapError::WorkerSpawn)?;
        worker.handle = Some(handle);
        while !worker.ready {
            worker.wait();
        }
        Ok(())
    })
}

/// Halts and joins the worker thread, if there is one.
pub(crate) fn shutdown(heap: &GcHeap) {
    let handle = heap.while_safe(|| {
        let mut worker = heap.worker.lock_alone();
        if worker.on_worker_thread() {
            log::warn!("HeapWorker asked to shut itself down");
            return None;
        }
        worker.halt = true;
        worker.signal();
        worker.handle.take()
    });
    if let Some(handle) = handle {
        heap.while_safe(|| {
            if handle.join().is_err() {
                log::warn!("HeapWorker thread join failed");
            } else {
                log::debug!("HeapWorker thread has shut down");
            }
        });
    }
}

fn heap_worker_main(heap: Arc<GcHeap>) {
    let mutator = Mutator::attach(heap.clone(), "HeapWorker");
    let _safe = mutator.enter_safe();

    let mut worker = heap.worker.lock_alone();
    worker.ready = true;
    worker.thread = Some(thread::current().id());
    worker.signal();
    log::debug!("HeapWorker thread started");

    while !worker.halt {
        if let Some(when) = worker.next_trim.filter(|&when| when <= Instant::now()) {
            // The heap must be locked before the worker; unroll and
            // re-order the locks.
            drop(worker);
            let mut heap_guard = heap.lock_heap();
            let (state, token) = heap_guard.parts();
            worker = heap.worker.lock(&token);
            let stats = state.source.trim();
            log_madvise_stats(&stats);
            drop(heap_guard);
            // A collection that ran while the lock was dropped may have
            // scheduled a new trim and queued work; its signal went nowhere.
            if worker.next_trim == Some(when) {
                worker.next_trim = None;
            }
            continue;
        }

        if worker.lists().is_empty() {
            // Let anyone waiting in wait_for_worker_idle know we're done.
            worker.broadcast_idle();
            match worker.next_trim {
                Some(deadline) => worker.wait_until(deadline),
                None => worker.wait(),
            }
        }

        if !worker.halt {
            do_heap_work(&heap, &mutator, &mut worker);
        }
    }

    worker.ready = false;
    worker.thread = None;
    drop(worker);
    log::trace!("HeapWorker thread exiting");
}

fn log_madvise_stats(stats: &TrimStats) {
    log::debug!(
        "madvised {} (GC) across {} arenas; native heap {}",
        formatted_size(stats.heap_bytes()),
        stats.per_arena.len(),
        if stats.native_released {
            "released memory"
        } else {
            "unchanged"
        }
    );
}

enum Work {
    Finalize,
    Reference(ReferenceOps),
}

/// Pops the next object to work on, reference operations first so that a
/// reference's `clear()` always precedes its referent's `finalize()`.
fn next_heap_worker_object(mutator: &Mutator, worker: &WorkerGuard<'_>) -> Option<(ObjectRef, Work)> {
    let mut lists = worker.lists();
    let next = match lists.reference_ops.pop() {
        Some((obj, ops)) => Some((obj, Work::Reference(ops))),
        None => lists
            .pending_finalization
            .pop()
            .map(|obj| (obj, Work::Finalize)),
    };
    if let Some((obj, _)) = next {
        // Don't let the collector take it until we're done with it.
        mutator.add_tracked_alloc(obj);
    }
    next
}

fn call_method(
    heap: &GcHeap,
    mutator: &Mutator,
    worker: &mut WorkerGuard<'_>,
    obj: ObjectRef,
    call: HeapCall,
) {
    worker.current = Some(InFlight {
        obj,
        call,
        started: Instant::now(),
    });
    // The callback may suspend, and the collector needs the worker lock.
    let result = worker.unlocked(|| {
        let _running = mutator.enter_unsafe();
        panic::catch_unwind(AssertUnwindSafe(|| heap.model.invoke(mutator, call, obj)))
    });
    worker.current = None;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!(
            "Uncaught error thrown by {}.{} (will be discarded): {}",
            heap.model.describe(obj),
            call,
            err
        ),
        Err(payload) => {
            if fatal_payload(&*payload).is_some() {
                panic::resume_unwind(payload);
            }
            log::warn!(
                "{}.{} panicked (will be discarded)",
                heap.model.describe(obj),
                call
            );
        }
    }
}

/// Runs every pending reference operation and finalizer. The caller holds
/// the worker lock and is in the safe state.
fn do_heap_work(heap: &GcHeap, mutator: &Mutator, worker: &mut WorkerGuard<'_>) {
    let mut finalized = 0;
    let mut cleared = 0;
    let mut enqueued = 0;

    while let Some((obj, work)) = next_heap_worker_object(mutator, worker) {
        debug_assert!(heap.is_valid_object(obj));
        match work {
            Work::Finalize => {
                finalized += 1;
                call_method(heap, mutator, worker, obj, HeapCall::Finalize);
            }
            Work::Reference(ops) => {
                // clear() must happen before enqueue(), otherwise a
                // non-clear reference could appear on a queue.
                if ops.clear {
                    cleared += 1;
                    call_method(heap, mutator, worker, obj, HeapCall::Clear);
                }
                if ops.enqueue {
                    enqueued += 1;
                    call_method(heap, mutator, worker, obj, HeapCall::Enqueue);
                }
            }
        }
        mutator.release_tracked_alloc(obj);
    }

    if finalized + cleared + enqueued > 0 {
        log::debug!(
            "Called {} finalizers, cleared {} references, enqueued {} references",
            finalized,
            cleared,
            enqueued
        );
    }
}

/// Blocks until the worker has drained everything pending right now. Without
/// a worker thread the work runs on the calling thread.
pub(crate) fn run_finalization_sync(heap: &GcHeap, mutator: &Mutator) {
    let _safe = mutator.enter_safe();
    let mut worker = heap.worker.lock_alone();
    if worker.on_worker_thread() {
        drop(worker);
        fatal(FatalError::WorkerReentry);
    }
    if !worker.is_running() {
        do_heap_work(heap, mutator, &mut worker);
        return;
    }
    while !worker.is_drained() {
        worker.signal();
        worker.wait_idle();
    }
}

/// Wakes the worker and waits for it to finish one pass.
pub(crate) fn wait_for_worker_idle(heap: &GcHeap) {
    heap.while_safe(|| {
        let mut worker = heap.worker.lock_alone();
        if !worker.is_running() || worker.on_worker_thread() {
            return;
        }
        worker.signal();
        worker.wait_idle();
    })
}

pub(crate) fn signal_worker(heap: &GcHeap) {
    heap.while_safe(|| heap.worker.lock_alone().signal())
}

pub(crate) fn schedule_trim(heap: &GcHeap, delay: Duration) {
    heap.while_safe(|| heap.worker.lock_alone().schedule_trim(delay))
}

/// Restarts the watchdog clock of the call in flight, if any.
pub(crate) fn reset_watchdog(heap: &GcHeap) {
    heap.while_safe(|| {
        if let Some(in_flight) = heap.worker.lock_alone().current.as_mut() {
            in_flight.started = Instant::now();
        }
    })
}

/// Number of pending finalizations and pending reference operations.
pub(crate) fn pending_work(heap: &GcHeap) -> (usize, usize) {
    heap.while_safe(|| {
        let worker = heap.worker.lock_alone();
        let lists = worker.lists();
        (lists.pending_finalization.len(), lists.reference_ops.len())
    })
}

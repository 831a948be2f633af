//! The GC heap: allocation, collection, and everything layered on the heap
//! source that needs the heap lock.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::bitmap::ObjectBitmap;
use crate::error::{fatal, FatalError, HeapError};
use crate::globals::*;
use crate::heap_source::{HeapSource, HeapValue, SharedBitmaps};
use crate::heap_worker::{self, assert_worker_running, WorkerLists, WorkerLock};
use crate::mark_sweep::{MarkContext, SoftRefPolicy};
use crate::mutator::{Mutator, OomeState};
use crate::object::{ObjectModel, ObjectRef, ReferenceKind};
use crate::ref_table::{HeapRefTable, LargeHeapRefTable};
use crate::roots::{RootProvider, RootSet};
use crate::safepoint::{GlobalSafepoint, ThreadState, ThreadStateGuard};
use crate::statistics::{formatted_size, AllocProfile, ArenaStatistics, HeapStatistics, TrimStats};
use crate::{AllocFlags, Config};

static NEXT_HEAP_ID: AtomicUsize = AtomicUsize::new(0);

/// Everything guarded by the heap lock.
pub struct HeapState {
    pub(crate) source: HeapSource,
    /// Objects that have a `finalize()` and haven't been found unreachable yet.
    finalizable: LargeHeapRefTable,
    /// Objects allocated with `NO_GC`, rooted until their flag is cleared.
    non_collectable: HeapRefTable,
    soft_ref_policy: SoftRefPolicy,
    /// Ideal footprint at which the soft reference policy last changed.
    soft_ref_threshold: usize,
    soft_ref_color: usize,
    /// References whose clear/enqueue work was already scheduled. Their
    /// referents stay strongly reachable until cleared.
    scheduled_refs: HashSet<ObjectRef>,
    gc_running: bool,
    gc_start_time: Option<Instant>,
    generation: u32,
    gc_count: usize,
    total_objects_freed: usize,
    total_bytes_freed: usize,
    last_gc_pause: Duration,
    profile: AllocProfile,
}

pub struct HeapGuard<'a>(MutexGuard<'a, HeapState>);

/// Proof that the heap lock is held. Required to take the worker lock in the
/// right order.
pub struct HeapLocked<'a>(PhantomData<&'a mut HeapState>);

impl<'a> HeapGuard<'a> {
    pub fn parts(&mut self) -> (&mut HeapState, HeapLocked<'_>) {
        (&mut *self.0, HeapLocked(PhantomData))
    }
}

impl Deref for HeapGuard<'_> {
    type Target = HeapState;
    fn deref(&self) -> &HeapState {
        &self.0
    }
}

impl DerefMut for HeapGuard<'_> {
    fn deref_mut(&mut self) -> &mut HeapState {
        &mut self.0
    }
}

pub struct GcHeap {
    id: usize,
    pub(crate) config: Config,
    pub(crate) model: Box<dyn ObjectModel>,
    state: Mutex<HeapState>,
    pub(crate) worker: WorkerLock,
    pub(crate) safepoint: GlobalSafepoint,
    roots: RootSet,
    live_bitmaps: SharedBitmaps,
    debugger_active: AtomicBool,
    profiling: AtomicBool,
}

impl GcHeap {
    /// Takes the heap lock. If it is contended and the caller is a running
    /// mutator, the caller waits in the safe state so a collection holding
    /// the lock can suspend it.
    pub(crate) fn lock_heap(&self) -> HeapGuard<'_> {
        if let Some(guard) = self.state.try_lock() {
            return HeapGuard(guard);
        }
        let guard = match self.safepoint.current() {
            Some(record) if record.state() == ThreadState::Running => {
                let _safe = ThreadStateGuard::enter(&self.safepoint, &record, ThreadState::Safe);
                self.state.lock()
            }
            _ => self.state.lock(),
        };
        HeapGuard(guard)
    }

    /// Runs `f` in the safe state if the caller is attached to this heap.
    pub(crate) fn while_safe<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.safepoint.current() {
            Some(record) => {
                let _safe = ThreadStateGuard::enter(&self.safepoint, &record, ThreadState::Safe);
                f()
            }
            None => f(),
        }
    }

    /// Lock-free check that `obj` points at a live allocation. Never returns
    /// false for a pointer handed out by a finished allocation.
    pub(crate) fn is_valid_object(&self, obj: ObjectRef) -> bool {
        if obj.addr() % OBJECT_ALIGNMENT != 0 {
            return false;
        }
        self.live_bitmaps
            .read()
            .iter()
            .any(|bitmap| bitmap.may_contain(obj.addr()) && bitmap.test(obj))
    }

    fn profiling(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    pub(crate) fn malloc(
        &self,
        mutator: &Mutator,
        size: usize,
        flags: AllocFlags,
    ) -> Result<ObjectRef, HeapError> {
        let profiling = self.profiling();
        let obj = {
            let mut heap = self.lock_heap();
            let obj = self.try_malloc(&mut heap, mutator, size);
            if let Some(obj) = obj {
                let state = &mut *heap;
                if flags.contains(AllocFlags::FINALIZABLE) && !state.finalizable.push(obj) {
                    log::error!("No room for any more finalizable objects");
                    fatal(FatalError::FinalizableTableFull);
                }
                if flags.contains(AllocFlags::NO_GC) && !state.non_collectable.add(obj) {
                    fatal(FatalError::NonCollectableTableFull {
                        entries: state.non_collectable.len(),
                    });
                }
                #[cfg(feature = "object-headers")]
                {
                    let generation = state.generation;
                    state.source.set_birth_generation(obj, generation);
                }
                // Track before dropping the lock so a collection started by
                // another thread can't miss it.
                if !flags.intersects(AllocFlags::NO_GC | AllocFlags::DONT_TRACK) {
                    mutator.add_tracked_alloc(obj);
                }
            }
            if profiling {
                heap.profile.count_alloc(size, obj.is_some());
            }
            obj
        };
        if profiling {
            mutator.update_profile(|p| p.count_alloc(size, obj.is_some()));
        }
        match obj {
            Some(obj) => Ok(obj),
            None => Err(self.throw_out_of_memory(mutator, size)),
        }
    }

    /// Reports an out-of-memory condition to the VM. If that itself runs out
    /// of memory the nested report is replaced by the pre-built error.
    fn throw_out_of_memory(&self, mutator: &Mutator, size: usize) -> HeapError {
        match mutator.oome.get() {
            OomeState::Idle => {
                mutator.oome.set(OomeState::Throwing);
                self.model.throw_out_of_memory(mutator, size);
                let prebuilt = mutator.oome.get() == OomeState::Failed;
                mutator.oome.set(OomeState::Idle);
                HeapError::OutOfMemory { size, prebuilt }
            }
            OomeState::Throwing | OomeState::Failed => {
                mutator.oome.set(OomeState::Failed);
                HeapError::OutOfMemory {
                    size,
                    prebuilt: true,
                }
            }
        }
    }

    fn gc_for_malloc(&self, heap: &mut HeapGuard<'_>, mutator: &Mutator, collect_soft: bool) {
        if self.profiling() {
            heap.profile.gc_count += 1;
            mutator.update_profile(|p| p.gc_count += 1);
        }
        self.collect_locked(heap, mutator, collect_soft);
    }

    fn try_malloc(&self, heap: &mut HeapGuard<'_>, mutator: &Mutator, size: usize) -> Option<ObjectRef> {
        if size >= heap.source.absolute_max_size() {
            log::warn!(
                "malloc({}/{:#x}): someone's allocating a huge buffer",
                size,
                size
            );
            log::error!("Out of memory on a {}-byte allocation.", size);
            return None;
        }

        if let Some(obj) = heap.source.alloc(size) {
            return Some(obj);
        }

        // Free up some space; soft references survive this one.
        self.gc_for_malloc(heap, mutator, false);
        if let Some(obj) = heap.source.alloc(size) {
            return Some(obj);
        }

        // Try harder, growing the heap if necessary.
        let obj = heap.source.alloc_and_grow(size);
        heap_size_changed(heap);
        if obj.is_some() {
            log::info!(
                "Grow heap (frag case) to {} for {}-byte allocation",
                formatted_size(heap.source.ideal_footprint()),
                size
            );
            return obj;
        }

        // All soft references must be cleared before an out-of-memory error
        // can be reported.
        log::info!(
            "Forcing collection of SoftReferences for {}-byte allocation",
            size
        );
        self.gc_for_malloc(heap, mutator, true);
        let obj = heap.source.alloc_and_grow(size);
        heap_size_changed(heap);
        if obj.is_none() {
            log::error!("Out of memory on a {}-byte allocation.", size);
        }
        obj
    }

    /// Runs a full stop-the-world collection. The caller holds the heap lock.
    pub(crate) fn collect_locked(&self, heap: &mut HeapGuard<'_>, mutator: &Mutator, collect_soft: bool) {
        let (state, token) = heap.parts();
        if state.gc_running {
            log::warn!("Attempted recursive GC");
            return;
        }
        state.gc_running = true;
        let start = Instant::now();
        if let Some(last) = state.gc_start_time {
            log::trace!("{}ms since last GC", start.duration_since(last).as_millis());
        }
        state.gc_start_time = Some(start);
        let bytes_before = state.source.value(HeapValue::BytesAllocated);

        log::debug!("GC starting -- suspending threads");
        let suspended = self.safepoint.suspend_all(Some(&*mutator.record));

        // The worker can't be in the middle of a callback once we hold this,
        // since callbacks run with its lock released and its thread is now
        // suspended.
        let mut worker = self.worker.lock(&token);
        assert_worker_running(
            &mut worker,
            self.config.watchdog_timeout,
            self.debugger_active.load(Ordering::Relaxed),
            &*self.model,
        );
        let in_flight = worker.current.map(|call| call.obj);

        let model = &*self.model;
        let policy = if collect_soft {
            SoftRefPolicy::All
        } else {
            state.soft_ref_policy
        };

        let (objects_freed, bytes_freed) = {
            let mut lists = worker.lists();

            // A reference stays scheduled while its work is queued or running.
            // Enqueued phantom references also keep their referent until it
            // is cleared.
            let queued: HashSet<ObjectRef> = lists.reference_ops.iter().map(|&(r, _)| r).collect();
            state.scheduled_refs.retain(|&r| {
                model.referent(r).is_some()
                    && (queued.contains(&r)
                        || in_flight == Some(r)
                        || model.reference_kind(r) == Some(ReferenceKind::Phantom))
            });

            let mut ctx = MarkContext::begin_mark_step(model, &state.source);

            log::debug!("Marking...");
            ctx.mark_root_set(
                &self.roots,
                &self.safepoint,
                &state.non_collectable,
                &lists,
                in_flight,
            );

            let WorkerLists {
                pending_finalization,
                reference_ops,
            } = &mut *lists;

            ctx.set_defer_soft_references(policy != SoftRefPolicy::None);
            log::debug!("Recursing...");
            ctx.scan_marked_objects(&state.scheduled_refs);
            let refs = ctx.latch_references();

            if policy != SoftRefPolicy::None {
                log::debug!("Handling soft references...");
                ctx.handle_references(
                    refs.soft,
                    ReferenceKind::Soft,
                    policy,
                    &mut state.soft_ref_color,
                    reference_ops,
                    &mut state.scheduled_refs,
                );
                // One attempt is enough; later collections preserve soft
                // references again until the heap grows some more.
                state.soft_ref_policy = SoftRefPolicy::None;
            }
            log::debug!("Handling weak references...");
            ctx.handle_references(
                refs.weak,
                ReferenceKind::Weak,
                policy,
                &mut state.soft_ref_color,
                reference_ops,
                &mut state.scheduled_refs,
            );

            log::debug!("Finding finalizations...");
            ctx.schedule_finalizations(
                &mut state.finalizable,
                pending_finalization,
                &state.scheduled_refs,
            );

            log::debug!("Handling phantom references...");
            ctx.handle_references(
                refs.phantom,
                ReferenceKind::Phantom,
                policy,
                &mut state.soft_ref_color,
                reference_ops,
                &mut state.scheduled_refs,
            );

            log::debug!("Sweeping...");
            let freed = ctx.sweep_unmarked_objects(&mut state.source, &mut state.scheduled_refs);
            ctx.finish_mark_step();
            freed
        };

        // Now's a good time to adjust the heap size.
        state.source.grow_for_utilization();
        heap_size_changed(state);
        state.generation = state.generation.wrapping_add(1);

        // Replaces any trim already pending and wakes the worker for the
        // work scheduled above.
        worker.schedule_trim(self.config.trim_delay);
        drop(worker);

        log::debug!("GC finished -- resuming threads");
        drop(suspended);

        let pause = start.elapsed();
        state.gc_running = false;
        state.gc_count += 1;
        state.total_objects_freed += objects_freed;
        state.total_bytes_freed += bytes_freed;
        state.last_gc_pause = pause;

        if pause.as_secs() >= 10 {
            log::debug!(
                "GC freed {} objects / {} bytes in {} sec",
                objects_freed,
                bytes_freed,
                pause.as_secs()
            );
        } else {
            log::debug!(
                "GC freed {} objects / {} bytes in {}ms",
                objects_freed,
                bytes_freed,
                pause.as_millis()
            );
        }
        if self.config.verbose {
            log::info!(
                "[gc] GC({}) Pause MarkSweep {}->{}({}) {:.3}ms",
                state.gc_count,
                formatted_size(bytes_before),
                formatted_size(state.source.value(HeapValue::BytesAllocated)),
                formatted_size(state.source.ideal_footprint()),
                pause.as_micros() as f64 / 1000.0
            );
        }
    }

    pub(crate) fn track_external_allocation(&self, mutator: &Mutator, n: usize) -> Result<(), HeapError> {
        let result = {
            let mut heap = self.lock_heap();
            let result = self.track_external_locked(&mut heap, mutator, n);
            if self.profiling() {
                heap.profile.count_external(n, result.is_ok());
            }
            result
        };
        if self.profiling() {
            mutator.update_profile(|p| p.count_external(n, result.is_ok()));
        }
        result
    }

    fn track_external_locked(
        &self,
        heap: &mut HeapGuard<'_>,
        mutator: &Mutator,
        n: usize,
    ) -> Result<(), HeapError> {
        if !heap.source.external_alloc_possible(n) {
            // The active arena may be pinned at a large footprint by an old
            // soft limit. Collect and give the pages back before deciding.
            self.gc_for_malloc(heap, mutator, false);
            heap.source.shrink_to_ideal();
            if !heap.source.external_alloc_possible(n) {
                log::error!("{}-byte external allocation too large for this process.", n);
                return Err(HeapError::ExternalAllocationTooLarge { size: n });
            }
        }

        // Try "allocating" using the existing free space.
        log::trace!(
            "EXTERNAL alloc {} ({} < {})",
            n,
            heap.source.external_bytes_allocated(),
            heap.source.external_limit()
        );
        if heap.source.external_alloc(n, false) {
            return Ok(());
        }

        self.gc_for_malloc(heap, mutator, false);
        if heap.source.external_alloc(n, false) {
            return Ok(());
        }

        // Even that didn't work; grow the limit.
        let ok = heap.source.external_alloc(n, true);
        heap_size_changed(heap);
        if ok {
            return Ok(());
        }

        log::info!(
            "Forcing collection of SoftReferences for {}-byte external allocation",
            n
        );
        self.gc_for_malloc(heap, mutator, true);
        let ok = heap.source.external_alloc(n, true);
        heap_size_changed(heap);
        if ok {
            return Ok(());
        }
        log::error!("Out of external memory on a {}-byte allocation.", n);
        Err(HeapError::ExternalOutOfMemory { size: n })
    }

    pub(crate) fn track_external_free(&self, n: usize) {
        let mut heap = self.lock_heap();
        log::trace!(
            "EXTERNAL free {} ({} < {})",
            n,
            heap.source.external_bytes_allocated(),
            heap.source.external_limit()
        );
        heap.source.external_free(n);
    }

    pub(crate) fn clear_alloc_flags(&self, mutator: &Mutator, obj: ObjectRef, mask: AllocFlags) {
        if mask.contains(AllocFlags::NO_GC) {
            let mut heap = self.lock_heap();
            if !heap.non_collectable.remove(obj) && heap.source.contains(obj) {
                drop(heap);
                fatal(FatalError::MissingNonCollectableEntry { addr: obj.addr() });
            }
        }
        if mask.contains(AllocFlags::DONT_TRACK) {
            mutator.release_tracked_alloc(obj);
        }
    }

    pub(crate) fn run_finalization_sync(&self, mutator: &Mutator) {
        heap_worker::run_finalization_sync(self, mutator)
    }
}

/// Re-evaluates the soft reference policy after the ideal footprint moved.
/// Growing past the threshold starts clearing some soft references;
/// shrinking well below it stops.
fn heap_size_changed(state: &mut HeapState) {
    let current = state.source.ideal_footprint();
    if current + 4 * SOFT_REFERENCE_GROWTH_SLACK <= state.soft_ref_threshold {
        state.soft_ref_threshold = current;
        state.soft_ref_policy = SoftRefPolicy::None;
        log::trace!("Soft references will be preserved ({})", formatted_size(current));
    } else if current >= state.soft_ref_threshold + SOFT_REFERENCE_GROWTH_SLACK {
        state.soft_ref_threshold = current;
        state.soft_ref_policy = SoftRefPolicy::Some;
        log::trace!("Soft references will be partially cleared ({})", formatted_size(current));
    }
}

/// A managed heap. Dropping it shuts down the heap worker and releases every
/// arena.
pub struct Heap {
    inner: Arc<GcHeap>,
}

impl Heap {
    pub fn new(config: Config, model: impl ObjectModel) -> Result<Heap, HeapError> {
        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        let mut source = HeapSource::startup(config.start_size, config.maximum_size, config.zygote)?;
        source.set_target_utilization(config.target_utilization);
        let live_bitmaps = source.shared_bitmaps();
        let state = HeapState {
            source,
            finalizable: LargeHeapRefTable::with_capacity(FINALIZABLE_TABLE_DEFAULT),
            non_collectable: HeapRefTable::with_capacity(NON_COLLECTABLE_TABLE_DEFAULT),
            soft_ref_policy: SoftRefPolicy::None,
            soft_ref_threshold: config.start_size,
            soft_ref_color: 0,
            scheduled_refs: HashSet::new(),
            gc_running: false,
            gc_start_time: None,
            generation: 0,
            gc_count: 0,
            total_objects_freed: 0,
            total_bytes_freed: 0,
            last_gc_pause: Duration::ZERO,
            profile: AllocProfile::default(),
        };
        let inner = Arc::new(GcHeap {
            id,
            profiling: AtomicBool::new(config.profile_allocations),
            config,
            model: Box::new(model),
            state: Mutex::new(state),
            worker: WorkerLock::new(),
            safepoint: GlobalSafepoint::new(id),
            roots: RootSet::new(),
            live_bitmaps,
            debugger_active: AtomicBool::new(false),
        });
        if !inner.config.zygote && inner.config.start_worker {
            heap_worker::start(&inner)?;
        }
        log::debug!(
            "Heap {} started (start {}, max {})",
            inner.id,
            formatted_size(inner.config.start_size),
            formatted_size(inner.config.maximum_size)
        );
        Ok(Heap { inner })
    }

    /// Attaches the calling thread. Attaching a thread twice is fatal.
    pub fn attach_current_thread(&self, name: &str) -> Mutator {
        Mutator::attach(self.inner.clone(), name)
    }

    pub fn add_root_provider(&self, provider: impl RootProvider + 'static) {
        self.inner.roots.add(provider);
    }

    pub fn is_valid_object(&self, obj: ObjectRef) -> bool {
        self.inner.is_valid_object(obj)
    }

    /// Usable bytes of the chunk holding `obj`, 0 for anything the heap
    /// doesn't own.
    pub fn object_size_in_heap(&self, obj: ObjectRef) -> usize {
        self.inner.lock_heap().source.chunk_size(obj)
    }

    pub fn ideal_footprint(&self) -> usize {
        self.inner.lock_heap().source.ideal_footprint()
    }

    pub fn value(&self, which: HeapValue) -> usize {
        self.inner.lock_heap().source.value(which)
    }

    pub fn per_arena_values(&self, which: HeapValue) -> Vec<usize> {
        self.inner.lock_heap().source.per_arena_values(which)
    }

    pub fn statistics(&self) -> HeapStatistics {
        let heap = self.inner.lock_heap();
        let source = &heap.source;
        HeapStatistics {
            arenas: source
                .arenas()
                .iter()
                .map(|arena| ArenaStatistics {
                    name: arena.name().to_string(),
                    footprint: arena.footprint(),
                    allowed_footprint: arena.allowed_footprint(),
                    bytes_allocated: arena.bytes_allocated(),
                    objects_allocated: arena.objects_allocated(),
                    bitmap_size: arena.bitmap().size(),
                })
                .collect(),
            ideal_size: source.ideal_footprint(),
            soft_limit: source.soft_limit(),
            minimum_size: source.minimum_size(),
            absolute_max_size: source.absolute_max_size(),
            target_utilization: source.target_utilization(),
            external_bytes_allocated: source.external_bytes_allocated(),
            external_limit: source.external_limit(),
            total_gc_cycles_count: heap.gc_count,
            total_objects_freed: heap.total_objects_freed,
            total_bytes_freed: heap.total_bytes_freed,
            last_gc_pause: heap.last_gc_pause,
        }
    }

    /// Visits every chunk, oldest arena first, with the heap locked.
    pub fn walk(&self, callback: impl FnMut(*const u8, usize, bool)) {
        self.inner.lock_heap().source.walk(callback)
    }

    pub fn object_bitmaps(&self) -> Vec<Arc<ObjectBitmap>> {
        self.inner.lock_heap().source.object_bitmaps()
    }

    pub fn replace_object_bitmaps(&self, bitmaps: &mut [Arc<ObjectBitmap>]) -> bool {
        self.inner.lock_heap().source.replace_object_bitmaps(bitmaps)
    }

    pub fn target_utilization(&self) -> f32 {
        self.inner.lock_heap().source.target_utilization()
    }

    pub fn set_target_utilization(&self, target: f32) {
        self.inner.lock_heap().source.set_target_utilization(target)
    }

    pub fn minimum_heap_size(&self) -> usize {
        self.inner.lock_heap().source.minimum_size()
    }

    /// Returns the previous minimum.
    pub fn set_minimum_heap_size(&self, size: usize) -> usize {
        let mut heap = self.inner.lock_heap();
        let old = heap.source.set_minimum_size(size);
        heap_size_changed(&mut heap);
        old
    }

    pub fn trim(&self) -> TrimStats {
        let stats = self.inner.lock_heap().source.trim();
        log::debug!(
            "madvised {} bytes (GC); native heap released memory: {}",
            stats.heap_bytes(),
            stats.native_released
        );
        stats
    }

    /// Asks the heap worker to trim after `delay`. Zero cancels a pending trim.
    pub fn schedule_trim(&self, delay: Duration) {
        heap_worker::schedule_trim(&self.inner, delay)
    }

    /// While set, a worker callback running past the watchdog timeout is
    /// tolerated. Either way the watchdog clock restarts.
    pub fn set_debugger_active(&self, active: bool) {
        self.inner.debugger_active.store(active, Ordering::Relaxed);
        heap_worker::reset_watchdog(&self.inner);
    }

    pub fn signal_worker(&self) {
        heap_worker::signal_worker(&self.inner)
    }

    pub fn wait_for_worker_idle(&self) {
        heap_worker::wait_for_worker_idle(&self.inner)
    }

    /// Pending finalizations and pending reference operations.
    pub fn pending_work(&self) -> (usize, usize) {
        heap_worker::pending_work(&self.inner)
    }

    /// Zygote mode only: split off a fresh arena before the first fork.
    /// Returns false if the split already happened.
    pub fn startup_before_fork(&self) -> Result<bool, HeapError> {
        self.inner.lock_heap().source.startup_before_fork()
    }

    /// Leaves zygote mode: moves allocation to a new arena and starts the
    /// heap worker.
    pub fn startup_after_zygote(&self) -> Result<(), HeapError> {
        {
            let mut heap = self.inner.lock_heap();
            heap.gc_start_time = None;
            heap.source.startup_after_zygote()?;
        }
        if self.inner.config.start_worker {
            heap_worker::start(&self.inner)?;
        }
        Ok(())
    }

    pub fn is_allocated_in_zygote(&self, obj: ObjectRef) -> bool {
        self.inner.lock_heap().source.is_allocated_in_zygote(obj)
    }

    /// Generation `obj` was allocated in. Only recorded with the
    /// `object-headers` feature.
    pub fn birth_generation(&self, obj: ObjectRef) -> Option<u32> {
        self.inner.lock_heap().source.birth_generation(obj)
    }

    pub fn set_alloc_profiling(&self, enabled: bool) {
        self.inner.profiling.store(enabled, Ordering::Relaxed);
    }

    pub fn alloc_profile(&self) -> AllocProfile {
        self.inner.lock_heap().profile
    }

    pub fn shutdown(&self) {
        heap_worker::shutdown(&self.inner);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.shutdown();
    }
}

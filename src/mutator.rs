use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::HeapError;
use crate::heap::GcHeap;
use crate::object::ObjectRef;
use crate::safepoint::{ThreadRecord, ThreadState, ThreadStateGuard};
use crate::statistics::AllocProfile;
use crate::AllocFlags;

/// Progress of an out-of-memory report on this thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OomeState {
    Idle,
    Throwing,
    /// Reporting ran out of memory itself; the pre-built error must be used.
    Failed,
}

/// A thread attached to the heap.
///
/// Every thread that reads or writes heap objects needs one, and must call
/// [`Mutator::safepoint`] regularly while running so that collections can
/// suspend it. Dropping the mutator detaches the thread; allocations it was
/// still tracking lose that protection.
pub struct Mutator {
    pub(crate) heap: Arc<GcHeap>,
    pub(crate) record: Arc<ThreadRecord>,
    pub(crate) oome: Cell<OomeState>,
    pub(crate) profile: Cell<AllocProfile>,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    pub(crate) fn attach(heap: Arc<GcHeap>, name: &str) -> Self {
        let record = heap.safepoint.register(name);
        Self {
            heap,
            record,
            oome: Cell::new(OomeState::Idle),
            profile: Cell::new(AllocProfile::default()),
            _not_send: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn state(&self) -> ThreadState {
        self.record.state()
    }

    /// Parks the thread if a collection is waiting for it. Returns true if it
    /// had to stop.
    #[inline(always)]
    pub fn safepoint(&self) -> bool {
        if self.heap.safepoint.is_requested() {
            self.safepoint_slow();
            return true;
        }
        false
    }

    #[inline(never)]
    #[cold]
    fn safepoint_slow(&self) {
        if self.record.state() == ThreadState::Running {
            self.heap.safepoint.park(&self.record);
        }
    }

    /// Declares that the thread will not touch heap objects until the guard
    /// is dropped, e.g. around blocking I/O.
    pub fn enter_safe(&self) -> ThreadStateGuard<'_> {
        ThreadStateGuard::enter(&self.heap.safepoint, &self.record, ThreadState::Safe)
    }

    /// Reverse of [`Mutator::enter_safe`]; blocks while a collection is running.
    pub fn enter_unsafe(&self) -> ThreadStateGuard<'_> {
        ThreadStateGuard::enter(&self.heap.safepoint, &self.record, ThreadState::Running)
    }

    /// Allocates `size` zeroed bytes, collecting and growing the heap as
    /// needed. Unless `flags` says otherwise the object is tracked by this
    /// thread until [`Mutator::release_tracked_alloc`].
    pub fn allocate(&self, size: usize, flags: AllocFlags) -> Result<ObjectRef, HeapError> {
        self.heap.malloc(self, size, flags)
    }

    /// Runs a full collection on this thread.
    pub fn collect(&self, collect_soft_references: bool) {
        let mut heap = self.heap.lock_heap();
        self.heap.collect_locked(&mut heap, self, collect_soft_references);
    }

    /// Charges `n` bytes of native memory against the heap. May collect.
    pub fn track_external_allocation(&self, n: usize) -> Result<(), HeapError> {
        self.heap.track_external_allocation(self, n)
    }

    pub fn track_external_free(&self, n: usize) {
        self.heap.track_external_free(n)
    }

    /// Blocks until every finalizer and reference operation pending right
    /// now has run.
    pub fn run_finalization_sync(&self) {
        self.heap.run_finalization_sync(self)
    }

    /// Keeps `obj` alive until a matching [`Mutator::release_tracked_alloc`].
    pub fn add_tracked_alloc(&self, obj: ObjectRef) {
        self.record.add_tracked(obj);
    }

    pub fn release_tracked_alloc(&self, obj: ObjectRef) -> bool {
        self.record.release_tracked(obj)
    }

    pub fn tracked_alloc_count(&self) -> usize {
        self.record.tracked_count()
    }

    /// Drops the `NO_GC` and/or `DONT_TRACK` state of an allocation. Only
    /// those two flags are meaningful here.
    pub fn clear_alloc_flags(&self, obj: ObjectRef, mask: AllocFlags) {
        self.heap.clear_alloc_flags(self, obj, mask)
    }

    /// Allocation counters of this thread; all zero unless profiling is on.
    pub fn alloc_profile(&self) -> AllocProfile {
        self.profile.get()
    }

    pub(crate) fn update_profile(&self, f: impl FnOnce(&mut AllocProfile)) {
        let mut profile = self.profile.get();
        f(&mut profile);
        self.profile.set(profile);
    }

    pub fn is_valid_object(&self, obj: ObjectRef) -> bool {
        self.heap.is_valid_object(obj)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.heap.safepoint.unregister(&self.record);
    }
}

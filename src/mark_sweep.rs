//! The tracing half of a collection: marks everything reachable from the
//! roots into per-arena mark bitmaps, sorts reference objects out as it goes,
//! then frees whatever the live bitmaps hold that the mark bitmaps don't.

use std::collections::HashSet;
use std::sync::Arc;

use memmap2::MmapMut;

use crate::bitmap::ObjectBitmap;
use crate::error::{fatal, FatalError};
use crate::globals::MIN_CHUNK_SIZE;
use crate::heap_source::HeapSource;
use crate::heap_worker::WorkerLists;
use crate::object::{ObjectModel, ObjectRef, ReferenceKind};
use crate::ref_table::{HeapRefTable, LargeHeapRefTable, ReferenceOpTable, ReferenceOps};
use crate::roots::RootSet;
use crate::safepoint::GlobalSafepoint;

/// How soft references are treated by the next collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftRefPolicy {
    /// Soft referents are strongly reachable.
    None,
    /// Every other otherwise-unreachable soft referent is cleared.
    Some,
    /// Every otherwise-unreachable soft referent is cleared.
    All,
}

/// Grey objects waiting to be scanned. Grows downward from the top of its
/// reservation.
pub struct MarkStack {
    _map: MmapMut,
    base: *mut ObjectRef,
    capacity: usize,
    top: usize,
}

impl MarkStack {
    pub fn new(capacity: usize) -> Result<Self, FatalError> {
        let bytes = capacity.max(1) * std::mem::size_of::<ObjectRef>();
        let mut map = MmapMut::map_anon(bytes)
            .map_err(|e| FatalError::MarkSetupFailed(format!("mark stack: {}", e)))?;
        let base = map.as_mut_ptr().cast::<ObjectRef>();
        Ok(Self {
            _map: map,
            base,
            capacity,
            top: capacity,
        })
    }

    #[inline]
    pub fn push(&mut self, obj: ObjectRef) {
        if self.top == 0 {
            fatal(FatalError::MarkStackOverflow {
                capacity: self.capacity,
            });
        }
        self.top -= 1;
        unsafe { self.base.add(self.top).write(obj) }
    }

    #[inline]
    pub fn pop(&mut self) -> Option<ObjectRef> {
        if self.top == self.capacity {
            return None;
        }
        let obj = unsafe { self.base.add(self.top).read() };
        self.top += 1;
        Some(obj)
    }

    pub fn len(&self) -> usize {
        self.capacity - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.top == self.capacity
    }
}

/// Reference objects found by a scan whose referents were not yet known to
/// be strongly reachable.
#[derive(Debug, Default)]
pub struct ReferenceLists {
    pub soft: Vec<ObjectRef>,
    pub weak: Vec<ObjectRef>,
    pub phantom: Vec<ObjectRef>,
}

pub struct MarkContext<'a> {
    model: &'a dyn ObjectModel,
    live: Vec<Arc<ObjectBitmap>>,
    marks: Vec<ObjectBitmap>,
    stack: MarkStack,
    defer_soft: bool,
    mark_all_referents: bool,
    refs: ReferenceLists,
    marked: usize,
}

impl<'a> MarkContext<'a> {
    /// Allocates a mark bitmap per arena and a mark stack large enough for
    /// every object the heap could hold.
    pub fn begin_mark_step(model: &'a dyn ObjectModel, source: &HeapSource) -> Self {
        let live = source.object_bitmaps();
        let mut marks = Vec::with_capacity(live.len());
        for bitmap in &live {
            let mark = ObjectBitmap::create(
                "mark",
                bitmap.heap_begin() as *const u8,
                bitmap.heap_limit() - bitmap.heap_begin(),
            )
            .unwrap_or_else(|e| fatal(FatalError::MarkSetupFailed(e.to_string())));
            marks.push(mark);
        }
        let stack = MarkStack::new(source.absolute_max_size() / MIN_CHUNK_SIZE)
            .unwrap_or_else(|e| fatal(e));
        Self {
            model,
            live,
            marks,
            stack,
            defer_soft: false,
            mark_all_referents: false,
            refs: ReferenceLists::default(),
            marked: 0,
        }
    }

    /// Marks `obj` and queues it for scanning if it is a live heap object
    /// that was not marked yet. Anything else is ignored.
    #[inline]
    pub fn mark(&mut self, obj: ObjectRef) {
        for (live, mark) in self.live.iter().zip(self.marks.iter()) {
            if live.may_contain(obj.addr()) {
                if live.test(obj) && !mark.set(obj) {
                    self.marked += 1;
                    self.stack.push(obj);
                }
                return;
            }
        }
    }

    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        self.marks.iter().any(|mark| mark.test(obj))
    }

    pub fn marked_count(&self) -> usize {
        self.marked
    }

    /// Marks everything referenced from outside the heap: registered root
    /// providers, every thread's tracked allocations, non-collectable
    /// objects, and objects waiting on the heap worker.
    pub fn mark_root_set(
        &mut self,
        roots: &RootSet,
        threads: &GlobalSafepoint,
        non_collectable: &HeapRefTable,
        lists: &WorkerLists,
        in_flight: Option<ObjectRef>,
    ) {
        let mut visitor = |obj: ObjectRef| self.mark(obj);
        roots.visit(&mut visitor);
        threads.visit_tracked(&mut visitor);
        non_collectable.visit(&mut visitor);
        for &obj in lists.pending_finalization.iter() {
            visitor(obj);
        }
        for &(obj, _) in lists.reference_ops.iter() {
            visitor(obj);
        }
        if let Some(obj) = in_flight {
            visitor(obj);
        }
        log::trace!("Marked {} objects from roots", self.marked);
    }

    /// Soft referents are only traced strongly when `defer` is false.
    pub fn set_defer_soft_references(&mut self, defer: bool) {
        self.defer_soft = defer;
    }

    /// Drains the mark stack, collecting reference objects into the
    /// soft/weak/phantom lists instead of following their referents.
    pub fn scan_marked_objects(&mut self, scheduled: &HashSet<ObjectRef>) {
        let model = self.model;
        while let Some(obj) = self.stack.pop() {
            model.trace(obj, &mut |child: ObjectRef| self.mark(child));
            let Some(kind) = model.reference_kind(obj) else {
                continue;
            };
            let Some(referent) = model.referent(obj) else {
                continue;
            };
            if self.mark_all_referents || scheduled.contains(&obj) {
                self.mark(referent);
                continue;
            }
            match kind {
                ReferenceKind::Soft if !self.defer_soft => self.mark(referent),
                ReferenceKind::Soft => self.refs.soft.push(obj),
                ReferenceKind::Weak => self.refs.weak.push(obj),
                ReferenceKind::Phantom => self.refs.phantom.push(obj),
            }
        }
    }

    /// Takes the reference lists built so far. From here on every referent
    /// reached by a scan is marked strongly.
    pub fn latch_references(&mut self) -> ReferenceLists {
        self.mark_all_referents = true;
        std::mem::take(&mut self.refs)
    }

    /// Clears or preserves the referents of `list`, scheduling `clear()` and
    /// `enqueue()` calls on the heap worker. Referents that are still marked
    /// are left alone.
    pub fn handle_references(
        &mut self,
        list: Vec<ObjectRef>,
        kind: ReferenceKind,
        policy: SoftRefPolicy,
        color: &mut usize,
        ops: &mut ReferenceOpTable,
        scheduled: &mut HashSet<ObjectRef>,
    ) {
        let model = self.model;
        let mut cleared = 0;
        for reference in list {
            let Some(referent) = model.referent(reference) else {
                continue;
            };
            if self.is_marked(referent) {
                continue;
            }
            if kind == ReferenceKind::Soft && policy == SoftRefPolicy::Some {
                *color += 1;
                if *color & 1 == 1 {
                    self.mark(referent);
                    continue;
                }
            }
            let has_queue = model.has_queue(reference);
            let work = match kind {
                ReferenceKind::Soft | ReferenceKind::Weak => {
                    let clear = model.overrides_clear(reference);
                    if clear {
                        // clear() must still see the referent.
                        self.mark(referent);
                    } else {
                        model.clear_referent(reference);
                    }
                    ReferenceOps {
                        clear,
                        enqueue: has_queue,
                    }
                }
                ReferenceKind::Phantom => {
                    if has_queue {
                        self.mark(referent);
                    } else {
                        model.clear_referent(reference);
                    }
                    ReferenceOps {
                        clear: false,
                        enqueue: has_queue,
                    }
                }
            };
            cleared += 1;
            if !work.is_empty() {
                if !ops.push((reference, work)) {
                    fatal(FatalError::ReferenceTableFull);
                }
                scheduled.insert(reference);
            }
        }
        log::trace!("Handled {} {:?} references", cleared, kind);
        self.scan_marked_objects(scheduled);
    }

    /// Moves every unmarked finalizable object to the pending-finalization
    /// table and marks it, keeping it and everything it references alive
    /// until `finalize()` has run.
    pub fn schedule_finalizations(
        &mut self,
        finalizable: &mut LargeHeapRefTable,
        pending: &mut LargeHeapRefTable,
        scheduled: &HashSet<ObjectRef>,
    ) -> usize {
        let newly_pending = finalizable.take_where(|&obj| !self.is_marked(obj));
        for &obj in &newly_pending {
            if !pending.push(obj) {
                fatal(FatalError::FinalizableTableFull);
            }
            self.mark(obj);
        }
        self.scan_marked_objects(scheduled);
        if !newly_pending.is_empty() {
            log::debug!("Scheduled {} finalizations", newly_pending.len());
        }
        newly_pending.len()
    }

    /// Frees every allocation that is live but unmarked. Returns the number
    /// of objects and bytes freed.
    pub fn sweep_unmarked_objects(
        &mut self,
        source: &mut HeapSource,
        scheduled: &mut HashSet<ObjectRef>,
    ) -> (usize, usize) {
        let mut objects = 0;
        let mut bytes = 0;
        for (live, mark) in self.live.iter().zip(self.marks.iter()) {
            ObjectBitmap::sweep_walk(live, mark, |obj| {
                bytes += source.free(obj);
                objects += 1;
                scheduled.remove(&obj);
            });
        }
        (objects, bytes)
    }

    pub fn finish_mark_step(self) {
        debug_assert!(self.stack.is_empty());
        log::trace!("Mark step done, {} objects marked", self.marked);
    }
}

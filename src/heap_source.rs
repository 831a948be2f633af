//! Arenas and footprint control.
//!
//! The heap source presents a single logical heap made of up to
//! [`MAX_ARENA_COUNT`] arenas. Only the active arena (index 0) serves
//! allocations; older arenas are frozen snapshots split off around a fork.
//! Shrinking is simulated with a soft limit on the active arena, since chunks
//! are never relocated.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::bitmap::ObjectBitmap;
use crate::error::{fatal, FatalError, HeapError};
use crate::globals::*;
use crate::mspace::Mspace;
use crate::object::ObjectRef;
use crate::statistics::{formatted_size, TrimStats};

/// Values that can be queried across all arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapValue {
    Footprint,
    AllowedFootprint,
    BytesAllocated,
    ObjectsAllocated,
    ExternalBytesAllocated,
    ExternalLimit,
}

/// The live-object bitmaps of every arena, shared with readers that check
/// pointer validity without taking the heap lock.
pub type SharedBitmaps = Arc<RwLock<Vec<Arc<ObjectBitmap>>>>;

pub struct Arena {
    space: Mspace,
    bitmap: Arc<ObjectBitmap>,
    absolute_max_size: usize,
    /// Heuristic; includes per-chunk overhead.
    bytes_allocated: usize,
    objects_allocated: usize,
}

impl Arena {
    fn new(id: usize, start_size: usize, absolute_max_size: usize) -> Result<Self, HeapError> {
        let name = if id == 0 {
            "sable-heap".to_string()
        } else {
            format!("sable-heap/{}", id)
        };
        let space = Mspace::new(name, start_size, absolute_max_size)?;
        let bitmap = ObjectBitmap::create("objects", space.base(), space.capacity())?;
        log::trace!(
            "{}: {} bitmap of {} covering {}",
            space.name(),
            bitmap.name(),
            formatted_size(bitmap.size()),
            formatted_size(space.capacity())
        );
        Ok(Self {
            space,
            bitmap: Arc::new(bitmap),
            absolute_max_size,
            bytes_allocated: 0,
            objects_allocated: 0,
        })
    }

    pub fn name(&self) -> &str {
        self.space.name()
    }
    pub fn footprint(&self) -> usize {
        self.space.footprint()
    }
    pub fn allowed_footprint(&self) -> usize {
        self.space.max_allowed_footprint()
    }
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }
    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated
    }
    pub fn absolute_max_size(&self) -> usize {
        self.absolute_max_size
    }
    pub fn bitmap(&self) -> &Arc<ObjectBitmap> {
        &self.bitmap
    }

    fn may_contain(&self, obj: ObjectRef) -> bool {
        self.bitmap.may_contain(obj.addr())
    }

    fn count_allocation(&mut self, obj: ObjectRef) {
        let usable = self.space.usable_size(obj).unwrap_or(0);
        self.bytes_allocated += usable + CHUNK_OVERHEAD;
        self.objects_allocated += 1;
        self.bitmap.set(obj);
        debug_assert!(self.space.footprint() <= self.space.max_allowed_footprint());
    }

    fn count_free(&mut self, obj: ObjectRef) -> usize {
        let delta = self.space.usable_size(obj).unwrap_or(0) + CHUNK_OVERHEAD;
        self.bytes_allocated = self.bytes_allocated.saturating_sub(delta);
        self.bitmap.clear(obj);
        self.objects_allocated = self.objects_allocated.saturating_sub(1);
        delta
    }

    fn value(&self, which: HeapValue) -> usize {
        match which {
            HeapValue::Footprint => self.footprint(),
            HeapValue::AllowedFootprint => self.allowed_footprint(),
            HeapValue::BytesAllocated => self.bytes_allocated,
            HeapValue::ObjectsAllocated => self.objects_allocated,
            HeapValue::ExternalBytesAllocated | HeapValue::ExternalLimit => 0,
        }
    }
}

/// Given the size of a live set, returns the ideal heap size for the
/// utilization ratio `target_utilization / HEAP_UTILIZATION_MAX`, keeping the
/// resulting free space within `[HEAP_MIN_FREE, HEAP_IDEAL_FREE]`.
pub fn utilization_target(live_size: usize, target_utilization: usize) -> usize {
    let target = (live_size / target_utilization) * HEAP_UTILIZATION_MAX;
    if target > live_size + HEAP_IDEAL_FREE {
        live_size + HEAP_IDEAL_FREE
    } else if target < live_size + HEAP_MIN_FREE {
        live_size + HEAP_MIN_FREE
    } else {
        target
    }
}

pub struct HeapSource {
    /// Index 0 is the active arena.
    arenas: Vec<Arena>,
    target_utilization: usize,
    minimum_size: usize,
    start_size: usize,
    absolute_max_size: usize,
    ideal_size: usize,
    /// `usize::MAX` when no soft limit is in effect.
    soft_limit: usize,
    external_bytes_allocated: usize,
    external_limit: usize,
    saw_zygote: bool,
    zygote_arena_split: bool,
    shared_bitmaps: SharedBitmaps,
}

impl HeapSource {
    pub fn startup(start_size: usize, absolute_max_size: usize, zygote: bool) -> Result<Self, HeapError> {
        if start_size > absolute_max_size {
            log::error!(
                "Bad heap parameters (start={}, max={})",
                start_size,
                absolute_max_size
            );
            return Err(HeapError::BadHeapParameters {
                start: start_size,
                max: absolute_max_size,
            });
        }
        let arena = Arena::new(0, start_size, absolute_max_size)?;
        let mut source = Self {
            arenas: Vec::with_capacity(MAX_ARENA_COUNT),
            target_utilization: DEFAULT_HEAP_UTILIZATION,
            minimum_size: 0,
            start_size,
            absolute_max_size,
            ideal_size: start_size,
            soft_limit: usize::MAX,
            external_bytes_allocated: 0,
            external_limit: 0,
            saw_zygote: zygote,
            zygote_arena_split: false,
            shared_bitmaps: Arc::new(RwLock::new(Vec::with_capacity(MAX_ARENA_COUNT))),
        };
        source.push_arena(arena);
        Ok(source)
    }

    pub fn shared_bitmaps(&self) -> SharedBitmaps {
        self.shared_bitmaps.clone()
    }

    fn publish_bitmaps(&self) {
        *self.shared_bitmaps.write() = self.arenas.iter().map(|a| a.bitmap.clone()).collect();
    }

    fn push_arena(&mut self, arena: Arena) {
        if let Some(old) = self.arenas.first_mut() {
            // Don't let the soon-to-be-old arena grow any further.
            let footprint = old.space.footprint();
            old.space.set_max_allowed_footprint(footprint);
        }
        self.arenas.insert(0, arena);
        self.publish_bitmaps();
    }

    /// Freezes the active arena at its current footprint and starts a new one
    /// in front of it, sized to what is left under the absolute maximum.
    pub fn add_arena(&mut self) -> Result<(), HeapError> {
        if self.arenas.len() >= MAX_ARENA_COUNT {
            fatal(FatalError::TooManyArenas {
                count: self.arenas.len(),
                max: MAX_ARENA_COUNT,
            });
        }
        let overhead = self.old_arena_overhead(true);
        if overhead + HEAP_MIN_FREE >= self.absolute_max_size {
            log::error!(
                "No room to create any more arenas ({} overhead, {} max)",
                overhead,
                self.absolute_max_size
            );
            return Err(HeapError::NoRoomForArena {
                overhead,
                max: self.absolute_max_size,
            });
        }
        let arena = Arena::new(
            self.arenas.len(),
            HEAP_MIN_FREE,
            self.absolute_max_size - overhead,
        )?;
        self.push_arena(arena);
        Ok(())
    }

    /// Called in zygote mode right before the first fork. Splits off a new
    /// arena for post-fork zygote allocations; only ever tried once, even if
    /// it fails.
    pub fn startup_before_fork(&mut self) -> Result<bool, HeapError> {
        if self.zygote_arena_split {
            return Ok(false);
        }
        log::info!("Splitting out new zygote heap");
        self.zygote_arena_split = true;
        self.add_arena()?;
        Ok(true)
    }

    /// Called in a child once it leaves zygote mode. Allocations from here on
    /// go to a fresh arena, keeping the zygote's pages shared.
    pub fn startup_after_zygote(&mut self) -> Result<bool, HeapError> {
        if self.saw_zygote {
            self.add_arena()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }
    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }
    pub fn active(&self) -> &Arena {
        &self.arenas[0]
    }
    pub fn start_size(&self) -> usize {
        self.start_size
    }
    pub fn absolute_max_size(&self) -> usize {
        self.absolute_max_size
    }

    pub fn value(&self, which: HeapValue) -> usize {
        match which {
            HeapValue::ExternalBytesAllocated => self.external_bytes_allocated,
            HeapValue::ExternalLimit => self.external_limit,
            _ => self.arenas.iter().map(|a| a.value(which)).sum(),
        }
    }

    pub fn per_arena_values(&self, which: HeapValue) -> Vec<usize> {
        self.arenas.iter().map(|a| a.value(which)).collect()
    }

    fn arena_index_of(&self, obj: ObjectRef) -> Option<usize> {
        self.arenas.iter().position(|a| a.may_contain(obj))
    }

    /// True if `obj` is a live allocation in any arena.
    pub fn contains(&self, obj: ObjectRef) -> bool {
        match self.arena_index_of(obj) {
            Some(i) => self.arenas[i].bitmap.test(obj),
            None => false,
        }
    }

    /// True if the heap started in zygote mode and `obj` lives outside the
    /// active arena.
    pub fn is_allocated_in_zygote(&self, obj: ObjectRef) -> bool {
        self.saw_zygote && matches!(self.arena_index_of(obj), Some(i) if i != 0)
    }

    /// Usable bytes of the chunk holding `obj`; 0 if no arena owns it.
    pub fn chunk_size(&self, obj: ObjectRef) -> usize {
        self.arena_index_of(obj)
            .and_then(|i| self.arenas[i].space.usable_size(obj))
            .unwrap_or(0)
    }

    pub fn set_birth_generation(&mut self, obj: ObjectRef, generation: u32) {
        if let Some(i) = self.arena_index_of(obj) {
            self.arenas[i].space.set_birth_generation(obj, generation);
        }
    }

    pub fn birth_generation(&self, obj: ObjectRef) -> Option<u32> {
        let i = self.arena_index_of(obj)?;
        self.arenas[i].space.chunk_info(obj).map(|info| info.generation())
    }

    /// Allocates `n` zeroed bytes from the active arena, failing fast if that
    /// would cross the soft limit or the arena's allowed footprint.
    pub fn alloc(&mut self, n: usize) -> Option<ObjectRef> {
        let soft_limit = self.soft_limit;
        let arena = &mut self.arenas[0];
        if arena.bytes_allocated.saturating_add(n) > soft_limit {
            log::trace!(
                "soft limit of {} hit for {}-byte allocation",
                formatted_size(soft_limit),
                n
            );
            return None;
        }
        let obj = arena.space.calloc(n)?;
        arena.count_allocation(obj);
        Some(obj)
    }

    /// Removes any hard limit, tries to allocate, and shrinks the allowed
    /// footprint straight back to the real one.
    fn arena_alloc_and_grow(&mut self, n: usize) -> Option<ObjectRef> {
        let max = self.arenas[0].absolute_max_size;
        if max <= self.external_bytes_allocated {
            return None;
        }
        self.arenas[0]
            .space
            .set_max_allowed_footprint(max - self.external_bytes_allocated);
        let obj = self.alloc(n);
        let space = &mut self.arenas[0].space;
        let footprint = space.footprint();
        space.set_max_allowed_footprint(footprint);
        obj
    }

    /// Last-resort allocation: lifts the soft limit, then grows the active
    /// arena as far as the absolute maximum allows.
    pub fn alloc_and_grow(&mut self, n: usize) -> Option<ObjectRef> {
        if let Some(obj) = self.alloc(n) {
            return Some(obj);
        }
        let old_ideal_size = self.ideal_size;
        if self.is_soft_limited() {
            self.soft_limit = usize::MAX;
            if let Some(obj) = self.alloc(n) {
                self.snap_ideal_footprint();
                return Some(obj);
            }
            // The soft limit stays lifted.
        }
        match self.arena_alloc_and_grow(n) {
            Some(obj) => {
                self.snap_ideal_footprint();
                Some(obj)
            }
            None => {
                self.set_ideal_footprint(old_ideal_size);
                None
            }
        }
    }

    /// Frees `obj`, returning the bytes it accounted for (0 if no arena owns
    /// it). Chunks in frozen arenas are only accounted; touching their memory
    /// would unshare pages.
    pub fn free(&mut self, obj: ObjectRef) -> usize {
        let Some(i) = self.arena_index_of(obj) else {
            return 0;
        };
        let arena = &mut self.arenas[i];
        let freed = arena.count_free(obj);
        if i == 0 {
            arena.space.free(obj);
        }
        freed
    }

    /// Footprint of all arenas except, optionally, the active one.
    fn old_arena_overhead(&self, include_active: bool) -> usize {
        let skip = if include_active { 0 } else { 1 };
        self.arenas.iter().skip(skip).map(|a| a.footprint()).sum()
    }

    /// Real bytes used by old arenas and external memory plus, optionally, the
    /// soft usage of the active arena.
    fn soft_footprint(&self, include_active: bool) -> usize {
        let mut ret = self.old_arena_overhead(false) + self.external_bytes_allocated;
        if include_active {
            ret += self.arenas[0].bytes_allocated;
        }
        ret
    }

    pub fn footprint(&self) -> usize {
        self.old_arena_overhead(true)
    }

    pub fn ideal_footprint(&self) -> usize {
        self.ideal_size
    }

    pub fn soft_limit(&self) -> Option<usize> {
        if self.soft_limit == usize::MAX {
            None
        } else {
            Some(self.soft_limit)
        }
    }

    pub fn is_soft_limited(&self) -> bool {
        self.soft_limit <= self.ideal_size
    }

    fn set_soft_limit(&mut self, soft_limit: usize) {
        // Compare against the real footprint: the arena may not have grown
        // all the way to its allowed size yet.
        let space = &mut self.arenas[0].space;
        let current = space.footprint();
        if soft_limit < current {
            space.set_max_allowed_footprint(current);
            self.soft_limit = soft_limit;
        } else {
            space.set_max_allowed_footprint(soft_limit);
            self.soft_limit = usize::MAX;
        }
    }

    fn set_ideal_footprint(&mut self, max: usize) {
        let old_ideal = self.ideal_size;
        let old_soft = self.soft_limit;
        let max = if max > self.absolute_max_size {
            log::info!(
                "Clamp target GC heap from {} to {}",
                formatted_size(max),
                formatted_size(self.absolute_max_size)
            );
            self.absolute_max_size
        } else if max < self.minimum_size {
            self.minimum_size
        } else {
            max
        };

        // Old arenas and external allocations count against the ideal size.
        let overhead = self.soft_footprint(false);
        let active_max = max.saturating_sub(overhead);
        self.set_soft_limit(active_max);
        self.ideal_size = max;

        log::trace!(
            "IDEAL {}->{}, soft {:?}->{:?}, allowed {}, ext {}",
            old_ideal,
            self.ideal_size,
            (old_soft != usize::MAX).then(|| old_soft),
            self.soft_limit(),
            self.arenas[0].allowed_footprint(),
            self.external_bytes_allocated
        );
    }

    fn snap_ideal_footprint(&mut self) {
        self.set_ideal_footprint(self.soft_footprint(true));
    }

    pub fn target_utilization(&self) -> f32 {
        self.target_utilization as f32 / HEAP_UTILIZATION_MAX as f32
    }

    /// Clamped to `[0.2, 0.8]`.
    pub fn set_target_utilization(&mut self, target: f32) {
        let target = target.clamp(0.2, 0.8);
        self.target_utilization = (target * HEAP_UTILIZATION_MAX as f32) as usize;
        log::trace!(
            "Set heap target utilization to {}/{} ({})",
            self.target_utilization,
            HEAP_UTILIZATION_MAX,
            target
        );
    }

    pub fn minimum_size(&self) -> usize {
        self.minimum_size
    }

    /// Sets the minimum ideal size, returning the previous one. External
    /// allocations are not considered here; `set_ideal_footprint` accounts
    /// for them whenever the minimum is applied.
    pub fn set_minimum_size(&mut self, size: usize) -> usize {
        let old = self.minimum_size;
        let size = size.min(self.absolute_max_size);
        self.minimum_size = size;
        if size > self.ideal_size {
            self.set_ideal_footprint(self.ideal_size);
        }
        old
    }

    /// Resizes the ideal footprint from the live size of the active arena.
    /// Only meaningful right after a full mark-sweep.
    pub fn grow_for_utilization(&mut self) {
        // Old arenas may be full of objects outside the working set, so only
        // the active arena and external memory drive the target.
        let ext = self.external_bytes_allocated;
        let current_used = self.arenas[0].bytes_allocated + ext;
        let target = utilization_target(current_used, self.target_utilization) - ext;
        let current_used = current_used - ext;

        // set_ideal_footprint subtracts the old arenas again.
        let overhead = self.soft_footprint(false);
        let old_ideal = self.ideal_size;
        self.set_ideal_footprint(target + overhead);

        let new_max = self.arenas[0].allowed_footprint();
        let pct = if old_ideal == 0 {
            0.0
        } else {
            current_used as f64 * 100.0 / old_ideal as f64
        };
        match self.soft_limit() {
            Some(soft) => log::debug!(
                "GC old usage {:.1}%; now {} used / {} soft max ({} over, {} ext, {} real max)",
                pct,
                formatted_size(current_used),
                formatted_size(soft),
                formatted_size(overhead),
                formatted_size(ext),
                formatted_size(new_max)
            ),
            None => log::debug!(
                "GC old usage {:.1}%; now {} used / {} real max ({} over, {} ext)",
                pct,
                formatted_size(current_used),
                formatted_size(new_max),
                formatted_size(overhead),
                formatted_size(ext)
            ),
        }
    }

    /// Returns unused memory to the OS: the wilderness of every arena, then
    /// every whole free page inside it.
    pub fn trim(&mut self) -> TrimStats {
        let mut per_arena = Vec::with_capacity(self.arenas.len());
        for arena in self.arenas.iter_mut() {
            let mut released = arena.space.trim(0);
            released += arena.space.release_free_pages();
            per_arena.push(released);
        }
        TrimStats {
            per_arena,
            native_released: crate::mmap::trim_native_heap(),
        }
    }

    /// Trims immediately, then re-applies the ideal footprint so the active
    /// arena's allowed footprint follows its real footprint back down.
    pub fn shrink_to_ideal(&mut self) -> TrimStats {
        let stats = self.trim();
        self.set_ideal_footprint(self.ideal_size);
        stats
    }

    /// Visits every chunk of every arena, oldest arena first.
    pub fn walk(&self, mut callback: impl FnMut(*const u8, usize, bool)) {
        for arena in self.arenas.iter().rev() {
            arena.space.walk(&mut callback);
        }
    }

    /// Shallow copies of the live bitmaps, active arena first.
    pub fn object_bitmaps(&self) -> Vec<Arc<ObjectBitmap>> {
        self.arenas.iter().map(|a| a.bitmap.clone()).collect()
    }

    /// Swaps the arenas' live bitmaps with `bitmaps`. Fails without changing
    /// anything unless there is exactly one bitmap per arena covering the
    /// same range.
    pub fn replace_object_bitmaps(&mut self, bitmaps: &mut [Arc<ObjectBitmap>]) -> bool {
        if bitmaps.len() != self.arenas.len()
            || self
                .arenas
                .iter()
                .zip(bitmaps.iter())
                .any(|(a, b)| !a.bitmap.same_range(b))
        {
            return false;
        }
        for (arena, bitmap) in self.arenas.iter_mut().zip(bitmaps.iter_mut()) {
            std::mem::swap(&mut arena.bitmap, bitmap);
        }
        self.publish_bitmaps();
        true
    }

    // External allocation tracking. Native memory whose lifetime is tied to
    // heap objects is counted as part of the active arena.

    pub fn external_bytes_allocated(&self) -> usize {
        self.external_bytes_allocated
    }

    pub fn external_limit(&self) -> usize {
        self.external_limit
    }

    /// Whether `n` external bytes could ever fit next to the active arena's
    /// allowed footprint. Fails "mysteriously" with a small soft limit but a
    /// large real footprint.
    pub fn external_alloc_possible(&self, n: usize) -> bool {
        let arena = &self.arenas[0];
        let current = arena.allowed_footprint();
        if current + self.external_bytes_allocated + n <= arena.absolute_max_size {
            return true;
        }
        log::trace!(
            "external alloc impossible: footprint {} + external {} + n {} > max {}",
            current,
            self.external_bytes_allocated,
            n,
            arena.absolute_max_size
        );
        false
    }

    /// Counts `n` external bytes if they fit under the external limit, or
    /// unconditionally when `grow` is set, raising the limit to the
    /// utilization target of the new total.
    pub fn external_alloc(&mut self, n: usize, grow: bool) -> bool {
        debug_assert!(self.external_limit >= self.external_bytes_allocated);
        if self.external_bytes_allocated + n <= self.external_limit {
            self.external_bytes_allocated += n;
            return true;
        }
        if !grow {
            return false;
        }
        self.external_bytes_allocated += n;
        self.external_limit =
            utilization_target(self.external_bytes_allocated, EXTERNAL_TARGET_UTILIZATION);
        log::trace!("EXTERNAL grow limit to {}", self.external_limit);
        true
    }

    /// Uncounts `n` external bytes and shrinks the limit toward the new usage,
    /// keeping at least the freed amount available for an immediate re-allocation.
    /// Returns the number of bytes actually uncounted.
    pub fn external_free(&mut self, n: usize) -> usize {
        let old_allocated = self.external_bytes_allocated;
        let n = n.min(old_allocated);
        self.external_bytes_allocated -= n;

        let mut new_limit =
            utilization_target(self.external_bytes_allocated, EXTERNAL_TARGET_UTILIZATION);
        if new_limit < old_allocated {
            log::trace!(
                "EXTERNAL free preserved {} extra free bytes",
                old_allocated - new_limit
            );
            new_limit = old_allocated;
        }
        if new_limit < self.external_limit {
            self.external_limit = new_limit;
        }
        n
    }
}

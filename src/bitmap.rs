use atomic::{Atomic, Ordering};
use core::fmt;
use memmap2::MmapMut;
use std::mem::size_of;
use std::sync::atomic::AtomicUsize;

use crate::error::HeapError;
use crate::globals::OBJECT_ALIGNMENT;
use crate::object::ObjectRef;

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;

/// One bit per `ALIGN`-aligned address of a heap region.
///
/// Bits are only set and cleared while the heap lock is held, but may be read
/// by any thread at any time: a bit for a new object is published before the
/// object pointer itself can escape the allocating thread.
pub struct HeapBitmap<const ALIGN: usize> {
    #[allow(dead_code)]
    mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    /// Highest address ever set, or `heap_begin - 1` when nothing was set.
    max: AtomicUsize,
    name: &'static str,
}

/// Bitmap of live allocations, also used as the mark bitmap during a collection.
pub type ObjectBitmap = HeapBitmap<OBJECT_ALIGNMENT>;

unsafe impl<const ALIGN: usize> Send for HeapBitmap<ALIGN> {}
unsafe impl<const ALIGN: usize> Sync for HeapBitmap<ALIGN> {}

impl<const ALIGN: usize> HeapBitmap<ALIGN> {
    pub fn create(
        name: &'static str,
        heap_begin: *const u8,
        heap_capacity: usize,
    ) -> Result<Self, HeapError> {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mut mem_map =
            MmapMut::map_anon(bitmap_size.max(size_of::<usize>())).map_err(|source| {
                HeapError::ReservationFailed {
                    size: bitmap_size,
                    source,
                }
            })?;
        let bitmap_begin = mem_map.as_mut_ptr().cast();
        Ok(Self {
            mem_map,
            bitmap_begin,
            bitmap_size,
            heap_begin: heap_begin as usize,
            heap_limit: heap_begin as usize + heap_capacity,
            max: AtomicUsize::new((heap_begin as usize).wrapping_sub(1)),
            name,
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }
    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }
    #[inline]
    pub fn size(&self) -> usize {
        self.bitmap_size
    }

    pub fn compute_bitmap_size(capacity: usize) -> usize {
        let bytes_covered_per_word = ALIGN * BITS_PER_INTPTR;
        (capacity + bytes_covered_per_word - 1) / bytes_covered_per_word * size_of::<usize>()
    }
    #[inline]
    pub fn index_to_offset(index: usize) -> usize {
        index * ALIGN * BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_to_index(offset: usize) -> usize {
        offset / ALIGN / BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_to_mask(offset: usize) -> usize {
        1 << ((offset / ALIGN) % BITS_PER_INTPTR)
    }

    /// True if `addr` lies in the covered range and is suitably aligned. Says
    /// nothing about whether an object lives there.
    #[inline]
    pub fn may_contain(&self, addr: usize) -> bool {
        addr >= self.heap_begin && addr < self.heap_limit && addr % ALIGN == 0
    }

    #[inline]
    fn word(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(index < self.bitmap_size / size_of::<usize>());
        unsafe { &*self.bitmap_begin.add(index) }
    }

    #[inline]
    pub fn test(&self, obj: ObjectRef) -> bool {
        let addr = obj.addr();
        if !self.may_contain(addr) {
            return false;
        }
        let offset = addr - self.heap_begin;
        self.word(Self::offset_to_index(offset)).load(Ordering::Acquire)
            & Self::offset_to_mask(offset)
            != 0
    }

    /// Sets the bit for `obj`, returning its previous value.
    #[inline]
    pub fn set(&self, obj: ObjectRef) -> bool {
        let addr = obj.addr();
        debug_assert!(self.may_contain(addr), "Invalid object address: {:?}", obj);
        let offset = addr - self.heap_begin;
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(Self::offset_to_index(offset));
        let old_word = entry.load(Ordering::Relaxed);
        if old_word & mask != 0 {
            return true;
        }
        entry.fetch_or(mask, Ordering::Release);
        self.max.fetch_max(addr, std::sync::atomic::Ordering::Relaxed);
        false
    }

    /// Clears the bit for `obj`, returning its previous value.
    #[inline]
    pub fn clear(&self, obj: ObjectRef) -> bool {
        let addr = obj.addr();
        debug_assert!(self.may_contain(addr), "Invalid object address: {:?}", obj);
        let offset = addr - self.heap_begin;
        let mask = Self::offset_to_mask(offset);
        self.word(Self::offset_to_index(offset))
            .fetch_and(!mask, Ordering::Release)
            & mask
            != 0
    }

    pub fn clear_all(&self) {
        let words = self.words_in_use();
        for i in 0..words {
            self.word(i).store(0, Ordering::Relaxed);
        }
        self.max.store(
            self.heap_begin.wrapping_sub(1),
            std::sync::atomic::Ordering::Relaxed,
        );
    }

    /// Number of bitmap words that can hold a set bit.
    fn words_in_use(&self) -> usize {
        let max = self.max.load(std::sync::atomic::Ordering::Relaxed);
        if max < self.heap_begin {
            return 0;
        }
        Self::offset_to_index(max - self.heap_begin) + 1
    }

    #[inline]
    fn visit_word(&self, index: usize, mut w: usize, visitor: &mut impl FnMut(ObjectRef)) {
        let ptr_base = Self::index_to_offset(index) + self.heap_begin;
        while w != 0 {
            let shift = w.trailing_zeros() as usize;
            // SAFETY: set bits only ever correspond to non-null heap addresses.
            visitor(unsafe { ObjectRef::from_addr_unchecked(ptr_base + shift * ALIGN) });
            w ^= 1 << shift;
        }
    }

    /// Visits every set bit in address order. A word is loaded before its bits
    /// are visited, so the visitor may clear bits as it goes.
    pub fn walk(&self, mut visitor: impl FnMut(ObjectRef)) {
        for i in 0..self.words_in_use() {
            let w = self.word(i).load(Ordering::Acquire);
            if w != 0 {
                self.visit_word(i, w, &mut visitor);
            }
        }
    }

    /// Visits every bit set in `live` but not in `mark`: the garbage of a
    /// collection. Both bitmaps must cover the same range.
    pub fn sweep_walk(live: &Self, mark: &Self, mut visitor: impl FnMut(ObjectRef)) {
        assert_eq!(live.heap_begin, mark.heap_begin);
        assert_eq!(live.bitmap_size, mark.bitmap_size);
        for i in 0..live.words_in_use() {
            let garbage =
                live.word(i).load(Ordering::Acquire) & !mark.word(i).load(Ordering::Acquire);
            if garbage != 0 {
                live.visit_word(i, garbage, &mut visitor);
            }
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        (0..self.words_in_use())
            .map(|i| self.word(i).load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Deep copy covering the same range, for handing to an external heap dumper.
    pub fn snapshot(&self) -> Result<Self, HeapError> {
        let copy = Self::create(
            self.name,
            self.heap_begin as *const u8,
            self.heap_limit - self.heap_begin,
        )?;
        for i in 0..self.words_in_use() {
            copy.word(i)
                .store(self.word(i).load(Ordering::Acquire), Ordering::Relaxed);
        }
        copy.max.store(
            self.max.load(std::sync::atomic::Ordering::Relaxed),
            std::sync::atomic::Ordering::Relaxed,
        );
        Ok(copy)
    }

    /// True if both bitmaps describe the same address range.
    pub fn same_range(&self, other: &Self) -> bool {
        self.heap_begin == other.heap_begin && self.heap_limit == other.heap_limit
    }
}

impl<const ALIGN: usize> fmt::Debug for HeapBitmap<ALIGN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[begin={:p},end={:p}]",
            self.name, self.heap_begin as *const (), self.heap_limit as *const ()
        )
    }
}

use std::collections::{BTreeMap, BTreeSet};

use modular_bitfield::prelude::*;

use crate::error::HeapError;
use crate::globals::{align_up, CHUNK_OVERHEAD, MIN_CHUNK_SIZE, OBJECT_ALIGNMENT, PAGE_SIZE};
use crate::mmap::Mmap;
use crate::object::ObjectRef;

/// Out-of-line header of an allocated chunk.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct ChunkInfo {
    /// Chunk length in `OBJECT_ALIGNMENT` units, overhead included.
    granules: B32,
    birth_generation: B32,
}

impl ChunkInfo {
    pub fn chunk_size(&self) -> usize {
        self.granules() as usize * OBJECT_ALIGNMENT
    }
    pub fn usable_size(&self) -> usize {
        self.chunk_size() - CHUNK_OVERHEAD
    }
    pub fn generation(&self) -> u32 {
        self.birth_generation()
    }
}

/// A contiguous, growable allocation space over one reserved region.
///
/// Memory is handed out bump-pointer style from `top` and recycled through a
/// best-fit free list. The region only counts as "obtained from the system"
/// (the footprint) up to a page-rounded high-water mark, which may never
/// exceed `max_allowed`; that is how the heap source caps growth without
/// unmapping anything.
pub struct Mspace {
    name: String,
    mem: Mmap,
    chunks: BTreeMap<usize, ChunkInfo>,
    free_by_offset: BTreeMap<usize, usize>,
    free_by_size: BTreeSet<(usize, usize)>,
    top: usize,
    footprint: usize,
    max_allowed: usize,
}

impl Mspace {
    pub fn new(name: String, start_size: usize, capacity: usize) -> Result<Self, HeapError> {
        let mem = Mmap::new(capacity)?;
        log::trace!(
            "Creating {} of size {} ({} reserved at {:p})",
            name,
            start_size,
            mem.size(),
            mem.start()
        );
        let mut space = Self {
            name,
            mem,
            chunks: BTreeMap::new(),
            free_by_offset: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            top: 0,
            footprint: 0,
            max_allowed: 0,
        };
        space.set_max_allowed_footprint(start_size);
        Ok(space)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn base(&self) -> *mut u8 {
        self.mem.start()
    }
    pub fn capacity(&self) -> usize {
        self.mem.size()
    }
    pub fn footprint(&self) -> usize {
        self.footprint
    }
    pub fn max_allowed_footprint(&self) -> usize {
        self.max_allowed
    }

    /// Raises the growth cap to `bytes` rounded up to whole pages. A cap below
    /// the current footprint pins the footprint where it is.
    pub fn set_max_allowed_footprint(&mut self, bytes: usize) {
        if bytes > self.footprint {
            self.max_allowed = self.footprint + align_up(bytes - self.footprint, PAGE_SIZE);
        } else {
            self.max_allowed = self.footprint;
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.mem.contains(addr)
    }

    fn offset_of(&self, obj: ObjectRef) -> Option<usize> {
        if self.contains(obj.addr()) {
            Some(obj.addr() - self.base() as usize)
        } else {
            None
        }
    }

    pub fn chunk_size_for(n: usize) -> Option<usize> {
        let size = n.checked_add(CHUNK_OVERHEAD + OBJECT_ALIGNMENT - 1)? & !(OBJECT_ALIGNMENT - 1);
        Some(size.max(MIN_CHUNK_SIZE))
    }

    /// Allocates `n` zeroed bytes, or returns `None` if neither the free list
    /// nor growth under the allowed footprint can satisfy the request.
    pub fn calloc(&mut self, n: usize) -> Option<ObjectRef> {
        let size = Self::chunk_size_for(n)?;
        if size > self.capacity() {
            return None;
        }
        let (offset, size) = match self.take_free(size) {
            Some(found) => found,
            None => (self.extend_top(size)?, size),
        };
        let info = ChunkInfo::new().with_granules((size / OBJECT_ALIGNMENT) as u32);
        self.chunks.insert(offset, info);
        unsafe {
            let ptr = self.base().add(offset);
            core::ptr::write_bytes(ptr, 0, size - CHUNK_OVERHEAD);
            Some(ObjectRef::from_addr_unchecked(ptr as usize))
        }
    }

    fn take_free(&mut self, size: usize) -> Option<(usize, usize)> {
        let &(free_size, offset) = self.free_by_size.range((size, 0)..).next()?;
        self.free_by_size.remove(&(free_size, offset));
        self.free_by_offset.remove(&offset);
        let rest = free_size - size;
        if rest >= MIN_CHUNK_SIZE {
            self.insert_free(offset + size, rest);
            Some((offset, size))
        } else {
            Some((offset, free_size))
        }
    }

    fn extend_top(&mut self, size: usize) -> Option<usize> {
        let new_top = self.top.checked_add(size)?;
        if new_top > self.footprint {
            let needed = align_up(new_top, PAGE_SIZE);
            if needed > self.max_allowed || needed > self.capacity() {
                return None;
            }
            self.footprint = needed;
        }
        let offset = self.top;
        self.top = new_top;
        Some(offset)
    }

    fn insert_free(&mut self, offset: usize, size: usize) {
        self.free_by_offset.insert(offset, size);
        self.free_by_size.insert((size, offset));
    }

    fn remove_free(&mut self, offset: usize, size: usize) {
        self.free_by_offset.remove(&offset);
        self.free_by_size.remove(&(size, offset));
    }

    /// Returns the chunk to the free list, merging with free neighbours.
    /// Returns the chunk size, or `None` if `obj` is not an allocated chunk.
    pub fn free(&mut self, obj: ObjectRef) -> Option<usize> {
        let offset = self.offset_of(obj)?;
        let size = self.chunks.remove(&offset)?.chunk_size();

        let mut start = offset;
        let mut len = size;
        let prev = self
            .free_by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = prev {
            if prev_offset + prev_size == offset {
                self.remove_free(prev_offset, prev_size);
                start = prev_offset;
                len += prev_size;
            }
        }
        if let Some(&next_size) = self.free_by_offset.get(&(offset + size)) {
            self.remove_free(offset + size, next_size);
            len += next_size;
        }
        if start + len == self.top {
            self.top = start;
        } else {
            self.insert_free(start, len);
        }
        Some(size)
    }

    pub fn chunk_info(&self, obj: ObjectRef) -> Option<ChunkInfo> {
        self.chunks.get(&self.offset_of(obj)?).copied()
    }

    pub fn usable_size(&self, obj: ObjectRef) -> Option<usize> {
        self.chunk_info(obj).map(|info| info.usable_size())
    }

    pub fn set_birth_generation(&mut self, obj: ObjectRef, generation: u32) {
        if let Some(offset) = self.offset_of(obj) {
            if let Some(info) = self.chunks.get_mut(&offset) {
                info.set_birth_generation(generation);
            }
        }
    }

    /// Hands the pages above the highest allocated chunk (plus `pad` bytes)
    /// back to the OS and lowers the footprint accordingly.
    pub fn trim(&mut self, pad: usize) -> usize {
        let keep = align_up(self.top.saturating_add(pad), PAGE_SIZE).min(self.footprint);
        if keep >= self.footprint {
            return 0;
        }
        let released = unsafe {
            self.mem
                .dontneed(self.base().add(keep), self.footprint - keep)
        };
        self.footprint = keep;
        released
    }

    /// Releases every whole page lying inside a free chunk. The chunks stay
    /// on the free list; their pages read back as zero.
    pub fn release_free_pages(&self) -> usize {
        let mut released = 0;
        for (&offset, &size) in self.free_by_offset.iter() {
            released += unsafe { self.mem.dontneed(self.base().add(offset), size) };
        }
        released
    }

    /// Visits every chunk in address order, followed by the unused tail of
    /// the footprint. The callback receives the chunk start, its length and
    /// whether it is in use.
    pub fn walk(&self, mut callback: impl FnMut(*const u8, usize, bool)) {
        let mut used = self.chunks.iter().peekable();
        let mut free = self.free_by_offset.iter().peekable();
        loop {
            let take_used = match (used.peek(), free.peek()) {
                (Some((&u, _)), Some((&f, _))) => u < f,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_used {
                if let Some((&offset, info)) = used.next() {
                    callback(unsafe { self.base().add(offset) }, info.chunk_size(), true);
                }
            } else if let Some((&offset, &size)) = free.next() {
                callback(unsafe { self.base().add(offset) }, size, false);
            }
        }
        if self.top < self.footprint {
            callback(
                unsafe { self.base().add(self.top) },
                self.footprint - self.top,
                false,
            );
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(start: usize, capacity: usize) -> Mspace {
        Mspace::new("test-space".to_string(), start, capacity).unwrap()
    }

    #[test]
    fn calloc_is_zeroed_and_aligned() {
        let mut ms = space(64 * 1024, 1 << 20);
        let a = ms.calloc(24).unwrap();
        unsafe {
            for i in 0..3 {
                a.write_word(i, usize::MAX);
            }
        }
        assert_eq!(a.addr() % OBJECT_ALIGNMENT, 0);
        assert_eq!(ms.usable_size(a), Some(24));
        ms.free(a).unwrap();
        let b = ms.calloc(24).unwrap();
        assert_eq!(a, b);
        unsafe {
            for i in 0..3 {
                assert_eq!(b.read_word(i), 0);
            }
        }
    }

    #[test]
    fn growth_is_capped_by_max_allowed() {
        let mut ms = space(PAGE_SIZE, 1 << 20);
        assert_eq!(ms.max_allowed_footprint(), PAGE_SIZE);
        let a = ms.calloc(PAGE_SIZE / 2).unwrap();
        assert!(ms.calloc(PAGE_SIZE).is_none());
        ms.set_max_allowed_footprint(4 * PAGE_SIZE);
        let b = ms.calloc(PAGE_SIZE).unwrap();
        assert!(ms.footprint() <= ms.max_allowed_footprint());
        assert_ne!(a, b);
    }

    #[test]
    fn max_allowed_never_below_footprint() {
        let mut ms = space(8 * PAGE_SIZE, 1 << 20);
        ms.calloc(3 * PAGE_SIZE).unwrap();
        let footprint = ms.footprint();
        ms.set_max_allowed_footprint(PAGE_SIZE);
        assert_eq!(ms.max_allowed_footprint(), footprint);
        ms.set_max_allowed_footprint(footprint + 1);
        assert_eq!(ms.max_allowed_footprint(), footprint + PAGE_SIZE);
    }

    #[test]
    fn free_coalesces_into_top() {
        let mut ms = space(1 << 20, 1 << 20);
        let objs: Vec<_> = (0..16).map(|_| ms.calloc(100).unwrap()).collect();
        for obj in objs.iter().step_by(2) {
            ms.free(*obj).unwrap();
        }
        for obj in objs.iter().skip(1).step_by(2) {
            ms.free(*obj).unwrap();
        }
        assert_eq!(ms.chunk_count(), 0);
        let mut free_chunks = 0;
        ms.walk(|_, _, used| {
            assert!(!used);
            free_chunks += 1;
        });
        // only the wilderness remains
        assert_eq!(free_chunks, 1);
        assert_eq!(ms.calloc(100).unwrap(), objs[0]);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut ms = space(1 << 16, 1 << 16);
        let a = ms.calloc(8).unwrap();
        assert!(ms.free(a).is_some());
        assert!(ms.free(a).is_none());
    }

    #[test]
    fn trim_releases_wilderness() {
        let mut ms = space(1 << 20, 1 << 20);
        let a = ms.calloc(16).unwrap();
        let big = ms.calloc(64 * PAGE_SIZE).unwrap();
        let before = ms.footprint();
        ms.free(big).unwrap();
        let released = ms.trim(0);
        assert!(released >= 63 * PAGE_SIZE);
        assert_eq!(ms.footprint(), before - released);
        assert!(ms.footprint() <= ms.max_allowed_footprint());
        assert!(ms.usable_size(a).is_some());
    }

    #[test]
    fn free_pages_inside_holes_are_released() {
        let mut ms = space(1 << 20, 1 << 20);
        let big = ms.calloc(8 * PAGE_SIZE).unwrap();
        let _pin = ms.calloc(16).unwrap();
        ms.free(big).unwrap();
        assert!(ms.release_free_pages() >= 7 * PAGE_SIZE);
    }
}

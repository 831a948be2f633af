use std::time::Duration;

pub const PAGE_SIZE: usize = 4096;
/// Every allocation starts on an 8-byte boundary; this is also the object bitmap granularity.
pub const OBJECT_ALIGNMENT: usize = 8;
/// Bytes of bookkeeping charged to each chunk on top of its usable size.
pub const CHUNK_OVERHEAD: usize = core::mem::size_of::<usize>();
pub const MIN_CHUNK_SIZE: usize = 2 * OBJECT_ALIGNMENT;

/// Utilization ratios are stored as integers over this scale.
pub const HEAP_UTILIZATION_MAX: usize = 1024;
pub const DEFAULT_HEAP_UTILIZATION: usize = 512;
/// Cap on the free space left after a collection.
pub const HEAP_IDEAL_FREE: usize = 2 * 1024 * 1024;
/// Floor on the free space left after a collection.
pub const HEAP_MIN_FREE: usize = HEAP_IDEAL_FREE / 4;
/// External allocations aim for 80% utilization of their own limit.
pub const EXTERNAL_TARGET_UTILIZATION: usize = 820;

/// Hysteresis used when deciding whether heap growth warrants clearing soft references.
pub const SOFT_REFERENCE_GROWTH_SLACK: usize = 128 * 1024;

/// Active arena plus the pre-fork and post-fork snapshot arenas.
pub const MAX_ARENA_COUNT: usize = 3;

pub const NON_COLLECTABLE_TABLE_DEFAULT: usize = 16;
pub const FINALIZABLE_TABLE_DEFAULT: usize = 128;
/// Hard ceiling for the growable reference tables. Reaching it is an internal error.
pub const REF_TABLE_MAX: usize = 1 << 24;

pub const DEFAULT_START_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAXIMUM_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TRIM_DELAY: Duration = Duration::from_secs(5);

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

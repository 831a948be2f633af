use std::time::Duration;

/// Snapshot of the heap's sizing state, produced by `Heap::statistics`.
#[derive(Debug, Clone, Default)]
pub struct HeapStatistics {
    pub arenas: Vec<ArenaStatistics>,
    pub ideal_size: usize,
    pub soft_limit: Option<usize>,
    pub minimum_size: usize,
    pub absolute_max_size: usize,
    pub target_utilization: f32,
    pub external_bytes_allocated: usize,
    pub external_limit: usize,
    pub total_gc_cycles_count: usize,
    pub total_objects_freed: usize,
    pub total_bytes_freed: usize,
    pub last_gc_pause: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ArenaStatistics {
    pub name: String,
    pub footprint: usize,
    pub allowed_footprint: usize,
    pub bytes_allocated: usize,
    pub objects_allocated: usize,
    /// Bytes of live bitmap covering the arena's reservation.
    pub bitmap_size: usize,
}

/// Pages handed back to the OS by one trim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimStats {
    /// Bytes released per arena, active arena first.
    pub per_arena: Vec<usize>,
    /// Whether the native allocator released anything.
    pub native_released: bool,
}

impl TrimStats {
    pub fn heap_bytes(&self) -> usize {
        self.per_arena.iter().sum()
    }
}

/// Per-thread or global allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocProfile {
    pub alloc_count: usize,
    pub alloc_size: usize,
    pub failed_alloc_count: usize,
    pub failed_alloc_size: usize,
    pub gc_count: usize,
    pub external_alloc_count: usize,
    pub external_alloc_size: usize,
    pub failed_external_alloc_count: usize,
    pub failed_external_alloc_size: usize,
}

impl AllocProfile {
    pub(crate) fn count_alloc(&mut self, size: usize, ok: bool) {
        if ok {
            self.alloc_count += 1;
            self.alloc_size += size;
        } else {
            self.failed_alloc_count += 1;
            self.failed_alloc_size += size;
        }
    }

    pub(crate) fn count_external(&mut self, size: usize, ok: bool) {
        if ok {
            self.external_alloc_count += 1;
            self.external_alloc_size += size;
        } else {
            self.failed_external_alloc_count += 1;
            self.failed_external_alloc_size += size;
        }
    }
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        for (i, arena) in self.arenas.iter().enumerate() {
            writeln!(
                f,
                "  Arena #{} ({}): {} allocated in {} objects, footprint {} of {} allowed, bitmap {}",
                i,
                arena.name,
                formatted_size(arena.bytes_allocated),
                arena.objects_allocated,
                formatted_size(arena.footprint),
                formatted_size(arena.allowed_footprint),
                formatted_size(arena.bitmap_size)
            )?;
        }
        writeln!(
            f,
            "  Ideal size: {} (minimum {}, maximum {})",
            formatted_size(self.ideal_size),
            formatted_size(self.minimum_size),
            formatted_size(self.absolute_max_size)
        )?;
        match self.soft_limit {
            Some(limit) => writeln!(f, "  Soft limit: {}", formatted_size(limit))?,
            None => writeln!(f, "  Soft limit: none")?,
        }
        writeln!(
            f,
            "  Target utilization: {:.0}%",
            self.target_utilization * 100.0
        )?;
        writeln!(
            f,
            "  External memory: {} of {}",
            formatted_size(self.external_bytes_allocated),
            formatted_size(self.external_limit)
        )?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Total freed: {} in {} objects",
            formatted_size(self.total_bytes_freed),
            self.total_objects_freed
        )?;
        writeln!(f, "  Last GC pause: {}ms", self.last_gc_pause.as_millis())
    }
}

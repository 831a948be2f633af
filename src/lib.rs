//! Managed heap with a stop-the-world mark-sweep collector.
//!
//! Objects are allocated from up to three arenas whose footprint is steered
//! toward a target utilization after every collection. Soft, weak and phantom
//! references are cleared by the collector; their `clear()`/`enqueue()` calls
//! and object finalizers run later on a dedicated heap worker thread.
//!
//! The VM plugs in through [`ObjectModel`] (object layout and callbacks) and
//! [`RootProvider`] (roots outside the heap). Threads touching heap objects
//! attach with [`Heap::attach_current_thread`] and poll
//! [`Mutator::safepoint`].

use std::time::Duration;

pub mod bitmap;
pub mod error;
pub mod globals;
pub mod heap;
pub mod heap_source;
pub mod heap_worker;
pub mod mark_sweep;
pub mod mmap;
pub mod mspace;
pub mod mutator;
pub mod object;
pub mod ref_table;
pub mod roots;
pub mod safepoint;
pub mod statistics;

#[cfg(test)]
mod tests;

pub use bitmap::ObjectBitmap;
pub use error::{fatal_payload, CallbackError, FatalError, HeapError};
pub use heap::Heap;
pub use heap_source::HeapValue;
pub use mutator::Mutator;
pub use object::{HeapCall, ObjectModel, ObjectRef, ReferenceKind, Visitor};
pub use roots::{GlobalRoots, RootProvider};
pub use statistics::{AllocProfile, HeapStatistics, TrimStats};

use globals::*;

/// Configuration for heap constructor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial allowed footprint of the first arena.
    pub start_size: usize,
    /// Absolute ceiling on the heap, including external allocations.
    pub maximum_size: usize,
    /// Live bytes over heap size the collector aims for, clamped to `[0.2, 0.8]`.
    pub target_utilization: f32,
    /// Start in zygote mode: no heap worker until `Heap::startup_after_zygote`.
    pub zygote: bool,
    /// How long a single finalize/clear/enqueue call may run before the heap
    /// worker is declared wedged.
    pub watchdog_timeout: Duration,
    /// Delay between a collection and the idle trim it schedules.
    pub trim_delay: Duration,
    /// Spawn the heap worker thread. When false, pending work only runs
    /// through `Mutator::run_finalization_sync`.
    pub start_worker: bool,
    /// Log a one-line summary of every collection at info level.
    pub verbose: bool,
    /// Count allocations per thread and globally.
    pub profile_allocations: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_size: DEFAULT_START_SIZE,
            maximum_size: DEFAULT_MAXIMUM_SIZE,
            target_utilization: DEFAULT_HEAP_UTILIZATION as f32 / HEAP_UTILIZATION_MAX as f32,
            zygote: false,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            trim_delay: DEFAULT_TRIM_DELAY,
            start_worker: true,
            verbose: false,
            profile_allocations: false,
        }
    }
}

impl Config {
    pub fn with_start_size(mut self, size: usize) -> Self {
        self.start_size = size;
        self
    }
    pub fn with_maximum_size(mut self, size: usize) -> Self {
        self.maximum_size = size;
        self
    }
    pub fn with_target_utilization(mut self, ratio: f32) -> Self {
        self.target_utilization = ratio;
        self
    }
    pub fn with_zygote(mut self, zygote: bool) -> Self {
        self.zygote = zygote;
        self
    }
    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }
    pub fn with_trim_delay(mut self, delay: Duration) -> Self {
        self.trim_delay = delay;
        self
    }
    pub fn with_worker(mut self, start_worker: bool) -> Self {
        self.start_worker = start_worker;
        self
    }
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
    pub fn with_alloc_profiling(mut self, enabled: bool) -> Self {
        self.profile_allocations = enabled;
        self
    }
}

bitflags::bitflags! {
    /// Options for [`Mutator::allocate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u8 {
        /// The object has a `finalize()` that must run before it is reclaimed.
        const FINALIZABLE = 1 << 0;
        /// Root the object until `clear_alloc_flags(obj, NO_GC)`. Implies not tracked.
        const NO_GC = 1 << 1;
        /// Don't add the object to the thread's tracked allocations.
        const DONT_TRACK = 1 << 2;
    }
}

impl AllocFlags {
    pub const DEFAULT: AllocFlags = AllocFlags::empty();
}

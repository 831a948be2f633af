use std::time::Duration;

use thiserror::Error;

use crate::object::HeapCall;

/// Recoverable heap failures, returned to the caller.
#[derive(Debug, Error)]
pub enum HeapError {
    /// Allocation could not be satisfied even after clearing soft references.
    #[error("out of memory on a {size}-byte allocation")]
    OutOfMemory {
        size: usize,
        /// Set when reporting the failure itself ran out of memory and the
        /// pre-built, stack-less error was used instead.
        prebuilt: bool,
    },
    #[error("bad heap parameters (start={start}, max={max})")]
    BadHeapParameters { start: usize, max: usize },
    #[error("can't reserve {size} bytes for an arena")]
    ReservationFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("no room to create any more arenas ({overhead} overhead, {max} max)")]
    NoRoomForArena { overhead: usize, max: usize },
    #[error("{size}-byte external allocation too large for this process")]
    ExternalAllocationTooLarge { size: usize },
    #[error("out of external memory on a {size}-byte allocation")]
    ExternalOutOfMemory { size: usize },
    #[error("can't start the heap worker thread")]
    WorkerSpawn(#[source] std::io::Error),
}

impl HeapError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            HeapError::OutOfMemory { .. } | HeapError::ExternalOutOfMemory { .. }
        )
    }
}

/// Internal invariant violations. These never propagate as values: they are
/// raised through [`fatal`] and terminate the collecting thread.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("attempt to create too many arenas ({count} >= {max})")]
    TooManyArenas { count: usize, max: usize },
    #[error("mark stack overflow ({capacity} entries)")]
    MarkStackOverflow { capacity: usize },
    #[error("can't set up the mark step: {0}")]
    MarkSetupFailed(String),
    #[error("no room for any more finalizable objects")]
    FinalizableTableFull,
    #[error("no room for any more reference operations")]
    ReferenceTableFull,
    #[error("no room for any more non-collectable objects: {entries}")]
    NonCollectableTableFull { entries: usize },
    #[error("failed to remove non-collectable entry for object {addr:#x}")]
    MissingNonCollectableEntry { addr: usize },
    #[error("heap worker is wedged: {}ms spent inside {call}", elapsed.as_millis())]
    WorkerWedged { elapsed: Duration, call: HeapCall },
    #[error("heap worker callback waited on the heap worker")]
    WorkerReentry,
    #[error("thread {name:?} is already attached to the heap")]
    ThreadAlreadyAttached { name: String },
}

/// Failure reported by a finalize/clear/enqueue callback. Always swallowed by
/// the heap worker after logging.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Logs `err`, dumps the current stack and aborts the calling thread with
/// `err` as the panic payload.
#[cold]
pub fn fatal(err: FatalError) -> ! {
    log::error!("fatal heap error: {}", err);
    let trace = backtrace::Backtrace::new();
    log::error!("{:?}", trace);
    std::panic::panic_any(err)
}

/// Extracts the [`FatalError`] carried by a panic payload, if any.
pub fn fatal_payload(payload: &(dyn std::any::Any + Send)) -> Option<&FatalError> {
    payload.downcast_ref::<FatalError>()
}

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::error::{fatal, FatalError};
use crate::object::{ObjectRef, Visitor};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// May touch heap objects; must poll safepoints.
    Running = 0,
    /// Blocked or otherwise guaranteed not to touch heap objects.
    Safe = 1,
}

/// Per-thread state the collector needs: whether the thread can be
/// considered stopped, and the allocations it is keeping alive.
pub struct ThreadRecord {
    name: String,
    state: AtomicCell<ThreadState>,
    tracked: Mutex<Vec<ObjectRef>>,
}

impl ThreadRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    pub(crate) fn add_tracked(&self, obj: ObjectRef) {
        self.tracked.lock().push(obj);
    }

    /// Drops the most recent tracking entry for `obj`.
    pub(crate) fn release_tracked(&self, obj: ObjectRef) -> bool {
        let mut tracked = self.tracked.lock();
        match tracked.iter().rposition(|&o| o == obj) {
            Some(i) => {
                tracked.remove(i);
                true
            }
            None => false,
        }
    }

    pub(crate) fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    fn visit_tracked(&self, visitor: &mut dyn Visitor) {
        for &obj in self.tracked.lock().iter() {
            visitor.visit(obj);
        }
    }
}

thread_local! {
    /// Records of the current thread, keyed by the id of the heap it is attached to.
    static ATTACHED: RefCell<Vec<(usize, Arc<ThreadRecord>)>> = RefCell::new(Vec::new());
}

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed.
pub struct GlobalSafepoint {
    heap_id: usize,
    requested: CachePadded<AtomicBool>,
    barrier: Mutex<()>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
}

impl GlobalSafepoint {
    pub fn new(heap_id: usize) -> Self {
        Self {
            heap_id,
            requested: CachePadded::new(AtomicBool::new(false)),
            barrier: Mutex::new(()),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Adds the calling thread to the thread list in the running state,
    /// waiting out any suspension in progress.
    pub fn register(&self, name: &str) -> Arc<ThreadRecord> {
        if self.current().is_some() {
            fatal(FatalError::ThreadAlreadyAttached {
                name: name.to_string(),
            });
        }
        let record = Arc::new(ThreadRecord {
            name: name.to_string(),
            state: AtomicCell::new(ThreadState::Running),
            tracked: Mutex::new(Vec::new()),
        });
        let mut guard = self.barrier.lock();
        while self.requested.load(Ordering::Acquire) {
            self.cv_resume.wait(&mut guard);
        }
        self.threads.lock().push(record.clone());
        drop(guard);
        ATTACHED.with(|attached| attached.borrow_mut().push((self.heap_id, record.clone())));
        log::trace!("Attached thread {:?}", name);
        record
    }

    pub fn unregister(&self, record: &Arc<ThreadRecord>) {
        let guard = self.barrier.lock();
        self.threads.lock().retain(|t| !Arc::ptr_eq(t, record));
        // A suspender may be waiting on this thread.
        self.cv_stopped.notify_all();
        drop(guard);
        ATTACHED.with(|attached| {
            attached
                .borrow_mut()
                .retain(|(id, r)| !(*id == self.heap_id && Arc::ptr_eq(r, record)))
        });
        log::trace!("Detached thread {:?}", record.name);
    }

    /// Record of the calling thread, if it is attached to this heap.
    pub fn current(&self) -> Option<Arc<ThreadRecord>> {
        ATTACHED.with(|attached| {
            attached
                .borrow()
                .iter()
                .find(|(id, _)| *id == self.heap_id)
                .map(|(_, r)| r.clone())
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    #[inline(always)]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Parks a running thread until the current suspension is lifted.
    #[cold]
    pub fn park(&self, record: &ThreadRecord) {
        let mut guard = self.barrier.lock();
        record.state.store(ThreadState::Safe);
        self.cv_stopped.notify_all();
        while self.requested.load(Ordering::Acquire) {
            self.cv_resume.wait(&mut guard);
        }
        record.state.store(ThreadState::Running);
    }

    /// Moves `record` to `state`, returning the previous state. Becoming
    /// running waits out any suspension in progress.
    pub fn transition(&self, record: &ThreadRecord, state: ThreadState) -> ThreadState {
        let old = record.state.load();
        if old == state {
            return old;
        }
        let mut guard = self.barrier.lock();
        match state {
            ThreadState::Safe => {
                record.state.store(ThreadState::Safe);
                self.cv_stopped.notify_all();
            }
            ThreadState::Running => {
                while self.requested.load(Ordering::Acquire) {
                    self.cv_resume.wait(&mut guard);
                }
                record.state.store(ThreadState::Running);
            }
        }
        old
    }

    /// Stops every attached thread except `current`. Threads are resumed when
    /// the returned guard is dropped.
    pub fn suspend_all<'a>(&'a self, current: Option<&ThreadRecord>) -> SuspendGuard<'a> {
        let mut guard = self.barrier.lock();
        debug_assert!(!self.requested.load(Ordering::Relaxed));
        self.requested.store(true, Ordering::Release);
        loop {
            let running = self
                .threads
                .lock()
                .iter()
                .filter(|t| !current.map_or(false, |c| std::ptr::eq(&***t, c)))
                .filter(|t| t.state.load() == ThreadState::Running)
                .count();
            if running == 0 {
                break;
            }
            log::trace!("Waiting for {} threads to reach a safepoint", running);
            self.cv_stopped.wait(&mut guard);
        }
        SuspendGuard { safepoint: self }
    }

    /// Visits the tracked allocations of every attached thread. Only valid
    /// while threads are suspended.
    pub fn visit_tracked(&self, visitor: &mut dyn Visitor) {
        for thread in self.threads.lock().iter() {
            thread.visit_tracked(visitor);
        }
    }

    fn resume_all(&self) {
        let guard = self.barrier.lock();
        self.requested.store(false, Ordering::Release);
        self.cv_resume.notify_all();
        drop(guard);
    }
}

#[must_use]
pub struct SuspendGuard<'a> {
    safepoint: &'a GlobalSafepoint,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.resume_all();
    }
}

/// Restores the thread's previous state when dropped.
pub struct ThreadStateGuard<'a> {
    safepoint: &'a GlobalSafepoint,
    record: &'a ThreadRecord,
    old: ThreadState,
}

impl<'a> ThreadStateGuard<'a> {
    pub(crate) fn enter(
        safepoint: &'a GlobalSafepoint,
        record: &'a ThreadRecord,
        state: ThreadState,
    ) -> Self {
        let old = safepoint.transition(record, state);
        Self {
            safepoint,
            record,
            old,
        }
    }
}

impl Drop for ThreadStateGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.transition(self.record, self.old);
    }
}

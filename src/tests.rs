use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::heap_source::utilization_target;
use crate::*;

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

// Test object layout, in words: tag, slot count, referent, slots...
const TAG: usize = 0;
const SLOTS: usize = 1;
const REFERENT: usize = 2;
const FIRST_SLOT: usize = 3;

const SOFT: usize = 1;
const WEAK: usize = 2;
const PHANTOM: usize = 3;
const KIND_MASK: usize = 0b11;
const OVERRIDES_CLEAR: usize = 1 << 2;
const HAS_QUEUE: usize = 1 << 3;
const FAILS: usize = 1 << 4;
const PANICS: usize = 1 << 5;
const STALLS: usize = 1 << 6;
const REENTERS: usize = 1 << 7;
const KEEPS_REFERENT: usize = 1 << 8;
const ID_SHIFT: u32 = 16;

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<(HeapCall, usize)>>,
    oom_calls: AtomicUsize,
    oom_allocates: AtomicBool,
    stall: AtomicBool,
    stalled: AtomicBool,
    reentry: Mutex<Option<FatalError>>,
}

#[derive(Clone, Default)]
struct TestModel(Arc<Shared>);

impl TestModel {
    fn events(&self) -> Vec<(HeapCall, usize)> {
        self.0.events.lock().clone()
    }

    fn count(&self, call: HeapCall, id: usize) -> usize {
        self.0
            .events
            .lock()
            .iter()
            .filter(|&&e| e == (call, id))
            .count()
    }
}

fn tag(obj: ObjectRef) -> usize {
    unsafe { obj.read_word(TAG) }
}

impl ObjectModel for TestModel {
    fn trace(&self, obj: ObjectRef, visitor: &mut dyn Visitor) {
        let slots = unsafe { obj.read_word(SLOTS) };
        for i in 0..slots {
            if let Some(child) = unsafe { obj.read_ref(FIRST_SLOT + i) } {
                visitor.visit(child);
            }
        }
    }

    fn reference_kind(&self, obj: ObjectRef) -> Option<ReferenceKind> {
        match tag(obj) & KIND_MASK {
            SOFT => Some(ReferenceKind::Soft),
            WEAK => Some(ReferenceKind::Weak),
            PHANTOM => Some(ReferenceKind::Phantom),
            _ => None,
        }
    }

    fn referent(&self, reference: ObjectRef) -> Option<ObjectRef> {
        unsafe { reference.read_ref(REFERENT) }
    }

    fn clear_referent(&self, reference: ObjectRef) {
        unsafe { reference.write_ref(REFERENT, None) }
    }

    fn has_queue(&self, reference: ObjectRef) -> bool {
        tag(reference) & HAS_QUEUE != 0
    }

    fn overrides_clear(&self, reference: ObjectRef) -> bool {
        tag(reference) & OVERRIDES_CLEAR != 0
    }

    fn invoke(&self, mutator: &Mutator, call: HeapCall, obj: ObjectRef) -> Result<(), CallbackError> {
        let tag = tag(obj);
        self.0.events.lock().push((call, tag >> ID_SHIFT));
        match call {
            HeapCall::Clear => {
                if tag & KEEPS_REFERENT == 0 {
                    self.clear_referent(obj);
                }
            }
            HeapCall::Enqueue => {}
            HeapCall::Finalize => {
                if tag & STALLS != 0 {
                    self.0.stalled.store(true, Ordering::SeqCst);
                    while self.0.stall.load(Ordering::SeqCst) {
                        mutator.safepoint();
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                if tag & REENTERS != 0 {
                    let result = catch_unwind(AssertUnwindSafe(|| mutator.run_finalization_sync()));
                    if let Err(payload) = result {
                        *self.0.reentry.lock() = fatal_payload(&*payload).cloned();
                    }
                }
                if tag & PANICS != 0 {
                    panic!("finalizer of #{} panicked", tag >> ID_SHIFT);
                }
                if tag & FAILS != 0 {
                    return Err(CallbackError::new("finalizer failed"));
                }
            }
        }
        Ok(())
    }

    fn throw_out_of_memory(&self, mutator: &Mutator, _size: usize) {
        self.0.oom_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.oom_allocates.load(Ordering::SeqCst) {
            let _ = mutator.allocate(1 << 40, AllocFlags::DONT_TRACK);
        }
    }

    fn describe(&self, obj: ObjectRef) -> String {
        format!("Obj#{}", tag(obj) >> ID_SHIFT)
    }
}

struct TestVm {
    heap: Heap,
    roots: GlobalRoots,
    model: TestModel,
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn vm(config: Config) -> TestVm {
    init_logging();
    let model = TestModel::default();
    let heap = Heap::new(config, model.clone()).unwrap();
    let roots = GlobalRoots::new("test globals");
    heap.add_root_provider(roots.clone());
    TestVm { heap, roots, model }
}

fn small_config() -> Config {
    Config::default()
        .with_start_size(1 * MB)
        .with_maximum_size(8 * MB)
        .with_worker(false)
}

/// Untracked object with `slots` reference slots.
fn alloc_object(m: &Mutator, id: usize, extra: usize, slots: usize, flags: AllocFlags) -> ObjectRef {
    let obj = m
        .allocate((FIRST_SLOT + slots) * 8, flags | AllocFlags::DONT_TRACK)
        .unwrap();
    unsafe {
        obj.write_word(TAG, (id << ID_SHIFT) | extra);
        obj.write_word(SLOTS, slots);
    }
    obj
}

/// Untracked reference object with a null referent.
fn alloc_reference(m: &Mutator, id: usize, kind: usize) -> ObjectRef {
    alloc_object(m, id, kind, 0, AllocFlags::DEFAULT)
}

fn set_referent(reference: ObjectRef, referent: ObjectRef) {
    unsafe { reference.write_ref(REFERENT, Some(referent)) }
}

fn set_slot(obj: ObjectRef, slot: usize, value: ObjectRef) {
    unsafe { obj.write_ref(FIRST_SLOT + slot, Some(value)) }
}

/// Untracked, all-zero object of `size` bytes. Traces as empty.
fn alloc_blob(m: &Mutator, size: usize) -> Result<ObjectRef, HeapError> {
    m.allocate(size, AllocFlags::DONT_TRACK)
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn allocations_are_zeroed_and_valid() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let obj = m.allocate(100, AllocFlags::DEFAULT).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(obj.as_ptr(), 100) };
    assert!(bytes.iter().all(|&b| b == 0));
    assert!(vm.heap.is_valid_object(obj));
    assert!(m.is_valid_object(obj));
    assert!(vm.heap.object_size_in_heap(obj) >= 100);

    let inside = ObjectRef::from_addr(obj.addr() + 8).unwrap();
    assert!(!vm.heap.is_valid_object(inside));
    let misaligned = ObjectRef::from_addr(obj.addr() + 1).unwrap();
    assert!(!vm.heap.is_valid_object(misaligned));
    assert_eq!(vm.heap.object_size_in_heap(ObjectRef::from_addr(0x1000).unwrap()), 0);
}

#[test]
fn unreachable_objects_are_swept() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let objs: Vec<_> = (0..100)
        .map(|i| alloc_object(&m, i, 0, 1, AllocFlags::DEFAULT))
        .collect();
    // Root every tenth object; each keeps its successor alive.
    for (i, &obj) in objs.iter().enumerate() {
        if i % 10 == 0 {
            vm.roots.push(obj);
            set_slot(obj, 0, objs[i + 1]);
        }
    }
    m.collect(false);

    for (i, &obj) in objs.iter().enumerate() {
        assert_eq!(vm.heap.is_valid_object(obj), i % 10 <= 1, "object {}", i);
    }
    let stats = vm.heap.statistics();
    assert_eq!(stats.total_gc_cycles_count, 1);
    assert_eq!(stats.total_objects_freed, 80);
    assert_eq!(vm.heap.value(HeapValue::ObjectsAllocated), 20);
}

#[test]
fn tracked_allocations_survive_until_released() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let obj = m.allocate(64, AllocFlags::DEFAULT).unwrap();
    assert_eq!(m.tracked_alloc_count(), 1);
    m.collect(false);
    assert!(vm.heap.is_valid_object(obj));

    m.clear_alloc_flags(obj, AllocFlags::DONT_TRACK);
    assert_eq!(m.tracked_alloc_count(), 0);
    m.collect(false);
    assert!(!vm.heap.is_valid_object(obj));
}

#[test]
fn non_collectable_objects_are_rooted_until_cleared() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let obj = m.allocate(64, AllocFlags::NO_GC).unwrap();
    assert_eq!(m.tracked_alloc_count(), 0);
    m.collect(true);
    assert!(vm.heap.is_valid_object(obj));

    m.clear_alloc_flags(obj, AllocFlags::NO_GC);
    m.collect(true);
    assert!(!vm.heap.is_valid_object(obj));

    // Clearing the flag of something the heap no longer owns is harmless.
    m.clear_alloc_flags(obj, AllocFlags::NO_GC);
}

#[test]
fn missing_non_collectable_entry_is_fatal() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let obj = m.allocate(64, AllocFlags::DEFAULT).unwrap();
    let payload = catch_unwind(AssertUnwindSafe(|| {
        m.clear_alloc_flags(obj, AllocFlags::NO_GC)
    }))
    .unwrap_err();
    assert_eq!(
        fatal_payload(&*payload),
        Some(&FatalError::MissingNonCollectableEntry { addr: obj.addr() })
    );
}

#[test]
fn huge_allocation_fails_without_collecting() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let err = m.allocate(8 * MB, AllocFlags::DEFAULT).unwrap_err();
    assert!(matches!(
        err,
        HeapError::OutOfMemory {
            size,
            prebuilt: false
        } if size == 8 * MB
    ));
    assert!(err.is_out_of_memory());
    assert_eq!(vm.model.0.oom_calls.load(Ordering::SeqCst), 1);
    assert_eq!(vm.heap.statistics().total_gc_cycles_count, 0);
}

#[test]
fn nested_out_of_memory_uses_prebuilt_error() {
    let vm = vm(small_config());
    vm.model.0.oom_allocates.store(true, Ordering::SeqCst);
    let m = vm.heap.attach_current_thread("main");
    let err = m.allocate(16 * MB, AllocFlags::DEFAULT).unwrap_err();
    assert!(matches!(err, HeapError::OutOfMemory { prebuilt: true, .. }));
    // The nested failure must not ask the VM to report again.
    assert_eq!(vm.model.0.oom_calls.load(Ordering::SeqCst), 1);

    vm.model.0.oom_allocates.store(false, Ordering::SeqCst);
    let err = m.allocate(16 * MB, AllocFlags::DEFAULT).unwrap_err();
    assert!(matches!(err, HeapError::OutOfMemory { prebuilt: false, .. }));
}

#[test]
fn soft_references_are_cleared_before_out_of_memory() {
    let vm = vm(Config::default()
        .with_start_size(1 * MB)
        .with_maximum_size(4 * MB)
        .with_worker(false));
    let m = vm.heap.attach_current_thread("main");

    let soft = alloc_reference(&m, 1, SOFT);
    vm.roots.push(soft);
    let referent = alloc_blob(&m, 256 * KB).unwrap();
    set_referent(soft, referent);

    let mut failed = false;
    for _ in 0..256 {
        match alloc_blob(&m, 64 * KB) {
            Ok(obj) => vm.roots.push(obj),
            Err(err) => {
                assert!(matches!(err, HeapError::OutOfMemory { .. }));
                failed = true;
                break;
            }
        }
    }
    assert!(failed);
    assert_eq!(vm.model.referent(soft), None);
    assert!(vm.heap.statistics().total_gc_cycles_count >= 2);
}

#[test]
fn weak_reference_is_cleared_then_enqueued() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let weak = alloc_reference(&m, 1, WEAK | HAS_QUEUE);
    vm.roots.push(weak);
    let referent = alloc_object(&m, 2, 0, 0, AllocFlags::DEFAULT);
    set_referent(weak, referent);

    m.collect(false);
    assert_eq!(vm.model.referent(weak), None);
    assert!(!vm.heap.is_valid_object(referent));
    assert_eq!(vm.heap.pending_work(), (0, 1));
    assert!(vm.model.events().is_empty());

    m.run_finalization_sync();
    assert_eq!(vm.model.events(), vec![(HeapCall::Enqueue, 1)]);
    assert_eq!(vm.heap.pending_work(), (0, 0));
}

#[test]
fn soft_references_survive_ordinary_collections() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let soft = alloc_reference(&m, 1, SOFT);
    vm.roots.push(soft);
    let referent = alloc_object(&m, 2, 0, 0, AllocFlags::DEFAULT);
    set_referent(soft, referent);

    m.collect(false);
    assert_eq!(vm.model.referent(soft), Some(referent));
    assert!(vm.heap.is_valid_object(referent));

    m.collect(true);
    assert_eq!(vm.model.referent(soft), None);
    assert!(!vm.heap.is_valid_object(referent));
}

fn live_referents(model: &TestModel, refs: &[ObjectRef]) -> usize {
    refs.iter().filter(|&&r| model.referent(r).is_some()).count()
}

#[test]
fn soft_references_survive_repeated_collections_after_growth() {
    let vm = vm(Config::default()
        .with_start_size(1 * MB)
        .with_maximum_size(16 * MB)
        .with_worker(false));
    let m = vm.heap.attach_current_thread("main");
    let grow = |blobs: usize| {
        for _ in 0..blobs {
            vm.roots.push(alloc_blob(&m, 64 * KB).unwrap());
        }
        m.collect(false);
        m.collect(false);
    };
    grow(32);

    let mut softs = Vec::new();
    for id in 0..8 {
        let soft = alloc_reference(&m, id, SOFT);
        vm.roots.push(soft);
        set_referent(soft, alloc_object(&m, 100 + id, 0, 0, AllocFlags::DEFAULT));
        softs.push(soft);
    }
    m.collect(false);
    let survivors = live_referents(&vm.model, &softs);
    for _ in 0..3 {
        m.collect(false);
        assert_eq!(live_referents(&vm.model, &softs), survivors);
    }

    // Growing again clears some of them once, then the rest are kept.
    grow(64);
    let after_growth = live_referents(&vm.model, &softs);
    assert!(after_growth < survivors);
    for _ in 0..3 {
        m.collect(false);
        assert_eq!(live_referents(&vm.model, &softs), after_growth);
    }
}

#[test]
fn drained_reference_is_processed_again() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    // clear() runs but leaves the referent in place.
    let weak = alloc_reference(&m, 1, WEAK | OVERRIDES_CLEAR | KEEPS_REFERENT);
    vm.roots.push(weak);
    let referent = alloc_object(&m, 2, 0, 0, AllocFlags::DEFAULT);
    set_referent(weak, referent);

    m.collect(false);
    m.run_finalization_sync();
    assert_eq!(vm.model.count(HeapCall::Clear, 1), 1);
    assert_eq!(vm.heap.pending_work(), (0, 0));

    m.collect(false);
    assert_eq!(vm.heap.pending_work(), (0, 1));
    m.run_finalization_sync();
    assert_eq!(vm.model.count(HeapCall::Clear, 1), 2);
    assert!(vm.heap.is_valid_object(referent));
}

#[test]
fn overriding_clear_keeps_referent_until_it_runs() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let weak = alloc_reference(&m, 1, WEAK | OVERRIDES_CLEAR);
    vm.roots.push(weak);
    let referent = alloc_object(&m, 2, 0, 0, AllocFlags::DEFAULT);
    set_referent(weak, referent);

    m.collect(false);
    assert_eq!(vm.model.referent(weak), Some(referent));
    // Still scheduled, so another collection must neither free the referent
    // nor schedule the reference twice.
    m.collect(false);
    assert!(vm.heap.is_valid_object(referent));
    assert_eq!(vm.heap.pending_work(), (0, 1));

    m.run_finalization_sync();
    assert_eq!(vm.model.events(), vec![(HeapCall::Clear, 1)]);
    m.collect(false);
    assert!(!vm.heap.is_valid_object(referent));
}

#[test]
fn reference_callbacks_run_in_order() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let mut rng = StdRng::seed_from_u64(0x5ab1e);

    let mut pairs = Vec::new();
    for i in 0..64 {
        let kind = rng.gen_range(SOFT..=PHANTOM);
        let mut extra = 0;
        if rng.gen_bool(0.5) {
            extra |= HAS_QUEUE;
        }
        if kind != PHANTOM && rng.gen_bool(0.5) {
            extra |= OVERRIDES_CLEAR;
        }
        let ref_id = 1000 + i;
        let reference = alloc_reference(&m, ref_id, kind | extra);
        vm.roots.push(reference);
        let referent = alloc_object(&m, i, 0, 0, AllocFlags::FINALIZABLE);
        set_referent(reference, referent);
        pairs.push((kind, extra, ref_id, i));
    }

    for _ in 0..3 {
        m.collect(true);
        m.run_finalization_sync();
    }

    let events = vm.model.events();
    let pos = |call: HeapCall, id: usize| events.iter().position(|&e| e == (call, id));
    for (kind, extra, ref_id, referent_id) in pairs {
        assert_eq!(vm.model.count(HeapCall::Finalize, referent_id), 1);
        let finalized = pos(HeapCall::Finalize, referent_id).unwrap();
        let cleared = pos(HeapCall::Clear, ref_id);
        let enqueued = pos(HeapCall::Enqueue, ref_id);
        assert_eq!(enqueued.is_some(), extra & HAS_QUEUE != 0, "ref {}", ref_id);
        assert!(vm.model.count(HeapCall::Enqueue, ref_id) <= 1);
        if kind == PHANTOM {
            assert!(cleared.is_none());
            if let Some(enqueued) = enqueued {
                assert!(finalized < enqueued, "ref {}", ref_id);
            }
            continue;
        }
        assert_eq!(cleared.is_some(), extra & OVERRIDES_CLEAR != 0, "ref {}", ref_id);
        if let (Some(cleared), Some(enqueued)) = (cleared, enqueued) {
            assert!(cleared < enqueued, "ref {}", ref_id);
        }
        if let Some(cleared) = cleared {
            assert!(cleared < finalized, "ref {}", ref_id);
        }
        if let Some(enqueued) = enqueued {
            assert!(enqueued < finalized, "ref {}", ref_id);
        }
    }
}

#[test]
fn combined_alloc_flags_root_then_finalize() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let flags = AllocFlags::NO_GC | AllocFlags::FINALIZABLE;
    assert!(flags.contains(AllocFlags::FINALIZABLE));
    assert!(!flags.contains(AllocFlags::DONT_TRACK));
    assert_eq!(AllocFlags::DEFAULT, AllocFlags::empty());

    let obj = m.allocate(FIRST_SLOT * 8, flags).unwrap();
    unsafe { obj.write_word(TAG, 1 << ID_SHIFT) };
    assert_eq!(m.tracked_alloc_count(), 0);
    m.collect(false);
    assert!(vm.heap.is_valid_object(obj));
    assert_eq!(vm.heap.pending_work(), (0, 0));

    m.clear_alloc_flags(obj, AllocFlags::NO_GC);
    m.collect(false);
    assert_eq!(vm.heap.pending_work(), (1, 0));
    m.run_finalization_sync();
    assert_eq!(vm.model.count(HeapCall::Finalize, 1), 1);
}

#[test]
fn callback_failures_are_swallowed() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    alloc_object(&m, 1, FAILS, 0, AllocFlags::FINALIZABLE);
    alloc_object(&m, 2, PANICS, 0, AllocFlags::FINALIZABLE);
    alloc_object(&m, 3, 0, 0, AllocFlags::FINALIZABLE);
    m.collect(false);
    assert_eq!(vm.heap.pending_work(), (3, 0));

    m.run_finalization_sync();
    for id in 1..=3 {
        assert_eq!(vm.model.count(HeapCall::Finalize, id), 1);
    }
    assert_eq!(vm.heap.pending_work(), (0, 0));
    assert_eq!(m.tracked_alloc_count(), 0);

    // Finalized objects are ordinary garbage from now on.
    m.collect(false);
    assert_eq!(vm.heap.value(HeapValue::ObjectsAllocated), 0);
}

#[test]
fn worker_thread_runs_finalizers() {
    let vm = vm(Config::default().with_start_size(1 * MB).with_maximum_size(8 * MB));
    let m = vm.heap.attach_current_thread("main");
    for id in 0..32 {
        alloc_object(&m, id, 0, 0, AllocFlags::FINALIZABLE);
    }
    m.collect(false);
    m.run_finalization_sync();
    for id in 0..32 {
        assert_eq!(vm.model.count(HeapCall::Finalize, id), 1);
    }
    assert_eq!(vm.heap.pending_work(), (0, 0));
    vm.heap.signal_worker();
    vm.heap.wait_for_worker_idle();
}

#[test]
fn work_queued_during_idle_trim_still_runs() {
    let vm = vm(Config::default()
        .with_start_size(1 * MB)
        .with_maximum_size(8 * MB)
        .with_trim_delay(Duration::from_secs(60)));
    let m = vm.heap.attach_current_thread("main");
    alloc_object(&m, 1, 0, 0, AllocFlags::FINALIZABLE);

    // Hold the heap lock across the trim deadline so the worker is stuck
    // waiting for it, then collect. The collection queues the finalizer and
    // pushes the next trim a minute out.
    {
        let mut guard = m.heap.lock_heap();
        {
            let (_, token) = guard.parts();
            m.heap.worker.lock(&token).schedule_trim(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(100));
        m.heap.collect_locked(&mut guard, &m, false);
    }
    wait_for("finalizer", || vm.model.count(HeapCall::Finalize, 1) == 1);
    vm.heap.wait_for_worker_idle();
    assert_eq!(vm.heap.pending_work(), (0, 0));
}

#[test]
fn run_finalization_sync_from_worker_is_fatal() {
    let vm = vm(Config::default().with_start_size(1 * MB).with_maximum_size(8 * MB));
    let m = vm.heap.attach_current_thread("main");
    alloc_object(&m, 1, REENTERS, 0, AllocFlags::FINALIZABLE);
    m.collect(false);
    m.run_finalization_sync();
    assert_eq!(vm.model.count(HeapCall::Finalize, 1), 1);
    assert_eq!(*vm.model.0.reentry.lock(), Some(FatalError::WorkerReentry));
}

fn watchdog_config() -> Config {
    Config::default()
        .with_start_size(1 * MB)
        .with_maximum_size(8 * MB)
        .with_watchdog_timeout(Duration::from_millis(50))
}

#[test]
fn wedged_worker_is_fatal() {
    let vm = vm(watchdog_config());
    let m = vm.heap.attach_current_thread("main");
    vm.model.0.stall.store(true, Ordering::SeqCst);
    alloc_object(&m, 7, STALLS, 0, AllocFlags::FINALIZABLE);
    m.collect(false);
    wait_for("the finalizer to stall", || vm.model.0.stalled.load(Ordering::SeqCst));
    std::thread::sleep(Duration::from_millis(120));

    let payload = catch_unwind(AssertUnwindSafe(|| m.collect(false))).unwrap_err();
    assert!(matches!(
        fatal_payload(&*payload),
        Some(FatalError::WorkerWedged {
            call: HeapCall::Finalize,
            ..
        })
    ));
    vm.model.0.stall.store(false, Ordering::SeqCst);
}

#[test]
fn debugger_suppresses_watchdog() {
    let vm = vm(watchdog_config());
    let m = vm.heap.attach_current_thread("main");
    vm.model.0.stall.store(true, Ordering::SeqCst);
    alloc_object(&m, 7, STALLS, 0, AllocFlags::FINALIZABLE);
    m.collect(false);
    wait_for("the finalizer to stall", || vm.model.0.stalled.load(Ordering::SeqCst));

    vm.heap.set_debugger_active(true);
    std::thread::sleep(Duration::from_millis(120));
    m.collect(false);
    assert_eq!(vm.heap.statistics().total_gc_cycles_count, 2);

    vm.heap.set_debugger_active(false);
    vm.model.0.stall.store(false, Ordering::SeqCst);
    m.run_finalization_sync();
    assert_eq!(vm.model.count(HeapCall::Finalize, 7), 1);
}

#[test]
fn heap_grows_and_shrinks_with_live_size() {
    let vm = vm(Config::default()
        .with_start_size(2 * MB)
        .with_maximum_size(16 * MB)
        .with_worker(false));
    let m = vm.heap.attach_current_thread("main");
    for _ in 0..96 {
        let obj = alloc_blob(&m, 64 * KB).unwrap();
        vm.roots.push(obj);
    }
    m.collect(false);
    let live = vm.heap.value(HeapValue::BytesAllocated);
    assert!(live >= 6 * MB);
    assert_eq!(vm.heap.ideal_footprint(), utilization_target(live, 512));
    assert!(vm.heap.statistics().soft_limit.is_none());

    vm.roots.truncate(16);
    m.collect(false);
    let live = vm.heap.value(HeapValue::BytesAllocated);
    assert!(live < 2 * MB);
    let ideal = vm.heap.ideal_footprint();
    assert_eq!(ideal, utilization_target(live, 512));
    let stats = vm.heap.statistics();
    let soft_limit = stats.soft_limit.unwrap();
    assert!(soft_limit <= ideal);
    assert!(stats.arenas[0].footprint > ideal);
    assert!(stats.arenas[0].allowed_footprint >= stats.arenas[0].footprint);
    assert!(ideal <= stats.absolute_max_size);
}

#[test]
fn external_allocation_collects_under_pressure() {
    let vm = vm(Config::default()
        .with_start_size(2 * MB)
        .with_maximum_size(8 * MB)
        .with_worker(false));
    let m = vm.heap.attach_current_thread("main");
    for _ in 0..80 {
        let obj = alloc_blob(&m, 64 * KB).unwrap();
        vm.roots.push(obj);
    }
    vm.roots.clear();
    let cycles = vm.heap.statistics().total_gc_cycles_count;

    m.track_external_allocation(4 * MB).unwrap();
    assert!(vm.heap.statistics().total_gc_cycles_count >= cycles + 1);
    assert_eq!(vm.heap.value(HeapValue::ExternalBytesAllocated), 4 * MB);
    assert!(vm.heap.value(HeapValue::ExternalLimit) >= 4 * MB);
    // The heap keeps working with the external bytes charged against it.
    assert!(alloc_blob(&m, 64 * KB).is_ok());

    assert!(matches!(
        m.track_external_allocation(16 * MB),
        Err(HeapError::ExternalAllocationTooLarge { .. })
    ));
    m.track_external_free(4 * MB);
    assert_eq!(vm.heap.value(HeapValue::ExternalBytesAllocated), 0);
}

#[test]
fn zygote_arenas_are_split_around_fork() {
    let vm = vm(Config::default()
        .with_start_size(1 * MB)
        .with_maximum_size(16 * MB)
        .with_zygote(true));
    let m = vm.heap.attach_current_thread("main");
    let before = alloc_object(&m, 1, 0, 0, AllocFlags::DEFAULT);
    vm.roots.push(before);
    alloc_object(&m, 2, 0, 0, AllocFlags::FINALIZABLE);
    // No worker in zygote mode; pending work runs on the caller.
    m.collect(false);
    m.run_finalization_sync();
    assert_eq!(vm.model.count(HeapCall::Finalize, 2), 1);

    assert!(vm.heap.startup_before_fork().unwrap());
    assert!(!vm.heap.startup_before_fork().unwrap());
    let forked = alloc_object(&m, 3, 0, 0, AllocFlags::DEFAULT);
    vm.roots.push(forked);
    assert!(vm.heap.is_allocated_in_zygote(before));
    assert!(!vm.heap.is_allocated_in_zygote(forked));
    assert_eq!(vm.heap.statistics().arenas.len(), 2);

    vm.heap.startup_after_zygote().unwrap();
    assert_eq!(vm.heap.per_arena_values(HeapValue::Footprint).len(), 3);
    let child = alloc_object(&m, 4, 0, 0, AllocFlags::DEFAULT);
    assert!(!vm.heap.is_allocated_in_zygote(child));
    assert!(vm.heap.is_allocated_in_zygote(forked));
    vm.heap.wait_for_worker_idle();

    vm.roots.remove(before);
    m.collect(false);
    assert!(!vm.heap.is_valid_object(before));
    assert!(vm.heap.is_valid_object(forked));
}

#[test]
fn worker_trims_after_collection() {
    let vm = vm(Config::default()
        .with_start_size(1 * MB)
        .with_maximum_size(8 * MB)
        .with_trim_delay(Duration::from_millis(10)));
    let m = vm.heap.attach_current_thread("main");
    for _ in 0..8 {
        alloc_blob(&m, 64 * KB).unwrap();
    }
    m.collect(false);
    assert!(vm.heap.value(HeapValue::Footprint) > 0);
    wait_for("the idle trim", || vm.heap.value(HeapValue::Footprint) == 0);
}

#[test]
fn cancelled_trim_does_not_run() {
    let vm = vm(Config::default()
        .with_start_size(1 * MB)
        .with_maximum_size(8 * MB)
        .with_trim_delay(Duration::from_millis(200)));
    let m = vm.heap.attach_current_thread("main");
    for _ in 0..8 {
        alloc_blob(&m, 64 * KB).unwrap();
    }
    m.collect(false);
    vm.heap.schedule_trim(Duration::ZERO);
    let footprint = vm.heap.value(HeapValue::Footprint);
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(vm.heap.value(HeapValue::Footprint), footprint);

    let stats = vm.heap.trim();
    assert_eq!(stats.per_arena.len(), 1);
    assert_eq!(vm.heap.value(HeapValue::Footprint), 0);
}

#[test]
fn mutators_allocate_concurrently() {
    let vm = vm(Config::default()
        .with_start_size(256 * KB)
        .with_maximum_size(8 * MB));
    let heap = &vm.heap;
    std::thread::scope(|scope| {
        for t in 0..4 {
            scope.spawn(move || {
                let m = heap.attach_current_thread(&format!("mutator-{}", t));
                let mut kept = Vec::new();
                for i in 0..400 {
                    // Tracked allocations stay alive; every other one is dropped.
                    let obj = m.allocate(1 * KB, AllocFlags::DEFAULT).unwrap();
                    if i % 2 == 0 {
                        kept.push(obj);
                    } else {
                        m.release_tracked_alloc(obj);
                    }
                    m.safepoint();
                }
                for &obj in &kept {
                    assert!(m.is_valid_object(obj));
                }
                assert_eq!(m.tracked_alloc_count(), kept.len());
            });
        }
    });
    assert!(vm.heap.statistics().total_gc_cycles_count > 0);
}

#[test]
fn attaching_twice_is_fatal() {
    let vm = vm(small_config());
    let _m = vm.heap.attach_current_thread("main");
    let payload = catch_unwind(AssertUnwindSafe(|| {
        vm.heap.attach_current_thread("again");
    }))
    .unwrap_err();
    assert!(matches!(
        fatal_payload(&*payload),
        Some(FatalError::ThreadAlreadyAttached { .. })
    ));
}

#[test]
fn allocation_profile_counts_per_thread_and_globally() {
    let vm = vm(small_config().with_alloc_profiling(true));
    let m = vm.heap.attach_current_thread("main");
    for _ in 0..3 {
        m.allocate(100, AllocFlags::DEFAULT).unwrap();
    }
    assert!(m.allocate(8 * MB, AllocFlags::DEFAULT).is_err());
    m.track_external_allocation(64 * KB).unwrap();

    let profile = m.alloc_profile();
    assert_eq!(profile.alloc_count, 3);
    assert_eq!(profile.alloc_size, 300);
    assert_eq!(profile.failed_alloc_count, 1);
    assert_eq!(profile.external_alloc_count, 1);
    assert_eq!(vm.heap.alloc_profile(), profile);

    vm.heap.set_alloc_profiling(false);
    m.allocate(100, AllocFlags::DEFAULT).unwrap();
    assert_eq!(m.alloc_profile().alloc_count, 3);
}

#[test]
fn tuning_knobs_are_clamped() {
    let vm = vm(small_config());
    vm.heap.set_target_utilization(0.95);
    assert!((vm.heap.target_utilization() - 0.8).abs() < 0.01);
    vm.heap.set_target_utilization(0.5);

    assert_eq!(vm.heap.set_minimum_heap_size(6 * MB), 0);
    assert_eq!(vm.heap.minimum_heap_size(), 6 * MB);
    assert!(vm.heap.ideal_footprint() >= 6 * MB);
    assert_eq!(vm.heap.set_minimum_heap_size(64 * MB), 6 * MB);
    assert_eq!(vm.heap.minimum_heap_size(), 8 * MB);
}

#[test]
fn bitmaps_can_be_snapshotted_and_swapped() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let obj = alloc_object(&m, 1, 0, 0, AllocFlags::DEFAULT);
    vm.roots.push(obj);

    let mut copies: Vec<_> = vm
        .heap
        .object_bitmaps()
        .iter()
        .map(|bitmap| Arc::new(bitmap.snapshot().unwrap()))
        .collect();
    assert_eq!(copies[0].count(), 1);
    assert!(vm.heap.replace_object_bitmaps(&mut copies));
    assert!(vm.heap.is_valid_object(obj));
    assert!(!vm.heap.replace_object_bitmaps(&mut copies[..0]));

    m.collect(false);
    assert!(vm.heap.is_valid_object(obj));
}

#[test]
fn walk_and_statistics_describe_the_heap() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    for i in 0..10 {
        let obj = alloc_object(&m, i, 0, 0, AllocFlags::DEFAULT);
        vm.roots.push(obj);
    }
    let mut used = 0;
    vm.heap.walk(|_, _, in_use| {
        if in_use {
            used += 1;
        }
    });
    assert_eq!(used, 10);

    let stats = vm.heap.statistics();
    assert_eq!(stats.arenas[0].objects_allocated, 10);
    assert!(stats.arenas[0].bitmap_size > 0);
    let text = stats.to_string();
    assert!(text.contains("Arena #0 (sable-heap)"));
}

#[cfg(feature = "object-headers")]
#[test]
fn birth_generation_follows_collections() {
    let vm = vm(small_config());
    let m = vm.heap.attach_current_thread("main");
    let first = alloc_object(&m, 1, 0, 0, AllocFlags::DEFAULT);
    vm.roots.push(first);
    m.collect(false);
    let second = alloc_object(&m, 2, 0, 0, AllocFlags::DEFAULT);
    assert_eq!(vm.heap.birth_generation(first), Some(0));
    assert_eq!(vm.heap.birth_generation(second), Some(1));
}

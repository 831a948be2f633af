//! The boundary between the heap and the VM's object layout.
//!
//! The heap hands out zeroed chunks and never interprets their contents. Everything
//! it needs to know about an object (its outgoing references, whether it is a
//! soft/weak/phantom reference, how to run its `finalize`/`clear`/`enqueue`
//! methods) is asked of the VM through [`ObjectModel`].

use std::fmt;
use std::ptr::NonNull;

use crate::error::CallbackError;
use crate::mutator::Mutator;

/// Address of an allocated object's payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<u8>);

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(Self)
    }

    /// # Safety
    /// `addr` must be non-zero.
    pub unsafe fn from_addr_unchecked(addr: usize) -> Self {
        Self(NonNull::new_unchecked(addr as *mut u8))
    }

    pub fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// # Safety
    /// The object must be live and at least `(index + 1) * 8` bytes long.
    #[inline]
    pub unsafe fn read_word(self, index: usize) -> usize {
        self.0.as_ptr().cast::<usize>().add(index).read()
    }

    /// # Safety
    /// See [`ObjectRef::read_word`].
    #[inline]
    pub unsafe fn write_word(self, index: usize, value: usize) {
        self.0.as_ptr().cast::<usize>().add(index).write(value)
    }

    /// # Safety
    /// See [`ObjectRef::read_word`].
    #[inline]
    pub unsafe fn read_ref(self, index: usize) -> Option<ObjectRef> {
        ObjectRef::from_addr(self.read_word(index))
    }

    /// # Safety
    /// See [`ObjectRef::read_word`].
    #[inline]
    pub unsafe fn write_ref(self, index: usize, value: Option<ObjectRef>) {
        self.write_word(index, value.map_or(0, |obj| obj.addr()))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.0.as_ptr())
    }
}

impl fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0.as_ptr(), f)
    }
}

/// Kind of a `java.lang.ref.Reference`-style object, in decreasing order of
/// reachability strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Phantom,
}

/// A method the heap worker invokes on an object outside the collection pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapCall {
    Finalize,
    Clear,
    Enqueue,
}

impl fmt::Display for HeapCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeapCall::Finalize => "finalize()",
            HeapCall::Clear => "clear()",
            HeapCall::Enqueue => "enqueue()",
        })
    }
}

pub trait Visitor {
    fn visit(&mut self, obj: ObjectRef);
}

impl<F: FnMut(ObjectRef)> Visitor for F {
    fn visit(&mut self, obj: ObjectRef) {
        self(obj)
    }
}

/// Everything the collector needs to know about the VM's objects.
pub trait ObjectModel: Send + Sync + 'static {
    /// Visits every strong reference held by `obj`. For reference objects the
    /// referent field must be skipped; the collector reads it through
    /// [`ObjectModel::referent`].
    ///
    /// Freshly allocated objects are all-zero and must trace as empty.
    fn trace(&self, obj: ObjectRef, visitor: &mut dyn Visitor);

    fn reference_kind(&self, _obj: ObjectRef) -> Option<ReferenceKind> {
        None
    }

    fn referent(&self, _reference: ObjectRef) -> Option<ObjectRef> {
        None
    }

    /// Nulls out the referent field without running any VM code.
    fn clear_referent(&self, _reference: ObjectRef) {}

    /// Whether the reference was registered with a queue and needs `enqueue()`.
    fn has_queue(&self, _reference: ObjectRef) -> bool {
        false
    }

    /// Whether the reference's class overrides `clear()`. If so the collector
    /// leaves the referent in place and schedules the call instead.
    fn overrides_clear(&self, _reference: ObjectRef) -> bool {
        false
    }

    /// Runs `call` on `obj`. Errors are logged by the heap worker and dropped.
    fn invoke(
        &self,
        mutator: &Mutator,
        call: HeapCall,
        obj: ObjectRef,
    ) -> Result<(), CallbackError>;

    /// Raises an out-of-memory condition on the calling thread. May allocate;
    /// if that allocation fails as well the heap falls back to the pre-built
    /// error instead of calling this again.
    fn throw_out_of_memory(&self, _mutator: &Mutator, _size: usize) {}

    /// Human readable description used in watchdog diagnostics.
    fn describe(&self, obj: ObjectRef) -> String {
        format!("{:?}", obj)
    }
}

use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::{ObjectRef, Visitor};

/// A source of GC roots outside the heap: VM globals, interpreter frames,
/// JNI reference tables. Walked once per collection while every mutator is
/// suspended.
pub trait RootProvider: Send {
    fn name(&self) -> &str;
    fn visit_roots(&mut self, visitor: &mut dyn Visitor);
}

pub struct RootSet(pub(crate) Mutex<Vec<Box<dyn RootProvider>>>);

impl RootSet {
    pub fn new() -> Self {
        Self(Mutex::new(vec![]))
    }

    pub fn add(&self, provider: impl RootProvider + 'static) {
        self.0.lock().push(Box::new(provider));
    }

    pub fn visit(&self, visitor: &mut dyn Visitor) {
        for provider in self.0.lock().iter_mut() {
            log::trace!("Marking roots of {}", provider.name());
            provider.visit_roots(visitor);
        }
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared, growable list of roots. Clones share the same list, so one copy
/// can be registered with the heap while the VM keeps pushing and removing
/// through another.
#[derive(Clone)]
pub struct GlobalRoots {
    name: Arc<str>,
    roots: Arc<Mutex<Vec<ObjectRef>>>,
}

impl GlobalRoots {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            roots: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn push(&self, obj: ObjectRef) {
        self.roots.lock().push(obj);
    }

    /// Removes one occurrence of `obj`. Returns false if it was not rooted.
    pub fn remove(&self, obj: ObjectRef) -> bool {
        let mut roots = self.roots.lock();
        match roots.iter().rposition(|&o| o == obj) {
            Some(i) => {
                roots.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.roots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ObjectRef> {
        self.roots.lock().clone()
    }

    pub fn truncate(&self, len: usize) {
        self.roots.lock().truncate(len);
    }
}

impl RootProvider for GlobalRoots {
    fn name(&self) -> &str {
        &self.name
    }

    fn visit_roots(&mut self, visitor: &mut dyn Visitor) {
        for &obj in self.roots.lock().iter() {
            visitor.visit(obj);
        }
    }
}

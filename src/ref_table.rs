//! Pending-work tables shared by the allocator, the collector and the heap
//! worker. Every object in a table is a GC root until it is removed.

use std::collections::VecDeque;

use crate::globals::REF_TABLE_MAX;
use crate::object::{ObjectRef, Visitor};

/// Unordered table of objects that must never be collected while registered.
pub struct HeapRefTable {
    entries: Vec<ObjectRef>,
}

impl HeapRefTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Returns false once the table is at its hard limit.
    pub fn add(&mut self, obj: ObjectRef) -> bool {
        if self.entries.len() >= REF_TABLE_MAX {
            return false;
        }
        self.entries.push(obj);
        true
    }

    /// Removes the most recently added entry for `obj`.
    pub fn remove(&mut self, obj: ObjectRef) -> bool {
        match self.entries.iter().rposition(|&o| o == obj) {
            Some(i) => {
                self.entries.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.entries.contains(&obj)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn visit(&self, visitor: &mut dyn Visitor) {
        for &obj in &self.entries {
            visitor.visit(obj);
        }
    }
}

/// FIFO table that can grow well beyond its initial capacity.
pub struct LargeHeapRefTable<T = ObjectRef> {
    entries: VecDeque<T>,
}

impl<T> LargeHeapRefTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends `entry`, returning false once the table is at its hard limit.
    pub fn push(&mut self, entry: T) -> bool {
        if self.entries.len() >= REF_TABLE_MAX {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    /// Removes the oldest entry.
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.iter()
    }

    /// Moves every entry matching `pred` out of the table, preserving the
    /// order of both the removed and the remaining entries.
    pub fn take_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if pred(&entry) {
                taken.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        taken
    }
}

/// Work scheduled on a cleared reference object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceOps {
    pub clear: bool,
    pub enqueue: bool,
}

impl ReferenceOps {
    pub fn is_empty(&self) -> bool {
        !self.clear && !self.enqueue
    }
}

pub type ReferenceOpTable = LargeHeapRefTable<(ObjectRef, ReferenceOps)>;

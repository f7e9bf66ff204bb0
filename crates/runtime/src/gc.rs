//! Garbage collection strategy
//!
//! The VM calls `collect_if_needed` at safe points (every 256
//! instructions) with a walker over the live root set: the operand-stack
//! prefix, each frame's constant pool, and the var roots reachable through
//! the environment. Non-Value slices (code and line/column arrays) are
//! reported through `mark_slice` so an owning FnProto stays accounted
//! while any frame references it.
//!
//! The shipped strategy is the arena collector: values are owned by Rust's
//! reference counting, the bump arena backs mark-phase scratch, and
//! "collection" is accounting that resets the allocation budget. The trait
//! keeps the contract open for a tracing mark-sweep implementation.

use bumpalo::Bump;
use clove_core::value::Value;
use std::cell::{Cell, RefCell};
use tracing::debug;

/// Walks the live roots, invoking the visitor once per root value.
pub trait RootWalker {
    fn walk(&self, visit: &mut dyn FnMut(&Value));
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Bytes accounted since the last collection.
    pub allocated: usize,
    /// Total bytes accounted over the strategy's lifetime.
    pub total_allocated: usize,
    /// Collections run.
    pub collections: usize,
    /// Roots visited during the most recent collection.
    pub last_root_count: usize,
}

pub trait GcStrategy {
    /// Account an allocation of `bytes` for a new value payload.
    fn allocate(&self, bytes: usize);

    /// Account a non-Value slice (code, line/column arrays) as live.
    fn mark_slice(&self, bytes: usize);

    /// Run a collection when the allocation threshold has been crossed.
    /// Returns whether a collection ran.
    fn collect_if_needed(&self, roots: &dyn RootWalker) -> bool;

    fn stats(&self) -> GcStats;
}

/// Default allocation budget between collections.
const DEFAULT_THRESHOLD: usize = 4 * 1024 * 1024;

/// Arena-backed collector: never frees mid-run (reference counting owns
/// the values); memory is reclaimed at teardown. The mark phase walks the
/// roots into arena scratch so the root-set plumbing is exercised exactly
/// as a tracing collector would need it.
pub struct ArenaGc {
    scratch: RefCell<Bump>,
    allocated: Cell<usize>,
    total_allocated: Cell<usize>,
    marked_slices: Cell<usize>,
    threshold: usize,
    collections: Cell<usize>,
    last_root_count: Cell<usize>,
}

impl ArenaGc {
    pub fn new() -> Self {
        ArenaGc::with_threshold(DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        ArenaGc {
            scratch: RefCell::new(Bump::new()),
            allocated: Cell::new(0),
            total_allocated: Cell::new(0),
            marked_slices: Cell::new(0),
            threshold,
            collections: Cell::new(0),
            last_root_count: Cell::new(0),
        }
    }
}

impl Default for ArenaGc {
    fn default() -> Self {
        ArenaGc::new()
    }
}

impl GcStrategy for ArenaGc {
    fn allocate(&self, bytes: usize) {
        self.allocated.set(self.allocated.get() + bytes);
        self.total_allocated.set(self.total_allocated.get() + bytes);
    }

    fn mark_slice(&self, bytes: usize) {
        self.marked_slices.set(self.marked_slices.get() + bytes);
    }

    fn collect_if_needed(&self, roots: &dyn RootWalker) -> bool {
        if self.allocated.get() < self.threshold {
            return false;
        }
        let mut scratch = self.scratch.borrow_mut();
        scratch.reset();
        let mut live = bumpalo::collections::Vec::new_in(&scratch);
        roots.walk(&mut |value| live.push(value.tag()));
        self.last_root_count.set(live.len());
        self.collections.set(self.collections.get() + 1);
        debug!(
            roots = live.len(),
            allocated = self.allocated.get(),
            "gc safe-point collection"
        );
        self.allocated.set(0);
        self.marked_slices.set(0);
        true
    }

    fn stats(&self) -> GcStats {
        GcStats {
            allocated: self.allocated.get(),
            total_allocated: self.total_allocated.get(),
            collections: self.collections.get(),
            last_root_count: self.last_root_count.get(),
        }
    }
}

/// Rough payload sizes used for allocation accounting.
pub fn value_size(value: &Value) -> usize {
    match value {
        Value::Str(s) => s.len() + std::mem::size_of::<Value>(),
        Value::List(l) => l.items.len() * std::mem::size_of::<Value>(),
        Value::Vector(v) => v.items.len() * std::mem::size_of::<Value>(),
        Value::Map(m) => m.entries.len() * 2 * std::mem::size_of::<Value>(),
        Value::Set(s) => s.items.len() * std::mem::size_of::<Value>(),
        _ => std::mem::size_of::<Value>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRoots(Vec<Value>);

    impl RootWalker for FixedRoots {
        fn walk(&self, visit: &mut dyn FnMut(&Value)) {
            for v in &self.0 {
                visit(v);
            }
        }
    }

    #[test]
    fn test_no_collection_below_threshold() {
        let gc = ArenaGc::with_threshold(1024);
        gc.allocate(100);
        assert!(!gc.collect_if_needed(&FixedRoots(vec![])));
        assert_eq!(gc.stats().collections, 0);
        assert_eq!(gc.stats().allocated, 100);
    }

    #[test]
    fn test_collection_when_threshold_crossed() {
        let gc = ArenaGc::with_threshold(64);
        gc.allocate(100);
        let roots = FixedRoots(vec![Value::Int(1), Value::Str("x".into())]);
        assert!(gc.collect_if_needed(&roots));
        let stats = gc.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.last_root_count, 2);
        // budget resets after a collection
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.total_allocated, 100);
    }

    #[test]
    fn test_value_size_scales_with_payload() {
        let small = value_size(&Value::Int(1));
        let big = value_size(&Value::vector(vec![Value::Int(1); 100]));
        assert!(big > small);
    }
}

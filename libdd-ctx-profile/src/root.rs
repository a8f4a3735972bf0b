// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::arena::{self, free_arena_list, ArenaList};
use crate::error::ProfileError;
use crate::node::{ContextNode, Guid, NodeRef, NodeShape, Siblings};
use crate::writer::ProfileWriter;
use core::cell::UnsafeCell;
use core::hash::BuildHasherDefault;
use hashbrown::{HashMap, HashSet};
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use rustc_hash::FxHasher;
use std::sync::atomic::{AtomicU64, Ordering};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Outcome of looking up a callee below a callsite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    Found(NodeRef),
    /// The caller has no such callsite, or its node can't be resolved.
    BadCallsite,
    /// A node for the callee exists but was declared with another shape,
    /// which means the binary and the profile disagree about the function.
    ShapeMismatch,
}

/// The part of a [ContextRoot] only the guard holder may touch.
pub(crate) struct ContextTree {
    arenas: Option<ArenaList>,
    first_node: Option<NodeRef>,
    unhandled: HashMap<Guid, NodeRef, FxBuildHasher>,
    first_unhandled: Option<NodeRef>,
    /// Bumped every time the tree is cleared; node handles from an earlier
    /// generation don't refer to this tree's nodes.
    generation: u64,
}

impl ContextTree {
    fn new() -> Self {
        Self {
            arenas: None,
            first_node: None,
            unhandled: HashMap::default(),
            first_unhandled: None,
            generation: 0,
        }
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn root_node(&self) -> Option<NodeRef> {
        self.first_node
    }

    pub(crate) fn arena_count(&self) -> usize {
        self.arenas.as_ref().map_or(0, ArenaList::len)
    }

    /// Allocates a node, appending a new arena when the current one is full.
    fn allocate_node(
        &mut self,
        guid: Guid,
        shape: NodeShape,
        next: Option<NodeRef>,
        arena_size: usize,
    ) -> NodeRef {
        let size = arena::next_arena_size(shape.alloc_size(), arena_size);
        let arenas = match self.arenas.take() {
            Some(arenas) => self.arenas.insert(arenas),
            None => match ArenaList::new(size) {
                Ok(arenas) => self.arenas.insert(arenas),
                Err(_) => arena::arena_allocation_failed(size),
            },
        };
        if let Some(node) = arenas.try_place_node(guid, shape, next) {
            return node;
        }
        if arenas.allocate_new_arena(size).is_err() {
            arena::arena_allocation_failed(size);
        }
        match arenas.try_place_node(guid, shape, next) {
            Some(node) => node,
            // The fresh arena is at least as big as the node, so this only
            // happens if the handle doesn't fit in 32 bits.
            None => arena::arena_allocation_failed(size),
        }
    }

    /// Returns the root node, creating it on the first entry. `None` if the
    /// existing root node was declared with a different shape.
    pub(crate) fn get_or_create_root_node(
        &mut self,
        guid: Guid,
        shape: NodeShape,
        arena_size: usize,
    ) -> Option<NodeRef> {
        match self.first_node {
            Some(node) => self.matches(node, guid, shape).then_some(node),
            None => {
                let node = self.allocate_node(guid, shape, None, arena_size);
                self.first_node = Some(node);
                Some(node)
            }
        }
    }

    fn matches(&self, node: NodeRef, guid: Guid, shape: NodeShape) -> bool {
        let Some(arenas) = &self.arenas else {
            return false;
        };
        arenas.node_guid(node) == Some(guid) && arenas.node_shape(node) == Some(shape)
    }

    /// Finds the callee `guid` among the nodes hanging off `callsite` of
    /// `parent`, creating it at the head of that list on first visit.
    pub(crate) fn find_or_create_child(
        &mut self,
        parent: NodeRef,
        callsite: u32,
        guid: Guid,
        shape: NodeShape,
        arena_size: usize,
    ) -> Lookup {
        let Some(arenas) = &self.arenas else {
            return Lookup::BadCallsite;
        };
        let Ok(head) = arenas.callsite_head(parent, callsite) else {
            return Lookup::BadCallsite;
        };
        for candidate in Siblings::starting_at(arenas, head) {
            if candidate.guid() == guid {
                return if candidate.shape() == shape {
                    Lookup::Found(candidate.node_ref())
                } else {
                    Lookup::ShapeMismatch
                };
            }
        }
        let node = self.allocate_node(guid, shape, head, arena_size);
        if let Some(arenas) = &mut self.arenas {
            arenas.set_callsite_head(parent, callsite, node);
        }
        Lookup::Found(node)
    }

    /// Returns the unhandled node for `guid`, creating and linking it on
    /// first sight. Unhandled nodes never have callsites. `None` if the
    /// existing node has a different number of counters.
    pub(crate) fn get_or_create_unhandled(
        &mut self,
        guid: Guid,
        num_counters: u32,
        arena_size: usize,
    ) -> Option<NodeRef> {
        let shape = NodeShape::new(num_counters, 0);
        if let Some(node) = self.unhandled.get(&guid).copied() {
            return self.matches(node, guid, shape).then_some(node);
        }
        let node = self.allocate_node(guid, shape, self.first_unhandled, arena_size);
        self.first_unhandled = Some(node);
        self.unhandled.insert(guid, node);
        Some(node)
    }

    /// Counts an entry into `node`.
    #[inline]
    pub(crate) fn enter(&mut self, node: NodeRef) {
        self.add(node, 0, 1);
    }

    #[inline]
    pub(crate) fn add(&mut self, node: NodeRef, counter: u32, delta: u64) {
        if let Some(value) = self
            .arenas
            .as_mut()
            .and_then(|arenas| arenas.counters_mut(node))
            .and_then(|counters| counters.get_mut(counter as usize))
        {
            *value = value.wrapping_add(delta);
        }
    }

    pub(crate) fn counter(&self, node: NodeRef, counter: u32) -> Option<u64> {
        let counters = self.arenas.as_ref()?.counters(node)?;
        counters.get(counter as usize).copied()
    }

    /// Every node reachable from the root and the unhandled list, each once.
    /// `None` if a node is reachable twice or a handle doesn't resolve.
    fn reachable_nodes(&self) -> Option<Vec<NodeRef>> {
        let Some(arenas) = &self.arenas else {
            return Some(Vec::new());
        };
        let mut seen: HashSet<NodeRef, FxBuildHasher> = HashSet::default();
        let mut order = Vec::new();
        let mut pending: Vec<NodeRef> = self.first_node.into_iter().collect();
        let mut unhandled = self.first_unhandled;
        while let Some(node) = unhandled {
            pending.push(node);
            unhandled = arenas.node_next(node);
            if pending.len() > self.unhandled.len() + 1 {
                // The unhandled list is longer than the map: it loops.
                return None;
            }
        }

        while let Some(node) = pending.pop() {
            if !seen.insert(node) {
                return None;
            }
            order.push(node);
            let view = ContextNode::resolve(arenas, node)?;
            for callsite in 0..view.callsites_size() {
                let mut next = arenas.callsite_head(node, callsite).ok()?;
                while let Some(child) = next {
                    if seen.contains(&child) {
                        return None;
                    }
                    pending.push(child);
                    next = arenas.node_next(child);
                }
            }
        }
        Some(order)
    }

    pub(crate) fn validate(&self) -> bool {
        self.reachable_nodes().is_some()
    }

    /// Zeroes every counter, keeping the tree and unhandled nodes in place.
    pub(crate) fn reset_counters(&mut self) {
        let Some(nodes) = self.reachable_nodes() else {
            return;
        };
        if let Some(arenas) = &mut self.arenas {
            for node in nodes {
                if let Some(counters) = arenas.counters_mut(node) {
                    counters.fill(0);
                }
            }
        }
    }

    /// Forgets the tree and releases its arenas. Returns how many arenas
    /// were released.
    pub(crate) fn clear(&mut self) -> usize {
        self.first_node = None;
        self.first_unhandled = None;
        self.unhandled = HashMap::default();
        self.generation = self.generation.wrapping_add(1);
        free_arena_list(&mut self.arenas)
    }

    pub(crate) fn view(&self, node: NodeRef) -> Option<ContextNode<'_>> {
        ContextNode::resolve(self.arenas.as_ref()?, node)
    }

    pub(crate) fn unhandled_contexts(&self) -> Option<UnhandledContexts<'_>> {
        let arenas = self.arenas.as_ref()?;
        Some(UnhandledContexts {
            siblings: Siblings::starting_at(arenas, self.first_unhandled),
        })
    }
}

/// Contexts that could not be attributed to a callsite, one per callee GUID,
/// most recently created first.
pub struct UnhandledContexts<'a> {
    siblings: Siblings<'a>,
}

impl<'a> Iterator for UnhandledContexts<'a> {
    type Item = ContextNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.siblings.next()
    }
}

/// The context tree of one entry point, along with the memory backing it.
///
/// Only one thread at a time may traverse the tree, to read it or to write
/// it. Many threads enter the same entry point, so on the hot path the guard
/// is only tried: a thread that doesn't win it gets a scratch context and the
/// tree stays untouched. Over time, collecting on one thread at a time
/// converges to the aggregate profile of all threads. That aggregation is
/// node by node, summing counters at the same position of the tree, and is
/// never flattened.
pub struct ContextRoot {
    taken: RawMutex,
    /// Entries into the entry point, whether or not they won the guard.
    total_entries: AtomicU64,
    /// Calls redirected to the unhandled contexts or to scratch because the
    /// declared shape didn't match the recorded node.
    shape_mismatches: AtomicU64,
    tree: UnsafeCell<ContextTree>,
}

// SAFETY: `tree` is only accessed by the thread holding `taken`.
unsafe impl Send for ContextRoot {}
unsafe impl Sync for ContextRoot {}

impl Default for ContextRoot {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the guard when dropped.
struct TakenGuard<'a> {
    root: &'a ContextRoot,
}

impl Drop for TakenGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: a TakenGuard is only created after locking `taken`.
        unsafe { self.root.taken.unlock() };
    }
}

impl ContextRoot {
    pub fn new() -> Self {
        Self {
            taken: RawMutex::INIT,
            total_entries: AtomicU64::new(0),
            shape_mismatches: AtomicU64::new(0),
            tree: UnsafeCell::new(ContextTree::new()),
        }
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Relaxed)
    }

    pub fn shape_mismatches(&self) -> u64 {
        self.shape_mismatches.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn count_entry(&self) {
        self.total_entries.fetch_add(1, Ordering::Relaxed);
    }

    #[cold]
    pub(crate) fn count_shape_mismatch(&self) {
        self.shape_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Non-blocking attempt to take the guard, for the hot path.
    #[inline]
    pub(crate) fn try_take(&self) -> bool {
        self.taken.try_lock()
    }

    /// # Safety
    /// The calling thread must hold the guard, taken through [Self::try_take].
    #[inline]
    pub(crate) unsafe fn release(&self) {
        self.taken.unlock();
    }

    /// # Safety
    /// The calling thread must hold the guard, and must not let the returned
    /// reference overlap with another one obtained from this function.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn tree_mut(&self) -> &mut ContextTree {
        &mut *self.tree.get()
    }

    /// Blocks until the guard is available, then runs `f` on the tree.
    fn with_tree<R>(&self, f: impl FnOnce(&mut ContextTree) -> R) -> R {
        self.taken.lock();
        let _guard = TakenGuard { root: self };
        // SAFETY: the guard is held until `_guard` is dropped.
        f(unsafe { self.tree_mut() })
    }

    /// Zeroes all counters and the entry count, preserving the tree shape.
    /// Returns the number of arenas backing the tree.
    pub(crate) fn reset(&self) -> usize {
        let arenas = self.with_tree(|tree| {
            tree.reset_counters();
            tree.arena_count()
        });
        self.total_entries.store(0, Ordering::Relaxed);
        self.shape_mismatches.store(0, Ordering::Relaxed);
        arenas
    }

    /// Releases the tree's memory. Returns the number of arenas released.
    pub(crate) fn free(&self) -> usize {
        let released = self.with_tree(ContextTree::clear);
        self.total_entries.store(0, Ordering::Relaxed);
        self.shape_mismatches.store(0, Ordering::Relaxed);
        released
    }

    /// Hands the tree to `writer`, with the guard held for the duration of
    /// the call. Roots that were never entered successfully write nothing.
    pub(crate) fn write_to<W: ProfileWriter + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<(), ProfileError> {
        self.with_tree(|tree| {
            let Some(root) = tree.root_node().and_then(|node| tree.view(node)) else {
                return Ok(());
            };
            let guid = root.guid();
            if !tree.validate() {
                tracing::error!("context tree rooted at {guid:#x} is invalid");
                return Err(ProfileError::InvalidTree { guid });
            }
            let mismatches = self.shape_mismatches();
            if mismatches > 0 {
                tracing::warn!("{mismatches} calls under root {guid:#x} had a mismatched shape");
            }
            let Some(unhandled) = tree.unhandled_contexts() else {
                return Ok(());
            };
            writer.write_contextual(root, unhandled, self.total_entries());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: usize = 4096;

    #[test]
    fn test_root_node_created_once() {
        let mut tree = ContextTree::new();
        let shape = NodeShape::new(1, 2);
        let first = tree.get_or_create_root_node(10, shape, ARENA).unwrap();
        let again = tree.get_or_create_root_node(10, shape, ARENA).unwrap();
        assert_eq!(first, again);
        assert_eq!(None, tree.get_or_create_root_node(10, NodeShape::new(2, 2), ARENA));
        assert_eq!(None, tree.get_or_create_root_node(11, shape, ARENA));
        assert_eq!(1, tree.arena_count());
    }

    #[test]
    fn test_children_reused_and_distinct() {
        let mut tree = ContextTree::new();
        let root = tree
            .get_or_create_root_node(1, NodeShape::new(1, 2), ARENA)
            .unwrap();
        let leaf = NodeShape::new(1, 0);

        let Lookup::Found(a) = tree.find_or_create_child(root, 0, 10, leaf, ARENA) else {
            panic!("expected a node");
        };
        assert_eq!(Lookup::Found(a), tree.find_or_create_child(root, 0, 10, leaf, ARENA));

        let Lookup::Found(b) = tree.find_or_create_child(root, 0, 20, leaf, ARENA) else {
            panic!("expected a node");
        };
        let Lookup::Found(c) = tree.find_or_create_child(root, 1, 10, leaf, ARENA) else {
            panic!("expected a node");
        };
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        // Both callees observed at callsite 0 are still reachable.
        assert_eq!(Lookup::Found(a), tree.find_or_create_child(root, 0, 10, leaf, ARENA));
        assert_eq!(Lookup::Found(b), tree.find_or_create_child(root, 0, 20, leaf, ARENA));
        assert!(tree.validate());
    }

    #[test]
    fn test_bad_callsite_and_mismatch() {
        let mut tree = ContextTree::new();
        let root = tree
            .get_or_create_root_node(1, NodeShape::new(1, 1), ARENA)
            .unwrap();
        let leaf = NodeShape::new(1, 0);
        assert_eq!(
            Lookup::BadCallsite,
            tree.find_or_create_child(root, 1, 10, leaf, ARENA)
        );
        assert!(matches!(
            tree.find_or_create_child(root, 0, 10, leaf, ARENA),
            Lookup::Found(_)
        ));
        assert_eq!(
            Lookup::ShapeMismatch,
            tree.find_or_create_child(root, 0, 10, NodeShape::new(4, 0), ARENA)
        );
    }

    #[test]
    fn test_arena_growth() {
        let mut tree = ContextTree::new();
        let root = tree
            .get_or_create_root_node(1, NodeShape::new(1, 512), ARENA)
            .unwrap();
        let leaf = NodeShape::new(8, 0);
        for callsite in 0..512 {
            let found = tree.find_or_create_child(root, callsite, callsite as u64, leaf, ARENA);
            assert!(matches!(found, Lookup::Found(_)));
        }
        assert!(tree.arena_count() > 1);
        assert!(tree.validate());
        assert_eq!(tree.arena_count(), tree.clear());
        assert_eq!(0, tree.arena_count());
        assert_eq!(None, tree.root_node());
    }

    #[test]
    fn test_clear_starts_new_generation() {
        let mut tree = ContextTree::new();
        let shape = NodeShape::new(1, 0);
        let before = tree.get_or_create_root_node(1, shape, ARENA).unwrap();
        let generation = tree.generation();
        tree.clear();
        assert_ne!(generation, tree.generation());
        // The same slot gets reused by the next tree.
        assert_eq!(Some(before), tree.get_or_create_root_node(1, shape, ARENA));
    }

    #[test]
    fn test_oversized_node_gets_own_arena() {
        let mut tree = ContextTree::new();
        let huge = NodeShape::new(1, 1024);
        let root = tree.get_or_create_root_node(1, huge, ARENA).unwrap();
        assert_eq!(Some(huge), tree.view(root).map(|n| n.shape()));
        assert!(tree.arenas.as_ref().unwrap().get(0).unwrap().size() >= huge.alloc_size());
    }

    #[test]
    fn test_unhandled_one_per_guid() {
        let mut tree = ContextTree::new();
        let a = tree.get_or_create_unhandled(5, 2, ARENA).unwrap();
        let b = tree.get_or_create_unhandled(6, 1, ARENA).unwrap();
        assert_eq!(Some(a), tree.get_or_create_unhandled(5, 2, ARENA));
        assert_eq!(None, tree.get_or_create_unhandled(5, 3, ARENA));
        assert_ne!(a, b);
        let guids: Vec<_> = tree.unhandled_contexts().unwrap().map(|n| n.guid()).collect();
        assert_eq!(vec![6, 5], guids);
    }

    #[test]
    fn test_reset_preserves_shape() {
        let mut tree = ContextTree::new();
        let root = tree
            .get_or_create_root_node(1, NodeShape::new(2, 1), ARENA)
            .unwrap();
        let Lookup::Found(child) =
            tree.find_or_create_child(root, 0, 2, NodeShape::new(1, 0), ARENA)
        else {
            panic!("expected a node");
        };
        let unhandled = tree.get_or_create_unhandled(3, 1, ARENA).unwrap();
        tree.enter(root);
        tree.add(root, 1, 41);
        tree.enter(child);
        tree.enter(unhandled);
        // Out of range counters are ignored.
        tree.add(child, 1, 1);

        assert_eq!(Some(1), tree.counter(root, 0));
        assert_eq!(Some(41), tree.counter(root, 1));
        assert_eq!(None, tree.counter(child, 1));

        tree.reset_counters();
        for node in [root, child, unhandled] {
            assert_eq!(Some(0), tree.counter(node, 0));
        }
        assert_eq!(
            Lookup::Found(child),
            tree.find_or_create_child(root, 0, 2, NodeShape::new(1, 0), ARENA)
        );
    }

    #[test]
    fn test_guard_exclusive() {
        let root = ContextRoot::new();
        assert!(root.try_take());
        assert!(!root.try_take());
        unsafe { root.release() };
        assert!(root.try_take());
        unsafe { root.release() };
        // The blocking path releases the guard on the way out.
        assert_eq!(0, root.reset());
        assert!(root.try_take());
        unsafe { root.release() };
    }
}

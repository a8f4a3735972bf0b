// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The calls instrumented code makes: [start_context] when entering a
//! function that owns a context root, [get_context] when entering any other
//! instrumented function, [publish_callsite] right before a call, and
//! [release_context] when leaving a root function.
//!
//! Everything here runs on the hot path. Nothing allocates except when a new
//! root, node or arena is needed, nothing blocks, and nothing logs.

use crate::collection;
use crate::config;
use crate::function_data::{CalleeId, FlatProfile, FunctionData};
use crate::node::{Guid, NodeRef, NodeShape};
use crate::root::{ContextRoot, Lookup};
use core::cell::Cell;
use core::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{compiler_fence, Ordering};

/// A node of one particular tree: the root that handed it out, and which
/// incarnation of that root's tree. Trees are recreated after [crate::free].
#[derive(Clone, Copy)]
pub struct TreeNode {
    root: &'static ContextRoot,
    generation: u64,
    node: NodeRef,
}

impl TreeNode {
    pub fn node_ref(&self) -> NodeRef {
        self.node
    }

    #[inline]
    fn belongs_to(&self, root: &ContextRoot, generation: u64) -> bool {
        ptr::eq(self.root, root) && self.generation == generation
    }
}

impl core::fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TreeNode")
            .field("root", &ptr::from_ref(self.root))
            .field("generation", &self.generation)
            .field("node", &self.node)
            .finish()
    }
}

/// What an instrumented function writes its counters through.
#[derive(Clone, Copy, Debug)]
pub enum Context {
    /// A node of the current root's tree. The only kind that may parent
    /// other contexts.
    Real(TreeNode),
    /// The per-GUID node of calls that couldn't be attributed to a callsite.
    Unhandled(TreeNode),
    /// The function's flat profile, used outside of any entry point.
    Flat(&'static FlatProfile),
    /// Writes are discarded.
    Scratch,
}

impl Context {
    /// Whether callees of this context are attributed anywhere. Only real
    /// contexts have subcontexts.
    #[inline]
    pub fn is_scratch(&self) -> bool {
        !matches!(self, Context::Real(_))
    }

    pub fn node(&self) -> Option<NodeRef> {
        match self {
            Context::Real(handle) | Context::Unhandled(handle) => Some(handle.node),
            Context::Flat(_) | Context::Scratch => None,
        }
    }

    /// Adds `delta` to `counter`. Out of range counters are ignored. Tree
    /// writes only land while the calling thread is building the tree the
    /// context came from; otherwise they are dropped.
    #[inline]
    pub fn add(&self, counter: u32, delta: u64) {
        match *self {
            Context::Real(handle) | Context::Unhandled(handle) => {
                let _ = STATE.try_with(|state| state.add(handle, counter, delta));
            }
            Context::Flat(flat) => flat.add(counter, delta),
            Context::Scratch => {}
        }
    }

    #[inline]
    pub fn increment(&self, counter: u32) {
        self.add(counter, 1);
    }

    /// Reads a counter, under the same conditions as [Context::add] writes.
    pub fn counter(&self, counter: u32) -> Option<u64> {
        match *self {
            Context::Real(handle) | Context::Unhandled(handle) => STATE
                .try_with(|state| state.counter(handle, counter))
                .ok()
                .flatten(),
            Context::Flat(flat) => flat.counter(counter),
            Context::Scratch => None,
        }
    }
}

#[derive(Clone, Copy)]
struct Callsite {
    parent: TreeNode,
    index: u32,
}

/// Per-thread protocol state. Slot 0 of the publications is written by real
/// callers, slot 1 by everyone else, so that only real callers can ever
/// attribute a callee.
struct ThreadState {
    /// Root whose guard this thread holds.
    held: Cell<Option<&'static ContextRoot>>,
    /// Root whose tree this thread is building. `None` while held if the
    /// entry degraded to scratch.
    current_root: Cell<Option<&'static ContextRoot>>,
    depth: Cell<u32>,
    busy: Cell<bool>,
    expected_callee: [Cell<Option<CalleeId>>; 2],
    callsite: [Cell<Option<Callsite>>; 2],
}

thread_local! {
    static STATE: ThreadState = const { ThreadState::new() };
}

/// Marks the thread as mutating runtime state. A signal handler interrupting
/// that window and re-entering the runtime sees the flag and stays out.
struct BusyGuard<'a> {
    busy: &'a Cell<bool>,
}

impl<'a> BusyGuard<'a> {
    #[inline]
    fn enter(busy: &'a Cell<bool>) -> Option<Self> {
        if busy.replace(true) {
            return None;
        }
        compiler_fence(Ordering::SeqCst);
        Some(Self { busy })
    }
}

impl Drop for BusyGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        compiler_fence(Ordering::SeqCst);
        self.busy.set(false);
    }
}

impl ThreadState {
    const fn new() -> Self {
        Self {
            held: Cell::new(None),
            current_root: Cell::new(None),
            depth: Cell::new(0),
            busy: Cell::new(false),
            expected_callee: [Cell::new(None), Cell::new(None)],
            callsite: [Cell::new(None), Cell::new(None)],
        }
    }

    fn start(&self, fdata: &'static FunctionData, guid: Guid, shape: NodeShape) -> Context {
        if fdata.is_ineligible_root() {
            return self.callee(fdata, CalleeId::of(fdata), guid, shape);
        }
        let depth = self.depth.get();
        self.depth.set(depth.saturating_add(1));

        // Creating the root takes locks, so it must not be re-entered.
        let root = {
            let Some(_busy) = BusyGuard::enter(&self.busy) else {
                return Context::Scratch;
            };
            fdata.get_or_allocate_context_root()
        };
        let Some(root) = root else {
            // Marked ineligible meanwhile; its release won't count.
            self.depth.set(depth);
            return self.callee(fdata, CalleeId::of(fdata), guid, shape);
        };
        root.count_entry();

        if depth > 0 {
            // Recursion, a root reached from another root, or a signal
            // handler: stay within the tree already being built.
            return match self.current_root.get() {
                Some(_) => self.callee(fdata, CalleeId::of(fdata), guid, shape),
                None => Context::Scratch,
            };
        }

        let Some(_busy) = BusyGuard::enter(&self.busy) else {
            return Context::Scratch;
        };
        if !root.try_take() {
            return Context::Scratch;
        }
        self.held.set(Some(root));
        // SAFETY: this thread holds the guard of `root`, and the busy flag
        // keeps re-entrant calls away from the tree.
        let tree = unsafe { root.tree_mut() };
        match tree.get_or_create_root_node(guid, shape, config::arena_size()) {
            Some(node) => {
                tree.enter(node);
                self.current_root.set(Some(root));
                Context::Real(TreeNode {
                    root,
                    generation: tree.generation(),
                    node,
                })
            }
            None => {
                root.count_shape_mismatch();
                Context::Scratch
            }
        }
    }

    fn callee(
        &self,
        fdata: &'static FunctionData,
        callee: CalleeId,
        guid: Guid,
        shape: NodeShape,
    ) -> Context {
        let Some(_busy) = BusyGuard::enter(&self.busy) else {
            return Context::Scratch;
        };
        let expected = self.expected_callee[0].take();
        let callsite = self.callsite[0].take();

        let Some(root) = self.current_root.get() else {
            if self.depth.get() > 0 || !collection::profiling_started() {
                return Context::Scratch;
            }
            return fdata.flat_context(guid, shape.num_counters);
        };
        // SAFETY: `current_root` is only set while holding its guard, and the
        // busy flag keeps re-entrant calls away from the tree.
        let tree = unsafe { root.tree_mut() };
        let generation = tree.generation();
        let arena_size = config::arena_size();
        let handle = |node| TreeNode {
            root,
            generation,
            node,
        };

        let site = callsite
            .filter(|_| expected == Some(callee))
            .filter(|site| site.parent.belongs_to(root, generation));
        if let Some(site) = site {
            let parent = site.parent.node;
            match tree.find_or_create_child(parent, site.index, guid, shape, arena_size) {
                Lookup::Found(node) => {
                    tree.enter(node);
                    return Context::Real(handle(node));
                }
                Lookup::BadCallsite | Lookup::ShapeMismatch => root.count_shape_mismatch(),
            }
        }

        match tree.get_or_create_unhandled(guid, shape.num_counters, arena_size) {
            Some(node) => {
                tree.enter(node);
                Context::Unhandled(handle(node))
            }
            None => {
                root.count_shape_mismatch();
                Context::Scratch
            }
        }
    }

    fn release(&self) {
        let depth = self.depth.get();
        if depth == 0 {
            return;
        }
        self.depth.set(depth - 1);
        if depth > 1 {
            return;
        }
        for slot in 0..2 {
            self.expected_callee[slot].set(None);
            self.callsite[slot].set(None);
        }
        self.current_root.set(None);
        if let Some(root) = self.held.take() {
            // SAFETY: `held` is set only after winning the guard.
            unsafe { root.release() };
        }
    }

    fn publish(&self, caller: &Context, index: u32, callee: CalleeId) {
        let (slot, site) = match *caller {
            Context::Real(parent) => (0, Some(Callsite { parent, index })),
            _ => (1, None),
        };
        self.callsite[slot].set(site);
        self.expected_callee[slot].set(Some(callee));
    }

    fn add(&self, handle: TreeNode, counter: u32, delta: u64) {
        let Some(_busy) = BusyGuard::enter(&self.busy) else {
            return;
        };
        let Some(root) = self.current_root.get() else {
            return;
        };
        // SAFETY: see `callee`.
        let tree = unsafe { root.tree_mut() };
        if handle.belongs_to(root, tree.generation()) {
            tree.add(handle.node, counter, delta);
        }
    }

    fn counter(&self, handle: TreeNode, counter: u32) -> Option<u64> {
        let _busy = BusyGuard::enter(&self.busy)?;
        let root = self.current_root.get()?;
        // SAFETY: see `callee`.
        let tree = unsafe { root.tree_mut() };
        if !handle.belongs_to(root, tree.generation()) {
            return None;
        }
        tree.counter(handle.node, counter)
    }
}

/// Enters a function that owns a context root, creating the root on first
/// use. Must be paired with [release_context] on the same thread.
///
/// Only one thread at a time builds a given root's tree; the others get
/// [Context::Scratch]. Entries are counted either way. Functions marked with
/// [FunctionData::mark_ineligible_root] are entered as ordinary callees.
pub fn start_context(
    fdata: &'static FunctionData,
    guid: Guid,
    num_counters: u32,
    num_callsites: u32,
) -> Context {
    let shape = NodeShape::new(num_counters, num_callsites);
    STATE
        .try_with(|state| state.start(fdata, guid, shape))
        .unwrap_or(Context::Scratch)
}

/// Enters an instrumented function. `callee` identifies the function being
/// entered, to compare with what the caller published.
pub fn get_context(
    fdata: &'static FunctionData,
    callee: CalleeId,
    guid: Guid,
    num_counters: u32,
    num_callsites: u32,
) -> Context {
    let shape = NodeShape::new(num_counters, num_callsites);
    STATE
        .try_with(|state| state.callee(fdata, callee, guid, shape))
        .unwrap_or(Context::Scratch)
}

/// Leaves a function entered with [start_context]. The outermost release on
/// a thread gives the root's guard back.
pub fn release_context(fdata: &'static FunctionData) {
    if fdata.is_ineligible_root() {
        // Entered as a callee.
        return;
    }
    let _ = STATE.try_with(ThreadState::release);
}

/// Announces that `caller` is about to call `callee` from its callsite
/// `index`.
#[inline]
pub fn publish_callsite(caller: &Context, index: u32, callee: CalleeId) {
    let _ = STATE.try_with(|state| state.publish(caller, index, callee));
}

/// Whether the calling thread holds a root's guard.
pub(crate) fn holds_root_guard() -> bool {
    STATE
        .try_with(|state| state.held.get().is_some())
        .unwrap_or(false)
}

/// A root entry, released when dropped.
pub struct EntryScope {
    fdata: &'static FunctionData,
    context: Context,
    _not_send: PhantomData<*const ()>,
}

impl EntryScope {
    pub fn context(&self) -> Context {
        self.context
    }
}

impl Drop for EntryScope {
    fn drop(&mut self) {
        release_context(self.fdata);
    }
}

/// [start_context] paired with its [release_context].
pub fn enter_root(
    fdata: &'static FunctionData,
    guid: Guid,
    num_counters: u32,
    num_callsites: u32,
) -> EntryScope {
    EntryScope {
        fdata,
        context: start_context(fdata, guid, num_counters, num_callsites),
        _not_send: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_root() -> &'static ContextRoot {
        Box::leak(Box::new(ContextRoot::new()))
    }

    #[test]
    fn test_scratch_variants() {
        assert!(Context::Scratch.is_scratch());
        let node = NodeRef::new(0, 0).unwrap();
        let handle = TreeNode {
            root: leaked_root(),
            generation: 0,
            node,
        };
        assert!(!Context::Real(handle).is_scratch());
        assert!(Context::Unhandled(handle).is_scratch());
        assert_eq!(Some(node), Context::Unhandled(handle).node());
        assert_eq!(None, Context::Scratch.counter(0));
        Context::Scratch.increment(0);
    }

    #[test]
    fn test_handle_ownership() {
        let root = leaked_root();
        let other = leaked_root();
        let handle = TreeNode {
            root,
            generation: 3,
            node: NodeRef::new(0, 0).unwrap(),
        };
        assert!(handle.belongs_to(root, 3));
        assert!(!handle.belongs_to(root, 4));
        assert!(!handle.belongs_to(other, 3));
    }

    #[test]
    fn test_busy_guard() {
        let busy = Cell::new(false);
        let guard = BusyGuard::enter(&busy).unwrap();
        assert!(BusyGuard::enter(&busy).is_none());
        drop(guard);
        assert!(!busy.get());
        assert!(BusyGuard::enter(&busy).is_some());
    }

    #[test]
    fn test_reentry_during_root_allocation() {
        static FDATA: FunctionData = FunctionData::new();
        let state = ThreadState::new();
        // As seen from a signal handler interrupting the first entry.
        state.busy.set(true);
        let ctx = state.start(&FDATA, 1, NodeShape::new(1, 0));
        assert!(matches!(ctx, Context::Scratch));
        assert!(FDATA.context_root().is_none());
        assert_eq!(1, state.depth.get());
        state.release();
        assert_eq!(0, state.depth.get());

        state.busy.set(false);
        let ctx = state.start(&FDATA, 1, NodeShape::new(1, 0));
        assert!(matches!(ctx, Context::Real(_)));
        assert!(FDATA.context_root().is_some());
        state.release();
        assert!(state.held.get().is_none());
    }

    #[test]
    fn test_publication_slots() {
        let state = ThreadState::new();
        let parent = TreeNode {
            root: leaked_root(),
            generation: 0,
            node: NodeRef::new(0, 24).unwrap(),
        };
        let callee = CalleeId::from_raw(7);
        state.publish(&Context::Real(parent), 3, callee);
        state.publish(&Context::Scratch, 1, CalleeId::from_raw(8));
        assert_eq!(Some(callee), state.expected_callee[0].get());
        assert_eq!(Some(3), state.callsite[0].get().map(|site| site.index));
        assert_eq!(Some(CalleeId::from_raw(8)), state.expected_callee[1].get());
        assert!(state.callsite[1].get().is_none());
    }

    #[test]
    fn test_release_without_entry() {
        let state = ThreadState::new();
        state.release();
        assert_eq!(0, state.depth.get());
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Context nodes live inside arena memory as runs of 64-bit words:
//!
//! ```text
//! ┌──────┬──────┬───────┬──────────────────┬──────────────────────┐
//! │ guid │ next │ shape │ counters[n_cnt]  │ callsite heads[n_cs] │
//! └──────┴──────┴───────┴──────────────────┴──────────────────────┘
//! ```
//!
//! `shape` packs the counter count in the low half and the callsite count in
//! the high half. `next` and the callsite heads hold encoded [NodeRef]s, with
//! zero meaning "none". The callees seen at one callsite form a list through
//! their `next` words, which is how indirect calls fan out.

use crate::arena::{ArenaList, ARENA_ALIGNMENT};
use allocator_api2::alloc::Allocator;

/// Stable identifier of a function across builds.
pub type Guid = u64;

const GUID_WORD: usize = 0;
const NEXT_WORD: usize = 1;
const SHAPE_WORD: usize = 2;
const HEADER_WORDS: usize = 3;

/// Handle to a context node: which arena of the owning root it lives in and
/// at which word offset. Only meaningful together with the root that handed
/// it out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef {
    arena: u32,
    word: u32,
}

impl NodeRef {
    pub(crate) fn new(arena: usize, byte_offset: usize) -> Option<Self> {
        Some(Self {
            arena: u32::try_from(arena).ok()?,
            word: u32::try_from(byte_offset / ARENA_ALIGNMENT).ok()?,
        })
    }

    #[inline]
    pub(crate) fn encode(self) -> u64 {
        ((self.arena as u64 + 1) << 32) | self.word as u64
    }

    #[inline]
    pub(crate) fn decode(raw: u64) -> Option<Self> {
        let arena = raw >> 32;
        if arena == 0 {
            return None;
        }
        Some(Self {
            arena: (arena - 1) as u32,
            word: raw as u32,
        })
    }
}

/// Counter and callsite counts of a node, as declared by the instrumented
/// function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeShape {
    pub num_counters: u32,
    pub num_callsites: u32,
}

impl NodeShape {
    pub const fn new(num_counters: u32, num_callsites: u32) -> Self {
        Self {
            num_counters,
            num_callsites,
        }
    }

    #[inline]
    fn pack(self) -> u64 {
        self.num_counters as u64 | ((self.num_callsites as u64) << 32)
    }

    #[inline]
    fn unpack(raw: u64) -> Self {
        Self {
            num_counters: raw as u32,
            num_callsites: (raw >> 32) as u32,
        }
    }

    #[inline]
    fn words(self) -> usize {
        HEADER_WORDS + self.num_counters as usize + self.num_callsites as usize
    }

    /// Bytes of arena memory a node of this shape occupies.
    #[inline]
    pub fn alloc_size(self) -> usize {
        self.words() * ARENA_ALIGNMENT
    }
}

/// Resolves `node` to exactly the words it occupies.
fn node_words<A: Allocator + Clone>(arenas: &ArenaList<A>, node: NodeRef) -> Option<&[u64]> {
    let words = arenas.get(node.arena as usize)?.words();
    let start = node.word as usize;
    let shape = NodeShape::unpack(*words.get(start + SHAPE_WORD)?);
    words.get(start..start.checked_add(shape.words())?)
}

fn node_words_mut<A: Allocator + Clone>(
    arenas: &mut ArenaList<A>,
    node: NodeRef,
) -> Option<&mut [u64]> {
    let words = arenas.get_mut(node.arena as usize)?.words_mut();
    let start = node.word as usize;
    let shape = NodeShape::unpack(*words.get(start + SHAPE_WORD)?);
    words.get_mut(start..start.checked_add(shape.words())?)
}

/// Mutating node operations. Callers hold the guard of the root owning
/// `arenas`.
impl<A: Allocator + Clone> ArenaList<A> {
    /// Places a node in the current arena, or returns `None` if it does not
    /// fit and a new arena is needed.
    pub(crate) fn try_place_node(
        &mut self,
        guid: Guid,
        shape: NodeShape,
        next: Option<NodeRef>,
    ) -> Option<NodeRef> {
        let (arena, offset) = self.try_bump_allocate(shape.alloc_size())?;
        let node = NodeRef::new(arena, offset)?;
        let start = node.word as usize;
        let words = self.get_mut(arena)?.words_mut();
        // Arena memory is zero-initialized, so counters and callsite heads
        // start out empty.
        let header = words.get_mut(start..start + HEADER_WORDS)?;
        header[GUID_WORD] = guid;
        header[NEXT_WORD] = next.map_or(0, NodeRef::encode);
        header[SHAPE_WORD] = shape.pack();
        Some(node)
    }

    pub(crate) fn node_guid(&self, node: NodeRef) -> Option<Guid> {
        node_words(self, node).map(|w| w[GUID_WORD])
    }

    pub(crate) fn node_shape(&self, node: NodeRef) -> Option<NodeShape> {
        node_words(self, node).map(|w| NodeShape::unpack(w[SHAPE_WORD]))
    }

    pub(crate) fn node_next(&self, node: NodeRef) -> Option<NodeRef> {
        node_words(self, node).and_then(|w| NodeRef::decode(w[NEXT_WORD]))
    }

    /// Head of the callee list at `callsite`, or `Err` if `node` has no such
    /// callsite.
    pub(crate) fn callsite_head(
        &self,
        node: NodeRef,
        callsite: u32,
    ) -> Result<Option<NodeRef>, ()> {
        let words = node_words(self, node).ok_or(())?;
        let shape = NodeShape::unpack(words[SHAPE_WORD]);
        if callsite >= shape.num_callsites {
            return Err(());
        }
        let slot = HEADER_WORDS + shape.num_counters as usize + callsite as usize;
        Ok(NodeRef::decode(words[slot]))
    }

    pub(crate) fn set_callsite_head(&mut self, node: NodeRef, callsite: u32, head: NodeRef) {
        if let Some(words) = node_words_mut(self, node) {
            let shape = NodeShape::unpack(words[SHAPE_WORD]);
            if callsite < shape.num_callsites {
                words[HEADER_WORDS + shape.num_counters as usize + callsite as usize] =
                    head.encode();
            }
        }
    }

    pub(crate) fn counters_mut(&mut self, node: NodeRef) -> Option<&mut [u64]> {
        let words = node_words_mut(self, node)?;
        let count = NodeShape::unpack(words[SHAPE_WORD]).num_counters as usize;
        words.get_mut(HEADER_WORDS..HEADER_WORDS + count)
    }

    pub(crate) fn counters(&self, node: NodeRef) -> Option<&[u64]> {
        let words = node_words(self, node)?;
        let count = NodeShape::unpack(words[SHAPE_WORD]).num_counters as usize;
        words.get(HEADER_WORDS..HEADER_WORDS + count)
    }
}

/// Read-only view of a context node, handed to profile writers while the
/// owning root's guard is held.
#[derive(Clone, Copy)]
pub struct ContextNode<'a> {
    arenas: &'a ArenaList,
    node: NodeRef,
    words: &'a [u64],
}

impl<'a> ContextNode<'a> {
    pub(crate) fn resolve(arenas: &'a ArenaList, node: NodeRef) -> Option<Self> {
        let words = node_words(arenas, node)?;
        Some(Self {
            arenas,
            node,
            words,
        })
    }

    pub fn node_ref(&self) -> NodeRef {
        self.node
    }

    pub fn guid(&self) -> Guid {
        self.words[GUID_WORD]
    }

    pub fn shape(&self) -> NodeShape {
        NodeShape::unpack(self.words[SHAPE_WORD])
    }

    pub fn counters_size(&self) -> u32 {
        self.shape().num_counters
    }

    pub fn callsites_size(&self) -> u32 {
        self.shape().num_callsites
    }

    /// Counter values; the first counter counts entries into this context.
    pub fn counters(&self) -> &'a [u64] {
        let count = self.counters_size() as usize;
        &self.words[HEADER_WORDS..HEADER_WORDS + count]
    }

    /// The next node in the list this node belongs to: another callee seen
    /// at the same callsite, or the next unhandled context.
    pub fn next(&self) -> Option<Self> {
        NodeRef::decode(self.words[NEXT_WORD]).and_then(|next| Self::resolve(self.arenas, next))
    }

    /// All callees observed at `callsite`. Empty if the callsite was never
    /// taken or doesn't exist.
    pub fn subcontexts(&self, callsite: u32) -> Siblings<'a> {
        let first = if callsite < self.callsites_size() {
            let slot = HEADER_WORDS + self.counters_size() as usize + callsite as usize;
            NodeRef::decode(self.words[slot]).and_then(|head| Self::resolve(self.arenas, head))
        } else {
            None
        };
        Siblings { current: first }
    }

    /// The subcontexts of every callsite, in callsite order.
    pub fn callsites(&self) -> impl Iterator<Item = Siblings<'a>> + 'a {
        let this = *self;
        (0..self.callsites_size()).map(move |callsite| this.subcontexts(callsite))
    }
}

impl core::fmt::Debug for ContextNode<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContextNode")
            .field("guid", &self.guid())
            .field("counters", &self.counters())
            .field("callsites", &self.callsites_size())
            .finish()
    }
}

/// Iterator over a list of nodes linked through their `next` word.
pub struct Siblings<'a> {
    current: Option<ContextNode<'a>>,
}

impl<'a> Siblings<'a> {
    pub(crate) fn starting_at(arenas: &'a ArenaList, head: Option<NodeRef>) -> Self {
        Self {
            current: head.and_then(|head| ContextNode::resolve(arenas, head)),
        }
    }
}

impl<'a> Iterator for Siblings<'a> {
    type Item = ContextNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.take()?;
        self.current = current.next();
        Some(current)
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use allocator_api2::alloc::{AllocError, Allocator, Global};
use core::alloc::Layout;
use core::ptr::NonNull;

/// Alignment of every arena's allocatable region. Context nodes are made of
/// 64-bit words, so this is also the alignment of every node.
pub const ARENA_ALIGNMENT: usize = 8;

/// [Arena] is a bump allocator over a single, zero-initialized block of
/// memory. Allocations are never returned individually; the whole block is
/// released when the arena is dropped.
///
/// Allocations are expressed as byte offsets into the arena rather than as
/// pointers, so they remain valid handles for as long as the arena lives.
///
/// Intentionally not thread safe: the owner of the [ArenaList] the arena
/// belongs to must hold whatever guard protects that list.
pub struct Arena<A: Allocator = Global> {
    allocation_ptr: NonNull<u8>,
    allocation_layout: Layout,
    size: usize,
    pos: usize,
    allocator: A,
}

// SAFETY: the arena exclusively owns its allocation.
unsafe impl<A: Allocator + Send> Send for Arena<A> {}

impl Arena<Global> {
    /// Creates an arena with `size` bytes of allocatable capacity from the
    /// global allocator.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        Self::new_in(size, Global)
    }
}

impl<A: Allocator> Arena<A> {
    /// Creates an arena with exactly `size` bytes of allocatable capacity.
    /// The whole region is zero-filled. The backing allocation may be padded
    /// up to [ARENA_ALIGNMENT], but the padding is never handed out.
    pub fn new_in(size: usize, allocator: A) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(size.max(ARENA_ALIGNMENT), ARENA_ALIGNMENT)
            .map_err(|_| AllocError)?
            .pad_to_align();
        let allocation = allocator.allocate_zeroed(layout)?;
        Ok(Self {
            allocation_ptr: allocation.cast(),
            allocation_layout: layout,
            size,
            pos: 0,
            allocator,
        })
    }

    /// Number of allocatable bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of bytes handed out so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.size - self.pos
    }

    /// Bytes requested from the underlying allocator for this arena.
    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.allocation_layout.size()
    }

    /// Reserves `n` bytes and returns their offset from the start of the
    /// arena, or `None` if fewer than `n` bytes remain. The arena never grows;
    /// on `None` the caller appends a new arena to the list and retries there.
    #[inline]
    pub fn try_bump_allocate(&mut self, n: usize) -> Option<usize> {
        let end = self.pos.checked_add(n)?;
        if end > self.size {
            return None;
        }
        let start = self.pos;
        self.pos = end;
        Some(start)
    }

    /// The whole allocatable region, including bytes not handed out yet.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the allocation is at least `size` bytes, was zero-filled on
        // creation, and lives as long as `self`.
        unsafe { core::slice::from_raw_parts(self.allocation_ptr.as_ptr(), self.size) }
    }

    /// The allocatable region viewed as 64-bit words. A trailing partial word
    /// is not included.
    pub(crate) fn words(&self) -> &[u64] {
        // SAFETY: the allocation is aligned to ARENA_ALIGNMENT, at least
        // `size` bytes long, and every bit pattern is a valid u64.
        unsafe {
            core::slice::from_raw_parts(
                self.allocation_ptr.as_ptr().cast::<u64>(),
                self.size / ARENA_ALIGNMENT,
            )
        }
    }

    pub(crate) fn words_mut(&mut self) -> &mut [u64] {
        // SAFETY: same as `words`, and `&mut self` guarantees exclusivity.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.allocation_ptr.as_ptr().cast::<u64>(),
                self.size / ARENA_ALIGNMENT,
            )
        }
    }
}

impl<A: Allocator> Drop for Arena<A> {
    fn drop(&mut self) {
        // SAFETY: passing the original ptr back in, with the same layout.
        unsafe {
            self.allocator
                .deallocate(self.allocation_ptr, self.allocation_layout)
        };
    }
}

/// An ordered, append-only chain of arenas. Only the last arena (the current
/// one) is allocated from; the earlier ones are considered full. The list
/// owns every arena in it and releases them all together.
pub struct ArenaList<A: Allocator + Clone = Global> {
    arenas: Vec<Arena<A>>,
    allocator: A,
}

impl ArenaList<Global> {
    pub fn new(first_size: usize) -> Result<Self, AllocError> {
        Self::new_in(first_size, Global)
    }
}

impl<A: Allocator + Clone> ArenaList<A> {
    /// Creates a list holding a single arena of `first_size` bytes.
    pub fn new_in(first_size: usize, allocator: A) -> Result<Self, AllocError> {
        let first = Arena::new_in(first_size, allocator.clone())?;
        Ok(Self {
            arenas: vec![first],
            allocator,
        })
    }

    /// Creates a new arena of `size` bytes and appends it as the tail of the
    /// chain, making it the current arena.
    #[cold]
    #[inline(never)]
    pub fn allocate_new_arena(&mut self, size: usize) -> Result<&mut Arena<A>, AllocError> {
        let arena = Arena::new_in(size, self.allocator.clone())?;
        self.arenas.push(arena);
        let last = self.arenas.len() - 1;
        Ok(&mut self.arenas[last])
    }

    /// Number of arenas in the chain. Never zero.
    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arena<A>> {
        self.arenas.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Arena<A>> {
        self.arenas.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arena<A>> {
        self.arenas.iter()
    }

    /// Index of the arena allocations are currently made from.
    pub fn current_index(&self) -> usize {
        self.arenas.len() - 1
    }

    /// Bump-allocates `n` bytes from the current arena, returning the arena
    /// index and the byte offset within it.
    pub fn try_bump_allocate(&mut self, n: usize) -> Option<(usize, usize)> {
        let index = self.current_index();
        let offset = self.arenas.get_mut(index)?.try_bump_allocate(n)?;
        Some((index, offset))
    }

    /// Bytes consumed, counting the unused tail of every non-current arena
    /// as consumed since it will never be handed out.
    pub fn used_bytes(&self) -> usize {
        let Some((current, full)) = self.arenas.split_last() else {
            return 0;
        };
        full.iter().map(Arena::size).sum::<usize>() + current.position()
    }

    /// Bytes requested from the underlying allocator for the whole chain.
    pub fn reserved_bytes(&self) -> usize {
        self.arenas.iter().map(Arena::reserved_bytes).sum()
    }
}

/// Releases every arena in the chain and leaves `list` empty. Returns the
/// number of arenas that were released.
pub fn free_arena_list<A: Allocator + Clone>(list: &mut Option<ArenaList<A>>) -> usize {
    match list.take() {
        Some(list) => {
            let released = list.len();
            drop(list);
            released
        }
        None => 0,
    }
}

/// Size of the arena to create when `needed` bytes do not fit in the current
/// one: oversized requests get an arena of twice their size, everything else
/// the configured default.
pub(crate) fn next_arena_size(needed: usize, default_size: usize) -> usize {
    if needed >= default_size {
        needed.saturating_mul(2)
    } else {
        default_size
    }
}

/// Aborts after failing to allocate an arena of `size` bytes.
#[cold]
#[inline(never)]
pub(crate) fn arena_allocation_failed(size: usize) -> ! {
    match Layout::from_size_align(size, ARENA_ALIGNMENT) {
        Ok(layout) => std::alloc::handle_alloc_error(layout),
        Err(_) => std::process::abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Forwards to [Global] and counts live allocations.
    #[derive(Clone, Default)]
    struct CountingAllocator {
        live: Arc<AtomicUsize>,
    }

    unsafe impl Allocator for CountingAllocator {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            let ptr = Global.allocate(layout)?;
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(ptr)
        }

        fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            let ptr = Global.allocate_zeroed(layout)?;
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(ptr)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            Global.deallocate(ptr, layout)
        }
    }

    #[test]
    fn test_zero_init() -> Result<(), AllocError> {
        let arena = Arena::new(4096)?;
        assert_eq!(4096, arena.size());
        assert_eq!(0, arena.position());
        assert!(arena.as_bytes().iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn test_exact_fill() -> Result<(), AllocError> {
        let mut arena = Arena::new(100)?;
        assert_eq!(Some(0), arena.try_bump_allocate(40));
        assert_eq!(Some(40), arena.try_bump_allocate(50));
        assert_eq!(Some(90), arena.try_bump_allocate(10));
        assert_eq!(100, arena.position());
        assert_eq!(None, arena.try_bump_allocate(1));
        // A failed allocation doesn't move the position.
        assert_eq!(100, arena.position());
        Ok(())
    }

    #[test]
    fn test_oversized_request() -> Result<(), AllocError> {
        let mut arena = Arena::new(16)?;
        assert_eq!(None, arena.try_bump_allocate(17));
        assert_eq!(None, arena.try_bump_allocate(usize::MAX));
        assert_eq!(Some(0), arena.try_bump_allocate(16));
        Ok(())
    }

    #[test]
    fn test_zero_sized_arena() -> Result<(), AllocError> {
        let mut arena = Arena::new(0)?;
        assert_eq!(0, arena.size());
        assert_eq!(Some(0), arena.try_bump_allocate(0));
        assert_eq!(None, arena.try_bump_allocate(1));
        assert!(arena.words().is_empty());
        Ok(())
    }

    #[test]
    fn test_words_view() -> Result<(), AllocError> {
        let mut arena = Arena::new(20)?;
        // 20 bytes hold two whole words.
        assert_eq!(2, arena.words().len());
        arena.words_mut()[1] = u64::MAX;
        assert_eq!(&[0xff; 8], &arena.as_bytes()[8..16]);
        assert_eq!(&[0; 4], &arena.as_bytes()[16..20]);
        Ok(())
    }

    #[test]
    fn test_list_growth() -> Result<(), AllocError> {
        let mut list = ArenaList::new(64)?;
        assert_eq!(1, list.len());
        assert_eq!(Some((0, 0)), list.try_bump_allocate(48));
        assert_eq!(None, list.try_bump_allocate(24));

        let arena = list.allocate_new_arena(128)?;
        assert_eq!(128, arena.size());
        assert_eq!(2, list.len());
        assert_eq!(1, list.current_index());
        assert_eq!(Some((1, 0)), list.try_bump_allocate(24));

        // The unused tail of the first arena counts as used.
        assert_eq!(64 + 24, list.used_bytes());
        assert!(list.reserved_bytes() >= 64 + 128);
        Ok(())
    }

    #[test]
    fn test_free_arena_list() -> Result<(), AllocError> {
        let allocator = CountingAllocator::default();
        let mut list = Some(ArenaList::new_in(32, allocator.clone())?);
        if let Some(list) = list.as_mut() {
            for _ in 0..4 {
                list.allocate_new_arena(32)?;
            }
        }
        assert_eq!(5, allocator.live.load(Ordering::SeqCst));

        assert_eq!(5, free_arena_list(&mut list));
        assert!(list.is_none());
        assert_eq!(0, allocator.live.load(Ordering::SeqCst));

        // Freeing an already freed list is a no-op.
        assert_eq!(0, free_arena_list(&mut list));
        Ok(())
    }

    #[test]
    fn test_next_arena_size() {
        assert_eq!(1024, next_arena_size(10, 1024));
        assert_eq!(2048, next_arena_size(1024, 1024));
        assert_eq!(usize::MAX, next_arena_size(usize::MAX, 1024));
    }

    #[test]
    fn fuzz() {
        bolero::check!()
            .with_type::<(u16, Vec<u16>)>()
            .for_each(|(size, requests)| {
                let size = *size as usize;
                let mut arena = Arena::new(size).unwrap();
                let mut total = 0usize;
                for request in requests {
                    let request = *request as usize;
                    match arena.try_bump_allocate(request) {
                        Some(offset) => {
                            assert_eq!(total, offset);
                            total += request;
                            assert!(total <= size);
                        }
                        None => assert!(total + request > size),
                    }
                    assert_eq!(total, arena.position());
                    assert!(arena.position() <= arena.size());
                }
            });
    }
}

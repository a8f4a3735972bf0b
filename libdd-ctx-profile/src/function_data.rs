// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collection;
use crate::context::Context;
use crate::node::Guid;
use crate::root::ContextRoot;
use parking_lot::{const_mutex, Mutex};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::OnceLock;

/// Per-function record, one `static` per instrumented function.
///
/// The context root is created on the first entry and published once; from
/// then on it is read without locking. Functions that must never own a root
/// are marked with [FunctionData::mark_ineligible_root] before their first
/// entry.
pub struct FunctionData {
    ctx_root: AtomicPtr<ContextRoot>,
    ineligible: AtomicBool,
    mutex: Mutex<()>,
    flat: OnceLock<FlatProfile>,
    flat_registered: AtomicBool,
}

impl Default for FunctionData {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionData {
    pub const fn new() -> Self {
        Self {
            ctx_root: AtomicPtr::new(ptr::null_mut()),
            ineligible: AtomicBool::new(false),
            mutex: const_mutex(()),
            flat: OnceLock::new(),
            flat_registered: AtomicBool::new(false),
        }
    }

    /// The root, if it was already created.
    #[inline]
    pub fn context_root(&self) -> Option<&'static ContextRoot> {
        let root = self.ctx_root.load(Ordering::Acquire);
        // SAFETY: `ctx_root` is either null or a leaked, never freed box.
        unsafe { root.as_ref() }
    }

    /// Returns the root, creating it on first use. `None` for functions
    /// marked as ineligible.
    #[inline]
    pub fn get_or_allocate_context_root(&'static self) -> Option<&'static ContextRoot> {
        if let Some(root) = self.context_root() {
            return Some(root);
        }
        if self.ineligible.load(Ordering::Acquire) {
            return None;
        }
        self.allocate_context_root()
    }

    #[cold]
    fn allocate_context_root(&'static self) -> Option<&'static ContextRoot> {
        let _lock = self.mutex.lock();
        if let Some(root) = self.context_root() {
            return Some(root);
        }
        if self.ineligible.load(Ordering::Relaxed) {
            return None;
        }
        let root: &'static ContextRoot = Box::leak(Box::new(ContextRoot::new()));
        collection::register_root(root);
        self.ctx_root.store(ptr::from_ref(root).cast_mut(), Ordering::Release);
        tracing::debug!("allocated context root for function data at {:p}", self);
        Some(root)
    }

    /// Prevents this function from ever owning a context root; entering it
    /// behaves like calling an ordinary callee. Fails if the root already
    /// exists.
    pub fn mark_ineligible_root(&self) -> bool {
        let _lock = self.mutex.lock();
        if self.context_root().is_some() {
            return false;
        }
        self.ineligible.store(true, Ordering::Release);
        true
    }

    pub fn is_ineligible_root(&self) -> bool {
        self.ineligible.load(Ordering::Acquire)
    }

    pub fn flat_profile(&self) -> Option<&FlatProfile> {
        self.flat.get()
    }

    /// Counts an activation happening outside any entry point.
    pub(crate) fn flat_context(&'static self, guid: Guid, num_counters: u32) -> Context {
        let flat = self.flat.get_or_init(|| FlatProfile::new(guid, num_counters));
        if flat.guid != guid || flat.counters.len() != num_counters as usize {
            return Context::Scratch;
        }
        if !self.flat_registered.swap(true, Ordering::AcqRel) {
            collection::register_flat(self);
        }
        flat.add(0, 1);
        Context::Flat(flat)
    }

    /// Zeroes the flat profile and drops it from the next fetch until the
    /// function runs again.
    pub(crate) fn detach_flat(&self) {
        if let Some(flat) = self.flat.get() {
            flat.reset();
        }
        self.flat_registered.store(false, Ordering::Release);
    }
}

/// Counters of a function for the activations that happened while its
/// thread was not inside any entry point. Any thread may update them.
#[derive(Debug)]
pub struct FlatProfile {
    guid: Guid,
    counters: Box<[AtomicU64]>,
}

impl FlatProfile {
    fn new(guid: Guid, num_counters: u32) -> Self {
        Self {
            guid,
            counters: (0..num_counters).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    #[inline]
    pub fn add(&self, counter: u32, delta: u64) {
        if let Some(value) = self.counters.get(counter as usize) {
            value.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn counter(&self, counter: u32) -> Option<u64> {
        self.counters
            .get(counter as usize)
            .map(|value| value.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        for value in self.counters.iter() {
            value.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.counters
            .iter()
            .map(|value| value.load(Ordering::Relaxed))
            .collect()
    }
}

/// Identity of a callee as published at a callsite. The caller publishes the
/// id of the function it is about to call; the callee compares it with its
/// own to tell whether the call is the one that was published.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CalleeId(usize);

impl CalleeId {
    pub fn of(fdata: &FunctionData) -> Self {
        Self(ptr::from_ref(fdata) as usize)
    }

    /// For callees identified by something other than their [FunctionData],
    /// such as a function address.
    pub const fn from_raw(id: usize) -> Self {
        Self(id)
    }
}

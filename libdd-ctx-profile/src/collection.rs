// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::context;
use crate::error::ProfileError;
use crate::function_data::FunctionData;
use crate::root::ContextRoot;
use crate::writer::{ProfileSnapshot, ProfileWriter};
use parking_lot::{const_mutex, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Every root ever created. Roots live for the rest of the process.
static CONTEXT_ROOTS: Mutex<Vec<&'static ContextRoot>> = const_mutex(Vec::new());

/// Functions whose flat profile saw activity since the last [free].
static FLAT_FUNCTIONS: Mutex<Vec<&'static FunctionData>> = const_mutex(Vec::new());

/// Flat profiles are only collected between [start_collection] and [fetch].
static PROFILING_STARTED: AtomicBool = AtomicBool::new(false);

pub(crate) fn register_root(root: &'static ContextRoot) {
    CONTEXT_ROOTS.lock().push(root);
}

pub(crate) fn register_flat(fdata: &'static FunctionData) {
    FLAT_FUNCTIONS.lock().push(fdata);
}

#[inline]
pub(crate) fn profiling_started() -> bool {
    PROFILING_STARTED.load(Ordering::Acquire)
}

// The registries are copied out before waiting on any root's guard: the
// guard holder may be registering a root at the same time.
fn roots() -> Vec<&'static ContextRoot> {
    CONTEXT_ROOTS.lock().clone()
}

fn flat_functions() -> Vec<&'static FunctionData> {
    FLAT_FUNCTIONS.lock().clone()
}

fn ensure_outside_entry_point() -> Result<(), ProfileError> {
    if context::holds_root_guard() {
        return Err(ProfileError::InsideEntryPoint);
    }
    Ok(())
}

/// Zeroes every counter collected so far, keeping the shape of the context
/// trees, and starts collecting flat profiles.
///
/// `autodetect` would ask for entry points to be discovered by sampling;
/// only explicitly instrumented entry points are supported, so it is
/// accepted and logged.
pub fn start_collection(autodetect: Option<Duration>) -> Result<(), ProfileError> {
    ensure_outside_entry_point()?;
    if let Some(duration) = autodetect {
        tracing::info!(
            "root auto-detection for {duration:?} is not supported, collecting explicit roots"
        );
    }
    let roots = roots();
    let arenas: usize = roots.iter().map(|root| root.reset()).sum();
    for fdata in flat_functions() {
        if let Some(flat) = fdata.flat_profile() {
            flat.reset();
        }
    }
    PROFILING_STARTED.store(true, Ordering::Release);
    tracing::info!(
        "started contextual profile collection with {} roots using {arenas} arenas",
        roots.len()
    );
    Ok(())
}

/// Stops collecting flat profiles and hands everything collected to
/// `writer`. Counters are left as they are, so a later fetch sees them
/// summed with whatever happens in between.
pub fn fetch<W: ProfileWriter + ?Sized>(writer: &mut W) -> Result<(), ProfileError> {
    ensure_outside_entry_point()?;
    PROFILING_STARTED.store(false, Ordering::Release);

    writer.start_context_section();
    for root in roots() {
        root.write_to(writer)?;
    }
    writer.end_context_section();

    writer.start_flat_section();
    for fdata in flat_functions() {
        if let Some(flat) = fdata.flat_profile() {
            writer.write_flat(flat.guid(), &flat.snapshot());
        }
    }
    writer.end_flat_section();
    Ok(())
}

/// [fetch] into a fresh [ProfileSnapshot].
pub fn fetch_snapshot() -> Result<ProfileSnapshot, ProfileError> {
    let mut snapshot = ProfileSnapshot::default();
    fetch(&mut snapshot)?;
    Ok(snapshot)
}

/// Releases the memory of every context tree and forgets the flat profiles.
/// The next entries start from empty trees.
pub fn free() -> Result<(), ProfileError> {
    ensure_outside_entry_point()?;
    PROFILING_STARTED.store(false, Ordering::Release);
    let released: usize = roots().iter().map(|root| root.free()).sum();
    let flat = std::mem::take(&mut *FLAT_FUNCTIONS.lock());
    for fdata in &flat {
        fdata.detach_flat();
    }
    tracing::info!("freed {released} arenas and {} flat profiles", flat.len());
    Ok(())
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::node::Guid;

/// Errors reported by the administrative operations. The instrumentation
/// entry points never fail: they degrade to scratch or unhandled contexts.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    /// The calling thread is inside an entry point and holds a context
    /// root's guard, so blocking on the guards would deadlock.
    #[error("administrative operation called from inside an entry point")]
    InsideEntryPoint,
    /// A node is reachable more than once, or a handle doesn't resolve.
    #[error("context tree rooted at guid {guid:#x} is malformed")]
    InvalidTree { guid: Guid },
}

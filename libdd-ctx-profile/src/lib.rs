// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Contextual profiling runtime.
//!
//! Instrumented functions count their executions per calling context: each
//! entry point owns a tree whose nodes are the functions reached from it,
//! keyed by the callsite they were reached through. Trees live in arenas
//! owned by their root and are built by one thread at a time; concurrent
//! entries into the same root write to scratch instead of waiting.
//!
//! A profiling session calls [start_collection], lets the program run, then
//! [fetch]es the trees and flat profiles into a [ProfileWriter], and finally
//! [free]s the memory.

pub mod arena;
mod collection;
pub mod config;
mod context;
mod error;
mod function_data;
mod node;
mod root;
mod writer;

pub use collection::*;
pub use config::{configure, CtxProfileConfig};
pub use context::*;
pub use error::*;
pub use function_data::*;
pub use node::{ContextNode, Guid, NodeRef, NodeShape, Siblings};
pub use root::{ContextRoot, UnhandledContexts};
pub use writer::*;

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default arena size: 1 MiB.
pub const DEFAULT_ARENA_SIZE: usize = 1024 * 1024;

/// Arenas smaller than this would hold only a handful of nodes.
pub const MIN_ARENA_SIZE: usize = 4096;

/// Environment variable overriding [CtxProfileConfig::arena_size].
pub const ARENA_SIZE_ENV: &str = "DD_CTXPROF_ARENA_SIZE";

static ARENA_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_ARENA_SIZE);

/// Process-wide tuning of the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtxProfileConfig {
    /// Size in bytes of each arena backing a context tree. Nodes larger than
    /// this get a dedicated arena of twice their size.
    pub arena_size: usize,
}

impl Default for CtxProfileConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }
}

impl CtxProfileConfig {
    /// Reads the configuration from the environment, keeping the default for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(ARENA_SIZE_ENV) {
            match value.trim().parse::<usize>() {
                Ok(size) => config.arena_size = size,
                Err(err) => {
                    tracing::warn!("ignoring {ARENA_SIZE_ENV}={value:?}: {err}");
                }
            }
        }
        config
    }
}

/// Installs `config` for the whole process. Arenas that already exist keep
/// their size; only arenas created afterwards are affected.
pub fn configure(config: &CtxProfileConfig) {
    let arena_size = config.arena_size.max(MIN_ARENA_SIZE);
    if arena_size != config.arena_size {
        tracing::warn!(
            "arena size {} is below the minimum, using {arena_size}",
            config.arena_size
        );
    }
    ARENA_SIZE.store(arena_size, Ordering::Relaxed);
}

#[inline]
pub(crate) fn arena_size() -> usize {
    ARENA_SIZE.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CtxProfileConfig::default();
        assert_eq!(DEFAULT_ARENA_SIZE, config.arena_size);

        let parsed: CtxProfileConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_deserialize() {
        let parsed: CtxProfileConfig = serde_json::from_str(r#"{"arena_size": 8192}"#).unwrap();
        assert_eq!(8192, parsed.arena_size);
    }
}

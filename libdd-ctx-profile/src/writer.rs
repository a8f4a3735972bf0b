// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::node::{ContextNode, Guid};
use crate::root::UnhandledContexts;
use serde::{Deserialize, Serialize};

/// Receives the profile during [crate::fetch]. Contextual profiles come
/// first, one call per entry point, then the flat profiles. The tree handed
/// to [ProfileWriter::write_contextual] is only borrowed for the duration of
/// the call: the root's guard is held meanwhile, so the writer must not call
/// back into the runtime for that root.
pub trait ProfileWriter {
    fn start_context_section(&mut self) {}

    fn write_contextual(
        &mut self,
        root: ContextNode<'_>,
        unhandled: UnhandledContexts<'_>,
        total_entries: u64,
    );

    fn end_context_section(&mut self) {}

    fn start_flat_section(&mut self) {}

    fn write_flat(&mut self, guid: Guid, counters: &[u64]);

    fn end_flat_section(&mut self) {}
}

/// An owned copy of a fetched profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub roots: Vec<RootSnapshot>,
    pub flat: Vec<FlatSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSnapshot {
    pub context: ContextSnapshot,
    pub unhandled: Vec<ContextSnapshot>,
    pub total_entries: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatSnapshot {
    pub guid: Guid,
    pub counters: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub guid: Guid,
    pub counters: Vec<u64>,
    /// For each callsite, the callees observed there.
    pub callsites: Vec<Vec<ContextSnapshot>>,
}

impl ContextSnapshot {
    pub fn from_node(node: ContextNode<'_>) -> Self {
        Self {
            guid: node.guid(),
            counters: node.counters().to_vec(),
            callsites: node
                .callsites()
                .map(|callees| callees.map(Self::from_node).collect())
                .collect(),
        }
    }

    /// Number of times this context was entered.
    pub fn entries(&self) -> u64 {
        self.counters.first().copied().unwrap_or(0)
    }

    pub fn child(&self, callsite: usize, guid: Guid) -> Option<&ContextSnapshot> {
        self.callsites.get(callsite)?.iter().find(|c| c.guid == guid)
    }

    /// Sums `other` into `self` position by position: counters of the same
    /// index, callees of the same GUID at the same callsite. Contexts with a
    /// different GUID are left alone.
    pub fn merge(&mut self, other: &ContextSnapshot) {
        if self.guid != other.guid {
            return;
        }
        add_counters(&mut self.counters, &other.counters);
        if self.callsites.len() < other.callsites.len() {
            self.callsites.resize_with(other.callsites.len(), Vec::new);
        }
        for (mine, theirs) in self.callsites.iter_mut().zip(&other.callsites) {
            merge_by_guid(mine, theirs);
        }
    }
}

fn add_counters(mine: &mut Vec<u64>, theirs: &[u64]) {
    if mine.len() < theirs.len() {
        mine.resize(theirs.len(), 0);
    }
    for (a, b) in mine.iter_mut().zip(theirs) {
        *a = a.wrapping_add(*b);
    }
}

fn merge_by_guid(mine: &mut Vec<ContextSnapshot>, theirs: &[ContextSnapshot]) {
    for context in theirs {
        match mine.iter_mut().find(|c| c.guid == context.guid) {
            Some(existing) => existing.merge(context),
            None => mine.push(context.clone()),
        }
    }
}

impl ProfileSnapshot {
    pub fn root(&self, guid: Guid) -> Option<&RootSnapshot> {
        self.roots.iter().find(|r| r.context.guid == guid)
    }

    pub fn flat(&self, guid: Guid) -> Option<&FlatSnapshot> {
        self.flat.iter().find(|f| f.guid == guid)
    }

    /// Sums `other` into `self`, root by root and node by node.
    pub fn merge(&mut self, other: &ProfileSnapshot) {
        for root in &other.roots {
            match self
                .roots
                .iter_mut()
                .find(|r| r.context.guid == root.context.guid)
            {
                Some(existing) => {
                    existing.context.merge(&root.context);
                    merge_by_guid(&mut existing.unhandled, &root.unhandled);
                    existing.total_entries =
                        existing.total_entries.wrapping_add(root.total_entries);
                }
                None => self.roots.push(root.clone()),
            }
        }
        for flat in &other.flat {
            match self.flat.iter_mut().find(|f| f.guid == flat.guid) {
                Some(existing) => add_counters(&mut existing.counters, &flat.counters),
                None => self.flat.push(flat.clone()),
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ProfileWriter for ProfileSnapshot {
    fn write_contextual(
        &mut self,
        root: ContextNode<'_>,
        unhandled: UnhandledContexts<'_>,
        total_entries: u64,
    ) {
        self.roots.push(RootSnapshot {
            context: ContextSnapshot::from_node(root),
            unhandled: unhandled.map(ContextSnapshot::from_node).collect(),
            total_entries,
        });
    }

    fn write_flat(&mut self, guid: Guid, counters: &[u64]) {
        self.flat.push(FlatSnapshot {
            guid,
            counters: counters.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(guid: Guid, counters: &[u64]) -> ContextSnapshot {
        ContextSnapshot {
            guid,
            counters: counters.to_vec(),
            callsites: Vec::new(),
        }
    }

    #[test]
    fn test_merge_sums_matching_positions() {
        let mut a = ContextSnapshot {
            guid: 1,
            counters: vec![1, 2],
            callsites: vec![vec![leaf(10, &[3])], vec![]],
        };
        let b = ContextSnapshot {
            guid: 1,
            counters: vec![4, 5],
            callsites: vec![vec![leaf(10, &[1]), leaf(11, &[7])], vec![leaf(12, &[2])]],
        };
        a.merge(&b);
        assert_eq!(vec![5, 7], a.counters);
        assert_eq!(Some(4), a.child(0, 10).map(ContextSnapshot::entries));
        assert_eq!(Some(7), a.child(0, 11).map(ContextSnapshot::entries));
        assert_eq!(Some(2), a.child(1, 12).map(ContextSnapshot::entries));
        assert_eq!(None, a.child(1, 10));
    }

    #[test]
    fn test_merge_ignores_other_guid() {
        let mut a = leaf(1, &[1]);
        a.merge(&leaf(2, &[100]));
        assert_eq!(vec![1], a.counters);
    }

    #[test]
    fn test_profile_merge_and_json() -> anyhow::Result<()> {
        let mut a = ProfileSnapshot {
            roots: vec![RootSnapshot {
                context: leaf(1, &[2]),
                unhandled: vec![leaf(5, &[1])],
                total_entries: 3,
            }],
            flat: vec![FlatSnapshot {
                guid: 9,
                counters: vec![1, 1],
            }],
        };
        let b = a.clone();
        a.merge(&b);
        let root = a.root(1).unwrap();
        assert_eq!(6, root.total_entries);
        assert_eq!(4, root.context.entries());
        assert_eq!(vec![2], root.unhandled[0].counters);
        assert_eq!(vec![2, 2], a.flat(9).unwrap().counters);

        let parsed: ProfileSnapshot = serde_json::from_str(&a.to_json()?)?;
        assert_eq!(a, parsed);
        Ok(())
    }
}

//! The fixed universe of breakpoints for a run.
//!
//! A count breakpoint fires on the `count`-th execution of its PC. A path
//! breakpoint carries the call sites leading to its PC and fires when its
//! [`BacktracePathMatcher`] is satisfied. Either way each id fires at most
//! once, and the registry knows when every id has fired.

use std::collections::{HashMap, HashSet};

use tracing::info;
use waypoint_types::{BreakpointId, BreakpointKey, BreakpointSpec, Pc, TriggerSource};

use crate::backtrace::{BacktracePathMatcher, PathSatisfied};
use crate::error::{ConsistencyError, LoadError};

/// A breakpoint that just fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub id: BreakpointId,
    pub key: BreakpointKey,
    pub source: TriggerSource,
    /// Set on the firing that completes the universe.
    pub all_visited: bool,
    pub path: Option<PathSatisfied>,
}

#[derive(Debug, Clone, Copy)]
enum EntryKind {
    Count,
    Path(usize),
}

#[derive(Debug, Clone)]
struct Entry {
    id: BreakpointId,
    key: BreakpointKey,
    kind: EntryKind,
    visited: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BreakpointRegistry {
    entries: Vec<Entry>,
    by_key: HashMap<BreakpointKey, usize>,
    counters: HashMap<Pc, u64>,
    matchers: Vec<BacktracePathMatcher>,
    matcher_entries: Vec<usize>,
    path_nodes: HashMap<Pc, Vec<usize>>,
    fired: usize,
}

impl BreakpointRegistry {
    pub fn load(specs: impl IntoIterator<Item = BreakpointSpec>) -> Result<Self, LoadError> {
        let mut registry = Self::default();
        let mut ids = HashSet::new();

        for spec in specs {
            if !ids.insert(spec.id) {
                return Err(LoadError::DuplicateId(spec.id));
            }
            let key = spec.key();
            let entry = registry.entries.len();

            let kind = if !spec.is_path() {
                if let Some(&first) = registry.by_key.get(&key) {
                    return Err(LoadError::DuplicateKey {
                        key,
                        first: registry.entries[first].id,
                        second: spec.id,
                    });
                }
                registry.by_key.insert(key, entry);
                registry.counters.entry(spec.pc).or_insert(0);
                EntryKind::Count
            } else {
                let path = spec.ancestors.iter().copied().chain([spec.pc]);
                let matcher = BacktracePathMatcher::new(spec.id, spec.slice, path, spec.count)
                    .map_err(|source| LoadError::Invariant {
                        id: spec.id,
                        source,
                    })?;
                let index = registry.matchers.len();
                for &pc in matcher.path() {
                    registry.path_nodes.entry(pc).or_default().push(index);
                }
                registry.matchers.push(matcher);
                registry.matcher_entries.push(entry);
                EntryKind::Path(index)
            };

            registry.entries.push(Entry {
                id: spec.id,
                key,
                kind,
                visited: false,
            });
        }

        info!(
            breakpoints = registry.entries.len(),
            backtraces = registry.matchers.len(),
            "loaded breakpoints"
        );
        Ok(registry)
    }

    /// Whether any breakpoint needs to see executions of `pc`.
    pub fn monitors(&self, pc: Pc) -> bool {
        self.counters.contains_key(&pc) || self.path_nodes.contains_key(&pc)
    }

    /// Counts one execution of `pc` and returns whatever fired because of it.
    pub fn update(&mut self, pc: Pc) -> Result<Vec<Fired>, ConsistencyError> {
        if !self.monitors(pc) {
            return Err(ConsistencyError::UnmonitoredPc { pc });
        }

        let mut fired = Vec::new();

        if let Some(counter) = self.counters.get_mut(&pc) {
            *counter += 1;
            let key = BreakpointKey { pc, count: *counter };
            if let Some(&entry) = self.by_key.get(&key) {
                fired.push(self.visit(entry, None)?);
            }
        }

        let mut satisfied = Vec::new();
        if let Some(indices) = self.path_nodes.get(&pc) {
            for &index in indices {
                if let Some(hit) = self.matchers[index].inc(pc) {
                    satisfied.push((index, hit));
                }
            }
        }
        for (index, hit) in satisfied {
            let entry = self.matcher_entries[index];
            fired.push(self.visit(entry, Some(hit))?);
        }

        Ok(fired)
    }

    fn visit(
        &mut self,
        entry: usize,
        path: Option<PathSatisfied>,
    ) -> Result<Fired, ConsistencyError> {
        let total = self.entries.len();
        let slot = &mut self.entries[entry];
        if slot.visited {
            return Err(ConsistencyError::Retriggered {
                id: slot.id,
                key: slot.key,
            });
        }
        slot.visited = true;
        self.fired += 1;

        let source = match slot.kind {
            EntryKind::Count => TriggerSource::Count,
            EntryKind::Path(_) => TriggerSource::Path,
        };
        info!(
            id = slot.id.get(),
            pc = %slot.key.pc,
            count = slot.key.count,
            fired = self.fired,
            total,
            "triggered breakpoint"
        );

        Ok(Fired {
            id: slot.id,
            key: slot.key,
            source,
            all_visited: self.fired == total,
            path,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fired_count(&self) -> usize {
        self.fired
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|entry| entry.visited)
    }

    /// Global execution count of a count-breakpoint PC.
    pub fn counter(&self, pc: Pc) -> Option<u64> {
        self.counters.get(&pc).copied()
    }

    /// Breakpoints that never fired, ordered by PC then count.
    pub fn unreached(&self) -> Vec<(BreakpointId, BreakpointKey)> {
        let mut unreached: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| !entry.visited)
            .map(|entry| (entry.id, entry.key))
            .collect();
        unreached.sort_by_key(|(id, key)| (*key, *id));
        unreached
    }

    pub fn fired_ids(&self) -> Vec<BreakpointId> {
        self.entries
            .iter()
            .filter(|entry| entry.visited)
            .map(|entry| entry.id)
            .collect()
    }

    pub fn matchers(&self) -> &[BacktracePathMatcher] {
        &self.matchers
    }

    pub fn dump(&self) -> String {
        let mut out = format!(
            "breakpoints: {} fired of {}\n",
            self.fired,
            self.entries.len()
        );
        for entry in &self.entries {
            let seen = match entry.kind {
                EntryKind::Count => self.counters.get(&entry.key.pc).copied().unwrap_or(0),
                EntryKind::Path(index) => self.matchers[index].tail_hits(),
            };
            out.push_str(&format!(
                "  {} ({}) seen {} visited={}\n",
                entry.id, entry.key, seen, entry.visited
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_spec(id: u64, pc: u64, count: u64, ancestors: &[u64]) -> BreakpointSpec {
        BreakpointSpec {
            id: BreakpointId::new(id),
            trigger: TriggerSource::Path,
            pc: Pc::new(pc),
            count,
            ancestors: ancestors.iter().copied().map(Pc::new).collect(),
            slice: 3,
        }
    }

    fn fired_ids(fired: &[Fired]) -> Vec<u64> {
        fired.iter().map(|f| f.id.get()).collect()
    }

    #[test]
    fn same_pc_fires_each_count_once_in_order() {
        let mut registry = BreakpointRegistry::load([
            BreakpointSpec::count(0, 0x1000, 1),
            BreakpointSpec::count(1, 0x1000, 2),
        ])
        .expect("valid breakpoints");

        let first = registry.update(Pc::new(0x1000)).expect("monitored");
        assert_eq!(fired_ids(&first), vec![0]);
        assert!(!first[0].all_visited);

        let second = registry.update(Pc::new(0x1000)).expect("monitored");
        assert_eq!(fired_ids(&second), vec![1]);
        assert!(second[0].all_visited);

        let third = registry.update(Pc::new(0x1000)).expect("monitored");
        assert!(third.is_empty());
        assert!(registry.is_complete());
    }

    #[test]
    fn unreached_lists_missing_coordinates() {
        let mut registry = BreakpointRegistry::load([
            BreakpointSpec::count(0, 0x400, 5),
            BreakpointSpec::count(1, 0x200, 1),
        ])
        .expect("valid breakpoints");
        for _ in 0..3 {
            registry.update(Pc::new(0x400)).expect("monitored");
        }
        assert!(!registry.is_complete());
        assert_eq!(registry.counter(Pc::new(0x400)), Some(3));
        let unreached: Vec<String> = registry
            .unreached()
            .iter()
            .map(|(_, key)| key.to_string())
            .collect();
        assert_eq!(unreached, ["0x200, 1", "0x400, 5"]);
    }

    #[test]
    fn unmonitored_update_is_a_consistency_error() {
        let mut registry =
            BreakpointRegistry::load([BreakpointSpec::count(0, 0x400, 1)]).expect("valid");
        assert!(!registry.monitors(Pc::new(0x404)));
        assert_eq!(
            registry.update(Pc::new(0x404)),
            Err(ConsistencyError::UnmonitoredPc { pc: Pc::new(0x404) })
        );
    }

    #[test]
    fn revisiting_is_a_consistency_error() {
        let mut registry =
            BreakpointRegistry::load([BreakpointSpec::count(4, 0x400, 1)]).expect("valid");
        registry.visit(0, None).expect("first visit");
        let err = registry.visit(0, None).expect_err("second visit");
        assert_eq!(
            err,
            ConsistencyError::Retriggered {
                id: BreakpointId::new(4),
                key: BreakpointKey {
                    pc: Pc::new(0x400),
                    count: 1
                },
            }
        );
    }

    #[test]
    fn path_breakpoint_fires_through_its_matcher() {
        let mut registry = BreakpointRegistry::load([
            path_spec(9, 0xc0, 2, &[0xa0, 0xb0]),
            BreakpointSpec::count(1, 0xb0, 1),
        ])
        .expect("valid");

        let mut fired = Vec::new();
        for pc in [0xa0, 0xb0, 0xc0, 0xa0, 0xb0, 0xc0] {
            fired.extend(registry.update(Pc::new(pc)).expect("monitored"));
        }

        assert_eq!(fired_ids(&fired), vec![1, 9]);
        let path_hit = &fired[1];
        assert_eq!(path_hit.source, TriggerSource::Path);
        assert!(path_hit.all_visited);
        let satisfied = path_hit.path.as_ref().expect("path breakpoints carry a snapshot");
        assert_eq!(satisfied.slice, 3);
        assert_eq!(satisfied.tail_hits, 2);
    }

    #[test]
    fn duplicates_are_rejected() {
        let err = BreakpointRegistry::load([
            BreakpointSpec::count(0, 0x400, 1),
            BreakpointSpec::count(0, 0x500, 1),
        ])
        .expect_err("duplicate id");
        assert!(matches!(err, LoadError::DuplicateId(id) if id.get() == 0));

        let err = BreakpointRegistry::load([
            BreakpointSpec::count(0, 0x400, 1),
            BreakpointSpec::count(1, 0x400, 1),
        ])
        .expect_err("duplicate coordinate");
        assert!(matches!(err, LoadError::DuplicateKey { .. }));
    }
}

//! Call-path-sensitive hit counting.
//!
//! A [`BacktracePathMatcher`] watches an ordered list of PCs: the call sites
//! leading to a target, followed by the target itself. Each hit zeroes the
//! counters of every node after it, so partial progress down the path is
//! forgotten as soon as execution climbs back to an earlier node.

use std::collections::HashMap;

use tracing::debug;
use waypoint_types::{BreakpointId, InvariantError, PathRecord, Pc};

/// Emitted once, when the tail has been hit the expected number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSatisfied {
    pub id: BreakpointId,
    pub slice: u64,
    pub tail: Pc,
    pub tail_hits: u64,
    pub snapshot: Vec<PathRecord>,
}

#[derive(Debug, Clone)]
pub struct BacktracePathMatcher {
    id: BreakpointId,
    slice: u64,
    path: Vec<Pc>,
    index: HashMap<Pc, usize>,
    hits: Vec<u64>,
    tail: Pc,
    expected: u64,
    tail_hits: u64,
    stopped: bool,
}

impl BacktracePathMatcher {
    /// `path` runs from the outermost call site to the target. Repeated PCs
    /// (recursive call sites) keep the position of their first occurrence.
    pub fn new(
        id: BreakpointId,
        slice: u64,
        path: impl IntoIterator<Item = Pc>,
        expected: u64,
    ) -> Result<Self, InvariantError> {
        let mut index = HashMap::new();
        let mut deduped = Vec::new();
        for pc in path {
            if !index.contains_key(&pc) {
                index.insert(pc, deduped.len());
                deduped.push(pc);
            }
        }
        let tail = *deduped.last().ok_or(InvariantError::EmptyPath)?;

        Ok(Self {
            id,
            slice,
            hits: vec![0; deduped.len()],
            path: deduped,
            index,
            tail,
            expected,
            tail_hits: 0,
            stopped: false,
        })
    }

    pub fn inc(&mut self, pc: Pc) -> Option<PathSatisfied> {
        if self.stopped {
            return None;
        }
        let position = *self.index.get(&pc)?;

        if pc == self.tail {
            self.tail_hits += 1;
        }
        self.hits[position] += 1;
        for later in &mut self.hits[position + 1..] {
            *later = 0;
        }

        if self.tail_hits < self.expected {
            return None;
        }

        self.stopped = true;
        let satisfied = PathSatisfied {
            id: self.id,
            slice: self.slice,
            tail: self.tail,
            tail_hits: self.tail_hits,
            snapshot: self.snapshot(),
        };
        debug!(
            id = self.id.get(),
            slice = self.slice,
            tail = %self.tail,
            tail_hits = self.tail_hits,
            expected = self.expected,
            trace = %render_snapshot(&satisfied.snapshot),
            "backtrace reached expected count"
        );
        Some(satisfied)
    }

    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn slice(&self) -> u64 {
        self.slice
    }

    pub fn tail(&self) -> Pc {
        self.tail
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn tail_hits(&self) -> u64 {
        self.tail_hits
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn path(&self) -> &[Pc] {
        &self.path
    }

    pub fn contains(&self, pc: Pc) -> bool {
        self.index.contains_key(&pc)
    }

    /// Per-node counters in path order.
    pub fn snapshot(&self) -> Vec<PathRecord> {
        self.path
            .iter()
            .zip(&self.hits)
            .map(|(&pc, &count)| PathRecord { pc, count })
            .collect()
    }
}

fn render_snapshot(records: &[PathRecord]) -> String {
    records
        .iter()
        .map(|record| format!("{}:{}", record.pc, record.count))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Pc = Pc::new(0xa0);
    const B: Pc = Pc::new(0xb0);
    const C: Pc = Pc::new(0xc0);

    fn matcher(path: &[Pc], expected: u64) -> BacktracePathMatcher {
        BacktracePathMatcher::new(BreakpointId::new(7), 0, path.iter().copied(), expected)
            .expect("non-empty path")
    }

    fn feed(matcher: &mut BacktracePathMatcher, pcs: &[Pc]) -> Vec<usize> {
        pcs.iter()
            .enumerate()
            .filter_map(|(step, &pc)| matcher.inc(pc).map(|_| step))
            .collect()
    }

    fn counts(matcher: &BacktracePathMatcher) -> Vec<u64> {
        matcher.snapshot().iter().map(|r| r.count).collect()
    }

    #[test]
    fn fires_once_after_second_full_walk() {
        let mut m = matcher(&[A, B, C], 2);
        assert_eq!(feed(&mut m, &[A, B, C, A, B, C]), vec![5]);
        assert!(m.is_stopped());
        assert_eq!(feed(&mut m, &[A, B, C]), Vec::<usize>::new());
    }

    #[test]
    fn restarted_walk_does_not_fire() {
        let mut m = matcher(&[A, B, C], 2);
        assert!(feed(&mut m, &[A, B, C, A, B]).is_empty());
        assert!(!m.is_stopped());
        assert_eq!(m.tail_hits(), 1);
    }

    #[test]
    fn recursion_collapses_to_one_node() {
        let mut m = matcher(&[A, A, A], 3);
        assert_eq!(m.path(), &[A]);
        assert_eq!(feed(&mut m, &[A, A, A]), vec![2]);
    }

    #[test]
    fn repeated_ancestor_keeps_first_position() {
        let m = matcher(&[A, B, A, C], 1);
        assert_eq!(m.path(), &[A, B, C]);
        assert_eq!(m.tail(), C);
    }

    #[test]
    fn earlier_hit_resets_later_nodes() {
        let mut m = matcher(&[A, B, C], 10);
        feed(&mut m, &[A, B, B, C]);
        assert_eq!(counts(&m), vec![1, 2, 1]);
        feed(&mut m, &[B]);
        assert_eq!(counts(&m), vec![1, 3, 0]);
        feed(&mut m, &[A]);
        assert_eq!(counts(&m), vec![2, 0, 0]);
        assert_eq!(m.tail_hits(), 1);
    }

    #[test]
    fn counters_match_replay_of_suffix_after_reset() {
        let sequence = [A, B, C, C, B, C, A, B, C, C];
        let mut full = matcher(&[A, B, C], u64::MAX);
        feed(&mut full, &sequence);

        // The last hit on A (index 6) reset everything after it.
        let mut suffix = matcher(&[A, B, C], u64::MAX);
        feed(&mut suffix, &sequence[6..]);

        assert_eq!(counts(&full)[1..], counts(&suffix)[1..]);
    }

    #[test]
    fn off_path_pcs_are_ignored() {
        let mut m = matcher(&[A, C], 1);
        assert!(m.inc(B).is_none());
        assert_eq!(counts(&m), vec![0, 0]);
        let satisfied = m.inc(C).expect("single tail hit satisfies");
        assert_eq!(satisfied.id, BreakpointId::new(7));
        assert_eq!(
            satisfied.snapshot,
            vec![PathRecord { pc: A, count: 0 }, PathRecord { pc: C, count: 1 }]
        );
    }

    #[test]
    fn empty_path_is_rejected() {
        let err = BacktracePathMatcher::new(BreakpointId::new(1), 0, Vec::new(), 1)
            .expect_err("nothing to match");
        assert_eq!(err, InvariantError::EmptyPath);
    }
}

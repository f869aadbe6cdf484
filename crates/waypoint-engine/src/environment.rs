//! Per-frame counter scopes.
//!
//! Every main-executable activation owns one [`Environment`]. Function-scoped
//! counts record how often each callee was entered from that frame;
//! block-scoped counts record how often each basic block ran inside it.
//! Together they give a position in the program that survives recursion:
//! "the 3rd block hit of X inside the 2nd call of Y inside the 1st call of Z".

use std::collections::HashMap;

use waypoint_types::{Pc, PathRecord};

use crate::error::ConsistencyError;

#[derive(Debug, Clone, Default)]
pub struct Environment {
    pc: Pc,
    func_counts: HashMap<Pc, u64>,
    block_counts: HashMap<Pc, u64>,
}

impl Environment {
    pub fn new(pc: Pc) -> Self {
        Self {
            pc,
            func_counts: HashMap::new(),
            block_counts: HashMap::new(),
        }
    }

    /// Entry PC of the frame this scope belongs to (zero for the root scope).
    pub fn pc(&self) -> Pc {
        self.pc
    }

    pub fn func_count(&self, target: Pc) -> Option<u64> {
        self.func_counts.get(&target).copied()
    }

    pub fn block_count(&self, pc: Pc) -> Option<u64> {
        self.block_counts.get(&pc).copied()
    }

    fn record_call(&mut self, target: Pc) -> u64 {
        let count = self.func_counts.entry(target).or_insert(0);
        *count += 1;
        *count
    }

    fn record_block(&mut self, pc: Pc) -> u64 {
        let count = self.block_counts.entry(pc).or_insert(0);
        *count += 1;
        *count
    }
}

/// Stack of counter scopes, nested with the main-executable activations.
///
/// The root scope is not a frame: it collects whatever runs before the first
/// main-executable call and is never popped.
#[derive(Debug, Clone, Default)]
pub struct PathEnvironment {
    root: Environment,
    frames: Vec<Environment>,
}

impl PathEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frame scopes, not counting the root.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current(&self) -> &Environment {
        self.frames.last().unwrap_or(&self.root)
    }

    fn current_mut(&mut self) -> &mut Environment {
        self.frames.last_mut().unwrap_or(&mut self.root)
    }

    /// Counts a call to `target` in the caller's scope and opens the
    /// callee's scope.
    pub(crate) fn enter(&mut self, target: Pc) -> u64 {
        let count = self.current_mut().record_call(target);
        self.frames.push(Environment::new(target));
        count
    }

    pub(crate) fn leave(&mut self) -> Option<Environment> {
        self.frames.pop()
    }

    pub fn record_block(&mut self, pc: Pc) -> u64 {
        self.current_mut().record_block(pc)
    }

    /// Current position, innermost scope first: the block count of `pc` in
    /// the innermost scope, then for every enclosing frame the number of
    /// times its parent entered it.
    pub fn breadcrumb(&self, pc: Pc) -> Result<Vec<PathRecord>, ConsistencyError> {
        let mut records = Vec::with_capacity(self.frames.len() + 1);
        let innermost = self.current();
        let count = innermost
            .block_count(pc)
            .ok_or(ConsistencyError::MissingScopeCount {
                pc,
                scope: innermost.pc,
                depth: self.frames.len(),
            })?;
        records.push(PathRecord { pc, count });

        for depth in (0..self.frames.len()).rev() {
            let callee = self.frames[depth].pc;
            let parent = if depth == 0 {
                &self.root
            } else {
                &self.frames[depth - 1]
            };
            let count = parent
                .func_count(callee)
                .ok_or(ConsistencyError::MissingScopeCount {
                    pc: callee,
                    scope: parent.pc,
                    depth,
                })?;
            records.push(PathRecord { pc: callee, count });
        }
        Ok(records)
    }

    /// Multi-line dump of every scope, innermost first.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let scopes: Vec<&Environment> = self.scopes().collect();
        for (depth, env) in scopes.iter().enumerate().rev() {
            out.push_str(&format!("scope {depth} (entry {}):\n", env.pc));
            let mut calls: Vec<_> = env.func_counts.iter().collect();
            calls.sort();
            for (pc, count) in calls {
                out.push_str(&format!("  call {pc}: {count}\n"));
            }
            let mut blocks: Vec<_> = env.block_counts.iter().collect();
            blocks.sort();
            for (pc, count) in blocks {
                out.push_str(&format!("  block {pc}: {count}\n"));
            }
        }
        out
    }

    fn scopes(&self) -> impl Iterator<Item = &Environment> {
        std::iter::once(&self.root).chain(self.frames.iter())
    }
}

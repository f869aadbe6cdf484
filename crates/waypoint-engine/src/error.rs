use std::error::Error;
use std::fmt;
use std::io;

use waypoint_types::{BreakpointId, BreakpointKey, InvariantError, Pc};

/// The shadow model disagrees with the program it is tracking. None of these
/// are recoverable: continuing would count against stale state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    UnmonitoredPc {
        pc: Pc,
    },
    Retriggered {
        id: BreakpointId,
        key: BreakpointKey,
    },
    MissingScopeCount {
        pc: Pc,
        scope: Pc,
        depth: usize,
    },
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmonitoredPc { pc } => {
                write!(f, "counter update for {pc}, which no breakpoint monitors")
            }
            Self::Retriggered { id, key } => {
                write!(f, "breakpoint {id} re-triggered at ({key}) after it was already visited")
            }
            Self::MissingScopeCount { pc, scope, depth } => {
                write!(f, "record {pc} doesn't exist in scope {scope} (depth {depth})")
            }
        }
    }
}

impl Error for ConsistencyError {}

#[derive(Debug)]
pub enum LoadError {
    DuplicateId(BreakpointId),
    DuplicateKey {
        key: BreakpointKey,
        first: BreakpointId,
        second: BreakpointId,
    },
    Invariant {
        id: BreakpointId,
        source: InvariantError,
    },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "breakpoint {id} is configured more than once"),
            Self::DuplicateKey { key, first, second } => {
                write!(f, "breakpoints {first} and {second} both target ({key})")
            }
            Self::Invariant { id, source } => write!(f, "breakpoint {id}: {source}"),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Invariant { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// `state` is the diagnostic dump taken when the violation was detected.
    Consistency {
        source: ConsistencyError,
        state: String,
    },
    Sink {
        stage: &'static str,
        source: io::Error,
    },
    /// A 64-bit counter would wrap.
    Overflow {
        counter: &'static str,
        pc: Pc,
    },
}

impl EngineError {
    pub(crate) fn sink(stage: &'static str, source: io::Error) -> Self {
        Self::Sink { stage, source }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consistency { source, state } => {
                write!(f, "shadow state desynchronized: {source}\n{state}")
            }
            Self::Sink { stage, source } => write!(f, "failed to {stage}: {source}"),
            Self::Overflow { counter, pc } => write!(f, "{counter} overflows at block {pc}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Consistency { source, .. } => Some(source),
            Self::Sink { source, .. } => Some(source),
            Self::Overflow { .. } => None,
        }
    }
}

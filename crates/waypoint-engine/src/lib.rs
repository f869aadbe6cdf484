//! Call-path-sensitive execution tracking.
//!
//! The engine keeps a shadow of the monitored program's call stack, counts
//! basic blocks and call entries per frame, and decides from the live event
//! stream when a configured `(pc, count)` coordinate or call path has been
//! reached. Everything it produces goes to a [`Sink`]: slice rows at every
//! interval boundary and checkpoint requests the moment a breakpoint fires.

mod activation;
mod backtrace;
mod blocks;
mod classify;
mod engine;
mod environment;
mod error;
mod registry;
mod shared;

pub use activation::{Activation, ActivationStack};
pub use backtrace::{BacktracePathMatcher, PathSatisfied};
pub use blocks::{BlockInfo, BlockTable};
pub use classify::{EveryTarget, ImageClassifier, Whitelist};
pub use engine::{
    Control, DEFAULT_INTERVAL, Engine, EngineConfig, Event, ExecutionObserver, Report, Sink,
};
pub use environment::{Environment, PathEnvironment};
pub use error::{ConsistencyError, EngineError, LoadError};
pub use registry::{BreakpointRegistry, Fired};
pub use shared::SharedEngine;

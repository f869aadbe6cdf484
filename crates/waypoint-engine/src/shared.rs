use std::sync::Arc;

use parking_lot::Mutex;

use crate::classify::{EveryTarget, ImageClassifier};
use crate::engine::{Control, Engine, Event, ExecutionObserver, Report, Sink};
use crate::error::EngineError;

/// A cloneable handle for feeding one engine from several threads.
/// Callbacks serialize on a single lock, so the global counters see one
/// interleaved stream while each [`ThreadKey`](waypoint_types::ThreadKey)
/// keeps its own shadow stack.
pub struct SharedEngine<S, C = EveryTarget> {
    inner: Arc<Mutex<Engine<S, C>>>,
}

impl<S, C> Clone for SharedEngine<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, C> SharedEngine<S, C>
where
    S: Sink,
    C: ImageClassifier,
{
    pub fn new(engine: Engine<S, C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    pub fn handle(&self, event: Event) -> Result<Control, EngineError> {
        self.inner.lock().handle(event)
    }

    pub fn with<R>(&self, f: impl FnOnce(&Engine<S, C>) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Finishes the run once every other handle is gone; otherwise hands
    /// the handle back.
    pub fn finish(self) -> Result<Report, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => Ok(mutex.into_inner().finish()),
            Err(inner) => Err(Self { inner }),
        }
    }
}

impl<S, C> ExecutionObserver for SharedEngine<S, C>
where
    S: Sink,
    C: ImageClassifier,
{
    fn observe(&mut self, event: Event) -> Result<Control, EngineError> {
        self.handle(event)
    }
}

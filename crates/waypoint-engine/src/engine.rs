use std::collections::HashMap;
use std::io;

use tracing::{error, info};
use waypoint_types::{BreakpointId, BreakpointKey, CheckpointRequest, Pc, Slice, ThreadKey};

use crate::activation::ActivationStack;
use crate::backtrace::BacktracePathMatcher;
use crate::blocks::{BlockInfo, BlockTable};
use crate::classify::{EveryTarget, ImageClassifier};
use crate::error::{ConsistencyError, EngineError};
use crate::registry::BreakpointRegistry;

/// Instructions per slice when nothing else is configured.
pub const DEFAULT_INTERVAL: u64 = 50_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Instructions executed before deltas and triggers are counted.
    pub skip: u64,
    /// Slice length in instructions.
    pub interval: u64,
    /// Ignore everything until a [`Event::MainEntry`] arrives.
    pub start_at_main: bool,
    /// Process id stamped into checkpoint requests.
    pub pid: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            skip: 0,
            interval: DEFAULT_INTERVAL,
            start_at_main: false,
            pid: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Block {
        thread: ThreadKey,
        pc: Pc,
        instructions: u64,
        next_pc: Option<Pc>,
    },
    Call {
        thread: ThreadKey,
        sp: u64,
        target: Pc,
    },
    Return {
        thread: ThreadKey,
        sp: u64,
    },
    MainEntry {
        thread: ThreadKey,
        sp: u64,
        target: Pc,
    },
}

impl Event {
    pub fn thread(&self) -> ThreadKey {
        match *self {
            Self::Block { thread, .. }
            | Self::Call { thread, .. }
            | Self::Return { thread, .. }
            | Self::MainEntry { thread, .. } => thread,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Every breakpoint has fired. The feed should stop.
    Complete,
}

/// Receives what the engine produces. Writes happen inline with the event
/// that caused them.
pub trait Sink {
    fn slice(&mut self, slice: &Slice) -> io::Result<()>;
    fn checkpoint(&mut self, request: &CheckpointRequest) -> io::Result<()>;
}

impl<S> Sink for &mut S
where
    S: Sink + ?Sized,
{
    fn slice(&mut self, slice: &Slice) -> io::Result<()> {
        (**self).slice(slice)
    }

    fn checkpoint(&mut self, request: &CheckpointRequest) -> io::Result<()> {
        (**self).checkpoint(request)
    }
}

/// The callback seam an instrumentation layer drives.
pub trait ExecutionObserver {
    fn observe(&mut self, event: Event) -> Result<Control, EngineError>;

    fn on_block(
        &mut self,
        thread: ThreadKey,
        pc: Pc,
        instructions: u64,
    ) -> Result<Control, EngineError> {
        self.observe(Event::Block {
            thread,
            pc,
            instructions,
            next_pc: None,
        })
    }

    fn on_call(&mut self, thread: ThreadKey, sp: u64, target: Pc) -> Result<Control, EngineError> {
        self.observe(Event::Call { thread, sp, target })
    }

    fn on_return(&mut self, thread: ThreadKey, sp: u64) -> Result<Control, EngineError> {
        self.observe(Event::Return { thread, sp })
    }
}

pub struct Engine<S, C = EveryTarget> {
    config: EngineConfig,
    sink: S,
    classifier: C,
    registry: BreakpointRegistry,
    blocks: BlockTable,
    stacks: HashMap<ThreadKey, ActivationStack>,
    instructions: u64,
    boundary: u64,
    slices: u64,
    started: bool,
    skipping: bool,
    complete: bool,
}

impl<S, C> Engine<S, C>
where
    S: Sink,
    C: ImageClassifier,
{
    pub fn new(config: EngineConfig, registry: BreakpointRegistry, classifier: C, sink: S) -> Self {
        info!(
            skip = config.skip,
            interval = config.interval,
            start_at_main = config.start_at_main,
            breakpoints = registry.len(),
            "engine ready"
        );
        Self {
            started: !config.start_at_main,
            skipping: config.skip > 0,
            config,
            sink,
            classifier,
            registry,
            blocks: BlockTable::new(),
            stacks: HashMap::new(),
            instructions: 0,
            boundary: 0,
            slices: 0,
            complete: false,
        }
    }

    pub fn handle(&mut self, event: Event) -> Result<Control, EngineError> {
        if self.complete {
            return Ok(Control::Complete);
        }
        if !self.started {
            if !matches!(event, Event::MainEntry { .. }) {
                return Ok(Control::Continue);
            }
            info!(thread = %event.thread(), "main entered, starting");
            self.started = true;
        }

        match event {
            Event::Block {
                thread,
                pc,
                instructions,
                next_pc,
            } => self.on_block_event(thread, pc, instructions, next_pc),
            Event::Call { thread, sp, target } => {
                self.stacks
                    .entry(thread)
                    .or_default()
                    .process_call(sp, target, &self.classifier);
                Ok(Control::Continue)
            }
            Event::Return { thread, sp } => {
                self.stacks.entry(thread).or_default().process_return(sp);
                Ok(Control::Continue)
            }
            Event::MainEntry { thread, sp, target } => {
                self.stacks
                    .entry(thread)
                    .or_default()
                    .process_main_entry(sp, target, &self.classifier);
                Ok(Control::Continue)
            }
        }
    }

    fn on_block_event(
        &mut self,
        thread: ThreadKey,
        pc: Pc,
        instructions: u64,
        next_pc: Option<Pc>,
    ) -> Result<Control, EngineError> {
        self.instructions = self
            .instructions
            .checked_add(instructions)
            .ok_or(EngineError::Overflow {
                counter: "instruction count",
                pc,
            })?;
        let block = self.blocks.observe(pc, instructions);

        if self.skipping {
            if self.instructions > self.config.skip {
                self.skipping = false;
                self.boundary = self.instructions;
                info!(instructions = self.instructions, "left skip region");
            }
            return Ok(Control::Continue);
        }

        self.blocks.record_hit(block);
        self.stacks
            .entry(thread)
            .or_default()
            .environment_mut()
            .record_block(pc);

        let mut control = Control::Continue;
        if self.registry.monitors(pc) {
            let fired = match self.registry.update(pc) {
                Ok(fired) => fired,
                Err(err) => return Err(self.consistency(thread, err)),
            };
            for hit in fired {
                let request = CheckpointRequest {
                    id: hit.id,
                    source: hit.source,
                    pc,
                    next_pc,
                    pid: self.config.pid,
                    thread,
                    instructions: self.instructions,
                    all_visited: hit.all_visited,
                };
                self.sink
                    .checkpoint(&request)
                    .map_err(|e| EngineError::sink("write checkpoint", e))?;
                if hit.all_visited {
                    info!(instructions = self.instructions, "all breakpoints visited");
                    self.complete = true;
                    control = Control::Complete;
                }
            }
        }

        if self.instructions - self.boundary > self.config.interval {
            self.emit_slice(thread, pc)?;
        }
        Ok(control)
    }

    fn emit_slice(&mut self, thread: ThreadKey, pc: Pc) -> Result<(), EngineError> {
        let breadcrumb = self
            .stacks
            .entry(thread)
            .or_default()
            .environment()
            .breadcrumb(pc);
        let breadcrumb = match breadcrumb {
            Ok(breadcrumb) => breadcrumb,
            Err(err) => return Err(self.consistency(thread, err)),
        };

        let slice = Slice {
            index: self.slices,
            instructions: self.instructions,
            bbv: self.blocks.take_bbv_row()?,
            breadcrumb,
        };
        self.slices += 1;
        self.boundary = self.instructions;
        self.sink
            .slice(&slice)
            .map_err(|e| EngineError::sink("write slice", e))
    }

    fn consistency(&self, thread: ThreadKey, source: ConsistencyError) -> EngineError {
        let state = self.dump(thread);
        error!(%thread, %source, "shadow state desynchronized\n{state}");
        EngineError::Consistency { source, state }
    }

    /// Diagnostic state of one thread plus the global counters.
    pub fn dump(&self, thread: ThreadKey) -> String {
        let mut out = format!(
            "thread {thread}, {} instructions, {} slices\n",
            self.instructions, self.slices
        );
        match self.stacks.get(&thread) {
            Some(stack) => out.push_str(&stack.dump()),
            None => out.push_str("no activations\n"),
        }
        out.push_str(&self.registry.dump());
        out
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    pub fn slices(&self) -> u64 {
        self.slices
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_skipping(&self) -> bool {
        self.skipping
    }

    pub fn registry(&self) -> &BreakpointRegistry {
        &self.registry
    }

    pub fn blocks(&self) -> &BlockTable {
        &self.blocks
    }

    pub fn stack(&self, thread: ThreadKey) -> Option<&ActivationStack> {
        self.stacks.get(&thread)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn finish(self) -> Report {
        let report = Report {
            instructions: self.instructions,
            slices: self.slices,
            total: self.registry.len(),
            fired: self.registry.fired_ids(),
            unreached: self.registry.unreached(),
            backtraces: self.registry.matchers().to_vec(),
            blocks: self.blocks.into_blocks(),
        };
        info!(
            instructions = report.instructions,
            slices = report.slices,
            fired = report.fired.len(),
            total = report.total,
            "execution finished"
        );
        report
    }
}

impl<S, C> ExecutionObserver for Engine<S, C>
where
    S: Sink,
    C: ImageClassifier,
{
    fn observe(&mut self, event: Event) -> Result<Control, EngineError> {
        self.handle(event)
    }
}

/// What a finished run amounts to.
#[derive(Debug, Clone)]
pub struct Report {
    pub instructions: u64,
    pub slices: u64,
    pub total: usize,
    pub fired: Vec<BreakpointId>,
    pub unreached: Vec<(BreakpointId, BreakpointKey)>,
    pub backtraces: Vec<BacktracePathMatcher>,
    pub blocks: Vec<BlockInfo>,
}

impl Report {
    pub fn is_complete(&self) -> bool {
        self.unreached.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_complete() { 0 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Whitelist;
    use waypoint_types::{BreakpointSpec, TriggerSource};

    #[derive(Default)]
    struct Recorder {
        slices: Vec<Slice>,
        checkpoints: Vec<CheckpointRequest>,
    }

    impl Sink for Recorder {
        fn slice(&mut self, slice: &Slice) -> io::Result<()> {
            self.slices.push(slice.clone());
            Ok(())
        }

        fn checkpoint(&mut self, request: &CheckpointRequest) -> io::Result<()> {
            self.checkpoints.push(request.clone());
            Ok(())
        }
    }

    struct Broken;

    impl Sink for Broken {
        fn slice(&mut self, _slice: &Slice) -> io::Result<()> {
            Ok(())
        }

        fn checkpoint(&mut self, _request: &CheckpointRequest) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    const T: ThreadKey = ThreadKey::MAIN;

    fn block(pc: u64, instructions: u64) -> Event {
        Event::Block {
            thread: T,
            pc: Pc::new(pc),
            instructions,
            next_pc: None,
        }
    }

    fn call(sp: u64, target: u64) -> Event {
        Event::Call {
            thread: T,
            sp,
            target: Pc::new(target),
        }
    }

    fn engine_with(config: EngineConfig, specs: Vec<BreakpointSpec>) -> Engine<Recorder> {
        let registry = BreakpointRegistry::load(specs).expect("valid breakpoints");
        Engine::new(config, registry, EveryTarget, Recorder::default())
    }

    #[test]
    fn five_hits_complete_the_run() {
        let mut engine = engine_with(
            EngineConfig::default(),
            vec![BreakpointSpec::count(0, 0x400, 5)],
        );
        let mut controls = Vec::new();
        for _ in 0..5 {
            controls.push(engine.handle(block(0x400, 3)).expect("consistent"));
        }
        assert_eq!(controls.last(), Some(&Control::Complete));
        assert!(controls[..4].iter().all(|c| *c == Control::Continue));

        let checkpoints = &engine.sink().checkpoints;
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].id, BreakpointId::new(0));
        assert_eq!(checkpoints[0].source, TriggerSource::Count);
        assert_eq!(checkpoints[0].instructions, 15);
        assert!(checkpoints[0].all_visited);

        let report = engine.finish();
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn three_hits_leave_the_breakpoint_unreached() {
        let mut engine = engine_with(
            EngineConfig::default(),
            vec![BreakpointSpec::count(0, 0x400, 5)],
        );
        for _ in 0..3 {
            engine.handle(block(0x400, 3)).expect("consistent");
        }
        assert!(engine.sink().checkpoints.is_empty());

        let report = engine.finish();
        assert_eq!(report.exit_code(), 1);
        assert_eq!(
            report.unreached,
            vec![(
                BreakpointId::new(0),
                BreakpointKey {
                    pc: Pc::new(0x400),
                    count: 5
                }
            )]
        );
    }

    #[test]
    fn events_after_completion_are_ignored() {
        let mut engine = engine_with(
            EngineConfig::default(),
            vec![BreakpointSpec::count(0, 0x400, 1)],
        );
        assert_eq!(engine.handle(block(0x400, 1)).expect("ok"), Control::Complete);
        assert_eq!(engine.handle(block(0x400, 1)).expect("ok"), Control::Complete);
        assert_eq!(engine.instructions(), 1);
        assert_eq!(engine.sink().checkpoints.len(), 1);
    }

    #[test]
    fn slices_carry_bbv_and_breadcrumb() {
        let config = EngineConfig {
            interval: 10,
            ..EngineConfig::default()
        };
        let mut engine = engine_with(config, Vec::new());
        engine.handle(call(0x7000, 0x100)).expect("ok");
        engine.handle(block(0x100, 4)).expect("ok");
        engine.handle(block(0x120, 4)).expect("ok");
        engine.handle(block(0x100, 4)).expect("ok");

        let slices = &engine.sink().slices;
        assert_eq!(slices.len(), 1);
        let slice = &slices[0];
        assert_eq!(slice.index, 0);
        assert_eq!(slice.instructions, 12);
        let bbv: Vec<(u64, u64)> = slice
            .bbv
            .iter()
            .map(|e| (e.block.get(), e.weighted))
            .collect();
        assert_eq!(bbv, vec![(1, 8), (2, 4)]);
        let crumbs: Vec<(u64, u64)> = slice
            .breadcrumb
            .iter()
            .map(|r| (r.pc.get(), r.count))
            .collect();
        assert_eq!(crumbs, vec![(0x100, 2), (0x100, 1)]);
    }

    #[test]
    fn skip_region_counts_but_does_not_trigger() {
        let config = EngineConfig {
            skip: 5,
            ..EngineConfig::default()
        };
        let mut engine = engine_with(config, vec![BreakpointSpec::count(0, 0x400, 1)]);
        engine.handle(block(0x400, 3)).expect("ok");
        engine.handle(block(0x400, 3)).expect("ok");
        assert!(!engine.is_skipping());
        assert!(engine.sink().checkpoints.is_empty());
        assert_eq!(engine.registry().counter(Pc::new(0x400)), Some(0));

        assert_eq!(engine.handle(block(0x400, 3)).expect("ok"), Control::Complete);
        assert_eq!(engine.sink().checkpoints[0].instructions, 9);
    }

    #[test]
    fn start_at_main_ignores_prologue() {
        let config = EngineConfig {
            start_at_main: true,
            ..EngineConfig::default()
        };
        let mut engine = engine_with(config, vec![BreakpointSpec::count(0, 0x400, 1)]);
        engine.handle(block(0x400, 2)).expect("ok");
        assert_eq!(engine.instructions(), 0);

        engine
            .handle(Event::MainEntry {
                thread: T,
                sp: 0x7000,
                target: Pc::new(0x100),
            })
            .expect("ok");
        assert_eq!(engine.stack(T).and_then(|s| s.main_entry_depth()), Some(0));
        assert_eq!(engine.handle(block(0x400, 2)).expect("ok"), Control::Complete);
    }

    #[test]
    fn threads_keep_separate_stacks() {
        let registry = BreakpointRegistry::load(Vec::new()).expect("empty");
        let classifier = Whitelist::new([Pc::new(0x100), Pc::new(0x200)]);
        let mut engine = Engine::new(
            EngineConfig::default(),
            registry,
            classifier,
            Recorder::default(),
        );
        let other = ThreadKey::new(1);
        engine.handle(call(0x7000, 0x100)).expect("ok");
        engine
            .handle(Event::Call {
                thread: other,
                sp: 0x9000,
                target: Pc::new(0x200),
            })
            .expect("ok");
        engine
            .handle(Event::Call {
                thread: other,
                sp: 0x8f00,
                target: Pc::new(0x7f00_0000),
            })
            .expect("ok");

        assert_eq!(engine.stack(T).map(ActivationStack::depth), Some(1));
        assert_eq!(engine.stack(other).map(ActivationStack::depth), Some(2));
        assert_eq!(engine.stack(other).map(|s| s.environment().len()), Some(1));
    }

    #[test]
    fn sink_failures_surface_as_engine_errors() {
        let registry =
            BreakpointRegistry::load([BreakpointSpec::count(0, 0x400, 1)]).expect("valid");
        let mut engine = Engine::new(EngineConfig::default(), registry, EveryTarget, Broken);
        let err = engine.handle(block(0x400, 1)).expect_err("sink is broken");
        assert!(matches!(err, EngineError::Sink { stage: "write checkpoint", .. }));
    }

    #[test]
    fn instruction_count_overflow_is_an_error() {
        let mut engine = engine_with(EngineConfig::default(), Vec::new());
        engine.handle(block(0x400, u64::MAX)).expect("first block fits");
        let err = engine
            .handle(block(0x400, u64::MAX))
            .expect_err("second block wraps the counter");
        assert!(matches!(err, EngineError::Overflow { counter: "instruction count", .. }));
        assert_eq!(engine.instructions(), u64::MAX);
    }

    #[test]
    fn observer_callbacks_drive_the_engine() {
        let mut engine = engine_with(
            EngineConfig::default(),
            vec![BreakpointSpec::count(0, 0x400, 2)],
        );
        engine.on_call(T, 0x7000, Pc::new(0x100)).expect("ok");
        engine.on_block(T, Pc::new(0x400), 1).expect("ok");
        engine.on_return(T, 0x6ff8).expect("ok");
        let control = engine.on_block(T, Pc::new(0x400), 1).expect("ok");
        assert_eq!(control, Control::Complete);
        assert_eq!(engine.stack(T).map(ActivationStack::depth), Some(0));
    }
}

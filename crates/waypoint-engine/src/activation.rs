//! Shadow call stack.
//!
//! Activations are pushed on every observed call and popped on every observed
//! return. Non-local exits (`longjmp`, exception unwinding) skip the return
//! instrumentation, so every event first compares the live stack pointer with
//! the one recorded at the top activation and discards frames the program has
//! already left. The stack grows down: a live SP above the recorded one means
//! that frame is gone.

use tracing::{debug, warn};
use waypoint_types::Pc;

use crate::classify::ImageClassifier;
use crate::environment::PathEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub index: usize,
    /// Stack pointer at the call site.
    pub sp: u64,
    pub target: Pc,
    pub main_exec: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ActivationStack {
    activations: Vec<Activation>,
    envs: PathEnvironment,
    generation: u64,
    main_entry_depth: Option<usize>,
}

impl ActivationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_call<C>(&mut self, sp: u64, target: Pc, classifier: &C)
    where
        C: ImageClassifier + ?Sized,
    {
        self.adjust_stack(sp);
        self.create_activation(sp, target, classifier);
    }

    /// Same as a call, but remembers the depth at which `main` was entered.
    pub fn process_main_entry<C>(&mut self, sp: u64, target: Pc, classifier: &C)
    where
        C: ImageClassifier + ?Sized,
    {
        self.adjust_stack(sp);
        self.main_entry_depth = Some(self.activations.len());
        self.create_activation(sp, target, classifier);
    }

    pub fn process_return(&mut self, sp: u64) {
        self.adjust_stack(sp);
        self.pop();
    }

    /// Discards every activation whose recorded SP lies below `sp` and
    /// returns how many were discarded.
    ///
    /// The comparison is strict. A frame whose recorded SP equals the live SP
    /// survives, which can leave one stale frame behind after an equal-depth
    /// recursive tail call. That inexactness is known and kept as is.
    pub fn adjust_stack(&mut self, sp: u64) -> usize {
        self.generation += 1;

        let mut popped = 0;
        while let Some(top) = self.activations.last() {
            if sp <= top.sp {
                break;
            }
            if self.activations.len() == 1 {
                warn!(
                    sp = format_args!("0x{sp:x}"),
                    last_sp = format_args!("0x{:x}", top.sp),
                    "adjust_stack bottomed out"
                );
            }
            self.pop();
            popped += 1;
        }

        if popped > 0 {
            debug!(
                popped,
                generation = self.generation,
                depth = self.activations.len(),
                "resynchronized shadow stack after non-local exit"
            );
        }
        popped
    }

    pub fn depth(&self) -> usize {
        self.activations.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn main_entry_depth(&self) -> Option<usize> {
        self.main_entry_depth
    }

    pub fn top(&self) -> Option<&Activation> {
        self.activations.last()
    }

    /// Bottom to top.
    pub fn frames(&self) -> impl Iterator<Item = &Activation> {
        self.activations.iter()
    }

    pub fn environment(&self) -> &PathEnvironment {
        &self.envs
    }

    pub fn environment_mut(&mut self) -> &mut PathEnvironment {
        &mut self.envs
    }

    pub fn dump(&self) -> String {
        let mut out = format!("activations: {}\n", self.activations.len());
        for activation in self.activations.iter().rev() {
            out.push_str(&format!(
                "{}: {} sp=0x{:x}{}\n",
                activation.index,
                activation.target,
                activation.sp,
                if activation.main_exec { "" } else { " (lib)" }
            ));
        }
        out.push_str(&self.envs.dump());
        out
    }

    fn create_activation<C>(&mut self, sp: u64, target: Pc, classifier: &C)
    where
        C: ImageClassifier + ?Sized,
    {
        let main_exec = classifier.is_main_executable(target);
        if main_exec {
            self.envs.enter(target);
        }
        self.activations.push(Activation {
            index: self.activations.len(),
            sp,
            target,
            main_exec,
        });
    }

    fn pop(&mut self) -> Option<Activation> {
        let activation = self.activations.pop()?;
        if activation.main_exec {
            self.envs.leave();
        }
        Some(activation)
    }
}

use std::collections::HashSet;

use waypoint_types::Pc;

/// Decides whether a call target belongs to the monitored executable (as
/// opposed to a shared library or a PLT stub). Only main-executable frames
/// get their own counter scope.
pub trait ImageClassifier {
    fn is_main_executable(&self, target: Pc) -> bool;
}

impl<F> ImageClassifier for F
where
    F: Fn(Pc) -> bool,
{
    fn is_main_executable(&self, target: Pc) -> bool {
        self(target)
    }
}

/// Treats every call target as main-executable code.
#[derive(Debug, Clone, Copy, Default)]
pub struct EveryTarget;

impl ImageClassifier for EveryTarget {
    fn is_main_executable(&self, _target: Pc) -> bool {
        true
    }
}

/// Routine entry points known to live in the main executable.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: HashSet<Pc>,
}

impl Whitelist {
    pub fn new(entries: impl IntoIterator<Item = Pc>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ImageClassifier for Whitelist {
    fn is_main_executable(&self, target: Pc) -> bool {
        self.entries.contains(&target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_classify() {
        let below_lib = |pc: Pc| pc.get() < 0x7f00_0000_0000;
        assert!(below_lib.is_main_executable(Pc::new(0x401000)));
        assert!(!below_lib.is_main_executable(Pc::new(0x7f12_3456_7000)));
    }

    #[test]
    fn whitelist_only_admits_listed_targets() {
        let list = Whitelist::new([Pc::new(0x401000), Pc::new(0x401200)]);
        assert_eq!(list.len(), 2);
        assert!(list.is_main_executable(Pc::new(0x401200)));
        assert!(!list.is_main_executable(Pc::new(0x401100)));
    }
}

use facet::Facet;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroId(&'static str),
    EmptyPath,
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroId(field) => write!(f, "{field} must be non-zero"),
            Self::EmptyPath => write!(f, "call path must contain at least the target pc"),
        }
    }
}

impl Error for InvariantError {}

/// A program counter observed in the monitored process.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pc(u64);

impl Pc {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Zero is used by configuration files as the "nothing to monitor" marker.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Pc {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Identifier a breakpoint (or backtrace) was configured with. It tags the
/// checkpoint produced when the breakpoint fires.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u64);

impl BreakpointId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of the monitored thread an event was observed on.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ThreadKey(u32);

impl ThreadKey {
    pub const MAIN: ThreadKey = ThreadKey(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Dense basic-block number used in BBV rows. Numbering starts at 1.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    pub fn new(value: u64) -> Result<Self, InvariantError> {
        if value == 0 {
            return Err(InvariantError::ZeroId("block_id"));
        }
        Ok(Self(value))
    }

    /// Id for the block stored at `index` of a zero-based table.
    pub fn from_index(index: usize) -> Self {
        Self(index as u64 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// A `(pc, count)` coordinate: the `count`-th execution of `pc`.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointKey {
    pub pc: Pc,
    pub count: u64,
}

impl fmt::Display for BreakpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.pc, self.count)
    }
}

/// One configured breakpoint. A path breakpoint fires on the `count`-th hit
/// of `pc` reached through its chain of call sites; a count breakpoint on the
/// `count`-th hit overall.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub id: BreakpointId,
    pub trigger: TriggerSource,
    pub pc: Pc,
    pub count: u64,
    /// Outermost call site first.
    pub ancestors: Vec<Pc>,
    pub slice: u64,
}

impl BreakpointSpec {
    pub fn count(id: u64, pc: u64, count: u64) -> Self {
        Self {
            id: BreakpointId::new(id),
            trigger: TriggerSource::Count,
            pc: Pc::new(pc),
            count,
            ancestors: Vec::new(),
            slice: 0,
        }
    }

    pub fn key(&self) -> BreakpointKey {
        BreakpointKey {
            pc: self.pc,
            count: self.count,
        }
    }

    pub fn is_path(&self) -> bool {
        self.trigger == TriggerSource::Path
    }
}

/// One scope of a breadcrumb or one node of a backtrace snapshot.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathRecord {
    pub pc: Pc,
    pub count: u64,
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbvEntry {
    pub block: BlockId,
    /// Hit delta multiplied by the block's instruction count.
    pub weighted: u64,
}

/// Everything emitted at a slice boundary.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub index: u64,
    pub instructions: u64,
    pub bbv: Vec<BbvEntry>,
    /// Innermost scope first.
    pub breadcrumb: Vec<PathRecord>,
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum TriggerSource {
    Count,
    Path,
}

/// Handed to the checkpoint writer the moment a breakpoint fires.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub id: BreakpointId,
    pub source: TriggerSource,
    pub pc: Pc,
    pub next_pc: Option<Pc>,
    pub pid: u32,
    pub thread: ThreadKey,
    pub instructions: u64,
    pub all_visited: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_displays_as_prefixed_hex() {
        assert_eq!(Pc::new(0x4005d0).to_string(), "0x4005d0");
        assert_eq!(format!("{:x}", Pc::new(255)), "ff");
    }

    #[test]
    fn block_id_rejects_zero() {
        assert_eq!(BlockId::new(0), Err(InvariantError::ZeroId("block_id")));
        assert_eq!(BlockId::new(3).map(BlockId::get), Ok(3));
    }

    #[test]
    fn breakpoint_keys_order_by_pc_then_count() {
        let mut keys = vec![
            BreakpointKey {
                pc: Pc::new(0x2000),
                count: 1,
            },
            BreakpointKey {
                pc: Pc::new(0x1000),
                count: 7,
            },
            BreakpointKey {
                pc: Pc::new(0x1000),
                count: 2,
            },
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["0x1000, 2", "0x1000, 7", "0x2000, 1"]);
    }
}

//! Text formats read and written around a run.
//!
//! Inputs are line-oriented and whitespace-separated: breakpoint
//! configuration, slice-annotated backtraces, routine whitelists and the
//! event trace (see [`trace`]). Outputs are the BBV rows, the breadcrumb
//! lines, the block-id table, the backtrace counts and the per-checkpoint
//! files.

use std::fmt;
use std::fmt::Write as _;

use waypoint_types::{
    BbvEntry, BreakpointId, BreakpointSpec, CheckpointRequest, PathRecord, Pc, TriggerSource,
};

pub mod trace;

pub const CHECKPOINT_DIR_PREFIX: &str = "cpt.None.SIMP-";
pub const REGS_FILE: &str = "m5.cpt.regs";
pub const PMEM_FILE: &str = "system.physmem.store0.pmem";
pub const CHECKPOINT_INFO_FILE: &str = "checkpoint.json";

// ── Errors ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    MissingField(&'static str),
    InvalidNumber { field: &'static str, token: String },
    InvalidHex { field: &'static str, token: String },
    ZeroCount,
    UnknownTag(String),
    TrailingToken(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing {field}"),
            Self::InvalidNumber { field, token } => {
                write!(f, "invalid {field} {token:?}: expected a decimal number")
            }
            Self::InvalidHex { field, token } => {
                write!(f, "invalid {field} {token:?}: expected a hex address")
            }
            Self::ZeroCount => write!(f, "expected count must be at least 1"),
            Self::UnknownTag(tag) => write!(f, "unknown record tag {tag:?}"),
            Self::TrailingToken(token) => write!(f, "unexpected trailing token {token:?}"),
        }
    }
}

impl std::error::Error for RecordError {}

/// A record that failed to parse, with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub line: usize,
    pub source: RecordError,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.source)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug)]
pub struct EncodeError(String);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encode checkpoint info: {}", self.0)
    }
}

impl std::error::Error for EncodeError {}

// ── Tokens ──────────────────────────────────────────────────

pub(crate) fn parse_dec(field: &'static str, token: Option<&str>) -> Result<u64, RecordError> {
    let token = token.ok_or(RecordError::MissingField(field))?;
    token.parse().map_err(|_| RecordError::InvalidNumber {
        field,
        token: token.to_owned(),
    })
}

/// Hex with or without a `0x` prefix.
pub(crate) fn parse_hex(field: &'static str, token: Option<&str>) -> Result<u64, RecordError> {
    let token = token.ok_or(RecordError::MissingField(field))?;
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).map_err(|_| RecordError::InvalidHex {
        field,
        token: token.to_owned(),
    })
}

pub(crate) fn parse_pc(field: &'static str, token: Option<&str>) -> Result<Pc, RecordError> {
    parse_hex(field, token).map(Pc::new)
}

/// Non-empty, non-comment lines with their 1-based numbers.
pub(crate) fn records(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn at_line<T>(line: usize, result: Result<T, RecordError>) -> Result<T, ConfigError> {
    result.map_err(|source| ConfigError { line, source })
}

// ── Inputs ──────────────────────────────────────────────────

/// One `<id> <pc> <count> [<ancestor_pc> ...]` record. Ancestors make it a
/// path breakpoint.
pub fn parse_breakpoint(line: &str) -> Result<BreakpointSpec, RecordError> {
    let mut tokens = line.split_whitespace();
    let id = BreakpointId::new(parse_dec("breakpoint id", tokens.next())?);
    let pc = parse_pc("target pc", tokens.next())?;
    let count = parse_dec("expected count", tokens.next())?;
    if count == 0 {
        return Err(RecordError::ZeroCount);
    }
    let ancestors = tokens
        .map(|token| parse_pc("ancestor pc", Some(token)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BreakpointSpec {
        id,
        trigger: if ancestors.is_empty() {
            TriggerSource::Count
        } else {
            TriggerSource::Path
        },
        pc,
        count,
        ancestors,
        slice: 0,
    })
}

pub fn parse_breakpoints(text: &str) -> Result<Vec<BreakpointSpec>, ConfigError> {
    records(text)
        .map(|(line, record)| at_line(line, parse_breakpoint(record)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BacktraceEntry {
    Path(BreakpointSpec),
    /// Target pc `0`: the slice has nothing to watch.
    Empty { id: BreakpointId, slice: u64 },
}

/// One `<id> <slice> <pc> <count> [<ancestor_pc> ...]` record.
pub fn parse_backtrace(line: &str) -> Result<BacktraceEntry, RecordError> {
    let mut tokens = line.split_whitespace();
    let id = BreakpointId::new(parse_dec("backtrace id", tokens.next())?);
    let slice = parse_dec("slice", tokens.next())?;
    let pc = parse_pc("target pc", tokens.next())?;
    if pc.is_null() {
        return Ok(BacktraceEntry::Empty { id, slice });
    }
    let count = parse_dec("expected count", tokens.next())?;
    if count == 0 {
        return Err(RecordError::ZeroCount);
    }
    let ancestors = tokens
        .map(|token| parse_pc("ancestor pc", Some(token)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BacktraceEntry::Path(BreakpointSpec {
        id,
        trigger: TriggerSource::Path,
        pc,
        count,
        ancestors,
        slice,
    }))
}

pub fn parse_backtraces(text: &str) -> Result<Vec<BacktraceEntry>, ConfigError> {
    records(text)
        .map(|(line, record)| at_line(line, parse_backtrace(record)))
        .collect()
}

/// One routine entry pc per line.
pub fn parse_whitelist(text: &str) -> Result<Vec<Pc>, ConfigError> {
    records(text)
        .map(|(line, record)| {
            let mut tokens = record.split_whitespace();
            let pc = parse_pc("routine pc", tokens.next());
            let pc = match (pc, tokens.next()) {
                (Ok(_), Some(extra)) => Err(RecordError::TrailingToken(extra.to_owned())),
                (pc, _) => pc,
            };
            at_line(line, pc)
        })
        .collect()
}

// ── Outputs ─────────────────────────────────────────────────

/// `T:<id>:<weighted> :<id>:<weighted> ...`
pub fn format_bbv_line(row: &[BbvEntry]) -> String {
    let mut out = String::from("T");
    for entry in row {
        let _ = write!(out, ":{}:{} ", entry.block.get(), entry.weighted);
    }
    out
}

/// `0x<pc>:<count> 0x<pc>:<count> ...`
pub fn format_path_line(records: &[PathRecord]) -> String {
    records
        .iter()
        .map(|record| format!("{}:{}", record.pc, record.count))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `<block_id> 0x<pc>`
pub fn format_block_line(id: u64, pc: Pc) -> String {
    format!("{id} {pc}")
}

/// `<id> <slice> 0x<pc>:<count> ...`
pub fn format_backtrace_count_line(
    id: BreakpointId,
    slice: u64,
    snapshot: &[PathRecord],
) -> String {
    let mut out = format!("{} {}", id.get(), slice);
    for record in snapshot {
        let _ = write!(out, " {}:{}", record.pc, record.count);
    }
    out
}

pub fn format_empty_backtrace_line(id: BreakpointId) -> String {
    format!("{} 0", id.get())
}

/// Directory name of the checkpoint taken for `id`.
pub fn checkpoint_dir_name(id: BreakpointId) -> String {
    format!("{CHECKPOINT_DIR_PREFIX}{}", id.get())
}

/// Contents of the register file. Values are decimal; `NPC` is left out
/// when the fall-through address is unknown.
pub fn format_regs(request: &CheckpointRequest) -> String {
    let mut out = format!("PC: {}\n", request.pc.get());
    if let Some(next_pc) = request.next_pc {
        let _ = writeln!(out, "NPC: {}", next_pc.get());
    }
    out
}

pub fn encode_checkpoint_info(request: &CheckpointRequest) -> Result<String, EncodeError> {
    facet_json::to_string(request).map_err(|e| EncodeError(e.to_string()))
}

//! Replays a recorded event trace through the engine and writes every
//! output file of a run: BBV rows, breadcrumb lines, the block-id table,
//! backtrace counts and one directory per checkpoint.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use waypoint_engine::{
    BreakpointRegistry, Control, DEFAULT_INTERVAL, Engine, EngineConfig, Event, EveryTarget,
    ImageClassifier, Report, Sink, Whitelist,
};
use waypoint_types::{BreakpointId, BreakpointSpec, CheckpointRequest, Pc, Slice, ThreadKey};
use waypoint_wire::trace::{TraceLine, TraceReader};
use waypoint_wire::{
    BacktraceEntry, CHECKPOINT_INFO_FILE, PMEM_FILE, REGS_FILE, checkpoint_dir_name,
    encode_checkpoint_info, format_backtrace_count_line, format_bbv_line, format_block_line,
    format_empty_backtrace_line, format_path_line, format_regs, parse_backtraces,
    parse_breakpoints, parse_whitelist,
};


pub type AnyResult<T> = Result<T, String>;

/// Exit code for configuration and consistency failures.
pub const EXIT_FAILURE: i32 = 2;

/// Fully resolved run configuration. Relative paths are already joined onto
/// the run directory.
#[derive(Debug, Clone)]
pub struct Settings {
    pub run_dir: PathBuf,
    pub breakpoints: PathBuf,
    pub backtraces: Option<PathBuf>,
    pub whitelist: Option<PathBuf>,
    pub events: PathBuf,
    pub bbv_out: PathBuf,
    pub path_out: PathBuf,
    pub bbid_out: PathBuf,
    pub btc_out: PathBuf,
    /// `None` when checkpoints are only reported, not written.
    pub checkpoint_root: Option<PathBuf>,
    pub engine: EngineConfig,
}

/// Values given on the command line, before `WAYPOINT_*` fallbacks and
/// defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub run_dir: Option<String>,
    pub breakpoints: Option<String>,
    pub backtraces: Option<String>,
    pub whitelist: Option<String>,
    pub events: Option<String>,
    pub bbv_out: Option<String>,
    pub path_out: Option<String>,
    pub bbid_out: Option<String>,
    pub btc_out: Option<String>,
    pub checkpoint_dir: Option<String>,
    /// Millions of instructions.
    pub interval: Option<u64>,
    pub skip: Option<u64>,
    pub start_at_main: bool,
    pub pid: Option<u32>,
    pub dry_run: bool,
}

impl Settings {
    /// Fills every setting from `overrides`, then from `env`, then from the
    /// defaults.
    pub fn resolve<E>(overrides: Overrides, env: E) -> AnyResult<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let string = |value: Option<String>, key: &str| value.or_else(|| env(key));
        let flag = |value: bool, key: &str| {
            value || env(key).is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"))
        };

        let run_dir = string(overrides.run_dir, "WAYPOINT_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let in_run_dir = |value: Option<String>, key: &str, default: &str| {
            run_dir.join(string(value, key).unwrap_or_else(|| default.to_owned()))
        };

        let interval = match number(overrides.interval, "WAYPOINT_INTERVAL", &env)? {
            Some(0) => return Err("interval must be at least 1 million instructions".to_owned()),
            Some(millions) => millions
                .checked_mul(1_000_000)
                .ok_or_else(|| format!("interval of {millions} million instructions overflows"))?,
            None => DEFAULT_INTERVAL,
        };
        let engine = EngineConfig {
            skip: number(overrides.skip, "WAYPOINT_SKIP", &env)?.unwrap_or(0),
            interval,
            start_at_main: flag(overrides.start_at_main, "WAYPOINT_START_AT_MAIN"),
            pid: number(overrides.pid, "WAYPOINT_PID", &env)?.unwrap_or(0),
        };

        let checkpoint_root = if flag(overrides.dry_run, "WAYPOINT_DRY_RUN") {
            None
        } else {
            Some(in_run_dir(
                overrides.checkpoint_dir,
                "WAYPOINT_CHECKPOINT_DIR",
                "checkpoints",
            ))
        };

        Ok(Self {
            breakpoints: in_run_dir(overrides.breakpoints, "WAYPOINT_BREAKPOINTS", "break.txt"),
            backtraces: string(overrides.backtraces, "WAYPOINT_BACKTRACES")
                .map(|path| run_dir.join(path)),
            whitelist: string(overrides.whitelist, "WAYPOINT_WHITELIST")
                .map(|path| run_dir.join(path)),
            events: in_run_dir(overrides.events, "WAYPOINT_EVENTS", "events.trace"),
            bbv_out: in_run_dir(overrides.bbv_out, "WAYPOINT_BBV_OUT", "out.bb"),
            path_out: in_run_dir(overrides.path_out, "WAYPOINT_PATH_OUT", "out.brk"),
            bbid_out: in_run_dir(overrides.bbid_out, "WAYPOINT_BBID_OUT", "out.bbid"),
            btc_out: in_run_dir(overrides.btc_out, "WAYPOINT_BTC_OUT", "backtrace.cnt"),
            checkpoint_root,
            engine,
            run_dir,
        })
    }
}

fn number<T, E>(value: Option<T>, key: &str, env: &E) -> AnyResult<Option<T>>
where
    T: std::str::FromStr,
    E: Fn(&str) -> Option<String>,
{
    if value.is_some() {
        return Ok(value);
    }
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{key}={raw:?} is not a number")),
        None => Ok(None),
    }
}

// ── Inputs ──────────────────────────────────────────────────

pub enum Classifier {
    Everything(EveryTarget),
    Listed(Whitelist),
}

impl ImageClassifier for Classifier {
    fn is_main_executable(&self, target: Pc) -> bool {
        match self {
            Self::Everything(every) => every.is_main_executable(target),
            Self::Listed(list) => list.is_main_executable(target),
        }
    }
}

/// Everything the engine needs before the first event.
pub struct Plan {
    pub specs: Vec<BreakpointSpec>,
    /// Backtrace ids whose slice has no target, in file order.
    pub empty_backtraces: Vec<BreakpointId>,
    pub classifier: Classifier,
}

impl Plan {
    pub fn parse(
        breakpoints: &str,
        backtraces: Option<&str>,
        whitelist: Option<&str>,
    ) -> AnyResult<Self> {
        let mut specs =
            parse_breakpoints(breakpoints).map_err(|e| format!("breakpoints: {e}"))?;

        let mut empty_backtraces = Vec::new();
        if let Some(text) = backtraces {
            for entry in parse_backtraces(text).map_err(|e| format!("backtraces: {e}"))? {
                match entry {
                    BacktraceEntry::Path(spec) => specs.push(spec),
                    BacktraceEntry::Empty { id, .. } => empty_backtraces.push(id),
                }
            }
        }

        let classifier = match whitelist {
            Some(text) => {
                let routines = parse_whitelist(text).map_err(|e| format!("whitelist: {e}"))?;
                info!(routines = routines.len(), "loaded main-executable whitelist");
                Classifier::Listed(Whitelist::new(routines))
            }
            None => Classifier::Everything(EveryTarget),
        };

        Ok(Self {
            specs,
            empty_backtraces,
            classifier,
        })
    }
}

// ── Outputs ─────────────────────────────────────────────────

/// Writes slice lines as they are produced and one directory per
/// checkpoint under the checkpoint root.
pub struct RunSink<W> {
    bbv: W,
    paths: W,
    checkpoint_root: Option<PathBuf>,
    taken: Vec<CheckpointRequest>,
}

impl<W: Write> RunSink<W> {
    pub fn new(bbv: W, paths: W, checkpoint_root: Option<PathBuf>) -> Self {
        Self {
            bbv,
            paths,
            checkpoint_root,
            taken: Vec::new(),
        }
    }

    /// Checkpoint requests in firing order.
    pub fn taken(&self) -> &[CheckpointRequest] {
        &self.taken
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.bbv.flush()?;
        self.paths.flush()
    }

    pub fn into_writers(self) -> (W, W) {
        (self.bbv, self.paths)
    }
}

impl<W: Write> Sink for RunSink<W> {
    fn slice(&mut self, slice: &Slice) -> io::Result<()> {
        writeln!(self.bbv, "{}", format_bbv_line(&slice.bbv))?;
        writeln!(self.paths, "{}", format_path_line(&slice.breadcrumb))
    }

    fn checkpoint(&mut self, request: &CheckpointRequest) -> io::Result<()> {
        if let Some(root) = &self.checkpoint_root {
            write_checkpoint(root, request)?;
        } else {
            info!(id = request.id.get(), pc = %request.pc, "checkpoint requested (dry run)");
        }
        self.taken.push(request.clone());
        Ok(())
    }
}

fn write_checkpoint(root: &Path, request: &CheckpointRequest) -> io::Result<()> {
    let dir = root.join(checkpoint_dir_name(request.id));
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(REGS_FILE), format_regs(request))?;
    // The memory image itself belongs to the snapshot collaborator.
    File::create(dir.join(PMEM_FILE))?;
    let info = encode_checkpoint_info(request).map_err(io::Error::other)?;
    fs::write(dir.join(CHECKPOINT_INFO_FILE), info)?;
    info!(
        id = request.id.get(),
        pc = %request.pc,
        instructions = request.instructions,
        dir = %dir.display(),
        "checkpoint saved"
    );
    Ok(())
}

pub fn render_block_table(report: &Report) -> String {
    let mut out = String::new();
    for block in &report.blocks {
        out.push_str(&format_block_line(block.id.get(), block.pc));
        out.push('\n');
    }
    out
}

pub fn render_backtrace_counts(empty: &[BreakpointId], report: &Report) -> String {
    let mut out = String::new();
    for id in empty {
        out.push_str(&format_empty_backtrace_line(*id));
        out.push('\n');
    }
    for matcher in &report.backtraces {
        out.push_str(&format_backtrace_count_line(
            matcher.id(),
            matcher.slice(),
            &matcher.snapshot(),
        ));
        out.push('\n');
    }
    out
}

// ── Replay ──────────────────────────────────────────────────

/// Feeds every event of `events` to a fresh engine until the trace ends or
/// every breakpoint has fired.
pub fn replay<S, R>(
    specs: Vec<BreakpointSpec>,
    classifier: Classifier,
    config: EngineConfig,
    events: R,
    sink: S,
) -> AnyResult<Report>
where
    S: Sink,
    R: BufRead,
{
    let registry =
        BreakpointRegistry::load(specs).map_err(|e| format!("invalid breakpoints: {e}"))?;
    let mut engine = Engine::new(config, registry, classifier, sink);
    let mut reader = TraceReader::new(events);
    let mut thread = ThreadKey::MAIN;

    while let Some(line) = reader.next() {
        let line = line.map_err(|e| e.to_string())?;
        let event = match line {
            TraceLine::Thread(next) => {
                thread = next;
                continue;
            }
            TraceLine::Block {
                pc,
                instructions,
                next_pc,
            } => Event::Block {
                thread,
                pc,
                instructions,
                next_pc,
            },
            TraceLine::Call { sp, target } => Event::Call { thread, sp, target },
            TraceLine::Return { sp } => Event::Return { thread, sp },
            TraceLine::MainEntry { sp, target } => Event::MainEntry { thread, sp, target },
        };

        match engine.handle(event) {
            Ok(Control::Continue) => {}
            Ok(Control::Complete) => {
                info!(line = reader.line(), "all breakpoints visited, stopping replay");
                break;
            }
            Err(err) => {
                return Err(format!(
                    "replay aborted at event trace line {}: {err}",
                    reader.line()
                ));
            }
        }
    }

    Ok(engine.finish())
}

fn read_input(what: &str, path: &Path) -> AnyResult<String> {
    fs::read_to_string(path).map_err(|e| format!("failed to read {what} {}: {e}", path.display()))
}

fn create_output(path: &Path) -> AnyResult<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| format!("failed to create {}: {e}", path.display()))
}

fn write_output(path: &Path, contents: &str) -> AnyResult<()> {
    fs::write(path, contents).map_err(|e| format!("failed to write {}: {e}", path.display()))
}

/// Runs one replay end to end and returns the process exit code.
pub fn run(settings: &Settings) -> AnyResult<i32> {
    let breakpoints = read_input("breakpoints", &settings.breakpoints)?;
    let backtraces = match &settings.backtraces {
        Some(path) => Some(read_input("backtraces", path)?),
        None => None,
    };
    let whitelist = match &settings.whitelist {
        Some(path) => Some(read_input("whitelist", path)?),
        None => None,
    };
    let plan = Plan::parse(&breakpoints, backtraces.as_deref(), whitelist.as_deref())?;

    let events = File::open(&settings.events)
        .map(BufReader::new)
        .map_err(|e| format!("failed to open event trace {}: {e}", settings.events.display()))?;

    if let Some(root) = &settings.checkpoint_root {
        fs::create_dir_all(root)
            .map_err(|e| format!("failed to create {}: {e}", root.display()))?;
    }
    let mut sink = RunSink::new(
        create_output(&settings.bbv_out)?,
        create_output(&settings.path_out)?,
        settings.checkpoint_root.clone(),
    );

    info!(
        run_dir = %settings.run_dir.display(),
        breakpoints = plan.specs.len(),
        events = %settings.events.display(),
        "replaying"
    );
    let report = replay(
        plan.specs,
        plan.classifier,
        settings.engine,
        events,
        &mut sink,
    )?;
    sink.flush()
        .map_err(|e| format!("failed to flush slice output: {e}"))?;

    info!(
        instructions = report.instructions,
        slices = report.slices,
        "executed {} instructions, dumping results",
        report.instructions
    );
    write_output(&settings.bbid_out, &render_block_table(&report))?;
    if settings.backtraces.is_some() {
        write_output(
            &settings.btc_out,
            &render_backtrace_counts(&plan.empty_backtraces, &report),
        )?;
    }

    if !report.is_complete() {
        let missing = report
            .unreached
            .iter()
            .map(|(_, key)| key.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        warn!(
            fired = report.fired.len(),
            total = report.total,
            "not all breakpoints were reached: {missing}"
        );
    }
    Ok(report.exit_code())
}

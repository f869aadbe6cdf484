use facet::Facet;
use figue as args;
use waypoint_cli::{AnyResult, EXIT_FAILURE, Overrides, Settings};

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Directory the other relative paths are resolved against.
    #[facet(args::named, default)]
    run_dir: Option<String>,
    #[facet(args::named, default)]
    breakpoints: Option<String>,
    /// Slice-annotated backtrace records.
    #[facet(args::named, default)]
    backtraces: Option<String>,
    /// Routine entry pcs of the main executable, one per line.
    #[facet(args::named, default)]
    whitelist: Option<String>,
    #[facet(args::named, default)]
    events: Option<String>,
    #[facet(args::named, default)]
    bbv_out: Option<String>,
    #[facet(args::named, default)]
    path_out: Option<String>,
    #[facet(args::named, default)]
    bbid_out: Option<String>,
    #[facet(args::named, default)]
    btc_out: Option<String>,
    #[facet(args::named, default)]
    checkpoint_dir: Option<String>,
    /// Slice length, in millions of instructions.
    #[facet(args::named, default)]
    interval: Option<u64>,
    /// Instructions to run before counting starts.
    #[facet(args::named, default)]
    skip: Option<u64>,
    #[facet(args::named, default)]
    start_at_main: bool,
    #[facet(args::named, default)]
    pid: Option<u32>,
    /// Decide and report checkpoints without writing them.
    #[facet(args::named, default)]
    dry_run: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}

fn run() -> AnyResult<i32> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::resolve(overrides_from_cli(cli), |key| std::env::var(key).ok())?;
    waypoint_cli::run(&settings)
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("waypoint")
                .description("Replay an execution trace and fire call-path-sensitive checkpoints")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn overrides_from_cli(cli: Cli) -> Overrides {
    Overrides {
        run_dir: cli.run_dir,
        breakpoints: cli.breakpoints,
        backtraces: cli.backtraces,
        whitelist: cli.whitelist,
        events: cli.events,
        bbv_out: cli.bbv_out,
        path_out: cli.path_out,
        bbid_out: cli.bbid_out,
        btc_out: cli.btc_out,
        checkpoint_dir: cli.checkpoint_dir,
        interval: cli.interval,
        skip: cli.skip,
        start_at_main: cli.start_at_main,
        pid: cli.pid,
        dry_run: cli.dry_run,
    }
}

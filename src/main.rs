//! Batch runner: load a device graph, run a gossip-min computation,
//! export aggregated storage to a text log.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use fieldcast::{
    program_fn, read_arcs_path, Aggregator, Field, FieldcastResult, GraphConnect, GraphSpawner,
    LogSink, Net, RoundVm, SimTime,
};

#[derive(Parser, Debug)]
#[command(name = "fieldcast", about = "Run a field-calculus batch simulation")]
struct Args {
    /// Nodes file: one device per line, columns `start value` (or
    /// just `value` with --no-start).
    #[arg(long)]
    nodes: PathBuf,

    /// Arcs file: one directed `from to` pair per line.
    #[arg(long)]
    arcs: PathBuf,

    /// Nodes file has no leading start column.
    #[arg(long)]
    no_start: bool,

    /// Log output: a file path, or a directory ending in '/' for an
    /// auto-generated name. Defaults to stdout.
    #[arg(long)]
    output: Option<String>,

    /// Name used in the log preamble and generated file names.
    #[arg(long, default_value = "fieldcast")]
    name: String,

    /// Seed for the net's random generator.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Round period in seconds.
    #[arg(long, default_value_t = 1.0)]
    period: f64,

    /// Context retain window in seconds.
    #[arg(long)]
    retain: f64,

    /// Log write period in seconds.
    #[arg(long, default_value_t = 1.0)]
    log_period: f64,

    /// Stop after this simulated time.
    #[arg(long, default_value_t = 50.0)]
    until: f64,

    /// Worker pool size; 1 runs sequentially.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Front-group tolerance for the parallel executor.
    #[arg(long, default_value_t = 0.0)]
    epsilon: f64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("fieldcast: {error}");
            ExitCode::from(error.exit_code() as u8)
        }
    }
}

fn run(args: Args) -> FieldcastResult<()> {
    let columns: &[&str] = if args.no_start {
        &["value"]
    } else {
        &["start", "value"]
    };
    let spawner = GraphSpawner::new(columns);
    let rows = spawner.read_nodes_path(&args.nodes)?;
    let arcs = read_arcs_path(&args.arcs)?;

    let program = program_fn(|vm: &mut RoundVm<'_>, storage: &mut f64| {
        let mine = *storage;
        *storage = vm.nbr(1, mine, |_, f: &Field<f64>| {
            Ok(f.fold(mine, |a, v| a.min(*v)))
        })?;
        Ok(())
    });

    let sink = match &args.output {
        None => LogSink::Stdout,
        Some(path) if path.ends_with('/') => LogSink::Dir(PathBuf::from(path)),
        Some(path) => LogSink::Path(PathBuf::from(path)),
    };

    let mut net = Net::builder(program, GraphConnect::from_arcs(arcs))
        .name(&args.name)
        .seed(args.seed)
        .threads(args.threads)
        .epsilon(args.epsilon)
        .retain_window(args.retain)
        .round(0.0, args.period)
        .logger(
            sink,
            vec![Aggregator::Count, Aggregator::Min, Aggregator::Mean],
            args.log_period,
        )
        .build()?;

    net.spawn_rows(&rows, |row| {
        (row.get(&spawner, "value").unwrap_or(0.0), None)
    })?;

    net.run_until(SimTime::new(args.until))?;
    Ok(())
}

//! Command line interface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context};
use clap::{ArgAction, Parser, ValueEnum};

use crate::input::Instance;
use crate::musmcs::marco::MaxMode;
use crate::musmcs::parallel::{Coordinator, CoordinatorConfig, RunOutcome, WorkerConf, WorkerMode};
use crate::musmcs::{Bias, MusMcs};

/// Thin wrapper around [`Bias`] for clap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum BiasArg {
    #[value(name = "MUSes")]
    Muses,
    #[value(name = "MCSes")]
    Mcses,
}

impl From<BiasArg> for Bias {
    fn from(arg: BiasArg) -> Bias {
        match arg {
            BiasArg::Muses => Bias::Muses,
            BiasArg::Mcses => Bias::Mcses,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum MaxSeedArg {
    /// Maximize every seed before checking it.
    Always,
    /// Maximize only seeds that land on the bias side of the check.
    Half,
}

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Enumerate minimal unsatisfiable subsets (MUSes) and minimal correction sets (MCSes) of an over-constrained CNF formula.",
    long_about = None
)]
pub struct Args {
    /// Input formula: .cnf or .gcnf, optionally gzipped.
    pub infile: PathBuf,

    /// Assume DIMACS (group) CNF input regardless of the file extension.
    #[arg(long)]
    pub cnf: bool,

    /// Bias every worker toward MUSes or MCSes.
    #[arg(short, long, value_enum, conflicts_with = "parallel")]
    pub bias: Option<BiasArg>,

    /// Stop after N results (MUSes and MCSes combined).
    #[arg(short, long, value_name = "N")]
    pub limit: Option<usize>,

    /// Limit the runtime to SEC seconds.
    #[arg(short = 'T', long, value_name = "SEC")]
    pub timeout: Option<u64>,

    /// Print constraint indexes for every result; repeat for progress detail.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Print the elapsed time with every result.
    #[arg(short, long)]
    pub alltimes: bool,

    /// Print timing statistics to stderr on exit.
    #[arg(short, long)]
    pub stats: bool,

    /// Number of worker threads with the default mode mix.
    #[arg(long, value_name = "N", conflicts_with_all = ["bias", "parallel"])]
    pub threads: Option<usize>,

    /// Exact worker pool: a comma-separated list of MUS, MCS, MCSonly.
    #[arg(long, value_name = "SPEC")]
    pub parallel: Option<String>,

    /// Enumerate MCSes only, with the cardinality-bounded enumerator.
    #[arg(long)]
    pub mcs_only: bool,

    /// For every satisfiable subset, print its complementary MCS instead of
    /// the MSS itself.
    #[arg(long)]
    pub print_mcses: bool,

    /// Perform no seed maximization whatsoever.
    #[arg(long, conflicts_with = "max_seed")]
    pub nomax: bool,

    /// When to maximize seeds within the map.
    #[arg(short = 'm', long = "max-seed", value_enum, value_name = "MODE")]
    pub max_seed: Option<MaxSeedArg>,

    /// Shorthand for --max-seed always.
    #[arg(short = 'M', conflicts_with_all = ["max_seed", "nomax"])]
    pub max_always: bool,

    /// Converge on a smallest MUS (implies the cardinality map and MUS bias).
    #[arg(long, conflicts_with = "mcs_only")]
    pub smus: bool,

    /// Use the cardinality map solver: seeds are size-optimal models.
    #[arg(long)]
    pub card_map: bool,

    /// Block both directions from every result.
    #[arg(long)]
    pub block_both: bool,

    /// After each MSS, seed the engine with an unexplored strict superset.
    #[arg(long)]
    pub mss_guided: bool,

    /// Derive hard constraints from map implications under assumptions
    /// instead of unit implications only.
    #[arg(long)]
    pub improved_implies: bool,

    /// Randomize the grow/shrink candidate order, optionally with a seed.
    #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "1")]
    pub rnd_init: Option<u64>,

    /// Randomize every worker, including the first.
    #[arg(long)]
    pub all_randomized: bool,

    /// Give every worker the same randomization seed.
    #[arg(long, conflicts_with = "all_randomized")]
    pub same_seeds: bool,

    /// External group-CNF MUS extractor binary used in place of the internal
    /// shrink.
    #[arg(long, value_name = "PATH")]
    pub shrinker: Option<PathBuf>,

    /// Dump the first worker's map blocking clauses to this file.
    #[arg(long, value_name = "PATH")]
    pub dump_map: Option<PathBuf>,

    /// Do not forward results between workers.
    #[arg(long, conflicts_with = "comms_ignore")]
    pub comms_disable: bool,

    /// Forward results to workers but do not apply them (for measuring the
    /// cost of communication).
    #[arg(long)]
    pub comms_ignore: bool,
}

pub fn parse_args() -> Args {
    Args::parse()
}

/// The default worker pool: half the CPUs, MUS-biased, with one MCS-biased
/// worker when the pool is large enough.
fn default_pool(threads: Option<usize>, bias: Option<Bias>, mcs_only: bool) -> Vec<WorkerMode> {
    let threads = threads
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|cpus| cpus.get() / 2)
                .unwrap_or(1)
        })
        .max(1);
    if mcs_only {
        vec![WorkerMode::McsOnly; threads]
    } else if let Some(bias) = bias {
        vec![WorkerMode::Marco(bias); threads]
    } else if threads > 3 {
        let mut modes = vec![WorkerMode::Marco(Bias::Muses); threads - 1];
        modes.push(WorkerMode::Marco(Bias::Mcses));
        modes
    } else {
        vec![WorkerMode::Marco(Bias::Muses); threads]
    }
}

fn parse_parallel_spec(spec: &str) -> anyhow::Result<Vec<WorkerMode>> {
    let modes = spec
        .split(',')
        .map(|mode| match mode.trim() {
            "MUS" => Ok(WorkerMode::Marco(Bias::Muses)),
            "MCS" => Ok(WorkerMode::Marco(Bias::Mcses)),
            "MCSonly" => Ok(WorkerMode::McsOnly),
            other => bail!("invalid parallel mode: {other:?} (expected MUS, MCS or MCSonly)"),
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    ensure!(!modes.is_empty(), "--parallel needs at least one mode");
    Ok(modes)
}

/// Builds the per-worker configurations out of the flag surface.
fn worker_configs(args: &Args, modes: Vec<WorkerMode>) -> Vec<WorkerConf> {
    let count = modes.len();
    let seed_for = |index: usize| -> Option<u64> {
        if count == 1 {
            args.rnd_init
        } else if args.same_seeds {
            Some(1)
        } else if index == 0 && !args.all_randomized {
            // keep one deterministic worker
            None
        } else {
            Some(index as u64 + 1)
        }
    };
    let card_map = args.card_map || args.smus;
    let max_mode = if args.nomax {
        MaxMode::Never
    } else if card_map {
        MaxMode::Solver
    } else if args.max_seed == Some(MaxSeedArg::Half) {
        MaxMode::Half
    } else {
        MaxMode::Always
    };

    modes
        .into_iter()
        .enumerate()
        .map(|(index, mode)| WorkerConf {
            mode,
            max_mode,
            card_map,
            smus: args.smus,
            block_both: args.block_both,
            mss_guided: args.mss_guided,
            improved_implies: args.improved_implies,
            comms_ignore: args.comms_ignore,
            shrinker: args.shrinker.clone(),
            rnd_seed: seed_for(index),
            dump_map: (index == 0).then(|| args.dump_map.clone()).flatten(),
            parallel: count > 1,
        })
        .collect()
}

fn check_args(args: &Args) -> anyhow::Result<()> {
    let name = args.infile.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let base = name.strip_suffix(".gz").unwrap_or(name);
    ensure!(
        args.cnf || base.ends_with(".cnf") || base.ends_with(".gcnf"),
        "Cannot determine the input type of {}: pass --cnf, or see --help",
        args.infile.display()
    );
    ensure!(
        !(args.smus && args.bias == Some(BiasArg::Mcses)),
        "--smus searches for a smallest MUS and is incompatible with an MCS bias"
    );
    Ok(())
}

fn init_tracing(verbosity: u8) -> anyhow::Result<()> {
    let level = match verbosity {
        0 | 1 => tracing::Level::WARN,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::Uptime::from(Instant::now()))
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// One output line per result: the tag, then the elapsed seconds when
/// `--alltimes`, then the 1-based constraint ids when verbose.
fn format_result(result: &MusMcs, args: &Args, elapsed: Duration, n: u32) -> String {
    let (tag, ids): (char, Vec<u32>) = match result {
        MusMcs::Mss(set) if args.print_mcses => ('C', (1..=n).filter(|i| !set.contains(i)).collect()),
        other => (other.tag(), other.set().iter().copied().collect()),
    };
    let mut line = String::new();
    line.push(tag);
    if args.alltimes {
        line.push_str(&format!(" {:.3}", elapsed.as_secs_f64()));
    }
    if args.verbose > 0 {
        for id in ids {
            line.push_str(&format!(" {id}"));
        }
    }
    line
}

/// Runs the tool; the returned value is the process exit code.
pub fn run(args: &Args) -> anyhow::Result<i32> {
    init_tracing(args.verbose)?;
    check_args(args)?;

    let instance = Instance::from_path(&args.infile)
        .with_context(|| format!("cannot load {}", args.infile.display()))?;
    let n = instance.num_groups;

    if args.limit == Some(0) {
        // useful for timing just the parsing and setup
        return Ok(0);
    }

    let modes = match &args.parallel {
        Some(spec) => parse_parallel_spec(spec)?,
        None => default_pool(args.threads, args.bias.map(Bias::from), args.mcs_only),
    };
    let config = CoordinatorConfig {
        workers: worker_configs(args, modes),
        limit: args.limit,
        timeout: args.timeout.map(Duration::from_secs),
        comms_disable: args.comms_disable,
    };

    let start = Instant::now();
    let summary = Coordinator::new(Arc::new(instance), config)
        .run(|result| println!("{}", format_result(result, args, start.elapsed(), n)))?;

    if args.stats {
        for (label, stats) in &summary.worker_stats {
            eprint!("{}", stats.report(label));
        }
        eprintln!("duplicate MUS count : {}", summary.duplicate_mus);
        eprintln!("duplicate MSS count : {}", summary.duplicate_mss);
    }

    match summary.outcome {
        RunOutcome::TimedOut => {
            eprintln!("Time limit reached.");
            Ok(128)
        }
        RunOutcome::Complete | RunOutcome::LimitReached => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("musmcs").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn parallel_spec_round_trips() {
        let modes = parse_parallel_spec("MUS,MCS,MCSonly").unwrap();
        assert_eq!(
            modes,
            vec![
                WorkerMode::Marco(Bias::Muses),
                WorkerMode::Marco(Bias::Mcses),
                WorkerMode::McsOnly,
            ]
        );
        assert!(parse_parallel_spec("MUS,bogus").is_err());
    }

    #[test]
    fn default_pool_mixes_in_one_mcs_worker() {
        assert_eq!(
            default_pool(Some(2), None, false),
            vec![WorkerMode::Marco(Bias::Muses); 2]
        );
        let pool = default_pool(Some(4), None, false);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool[3], WorkerMode::Marco(Bias::Mcses));
        assert_eq!(
            default_pool(Some(2), Some(Bias::Mcses), false),
            vec![WorkerMode::Marco(Bias::Mcses); 2]
        );
        assert_eq!(default_pool(Some(3), None, true), vec![WorkerMode::McsOnly; 3]);
        assert_eq!(default_pool(Some(0), None, false).len(), 1);
    }

    #[test]
    fn first_worker_stays_deterministic_by_default() {
        let parsed = args(&["in.cnf", "--parallel", "MUS,MUS,MUS"]);
        let configs = worker_configs(&parsed, parse_parallel_spec("MUS,MUS,MUS").unwrap());
        assert_eq!(configs[0].rnd_seed, None);
        assert_eq!(configs[1].rnd_seed, Some(2));
        assert_eq!(configs[2].rnd_seed, Some(3));
        assert!(configs.iter().all(|c| c.parallel));

        let parsed = args(&["in.cnf", "--parallel", "MUS,MUS", "--all-randomized"]);
        let configs = worker_configs(&parsed, parse_parallel_spec("MUS,MUS").unwrap());
        assert_eq!(configs[0].rnd_seed, Some(1));

        let parsed = args(&["in.cnf", "--parallel", "MUS,MUS", "--same-seeds"]);
        let configs = worker_configs(&parsed, parse_parallel_spec("MUS,MUS").unwrap());
        assert!(configs.iter().all(|c| c.rnd_seed == Some(1)));
    }

    #[test]
    fn rnd_init_applies_to_a_single_worker() {
        let parsed = args(&["in.cnf", "--threads", "1", "--rnd-init"]);
        let configs = worker_configs(&parsed, default_pool(Some(1), None, false));
        assert_eq!(configs[0].rnd_seed, Some(1));
        assert!(!configs[0].parallel);

        let parsed = args(&["in.cnf", "--threads", "1", "--rnd-init", "7"]);
        let configs = worker_configs(&parsed, default_pool(Some(1), None, false));
        assert_eq!(configs[0].rnd_seed, Some(7));
    }

    #[test]
    fn smus_implies_the_cardinality_map() {
        let parsed = args(&["in.cnf", "--smus", "--threads", "1"]);
        let configs = worker_configs(&parsed, default_pool(Some(1), None, false));
        assert!(configs[0].card_map);
        assert!(configs[0].smus);
        assert_eq!(configs[0].max_mode, MaxMode::Solver);
    }

    #[test]
    fn input_type_detection() {
        assert!(check_args(&args(&["problem.cnf"])).is_ok());
        assert!(check_args(&args(&["problem.gcnf.gz"])).is_ok());
        assert!(check_args(&args(&["problem.txt"])).is_err());
        assert!(check_args(&args(&["problem.txt", "--cnf"])).is_ok());
        assert!(check_args(&args(&["problem.cnf", "--smus", "-b", "MCSes"])).is_err());
    }

    #[test]
    fn result_formatting() {
        let base = args(&["in.cnf"]);
        let mss = MusMcs::Mss([1, 3].into());
        assert_eq!(format_result(&mss, &base, Duration::ZERO, 4), "S");

        let verbose = args(&["in.cnf", "-v"]);
        assert_eq!(format_result(&mss, &verbose, Duration::ZERO, 4), "S 1 3");
        let mus = MusMcs::Mus([2, 4].into());
        assert_eq!(format_result(&mus, &verbose, Duration::ZERO, 4), "U 2 4");

        let mcses = args(&["in.cnf", "-v", "--print-mcses"]);
        assert_eq!(format_result(&mss, &mcses, Duration::ZERO, 4), "C 2 4");
        assert_eq!(format_result(&mus, &mcses, Duration::ZERO, 4), "U 2 4");

        let timed = args(&["in.cnf", "-a"]);
        assert_eq!(
            format_result(&mss, &timed, Duration::from_millis(1500), 4),
            "S 1.500"
        );
    }
}

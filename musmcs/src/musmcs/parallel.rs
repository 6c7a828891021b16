//! Worker pool and result coordination.
//!
//! Every worker owns a complete solver stack built from the shared
//! read-only instance and runs one engine ([`Marco`] or [`McsEnumerator`])
//! on its own thread. Results stream back over per-worker channels; the
//! coordinator deduplicates them against a *master* map, hands them to the
//! output sink, and fans each accepted result out to every other worker,
//! whose seed manager turns it into blocking clauses before its next seed.
//!
//! Workers only observe termination at seed boundaries; whoever is stuck in
//! a long solver call simply dies with the process once the coordinator
//! returns. External shrinker children are the exception: they would outlive
//! the process, so the coordinator raises a shutdown flag on every exit path
//! and the shrinker adapter kills its child when it sees the flag.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use tracing::{debug, error, info, warn};

use crate::input::Instance;
use crate::musmcs::mapsolver::{BasicMap, CardinalityMap, MapSolver};
use crate::musmcs::marco::{Marco, MarcoConfig, MaxMode, Outcome};
use crate::musmcs::mcs_enumerator::McsEnumerator;
use crate::musmcs::shrinker::ExternalShrinker;
use crate::musmcs::subsetsolver::{ImpliedHardMode, SubsetSolver};
use crate::musmcs::{Bias, EnumError, MusMcs};
use crate::stats::Stats;

/// Messages flowing into a worker.
#[derive(Debug)]
pub enum InputMsg {
    /// A peer's result, to be applied as blocking clauses.
    Result(MusMcs),
    /// Stop at the next seed boundary.
    Terminate,
}

/// Messages a worker sends to the coordinator.
#[derive(Debug)]
pub enum WorkerMsg {
    Result(MusMcs),
    /// This worker is finished, but enumeration may not be complete (an
    /// MCS-only worker never produces MUSes).
    Done(Stats),
    /// The lattice is exhausted; everything can stop.
    Complete(Stats),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerMode {
    Marco(Bias),
    McsOnly,
}

impl WorkerMode {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerMode::Marco(Bias::Muses) => "MUS",
            WorkerMode::Marco(Bias::Mcses) => "MCS",
            WorkerMode::McsOnly => "MCSonly",
        }
    }
}

/// Full configuration of a single worker's solver stack.
#[derive(Clone, Debug)]
pub struct WorkerConf {
    pub mode: WorkerMode,
    pub max_mode: MaxMode,
    /// Use the cardinality map instead of the basic one.
    pub card_map: bool,
    pub smus: bool,
    pub block_both: bool,
    pub mss_guided: bool,
    pub improved_implies: bool,
    pub comms_ignore: bool,
    pub shrinker: Option<PathBuf>,
    /// Randomization seed for this worker; `None` keeps the deterministic
    /// candidate order.
    pub rnd_seed: Option<u64>,
    /// Sink for the map's blocking clauses (first worker only).
    pub dump_map: Option<PathBuf>,
    /// Whether peers explore the same lattice concurrently.
    pub parallel: bool,
}

impl Default for WorkerConf {
    fn default() -> Self {
        WorkerConf {
            mode: WorkerMode::Marco(Bias::Muses),
            max_mode: MaxMode::Always,
            card_map: false,
            smus: false,
            block_both: false,
            mss_guided: false,
            improved_implies: false,
            comms_ignore: false,
            shrinker: None,
            rnd_seed: None,
            dump_map: None,
            parallel: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub workers: Vec<WorkerConf>,
    /// Stop after this many results (MUSes and MSSes combined).
    pub limit: Option<usize>,
    pub timeout: Option<Duration>,
    /// Do not forward results to peers.
    pub comms_disable: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Enumeration finished: every MUS and MSS was emitted.
    Complete,
    LimitReached,
    TimedOut,
}

pub struct Summary {
    pub outcome: RunOutcome,
    pub emitted: usize,
    pub duplicate_mus: u64,
    pub duplicate_mss: u64,
    /// Per-worker statistics, for the workers that finished on their own.
    pub worker_stats: Vec<(String, Stats)>,
}

struct Handle {
    label: String,
    rx: Receiver<WorkerMsg>,
    tx: Sender<InputMsg>,
}

/// Raises the shutdown flag when the coordinator's run ends, however it
/// ends; workers stuck inside an external shrink watch this flag and kill
/// their child process.
struct SignalOnDrop(Arc<AtomicBool>);

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct Coordinator {
    instance: Arc<Instance>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(instance: Arc<Instance>, config: CoordinatorConfig) -> Coordinator {
        Coordinator { instance, config }
    }

    /// Runs the pool to completion, limit, or timeout. `sink` receives each
    /// deduplicated result in coordinator emission order.
    pub fn run(self, mut sink: impl FnMut(&MusMcs)) -> Result<Summary, EnumError> {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let n = self.instance.num_groups;
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_guard = SignalOnDrop(cancel.clone());

        let mut handles: Vec<Handle> = Vec::with_capacity(self.config.workers.len());
        for (id, conf) in self.config.workers.iter().enumerate() {
            let (result_tx, result_rx) = unbounded();
            let (input_tx, input_rx) = unbounded();
            let label = format!("worker {id} ({})", conf.mode.label());
            let instance = self.instance.clone();
            let conf = conf.clone();
            let thread_label = label.clone();
            let cancel = cancel.clone();
            thread::spawn(move || run_worker(&thread_label, instance, conf, cancel, input_rx, result_tx));
            handles.push(Handle {
                label,
                rx: result_rx,
                tx: input_tx,
            });
        }

        // dedup master: only needed when several workers race
        let mut master = (handles.len() > 1).then(|| BasicMap::new(n, None));

        let mut summary = Summary {
            outcome: RunOutcome::Complete,
            emitted: 0,
            duplicate_mus: 0,
            duplicate_mss: 0,
            worker_stats: Vec::new(),
        };

        'event_loop: while !handles.is_empty() {
            let selected = {
                let mut sel = Select::new();
                for handle in &handles {
                    sel.recv(&handle.rx);
                }
                let op = match deadline {
                    Some(deadline) => sel.select_deadline(deadline).ok(),
                    None => Some(sel.select()),
                };
                op.map(|op| {
                    let index = op.index();
                    (index, op.recv(&handles[index].rx))
                })
            };
            let Some((index, msg)) = selected else {
                summary.outcome = RunOutcome::TimedOut;
                break 'event_loop;
            };

            match msg {
                Err(_) => {
                    // the channel died without a done/complete message
                    warn!("{} hung up unexpectedly", handles[index].label);
                    handles.remove(index);
                }
                Ok(WorkerMsg::Done(stats)) => {
                    debug!("{} is done", handles[index].label);
                    let handle = handles.remove(index);
                    let _ = handle.tx.send(InputMsg::Terminate);
                    summary.worker_stats.push((handle.label, stats));
                }
                Ok(WorkerMsg::Complete(stats)) => {
                    debug!("{} completed the enumeration", handles[index].label);
                    summary.worker_stats.push((handles[index].label.clone(), stats));
                    break 'event_loop;
                }
                Ok(WorkerMsg::Result(result)) => {
                    if let Some(master) = &mut master {
                        // filter duplicate or preempt-spoiled results
                        if !master.check_seed(result.set())? {
                            debug!("{} sent a duplicate", handles[index].label);
                            if result.is_mus() {
                                summary.duplicate_mus += 1;
                            } else {
                                summary.duplicate_mss += 1;
                            }
                            continue;
                        }
                        match &result {
                            MusMcs::Mus(set) => master.block_up(set),
                            MusMcs::Mss(set) => master.block_down(set),
                        }
                    }

                    sink(&result);
                    summary.emitted += 1;
                    if self.config.limit.is_some_and(|limit| summary.emitted >= limit) {
                        eprintln!("Result limit reached.");
                        summary.outcome = RunOutcome::LimitReached;
                        break 'event_loop;
                    }

                    if !self.config.comms_disable {
                        for (peer, handle) in handles.iter().enumerate() {
                            if peer != index {
                                let _ = handle.tx.send(InputMsg::Result(result.clone()));
                            }
                        }
                    }
                }
            }
        }

        for handle in &handles {
            let _ = handle.tx.send(InputMsg::Terminate);
        }
        info!(emitted = summary.emitted, "coordinator finished");
        Ok(summary)
    }
}

fn run_worker(
    label: &str,
    instance: Arc<Instance>,
    conf: WorkerConf,
    cancel: Arc<AtomicBool>,
    inbound: Receiver<InputMsg>,
    out: Sender<WorkerMsg>,
) {
    info!("{label} starting");
    match conf.mode {
        WorkerMode::McsOnly => {
            let mut engine = match McsEnumerator::new(instance, Some(inbound), conf.comms_ignore) {
                Ok(engine) => engine,
                Err(e) => {
                    error!("{label} failed to initialize: {e}");
                    return;
                }
            };
            match engine.run(|result| {
                let _ = out.send(WorkerMsg::Result(result));
            }) {
                Ok(Outcome::Complete) => {
                    let _ = out.send(WorkerMsg::Done(engine.stats().clone()));
                }
                Ok(Outcome::Terminated) => {}
                Err(e) => error!("{label} failed: {e}"),
            }
        }
        WorkerMode::Marco(bias) => {
            let implied_mode = if conf.improved_implies {
                ImpliedHardMode::UnderAssumptions
            } else {
                ImpliedHardMode::Units
            };
            let shrinker = conf.shrinker.map(|path| ExternalShrinker::new(path, cancel));
            let subs = match SubsetSolver::new(instance.clone(), implied_mode, shrinker, conf.rnd_seed) {
                Ok(subs) => subs,
                Err(e) => {
                    error!("{label} failed to initialize: {e}");
                    return;
                }
            };
            let dump = conf.dump_map.and_then(|path| match File::create(&path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!("{label}: cannot open map dump {}: {e}", path.display());
                    None
                }
            });
            let map: Box<dyn MapSolver> = if conf.card_map {
                Box::new(CardinalityMap::new(instance.num_groups, bias.high(), dump))
            } else {
                Box::new(BasicMap::new(instance.num_groups, dump))
            };
            let marco_config = MarcoConfig {
                bias,
                max_mode: conf.max_mode,
                smus: conf.smus,
                block_both: conf.block_both,
                mss_guided: conf.mss_guided,
                comms_ignore: conf.comms_ignore,
                parallel: conf.parallel,
            };
            let mut engine = Marco::new(subs, map, marco_config, Some(inbound));
            match engine.run(|result| {
                let _ = out.send(WorkerMsg::Result(result));
            }) {
                Ok(Outcome::Complete) => {
                    let _ = out.send(WorkerMsg::Complete(engine.stats().clone()));
                }
                Ok(Outcome::Terminated) => {}
                Err(e) => error!("{label} failed: {e}"),
            }
        }
    }
    info!("{label} exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::dimacs;
    use std::collections::BTreeSet;
    use std::io::Cursor;

    const CONTRADICTIONS: &str = "p cnf 2 4\n1 0\n-1 0\n2 0\n-2 0\n";

    fn instance(text: &str) -> Arc<Instance> {
        Arc::new(dimacs::parse(Cursor::new(text)).unwrap())
    }

    fn collect(config: CoordinatorConfig, text: &str) -> (Vec<MusMcs>, Summary) {
        let mut results = Vec::new();
        let summary = Coordinator::new(instance(text), config)
            .run(|r| results.push(r.clone()))
            .unwrap();
        (results, summary)
    }

    fn expected_catalogue() -> BTreeSet<MusMcs> {
        BTreeSet::from([
            MusMcs::Mus([1, 2].into()),
            MusMcs::Mus([3, 4].into()),
            MusMcs::Mss([1, 3].into()),
            MusMcs::Mss([1, 4].into()),
            MusMcs::Mss([2, 3].into()),
            MusMcs::Mss([2, 4].into()),
        ])
    }

    #[test]
    fn single_worker_completes() {
        let config = CoordinatorConfig {
            workers: vec![WorkerConf::default()],
            limit: None,
            timeout: None,
            comms_disable: false,
        };
        let (results, summary) = collect(config, CONTRADICTIONS);
        assert_eq!(summary.outcome, RunOutcome::Complete);
        assert_eq!(summary.emitted, 6);
        let set: BTreeSet<MusMcs> = results.into_iter().collect();
        assert_eq!(set, expected_catalogue());
    }

    #[test]
    fn mixed_pool_deduplicates_results() {
        let worker = |mode, rnd_seed| WorkerConf {
            mode,
            rnd_seed,
            parallel: true,
            ..WorkerConf::default()
        };
        let config = CoordinatorConfig {
            workers: vec![
                worker(WorkerMode::Marco(Bias::Muses), None),
                worker(WorkerMode::Marco(Bias::Mcses), Some(2)),
                worker(WorkerMode::McsOnly, Some(3)),
            ],
            limit: None,
            timeout: Some(Duration::from_secs(60)),
            comms_disable: false,
        };
        let (results, summary) = collect(config, CONTRADICTIONS);
        assert_ne!(summary.outcome, RunOutcome::TimedOut);
        // each result is emitted at most once (P3) and is genuine
        let set: BTreeSet<MusMcs> = results.iter().cloned().collect();
        assert_eq!(set.len(), results.len());
        assert!(expected_catalogue().is_superset(&set));
        // a MARCO worker completing guarantees full coverage
        if summary.outcome == RunOutcome::Complete {
            assert_eq!(set, expected_catalogue());
        }
    }

    #[test]
    fn limit_stops_the_pool() {
        let config = CoordinatorConfig {
            workers: vec![WorkerConf::default()],
            limit: Some(3),
            timeout: None,
            comms_disable: false,
        };
        let (results, summary) = collect(config, CONTRADICTIONS);
        assert_eq!(summary.outcome, RunOutcome::LimitReached);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn comms_ignore_produces_duplicates_that_the_master_filters() {
        let worker = |rnd_seed| WorkerConf {
            mode: WorkerMode::Marco(Bias::Muses),
            comms_ignore: true,
            rnd_seed,
            parallel: true,
            ..WorkerConf::default()
        };
        let config = CoordinatorConfig {
            workers: vec![worker(None), worker(Some(2))],
            limit: None,
            timeout: Some(Duration::from_secs(60)),
            comms_disable: false,
        };
        let (results, summary) = collect(config, CONTRADICTIONS);
        // both workers enumerate everything; the master emits each set once
        let set: BTreeSet<MusMcs> = results.iter().cloned().collect();
        assert_eq!(set.len(), results.len());
        if summary.outcome == RunOutcome::Complete {
            assert_eq!(set, expected_catalogue());
            assert!(summary.duplicate_mus + summary.duplicate_mss > 0);
        }
    }
}

//! The main enumeration loop: seed → check → grow/shrink → yield → block.

use std::collections::{BTreeSet, VecDeque};

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::debug;

use crate::musmcs::mapsolver::MapSolver;
use crate::musmcs::parallel::InputMsg;
use crate::musmcs::subsetsolver::SubsetSolver;
use crate::musmcs::{Bias, EnumError, MusMcs};
use crate::sat::SatError;
use crate::stats::Stats;

/// When to maximize a seed within the map before checking it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MaxMode {
    /// Take seeds as the map produces them.
    Never,
    /// Maximize every seed toward the bias before the check.
    Always,
    /// Check first; maximize (and re-check) only seeds that landed on the
    /// bias side, where maximization can still pay off.
    Half,
    /// The map itself produces size-optimal seeds (cardinality variant).
    Solver,
}

#[derive(Clone, Debug)]
pub struct MarcoConfig {
    pub bias: Bias,
    pub max_mode: MaxMode,
    /// Enumerate toward a smallest MUS: each MUS also blocks downward and
    /// caps future seeds strictly below its cardinality.
    pub smus: bool,
    /// Block both directions from every result, trading lattice coverage
    /// for a higher deduplicated yield rate.
    pub block_both: bool,
    /// After each MSS, queue an unexplored strict superset as the next seed.
    pub mss_guided: bool,
    /// Receive peer results but do not apply their blocking clauses.
    pub comms_ignore: bool,
    /// Whether peers explore the same lattice (enables the preempt check
    /// before shrinking).
    pub parallel: bool,
}

impl Default for MarcoConfig {
    fn default() -> Self {
        MarcoConfig {
            bias: Bias::Muses,
            max_mode: MaxMode::Always,
            smus: false,
            block_both: false,
            mss_guided: false,
            comms_ignore: false,
            parallel: false,
        }
    }
}

/// How a worker's enumeration ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The lattice is exhausted: everything has been enumerated.
    Complete,
    /// The coordinator asked this worker to stop.
    Terminated,
}

/// Feeds the engine: seeds injected by heuristics or peers first, fresh
/// map seeds otherwise. Incoming peer results are drained and applied as
/// blocking clauses before every draw, never mid-seed.
pub struct SeedManager {
    queue: VecDeque<BTreeSet<u32>>,
    inbound: Option<Receiver<InputMsg>>,
    solver_seeds_maximal: bool,
}

enum Drawn {
    Seed { seed: BTreeSet<u32>, known_max: bool },
    Exhausted,
    Terminated,
}

impl SeedManager {
    pub fn new(inbound: Option<Receiver<InputMsg>>, solver_seeds_maximal: bool) -> SeedManager {
        SeedManager {
            queue: VecDeque::new(),
            inbound,
            solver_seeds_maximal,
        }
    }

    pub fn add_seed(&mut self, seed: BTreeSet<u32>) {
        self.queue.push_back(seed);
    }

    /// Applies buffered peer results to the map. Returns true on terminate.
    fn drain(&mut self, map: &mut dyn MapSolver, stats: &mut Stats, comms_ignore: bool) -> bool {
        let mut disconnected = false;
        if let Some(inbound) = &self.inbound {
            loop {
                match inbound.try_recv() {
                    Ok(InputMsg::Terminate) => return true,
                    Ok(InputMsg::Result(result)) => {
                        let _t = stats.time("receive");
                        if comms_ignore {
                            continue;
                        }
                        match &result {
                            MusMcs::Mss(set) => map.block_down(set),
                            MusMcs::Mus(set) => map.block_up(set),
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
        }
        if disconnected {
            self.inbound = None;
        }
        false
    }

    fn next(
        &mut self,
        map: &mut dyn MapSolver,
        stats: &mut Stats,
        comms_ignore: bool,
    ) -> Result<Drawn, SatError> {
        if self.drain(map, stats, comms_ignore) {
            return Ok(Drawn::Terminated);
        }
        if let Some(seed) = self.queue.pop_front() {
            return Ok(Drawn::Seed { seed, known_max: false });
        }
        let _t = stats.time("seed");
        match map.next_seed()? {
            Some(seed) => Ok(Drawn::Seed {
                seed,
                known_max: self.solver_seeds_maximal,
            }),
            None => Ok(Drawn::Exhausted),
        }
    }
}

pub struct Marco {
    subs: SubsetSolver,
    map: Box<dyn MapSolver>,
    seeds: SeedManager,
    cfg: MarcoConfig,
    stats: Stats,
    n: u32,
    /// Whether some explored seed covered the top of the lattice.
    got_top: bool,
    terminated: bool,
}

impl Marco {
    pub fn new(
        subs: SubsetSolver,
        map: Box<dyn MapSolver>,
        cfg: MarcoConfig,
        inbound: Option<Receiver<InputMsg>>,
    ) -> Marco {
        let n = map.n();
        let solver_maximal = cfg.max_mode == MaxMode::Solver && map.known_max_seeds();
        Marco {
            subs,
            map,
            seeds: SeedManager::new(inbound, solver_maximal),
            cfg,
            stats: Stats::new(),
            n,
            got_top: false,
            terminated: false,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Runs until exhaustion or termination, handing each result to `emit`
    /// only after its blocking clauses are installed in the local map.
    pub fn run(&mut self, mut emit: impl FnMut(MusMcs)) -> Result<Outcome, EnumError> {
        while let Some(result) = self.next_result()? {
            emit(result);
        }
        Ok(if self.terminated {
            Outcome::Terminated
        } else {
            Outcome::Complete
        })
    }

    /// Convenience for in-process consumers and tests.
    pub fn enumerate_all(&mut self) -> Result<Vec<MusMcs>, EnumError> {
        let mut results = Vec::new();
        self.run(|r| results.push(r))?;
        Ok(results)
    }

    fn next_result(&mut self) -> Result<Option<MusMcs>, EnumError> {
        loop {
            let drawn = self.seeds.next(&mut *self.map, &mut self.stats, self.cfg.comms_ignore)?;
            let (mut seed, mut known_max) = match drawn {
                Drawn::Seed { seed, known_max } => (seed, known_max),
                Drawn::Exhausted => return Ok(None),
                Drawn::Terminated => {
                    self.terminated = true;
                    return Ok(None);
                }
            };
            debug!(size = seed.len(), "drawn seed");

            let high = self.cfg.bias.high();
            if self.cfg.max_mode == MaxMode::Always {
                let _t = self.stats.time("maximize");
                seed = self.map.maximize_seed(&seed, high)?;
                known_max = true;
            }

            let mut seed_is_sat;
            (seed_is_sat, seed) = {
                let _t = self.stats.time("check");
                self.subs.check_subset(&seed)?
            };

            if self.cfg.max_mode == MaxMode::Half && seed_is_sat == high && !known_max {
                // the seed landed on the bias side: push it to a local
                // optimum and re-check (the improved seed may flip it back)
                {
                    let _t = self.stats.time("maximize");
                    seed = self.map.maximize_seed(&seed, high)?;
                }
                (seed_is_sat, seed) = {
                    let _t = self.stats.time("check");
                    self.subs.check_subset(&seed)?
                };
                known_max = true;
            }
            // a maximized seed on the bias side needs no grow/shrink; under
            // an smus size cap, seeds are no longer maximal models, so SAT
            // seeds must still be grown
            let known_optimal = known_max && (seed_is_sat == high) && !(self.cfg.smus && seed_is_sat);
            debug!(sat = seed_is_sat, known_optimal, "checked seed");

            if seed_is_sat {
                let mss = if known_optimal {
                    seed
                } else {
                    let _t = self.stats.time("grow");
                    self.subs.grow(&seed, &mut *self.map)?
                };
                {
                    let _t = self.stats.time("block");
                    self.map.block_down(&mss);
                    if self.cfg.block_both && !self.cfg.smus {
                        self.map.block_up(&mss);
                    }
                }
                self.subs.increment_mss();
                if self.cfg.mss_guided && ((mss.len() as u32) < self.n.saturating_sub(1) || !self.got_top) {
                    let _t = self.stats.time("mssguided");
                    if let Some(next) = self.map.find_above(&mss)? {
                        self.seeds.add_seed(next);
                    }
                }
                return Ok(Some(MusMcs::Mss(mss)));
            }

            self.got_top = true;
            let mus = if known_optimal {
                seed
            } else {
                let shrunk = {
                    let _t = self.stats.time("shrink");
                    self.subs.shrink(&seed, &mut *self.map, self.cfg.parallel)?
                };
                match shrunk {
                    Some(mus) => mus,
                    None => {
                        // a peer explored this seed first
                        self.stats.increment("parallel rejected");
                        continue;
                    }
                }
            };
            {
                let _t = self.stats.time("block");
                self.map.block_up(&mus);
                if self.cfg.smus {
                    self.map.block_down(&mus);
                    if !mus.is_empty() {
                        self.map.block_above_size(mus.len() - 1);
                    }
                } else if self.cfg.block_both {
                    self.map.block_down(&mus);
                }
            }
            self.subs.increment_mus();
            return Ok(Some(MusMcs::Mus(mus)));
        }
    }
}

impl Iterator for Marco {
    type Item = Result<MusMcs, EnumError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::dimacs;
    use crate::musmcs::mapsolver::{BasicMap, CardinalityMap};
    use crate::musmcs::subsetsolver::ImpliedHardMode;
    use std::io::Cursor;
    use std::sync::Arc;

    fn engine(text: &str, cfg: MarcoConfig) -> Marco {
        let instance = Arc::new(dimacs::parse(Cursor::new(text)).unwrap());
        let subs = SubsetSolver::new(instance.clone(), ImpliedHardMode::Units, None, None).unwrap();
        let map: Box<dyn MapSolver> = if cfg.max_mode == MaxMode::Solver {
            Box::new(CardinalityMap::new(instance.num_groups, cfg.bias.high(), None))
        } else {
            Box::new(BasicMap::new(instance.num_groups, None))
        };
        Marco::new(subs, map, cfg, None)
    }

    const CONTRADICTIONS: &str = "p cnf 2 4\n1 0\n-1 0\n2 0\n-2 0\n";

    fn expected_contradiction_results() -> BTreeSet<MusMcs> {
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
    fn enumerates_the_contradiction_catalogue() {
        let mut marco = engine(CONTRADICTIONS, MarcoConfig::default());
        let results = marco.enumerate_all().unwrap();
        assert_eq!(results.len(), 6);
        let set: BTreeSet<MusMcs> = results.into_iter().collect();
        assert_eq!(set, expected_contradiction_results());
    }

    #[test]
    fn every_max_mode_agrees_on_the_catalogue() {
        for (max_mode, bias) in [
            (MaxMode::Never, Bias::Muses),
            (MaxMode::Always, Bias::Mcses),
            (MaxMode::Half, Bias::Muses),
            (MaxMode::Half, Bias::Mcses),
            (MaxMode::Solver, Bias::Muses),
            (MaxMode::Solver, Bias::Mcses),
        ] {
            let cfg = MarcoConfig {
                bias,
                max_mode,
                ..MarcoConfig::default()
            };
            let results = engine(CONTRADICTIONS, cfg).enumerate_all().unwrap();
            let set: BTreeSet<MusMcs> = results.into_iter().collect();
            assert_eq!(set, expected_contradiction_results(), "{max_mode:?}/{bias:?}");
        }
    }

    #[test]
    fn mus_bias_yields_the_mus_before_long_msses() {
        // (a), (¬a), (a∨b): the single MUS {1,2} must precede any MSS
        // under a MUS bias with maximal seeds
        let mut marco = engine("p cnf 2 3\n1 0\n-1 0\n1 2 0\n", MarcoConfig::default());
        let results = marco.enumerate_all().unwrap();
        assert_eq!(results[0], MusMcs::Mus([1, 2].into()));
        let msses: BTreeSet<MusMcs> = results.into_iter().filter(|r| !r.is_mus()).collect();
        assert_eq!(
            msses,
            BTreeSet::from([MusMcs::Mss([1, 3].into()), MusMcs::Mss([2, 3].into())])
        );
    }

    #[test]
    fn satisfiable_input_yields_the_single_full_mss() {
        let mut marco = engine("p cnf 2 2\n1 0\n2 0\n", MarcoConfig::default());
        let results = marco.enumerate_all().unwrap();
        assert_eq!(results, vec![MusMcs::Mss([1, 2].into())]);
    }

    #[test]
    fn empty_instance_yields_nothing() {
        let mut marco = engine("p cnf 0 0\n", MarcoConfig::default());
        assert!(marco.enumerate_all().unwrap().is_empty());
    }

    #[test]
    fn duplicate_constraints_form_their_own_muses() {
        // (x), (¬x), (¬x) again: {1,2} and {1,3} are both MUSes
        let mut marco = engine("p cnf 1 3\n1 0\n-1 0\n-1 0\n", MarcoConfig::default());
        let muses: BTreeSet<MusMcs> = marco
            .enumerate_all()
            .unwrap()
            .into_iter()
            .filter(MusMcs::is_mus)
            .collect();
        assert_eq!(
            muses,
            BTreeSet::from([MusMcs::Mus([1, 2].into()), MusMcs::Mus([1, 3].into())])
        );
    }

    #[test]
    fn smus_mode_converges_on_a_smallest_mus() {
        // MUSes: {1,2} (size 2) and {3,4,5} (size 3); sizes must not grow
        let text = "p cnf 3 5\n1 0\n-1 0\n2 0\n-2 3 0\n-3 0\n";
        let cfg = MarcoConfig {
            bias: Bias::Muses,
            max_mode: MaxMode::Solver,
            smus: true,
            ..MarcoConfig::default()
        };
        let results = engine(text, cfg).enumerate_all().unwrap();
        let mus_sizes: Vec<usize> = results
            .iter()
            .filter(|r| r.is_mus())
            .map(|r| r.set().len())
            .collect();
        assert!(!mus_sizes.is_empty());
        assert!(mus_sizes.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*mus_sizes.last().unwrap(), 2);
    }

    #[test]
    fn mss_guided_mode_still_enumerates_everything() {
        let cfg = MarcoConfig {
            bias: Bias::Mcses,
            max_mode: MaxMode::Never,
            mss_guided: true,
            ..MarcoConfig::default()
        };
        let results = engine(CONTRADICTIONS, cfg).enumerate_all().unwrap();
        let set: BTreeSet<MusMcs> = results.into_iter().collect();
        assert_eq!(set, expected_contradiction_results());
    }

    #[test]
    fn block_both_deduplicates_but_may_lose_coverage() {
        let cfg = MarcoConfig {
            block_both: true,
            ..MarcoConfig::default()
        };
        let results = engine(CONTRADICTIONS, cfg).enumerate_all().unwrap();
        // no duplicates, and each result is a genuine MUS or MSS
        let set: BTreeSet<MusMcs> = results.iter().cloned().collect();
        assert_eq!(set.len(), results.len());
        assert!(expected_contradiction_results().is_superset(&set));
    }
}

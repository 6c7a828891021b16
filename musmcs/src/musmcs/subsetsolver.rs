//! Subset solver: satisfiability checks, grow and shrink over the frozen
//! formula.
//!
//! `check_subset` always returns the improved seed: the satisfied-group set
//! on SAT (possibly larger than asked, since untouched groups are left free)
//! or the unsat core on UNSAT. `grow` and `shrink` exploit exactly those
//! improvements to move through the lattice in large steps.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::trace;

use crate::input::Instance;
use crate::sat::{SatError, SatSolver};
use crate::musmcs::mapsolver::MapSolver;
use crate::musmcs::shrinker::ExternalShrinker;
use crate::musmcs::EnumError;

/// How ids known to be in every remaining MUS are derived from the map.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ImpliedHardMode {
    /// Unit consequences of the map's blocking clauses (singleton MCSes and
    /// whatever they propagate). Cheap, always sound.
    #[default]
    Units,
    /// Implications under assumptions: while shrinking, ids implied by
    /// excluding the working set's complement; while growing, ids implied
    /// excluded by the working set. Stronger, recomputed as the working set
    /// moves.
    UnderAssumptions,
}

pub struct SubsetSolver {
    sat: SatSolver,
    n: u32,
    implied_mode: ImpliedHardMode,
    shrinker: Option<ExternalShrinker>,
    instance: Arc<Instance>,
    rng: Option<SmallRng>,
    known_mss: u64,
    known_mus: u64,
}

impl SubsetSolver {
    pub fn new(
        instance: Arc<Instance>,
        implied_mode: ImpliedHardMode,
        shrinker: Option<ExternalShrinker>,
        rnd_seed: Option<u64>,
    ) -> Result<SubsetSolver, SatError> {
        let sat = SatSolver::instrumented(&instance)?;
        Ok(SubsetSolver {
            sat,
            n: instance.num_groups,
            implied_mode,
            shrinker,
            instance,
            rng: rnd_seed.map(SmallRng::seed_from_u64),
            known_mss: 0,
            known_mus: 0,
        })
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn increment_mss(&mut self) {
        self.known_mss += 1;
    }

    pub fn increment_mus(&mut self) {
        self.known_mus += 1;
    }

    fn complement(&self, subset: &BTreeSet<u32>) -> Vec<u32> {
        (1..=self.n).filter(|i| !subset.contains(i)).collect()
    }

    /// Shuffles candidate order when this worker is randomized; the order of
    /// grow/shrink candidates is what diversifies parallel workers.
    fn candidate_order(&mut self, mut candidates: Vec<u32>) -> Vec<u32> {
        if let Some(rng) = &mut self.rng {
            candidates.shuffle(rng);
        }
        candidates
    }

    /// SAT check of a subset, returning the improved seed: `sat_subset` on
    /// SAT, `unsat_core` on UNSAT.
    pub fn check_subset(&mut self, seed: &BTreeSet<u32>) -> Result<(bool, BTreeSet<u32>), SatError> {
        let is_sat = self.sat.solve_subset(seed)?;
        let improved = if is_sat {
            self.sat.sat_subset()?
        } else {
            self.sat.unsat_core()?
        };
        Ok((is_sat, improved))
    }

    /// Ids the working set must not try to add while growing (implied
    /// excluded by the map), under the improved-implications mode.
    fn grow_skips(&mut self, current: &BTreeSet<u32>, map: &mut dyn MapSolver) -> BTreeSet<u32> {
        if self.implied_mode != ImpliedHardMode::UnderAssumptions || self.known_mus == 0 {
            return BTreeSet::new();
        }
        let assumptions: Vec<i32> = current.iter().map(|&i| i as i32).collect();
        map.implies(&assumptions)
            .into_iter()
            .filter(|&lit| lit < 0)
            .map(|lit| lit.unsigned_abs())
            .collect()
    }

    /// Extends a SAT seed to a maximal satisfiable subset.
    pub fn grow(&mut self, seed: &BTreeSet<u32>, map: &mut dyn MapSolver) -> Result<BTreeSet<u32>, SatError> {
        let mut current = seed.clone();
        let mut skip = self.grow_skips(&current, map);
        for candidate in self.candidate_order(self.complement(seed)) {
            if current.contains(&candidate) || skip.contains(&candidate) {
                // brought in by an earlier sat_subset, or known hopeless
                continue;
            }
            current.insert(candidate);
            if self.sat.solve_subset(&current)? {
                // take every also-satisfied group along
                current = self.sat.sat_subset()?;
                skip = self.grow_skips(&current, map);
            } else {
                current.remove(&candidate);
            }
        }
        trace!(mss = current.len(), "grow finished");
        Ok(current)
    }

    /// Ids that are members of every MUS within the remaining map models and
    /// can therefore be skipped while shrinking.
    fn shrink_hard(&mut self, current: &BTreeSet<u32>, map: &mut dyn MapSolver) -> BTreeSet<u32> {
        let hard: BTreeSet<u32> = match self.implied_mode {
            ImpliedHardMode::Units => map
                .implies(&[])
                .into_iter()
                .filter(|&lit| lit > 0)
                .map(|lit| lit as u32)
                .collect(),
            ImpliedHardMode::UnderAssumptions => {
                if self.known_mss == 0 {
                    return BTreeSet::new();
                }
                let assumptions: Vec<i32> = self.complement(current).into_iter().map(|i| -(i as i32)).collect();
                map.implies(&assumptions)
                    .into_iter()
                    .filter(|&lit| lit > 0)
                    .map(|lit| lit as u32)
                    .collect()
            }
        };
        // an id outside the seed cannot be kept hard; stale entries would
        // invalidate the MUS
        hard.intersection(current).copied().collect()
    }

    /// Reduces an UNSAT seed to a minimal unsatisfiable subset, skipping ids
    /// the map already forces into every remaining MUS. Returns `None` when
    /// `parallel` is set and a peer explored the seed in the meantime.
    pub fn shrink(
        &mut self,
        seed: &BTreeSet<u32>,
        map: &mut dyn MapSolver,
        parallel: bool,
    ) -> Result<Option<BTreeSet<u32>>, EnumError> {
        if parallel && !map.check_seed(seed)? {
            // the hard ids below could lie outside an explored seed, which
            // would poison the result; give the seed up instead
            return Ok(None);
        }
        let mut hard = self.shrink_hard(seed, map);

        if let Some(shrinker) = self.shrinker.take() {
            let result = if seed.len() == hard.len() {
                // nothing left to minimize
                Ok(Some(seed.clone()))
            } else {
                shrinker
                    .shrink(&self.instance, seed, &hard)
                    .map(Some)
                    .map_err(EnumError::from)
            };
            self.shrinker = Some(shrinker);
            return result;
        }

        let mut current = seed.clone();
        for candidate in self.candidate_order(seed.iter().copied().collect()) {
            if !current.contains(&candidate) || hard.contains(&candidate) {
                // dropped by an earlier unsat core, or pinned
                continue;
            }
            current.remove(&candidate);
            if !self.sat.solve_subset(&current)? {
                // the core may drop several candidates at once
                current = self.sat.unsat_core()?;
                if self.implied_mode == ImpliedHardMode::UnderAssumptions {
                    hard = self.shrink_hard(&current, map);
                }
            } else {
                current.insert(candidate);
            }
        }
        trace!(mus = current.len(), "shrink finished");
        Ok(Some(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::dimacs;
    use crate::musmcs::mapsolver::BasicMap;
    use std::io::Cursor;

    fn solver(text: &str) -> SubsetSolver {
        let instance = Arc::new(dimacs::parse(Cursor::new(text)).unwrap());
        SubsetSolver::new(instance, ImpliedHardMode::Units, None, None).unwrap()
    }

    const CONTRADICTIONS: &str = "p cnf 2 4\n1 0\n-1 0\n2 0\n-2 0\n";

    #[test]
    fn check_subset_improves_both_ways() {
        let mut subs = solver(CONTRADICTIONS);
        let (sat, improved) = subs.check_subset(&[1].into()).unwrap();
        assert!(sat);
        assert!(improved.contains(&1));
        assert!(!improved.contains(&2));

        let (sat, core) = subs.check_subset(&[1, 2, 3].into()).unwrap();
        assert!(!sat);
        assert!(core.contains(&1) && core.contains(&2));
        assert!(core.len() <= 3);
    }

    #[test]
    fn grow_reaches_a_maximal_subset() {
        let mut subs = solver(CONTRADICTIONS);
        let mut map = BasicMap::new(subs.n(), None);
        let mss = subs.grow(&[1].into(), &mut map).unwrap();
        assert_eq!(mss.len(), 2);
        assert!(mss.contains(&1));
        // maximality: every excluded id breaks satisfiability
        for id in subs.complement(&mss) {
            let mut extended = mss.clone();
            extended.insert(id);
            let (sat, _) = subs.check_subset(&extended).unwrap();
            assert!(!sat);
        }
    }

    #[test]
    fn shrink_reaches_a_minimal_subset() {
        let mut subs = solver(CONTRADICTIONS);
        let mut map = BasicMap::new(subs.n(), None);
        let mus = subs
            .shrink(&[1, 2, 3, 4].into(), &mut map, false)
            .unwrap()
            .unwrap();
        assert!(mus == [1, 2].into() || mus == [3, 4].into());
        // minimality: every proper subset is SAT
        for &id in &mus {
            let mut reduced = mus.clone();
            reduced.remove(&id);
            let (sat, _) = subs.check_subset(&reduced).unwrap();
            assert!(sat);
        }
    }

    #[test]
    fn shrink_skips_map_implied_hard_ids() {
        // (a), (¬a), (a ∨ b): the only MUS is {1,2}, so {2,3} is an MSS and
        // its singleton MCS {1} pins 1 into every remaining MUS
        let mut subs = solver("p cnf 2 3\n1 0\n-1 0\n1 2 0\n");
        let mut map = BasicMap::new(subs.n(), None);
        map.block_down(&[2, 3].into());
        assert_eq!(map.implies(&[]), vec![1]);
        let mus = subs
            .shrink(&[1, 2, 3].into(), &mut map, false)
            .unwrap()
            .unwrap();
        assert_eq!(mus, [1, 2].into());
    }

    #[test]
    fn shrink_gives_up_on_explored_seeds_in_parallel_mode() {
        let mut subs = solver(CONTRADICTIONS);
        let mut map = BasicMap::new(subs.n(), None);
        let seed: BTreeSet<u32> = [1, 2, 3, 4].into();
        map.block_up(&[1, 2].into()); // a peer already reported this MUS region
        assert!(subs.shrink(&seed, &mut map, true).unwrap().is_none());
        // single-worker mode does not consult the map
        assert!(subs.shrink(&seed, &mut map, false).unwrap().is_some());
    }

    #[test]
    fn unsat_hard_clauses_shrink_to_the_empty_mus() {
        let mut subs = solver("p gcnf 1 3 1\n{0} 1 0\n{0} -1 0\n{1} 1 0\n");
        let mut map = BasicMap::new(subs.n(), None);
        let (sat, core) = subs.check_subset(&[1].into()).unwrap();
        assert!(!sat);
        assert!(core.len() <= 1);
        let mus = subs.shrink(&core, &mut map, false).unwrap().unwrap();
        assert!(mus.is_empty());
    }
}

//! Map solvers: SAT-based bookkeeping of the unexplored power-set lattice.
//!
//! One map variable per soft group; a model of the map formula is an
//! unexplored subset (the next *seed*). Exploring a subset installs a
//! blocking clause that removes it together with all of its subsets
//! ([`MapSolver::block_down`]) or supersets ([`MapSolver::block_up`]).
//!
//! Two variants are provided:
//! - [`BasicMap`]: plain models, in whatever order the backend produces
//!   them. Seed maximization, when wanted, is done by the engine through
//!   [`MapSolver::maximize_seed`].
//! - [`CardinalityMap`]: walks a cardinality bound so that every seed is a
//!   maximum-size (MUS bias) or minimum-size (MCS bias) model. The bound is
//!   an at-least/at-most constraint over the map variables plus `n`
//!   bound-setting variables; assuming `k` bound variables at their active
//!   polarity instantiates the bound at `k`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::warn;

use crate::sat::{nlit, plit, SatError, SatSolver};
use varisat::Lit;

pub trait MapSolver {
    fn n(&self) -> u32;

    /// Next unexplored subset, or `None` once the lattice is exhausted.
    fn next_seed(&mut self) -> Result<Option<BTreeSet<u32>>, SatError>;

    /// Iterative model maximization: repeatedly looks for a model extending
    /// `seed` with at least one more included (`up`) or excluded (`!up`)
    /// group, until a local optimum is reached.
    fn maximize_seed(&mut self, seed: &BTreeSet<u32>, up: bool) -> Result<BTreeSet<u32>, SatError>;

    /// Removes `from` and all of its subsets from the unexplored region.
    fn block_down(&mut self, from: &BTreeSet<u32>);

    /// Removes `from` and all of its supersets from the unexplored region.
    fn block_up(&mut self, from: &BTreeSet<u32>);

    /// Whether `seed` is still a model of the map formula, i.e. not yet
    /// excluded by any blocking clause.
    fn check_seed(&mut self, seed: &BTreeSet<u32>) -> Result<bool, SatError>;

    /// Any unexplored strict superset of `seed` (strict once `seed` itself
    /// has been blocked).
    fn find_above(&mut self, seed: &BTreeSet<u32>) -> Result<Option<BTreeSet<u32>>, SatError>;

    /// Map literals (signed 1-based ids) forced by the blocking clauses,
    /// optionally under additional assumptions. Conflicts yield an empty
    /// answer rather than a partial one.
    fn implies(&mut self, assumptions: &[i32]) -> Vec<i32>;

    /// True when every seed this map produces is already size-optimal in the
    /// bias direction.
    fn known_max_seeds(&self) -> bool {
        false
    }

    /// Cardinality refinement: restrict future models to at most `size`
    /// included groups. Only the cardinality variant supports this.
    fn block_above_size(&mut self, _size: usize) {
        unreachable!("cardinality bounds require the cardinality map")
    }

    /// Cardinality refinement: restrict future models to at least `size`
    /// included groups. Only the cardinality variant supports this.
    fn block_below_size(&mut self, _size: usize) {
        unreachable!("cardinality bounds require the cardinality map")
    }
}

/// State shared by both map variants: the backing solver, the record of
/// blocking clauses (which answers `implies` and feeds `--dump-map`), and
/// the seed extraction helpers.
struct MapCore {
    sat: SatSolver,
    n: u32,
    clauses: Vec<Vec<i32>>,
    dump: Option<BufWriter<File>>,
}

impl MapCore {
    fn new(n: u32, extra_vars: usize, dump: Option<File>) -> MapCore {
        MapCore {
            sat: SatSolver::new(n as usize + extra_vars, 0),
            n,
            clauses: Vec::new(),
            dump: dump.map(BufWriter::new),
        }
    }

    fn lit(&self, id: i32) -> Lit {
        debug_assert!(id != 0 && id.unsigned_abs() <= self.n);
        if id > 0 {
            plit(id as usize - 1)
        } else {
            nlit(-id as usize - 1)
        }
    }

    fn membership_assumptions(&self, seed: &BTreeSet<u32>) -> Vec<Lit> {
        (1..=self.n)
            .map(|i| {
                if seed.contains(&i) {
                    plit(i as usize - 1)
                } else {
                    nlit(i as usize - 1)
                }
            })
            .collect()
    }

    fn complement(&self, seed: &BTreeSet<u32>) -> Vec<u32> {
        (1..=self.n).filter(|i| !seed.contains(i)).collect()
    }

    fn seed_from_model(&self) -> BTreeSet<u32> {
        self.sat.model_trues(0..self.n as usize).into_iter().collect()
    }

    fn add_block_clause(&mut self, clause: Vec<i32>) {
        let lits: Vec<Lit> = clause.iter().map(|&id| self.lit(id)).collect();
        self.sat.add_clause(&lits);
        if let Some(dump) = &mut self.dump {
            let line = clause.iter().map(i32::to_string).collect::<Vec<_>>().join(" ");
            if let Err(e) = writeln!(dump, "{line} 0").and_then(|()| dump.flush()) {
                warn!("map clause dump failed: {e}");
                self.dump = None;
            }
        }
        self.clauses.push(clause);
    }

    fn block_down(&mut self, from: &BTreeSet<u32>) {
        let clause = self.complement(from).into_iter().map(|i| i as i32).collect();
        self.add_block_clause(clause);
    }

    fn block_up(&mut self, from: &BTreeSet<u32>) {
        let clause = from.iter().map(|&i| -(i as i32)).collect();
        self.add_block_clause(clause);
    }

    fn maximize_seed(&mut self, seed: &BTreeSet<u32>, up: bool) -> Result<BTreeSet<u32>, SatError> {
        let mut seed = seed.clone();
        loop {
            let comp = self.complement(&seed);
            let activate = self.sat.new_var();
            let mut clause = vec![!activate];
            let mut assumptions = vec![activate];
            if up {
                // a model with all of the seed plus at least one more
                clause.extend(comp.iter().map(|&i| plit(i as usize - 1)));
                assumptions.extend(seed.iter().map(|&i| plit(i as usize - 1)));
            } else {
                // a model with none of the complement and at least one
                // of the seed dropped
                clause.extend(seed.iter().map(|&i| nlit(i as usize - 1)));
                assumptions.extend(comp.iter().map(|&i| nlit(i as usize - 1)));
            }
            self.sat.add_clause(&clause);
            let improved = self.sat.solve(&assumptions)?;
            // retire the temporary clause
            self.sat.add_clause(&[!activate]);
            if improved {
                seed = self.seed_from_model();
            } else {
                return Ok(seed);
            }
        }
    }

    fn find_above(&mut self, seed: &BTreeSet<u32>) -> Result<Option<BTreeSet<u32>>, SatError> {
        let assumptions: Vec<Lit> = seed.iter().map(|&i| plit(i as usize - 1)).collect();
        if self.sat.solve(&assumptions)? {
            Ok(Some(self.seed_from_model()))
        } else {
            Ok(None)
        }
    }

    fn implies(&self, assumptions: &[i32]) -> Vec<i32> {
        propagate_units(&self.clauses, assumptions)
    }
}

/// Unit propagation to fixpoint over the recorded blocking clauses.
/// Returns the propagated literals (assumptions excluded); an empty answer
/// on conflict.
fn propagate_units(clauses: &[Vec<i32>], assumptions: &[i32]) -> Vec<i32> {
    let mut assignment: BTreeMap<u32, bool> = BTreeMap::new();
    for &lit in assumptions {
        assignment.insert(lit.unsigned_abs(), lit > 0);
    }
    let mut forced: Vec<i32> = Vec::new();
    loop {
        let mut changed = false;
        for clause in clauses {
            let mut unassigned = None;
            let mut open = 0usize;
            let mut satisfied = false;
            for &lit in clause {
                match assignment.get(&lit.unsigned_abs()) {
                    Some(&value) if value == (lit > 0) => {
                        satisfied = true;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        open += 1;
                        unassigned = Some(lit);
                    }
                }
            }
            if satisfied {
                continue;
            }
            match open {
                0 => return Vec::new(),
                1 => {
                    let lit = unassigned.unwrap();
                    assignment.insert(lit.unsigned_abs(), lit > 0);
                    forced.push(lit);
                    changed = true;
                }
                _ => {}
            }
        }
        if !changed {
            break;
        }
    }
    forced
}

pub struct BasicMap {
    core: MapCore,
}

impl BasicMap {
    pub fn new(n: u32, dump: Option<File>) -> BasicMap {
        BasicMap {
            core: MapCore::new(n, 0, dump),
        }
    }
}

impl MapSolver for BasicMap {
    fn n(&self) -> u32 {
        self.core.n
    }

    fn next_seed(&mut self) -> Result<Option<BTreeSet<u32>>, SatError> {
        if self.core.n == 0 {
            return Ok(None);
        }
        if self.core.sat.solve(&[])? {
            Ok(Some(self.core.seed_from_model()))
        } else {
            Ok(None)
        }
    }

    fn maximize_seed(&mut self, seed: &BTreeSet<u32>, up: bool) -> Result<BTreeSet<u32>, SatError> {
        self.core.maximize_seed(seed, up)
    }

    fn block_down(&mut self, from: &BTreeSet<u32>) {
        self.core.block_down(from);
    }

    fn block_up(&mut self, from: &BTreeSet<u32>) {
        self.core.block_up(from);
    }

    fn check_seed(&mut self, seed: &BTreeSet<u32>) -> Result<bool, SatError> {
        let assumptions = self.core.membership_assumptions(seed);
        self.core.sat.solve(&assumptions)
    }

    fn find_above(&mut self, seed: &BTreeSet<u32>) -> Result<Option<BTreeSet<u32>>, SatError> {
        self.core.find_above(seed)
    }

    fn implies(&mut self, assumptions: &[i32]) -> Vec<i32> {
        self.core.implies(assumptions)
    }
}

pub struct CardinalityMap {
    core: MapCore,
    bias_high: bool,
    /// Current bound on the number of included groups; walks from `n`
    /// towards 0 with a MUS bias, from 0 towards `n` otherwise.
    k: usize,
}

impl CardinalityMap {
    pub fn new(n: u32, bias_high: bool, dump: Option<File>) -> CardinalityMap {
        let n_usize = n as usize;
        let mut core = MapCore::new(n, n_usize, dump);
        // Generic at-least-k over the map variables: at-least(map ∪ bound, n)
        // with the desired number of bound variables assumed off. Expressed
        // as at-most over the negations; mirrored for the low bias.
        let lits: Vec<Lit> = (0..2 * n_usize)
            .map(|i| if bias_high { nlit(i) } else { plit(i) })
            .collect();
        core.sat.add_atmost(&lits, n_usize);
        CardinalityMap {
            core,
            bias_high,
            k: if bias_high { n_usize } else { 0 },
        }
    }

    /// Bound-setting assumptions: the first `k` bound variables at their
    /// active polarity, the rest inert. The same pattern instantiates
    /// at-least-k for the high bias and at-most-k for the low one.
    fn bound_assumptions(&self, k: usize) -> Vec<Lit> {
        let n = self.core.n as usize;
        (0..n)
            .map(|x| if x < k { nlit(n + x) } else { plit(n + x) })
            .collect()
    }

    /// Assumptions neutralizing the cardinality constraint entirely.
    fn neutral_assumptions(&self) -> Vec<Lit> {
        let n = self.core.n as usize;
        (0..n)
            .map(|x| if self.bias_high { plit(n + x) } else { nlit(n + x) })
            .collect()
    }

    fn solve_with_bound(&mut self, k: usize) -> Result<bool, SatError> {
        let assumptions = self.bound_assumptions(k);
        self.core.sat.solve(&assumptions)
    }
}

impl MapSolver for CardinalityMap {
    fn n(&self) -> u32 {
        self.core.n
    }

    /// Finds the next size-extremal model, relaxing the bound toward the
    /// opposite pole only when the current one is exhausted.
    fn next_seed(&mut self) -> Result<Option<BTreeSet<u32>>, SatError> {
        let n = self.core.n as usize;
        if n == 0 {
            return Ok(None);
        }
        if self.solve_with_bound(self.k)? {
            return Ok(Some(self.core.seed_from_model()));
        }
        if self.bias_high {
            if !self.solve_with_bound(0)? {
                return Ok(None);
            }
            self.k -= 1;
        } else {
            if !self.solve_with_bound(n)? {
                return Ok(None);
            }
            self.k += 1;
        }
        while !self.solve_with_bound(self.k)? {
            if self.bias_high {
                self.k -= 1;
            } else {
                self.k += 1;
            }
        }
        debug_assert!(self.k <= n);
        Ok(Some(self.core.seed_from_model()))
    }

    fn maximize_seed(&mut self, seed: &BTreeSet<u32>, up: bool) -> Result<BTreeSet<u32>, SatError> {
        // bound variables are left free, so the cardinality constraint is
        // inert here, as in find_above
        self.core.maximize_seed(seed, up)
    }

    fn block_down(&mut self, from: &BTreeSet<u32>) {
        self.core.block_down(from);
    }

    fn block_up(&mut self, from: &BTreeSet<u32>) {
        self.core.block_up(from);
    }

    fn check_seed(&mut self, seed: &BTreeSet<u32>) -> Result<bool, SatError> {
        let mut assumptions = self.core.membership_assumptions(seed);
        assumptions.extend(self.neutral_assumptions());
        self.core.sat.solve(&assumptions)
    }

    fn find_above(&mut self, seed: &BTreeSet<u32>) -> Result<Option<BTreeSet<u32>>, SatError> {
        self.core.find_above(seed)
    }

    fn implies(&mut self, assumptions: &[i32]) -> Vec<i32> {
        self.core.implies(assumptions)
    }

    fn known_max_seeds(&self) -> bool {
        true
    }

    fn block_above_size(&mut self, size: usize) {
        let lits: Vec<Lit> = (0..self.core.n as usize).map(plit).collect();
        self.core.sat.add_atmost(&lits, size);
        self.k = self.k.min(size);
    }

    fn block_below_size(&mut self, size: usize) {
        let n = self.core.n as usize;
        let lits: Vec<Lit> = (0..n).map(nlit).collect();
        self.core.sat.add_atmost(&lits, n - size);
        self.k = self.k.min(size);
    }
}

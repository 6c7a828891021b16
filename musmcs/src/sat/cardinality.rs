//! Sequential-counter cardinality encoding (Sinz 2005).
//!
//! `s[i][j]` reads "at least j+1 of the first i+1 literals are true"; the
//! counter only propagates upward, which is all an at-most-k constraint
//! needs. Every call allocates a fresh counter, so repeated bounds over the
//! same literals compose by conjunction.

use varisat::Lit;

use super::SatSolver;

pub fn encode_atmost(sat: &mut SatSolver, lits: &[Lit], k: usize) {
    let n = lits.len();
    if k >= n {
        return;
    }
    if k == 0 {
        for &lit in lits {
            sat.add_clause(&[!lit]);
        }
        return;
    }

    // register[i][j], row-major, width k
    let mut register = Vec::with_capacity(n * k);
    for _ in 0..n * k {
        register.push(sat.new_var());
    }
    let s = |i: usize, j: usize| register[i * k + j];

    // first literal: the count is 1 iff it is true, and never more
    sat.add_clause(&[!lits[0], s(0, 0)]);
    for j in 1..k {
        sat.add_clause(&[!s(0, j)]);
    }

    for i in 1..n {
        // the count never decreases, and a true literal bumps it
        sat.add_clause(&[!lits[i], s(i, 0)]);
        sat.add_clause(&[!s(i - 1, 0), s(i, 0)]);
        for j in 1..k {
            sat.add_clause(&[!lits[i], !s(i - 1, j - 1), s(i, j)]);
            sat.add_clause(&[!s(i - 1, j), s(i, j)]);
        }
        // overflow: k among the first i forbids lits[i]
        sat.add_clause(&[!lits[i], !s(i - 1, k - 1)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sat::plit;
    use std::collections::BTreeSet;

    /// Enumerates all models over the first `n` variables and returns the
    /// observed true-counts.
    fn model_sizes(sat: &mut SatSolver, n: usize) -> BTreeSet<usize> {
        let mut sizes = BTreeSet::new();
        // walk all 2^n assignments via assumptions, robust against the
        // auxiliary counter variables
        for mask in 0..(1u32 << n) {
            let assumptions: Vec<Lit> = (0..n)
                .map(|i| if mask & (1 << i) != 0 { plit(i) } else { !plit(i) })
                .collect();
            if sat.solve(&assumptions).unwrap() {
                sizes.insert(mask.count_ones() as usize);
            }
        }
        sizes
    }

    #[test]
    fn atmost_two_of_four() {
        let mut sat = SatSolver::new(4, 0);
        let lits: Vec<Lit> = (0..4).map(plit).collect();
        sat.add_atmost(&lits, 2);
        let sizes = model_sizes(&mut sat, 4);
        assert_eq!(sizes, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn atmost_zero_forces_all_false() {
        let mut sat = SatSolver::new(3, 0);
        let lits: Vec<Lit> = (0..3).map(plit).collect();
        sat.add_atmost(&lits, 0);
        let sizes = model_sizes(&mut sat, 3);
        assert_eq!(sizes, BTreeSet::from([0]));
    }

    #[test]
    fn trivial_bound_adds_nothing() {
        let mut sat = SatSolver::new(2, 0);
        let lits: Vec<Lit> = (0..2).map(plit).collect();
        sat.add_atmost(&lits, 2);
        let sizes = model_sizes(&mut sat, 2);
        assert_eq!(sizes, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn atleast_via_negations() {
        // at least 2 of 3 true == at most 1 of the negations true
        let mut sat = SatSolver::new(3, 0);
        let negs: Vec<Lit> = (0..3).map(|i| !plit(i)).collect();
        sat.add_atmost(&negs, 1);
        let sizes = model_sizes(&mut sat, 3);
        assert_eq!(sizes, BTreeSet::from([2, 3]));
    }
}

//! MUS/MCS enumeration: lattice exploration engines and their coordination.
//!
//! The power set of the soft groups is explored with two cooperating
//! solvers: the *map* solver ([`mapsolver`]) tracks which subsets are still
//! unexplored and proposes seeds, the *subset* solver ([`subsetsolver`])
//! decides their satisfiability and minimizes/maximizes them. The main
//! [`marco`] engine yields both MUSes and MSSes; [`mcs_enumerator`] is a
//! dedicated cardinality-bounded MCS enumerator. [`parallel`] runs several
//! engines side by side and deduplicates their results.

pub mod mapsolver;
pub mod marco;
pub mod mcs_enumerator;
pub mod parallel;
pub mod shrinker;
pub mod subsetsolver;

use std::collections::BTreeSet;

use thiserror::Error;

use crate::sat::SatError;
use shrinker::ShrinkerError;

/// Which kind of result the lattice exploration should reach first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Bias {
    Muses,
    Mcses,
}

impl Bias {
    /// A MUS bias prefers large (high) seeds, an MCS bias small (low) ones.
    pub fn high(self) -> bool {
        self == Bias::Muses
    }
}

/// An enumerated result: a minimal unsatisfiable subset or a maximal
/// satisfiable subset (whose complement is the corresponding MCS).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MusMcs {
    Mus(BTreeSet<u32>),
    Mss(BTreeSet<u32>),
}

impl MusMcs {
    pub fn set(&self) -> &BTreeSet<u32> {
        match self {
            MusMcs::Mus(set) | MusMcs::Mss(set) => set,
        }
    }

    pub fn is_mus(&self) -> bool {
        matches!(self, MusMcs::Mus(_))
    }

    /// The one-letter output tag: `U` for a MUS, `S` for an MSS.
    pub fn tag(&self) -> char {
        match self {
            MusMcs::Mus(_) => 'U',
            MusMcs::Mss(_) => 'S',
        }
    }
}

#[derive(Debug, Error)]
pub enum EnumError {
    #[error(transparent)]
    Sat(#[from] SatError),
    #[error(transparent)]
    Shrinker(#[from] ShrinkerError),
}

//! Enumeration of Minimal Unsatisfiable Subsets (MUSes) and Minimal
//! Correction Sets (MCSes) of over-constrained CNF formulas.
//!
//! Given a set of constraints that is collectively unsatisfiable, the
//! engines in [`musmcs`] emit every inclusion-minimal UNSAT subset and every
//! maximal satisfiable subset (whose complement is an inclusion-minimal
//! correction set), by exploring the power-set lattice with two cooperating
//! SAT solvers. Several biased workers can run side by side, sharing their
//! results as blocking clauses.

pub mod cli;
pub mod input;
pub mod musmcs;
pub mod sat;
pub mod stats;

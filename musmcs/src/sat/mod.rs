//! Facade over the CDCL backend.
//!
//! The facade owns a [`varisat::Solver`] and a variable layout: problem
//! variables first, then one relaxation variable per soft group, then any
//! auxiliary variables allocated later (cardinality counters, activation
//! variables). An *instrumented* clause for group `g` is the clause body
//! extended with the negated relaxation literal of `g`, so that assuming
//! `r_g` enables the group and leaving it free lets the solver drop it.
//!
//! The backend has no native cardinality constraints; [`Self::add_atmost`]
//! encodes them with a sequential counter (see [`cardinality`]).

pub mod cardinality;

use std::collections::BTreeSet;
use std::ops::Range;

use thiserror::Error;
use varisat::{ExtendFormula, Lit, Var};

#[derive(Debug, Error)]
pub enum SatError {
    #[error("soft group {0} is out of range")]
    InvalidLiteral(u32),
    #[error("no model available: the last check was not SAT")]
    NoModel,
    #[error("no unsat core available: the last check was not UNSAT")]
    NoCore,
    #[error("solver backend error: {0}")]
    Backend(String),
}

pub struct SatSolver {
    solver: varisat::Solver<'static>,
    num_vars: usize,
    num_groups: u32,
    num_allocated: usize,
    /// Outcome of the most recent `solve` call.
    state: Option<bool>,
    model: Vec<Lit>,
    core: Vec<Lit>,
}

/// Positive literal of the variable at facade index `index`.
pub fn plit(index: usize) -> Lit {
    Lit::positive(Var::from_index(index))
}

/// Negative literal of the variable at facade index `index`.
pub fn nlit(index: usize) -> Lit {
    Lit::negative(Var::from_index(index))
}

impl SatSolver {
    /// Creates a solver with `num_vars` problem variables and `num_groups`
    /// relaxation variables pre-allocated.
    pub fn new(num_vars: usize, num_groups: u32) -> SatSolver {
        let mut solver = varisat::Solver::new();
        let total = num_vars + num_groups as usize;
        for _ in 0..total {
            solver.new_var();
        }
        SatSolver {
            solver,
            num_vars,
            num_groups,
            num_allocated: total,
            state: None,
            model: Vec::new(),
            core: Vec::new(),
        }
    }

    /// A solver loaded with a full instance: hard clauses as-is, every soft
    /// group instrumented with its relaxation variable.
    pub fn instrumented(instance: &crate::input::Instance) -> Result<SatSolver, SatError> {
        let mut sat = SatSolver::new(instance.num_vars, instance.num_groups);
        for (group, clause_indices) in instance.groups.iter().enumerate() {
            for &idx in clause_indices {
                let body = &instance.clauses[idx];
                if group == 0 {
                    sat.add_clause(body);
                } else {
                    sat.add_clause_instrumented(body, group as u32)?;
                }
            }
        }
        Ok(sat)
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    pub fn num_groups(&self) -> u32 {
        self.num_groups
    }

    /// Allocates a fresh auxiliary variable and returns its positive literal.
    pub fn new_var(&mut self) -> Lit {
        self.solver.new_var();
        let lit = plit(self.num_allocated);
        self.num_allocated += 1;
        lit
    }

    /// Relaxation literal of soft group `id` (1-based), positive when
    /// `polarity` is true.
    pub fn group_lit(&self, id: u32, polarity: bool) -> Result<Lit, SatError> {
        if id == 0 || id > self.num_groups {
            return Err(SatError::InvalidLiteral(id));
        }
        let index = self.num_vars + (id - 1) as usize;
        Ok(if polarity { plit(index) } else { nlit(index) })
    }

    pub fn add_clause(&mut self, lits: &[Lit]) {
        self.solver.add_clause(lits);
        self.state = None;
    }

    /// Adds `body ∨ ¬r_group`, allocating nothing: relaxation variables are
    /// reserved up front.
    pub fn add_clause_instrumented(&mut self, body: &[Lit], group: u32) -> Result<(), SatError> {
        let mut clause = body.to_vec();
        clause.push(self.group_lit(group, false)?);
        self.add_clause(&clause);
        Ok(())
    }

    /// Constrains at most `k` of `lits` to be true.
    pub fn add_atmost(&mut self, lits: &[Lit], k: usize) {
        cardinality::encode_atmost(self, lits, k);
        self.state = None;
    }

    pub fn solve(&mut self, assumptions: &[Lit]) -> Result<bool, SatError> {
        self.solver.assume(assumptions);
        let sat = self
            .solver
            .solve()
            .map_err(|e| SatError::Backend(e.to_string()))?;
        if sat {
            self.model = self.solver.model().unwrap_or_default();
            self.core.clear();
        } else {
            self.core = self.solver.failed_core().map(<[Lit]>::to_vec).unwrap_or_default();
            self.model.clear();
        }
        self.state = Some(sat);
        Ok(sat)
    }

    /// SAT check of `hard ∪ ⋃_{i∈ids} group i`: assumes the relaxation
    /// literal of every id positively and leaves the other groups free, so a
    /// SAT model may satisfy more groups than asked for (see
    /// [`Self::sat_subset`]).
    pub fn solve_subset(&mut self, ids: &BTreeSet<u32>) -> Result<bool, SatError> {
        let assumptions = ids
            .iter()
            .map(|&id| self.group_lit(id, true))
            .collect::<Result<Vec<_>, _>>()?;
        self.solve(&assumptions)
    }

    /// 1-based offsets (within `range`) of the variables assigned true by the
    /// last SAT model. Variables the backend left unassigned count as false.
    pub fn model_trues(&self, range: Range<usize>) -> Vec<u32> {
        let mut trues: Vec<u32> = self
            .model
            .iter()
            .filter(|lit| lit.is_positive() && range.contains(&lit.var().index()))
            .map(|lit| (lit.var().index() - range.start) as u32 + 1)
            .collect();
        trues.sort_unstable();
        trues
    }

    /// Soft groups satisfied by the last SAT model (a superset of the ids
    /// passed to [`Self::solve_subset`]).
    pub fn sat_subset(&self) -> Result<BTreeSet<u32>, SatError> {
        if self.state != Some(true) {
            return Err(SatError::NoModel);
        }
        let range = self.num_vars..self.num_vars + self.num_groups as usize;
        Ok(self.model_trues(range).into_iter().collect())
    }

    /// Soft groups whose relaxation assumptions drove the last UNSAT result.
    pub fn unsat_core(&self) -> Result<BTreeSet<u32>, SatError> {
        if self.state != Some(false) {
            return Err(SatError::NoCore);
        }
        let range = self.num_vars..self.num_vars + self.num_groups as usize;
        Ok(self
            .core
            .iter()
            .filter(|lit| lit.is_positive() && range.contains(&lit.var().index()))
            .map(|lit| (lit.var().index() - self.num_vars) as u32 + 1)
            .collect())
    }
}

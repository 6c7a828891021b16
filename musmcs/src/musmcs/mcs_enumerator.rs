//! Dedicated MCS enumerator, bounded by correction-set cardinality.
//!
//! The classic CAMUS first phase: accumulate the groups known to take part
//! in infeasibility (`included`), then for k = 1, 2, … enumerate every model
//! that disables at most k of them while keeping the rest enabled. Each
//! model is an MSS; its complement MCS is blocked downward so it never
//! reappears. The auxiliary bounded solver is rebuilt at every k increment,
//! which keeps the bound sound when peers inject blocking clauses mid-loop.

use std::collections::BTreeSet;
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::debug;

use crate::input::Instance;
use crate::musmcs::marco::Outcome;
use crate::musmcs::parallel::InputMsg;
use crate::musmcs::{MusMcs, EnumError};
use crate::sat::{SatError, SatSolver};
use crate::stats::Stats;
use varisat::Lit;

pub struct McsEnumerator {
    instance: Arc<Instance>,
    /// Instrumented formula plus every blocking clause found or received.
    outer: SatSolver,
    /// Blocked MCSes, replayed into each rebuilt auxiliary solver.
    blk_downs: Vec<BTreeSet<u32>>,
    /// Received MUSes, replayed likewise.
    blk_ups: Vec<BTreeSet<u32>>,
    inbound: Option<Receiver<InputMsg>>,
    comms_ignore: bool,
    stats: Stats,
    n: u32,
}

impl McsEnumerator {
    pub fn new(
        instance: Arc<Instance>,
        inbound: Option<Receiver<InputMsg>>,
        comms_ignore: bool,
    ) -> Result<McsEnumerator, SatError> {
        let outer = SatSolver::instrumented(&instance)?;
        let n = instance.num_groups;
        Ok(McsEnumerator {
            instance,
            outer,
            blk_downs: Vec::new(),
            blk_ups: Vec::new(),
            inbound,
            comms_ignore,
            stats: Stats::new(),
            n,
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn complement(&self, subset: &BTreeSet<u32>) -> BTreeSet<u32> {
        (1..=self.n).filter(|i| !subset.contains(i)).collect()
    }

    /// Requires at least one group of `mcs` to be enabled, ruling out the
    /// corresponding MSS and everything below it.
    fn block_down(sat: &mut SatSolver, mcs: &BTreeSet<u32>) -> Result<(), SatError> {
        let clause: Vec<Lit> = mcs
            .iter()
            .map(|&id| sat.group_lit(id, true))
            .collect::<Result<_, _>>()?;
        sat.add_clause(&clause);
        Ok(())
    }

    /// Requires at least one group of `mus` to be disabled.
    fn block_up(sat: &mut SatSolver, mus: &BTreeSet<u32>) -> Result<(), SatError> {
        let clause: Vec<Lit> = mus
            .iter()
            .map(|&id| sat.group_lit(id, false))
            .collect::<Result<_, _>>()?;
        sat.add_clause(&clause);
        Ok(())
    }

    /// Drains buffered peer results into the outer solver (and the current
    /// auxiliary solver, when one is live). Returns true on terminate.
    fn drain(&mut self, mut aux: Option<&mut SatSolver>) -> Result<bool, SatError> {
        let mut disconnected = false;
        if let Some(inbound) = &self.inbound {
            loop {
                match inbound.try_recv() {
                    Ok(InputMsg::Terminate) => return Ok(true),
                    Ok(InputMsg::Result(result)) => {
                        let _t = self.stats.time("receive");
                        if self.comms_ignore {
                            continue;
                        }
                        match result {
                            MusMcs::Mss(mss) => {
                                // peers report the MSS; what gets blocked is
                                // its correction set
                                let mcs =
                                    (1..=self.n).filter(|i| !mss.contains(i)).collect::<BTreeSet<u32>>();
                                Self::block_down(&mut self.outer, &mcs)?;
                                if let Some(aux) = aux.as_deref_mut() {
                                    Self::block_down(aux, &mcs)?;
                                }
                                self.blk_downs.push(mcs);
                            }
                            MusMcs::Mus(mus) => {
                                Self::block_up(&mut self.outer, &mus)?;
                                if let Some(aux) = aux.as_deref_mut() {
                                    Self::block_up(aux, &mus)?;
                                }
                                self.blk_ups.push(mus);
                            }
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
        Ok(false)
    }

    /// Fresh instrumented solver carrying every blocking clause seen so far.
    fn build_bounded(&self, included: &BTreeSet<u32>, k: usize) -> Result<SatSolver, SatError> {
        let mut aux = SatSolver::instrumented(&self.instance)?;
        for mcs in &self.blk_downs {
            Self::block_down(&mut aux, mcs)?;
        }
        for mus in &self.blk_ups {
            Self::block_up(&mut aux, mus)?;
        }
        // at most k of the core groups may be disabled
        let disabled: Vec<Lit> = included
            .iter()
            .map(|&id| aux.group_lit(id, false))
            .collect::<Result<_, _>>()?;
        aux.add_atmost(&disabled, k);
        Ok(aux)
    }

    /// Enumerates every MCS (reported as its MSS), in non-decreasing MCS
    /// cardinality. Emits only `S` results.
    pub fn run(&mut self, mut emit: impl FnMut(MusMcs)) -> Result<Outcome, EnumError> {
        if self.n == 0 {
            return Ok(Outcome::Complete);
        }

        // seed `included` with a first core of the whole formula
        let everything: Vec<Lit> = (1..=self.n)
            .map(|id| self.outer.group_lit(id, true))
            .collect::<Result<_, _>>()
            .map_err(EnumError::from)?;
        if self.drain(None)? {
            return Ok(Outcome::Terminated);
        }
        let whole_formula_sat = {
            let _t = self.stats.time("check");
            self.outer.solve(&everything).map_err(EnumError::from)?
        };
        if whole_formula_sat {
            // nothing to correct: the only MSS is the full set
            emit(MusMcs::Mss(self.instance.all_groups()));
            return Ok(Outcome::Complete);
        }
        let mut included = self.outer.unsat_core().map_err(EnumError::from)?;
        let mut k = 1usize;

        loop {
            if self.drain(None)? {
                return Ok(Outcome::Terminated);
            }
            let unexplored_left = {
                let _t = self.stats.time("check");
                self.outer.solve(&[]).map_err(EnumError::from)?
            };
            if !unexplored_left {
                break;
            }
            debug!(k, included = included.len(), "rebuilding bounded solver");
            let mut aux = self.build_bounded(&included, k).map_err(EnumError::from)?;
            let enabled: Vec<Lit> = self
                .complement(&included)
                .iter()
                .map(|&id| aux.group_lit(id, true))
                .collect::<Result<_, _>>()
                .map_err(EnumError::from)?;

            loop {
                if self.drain(Some(&mut aux))? {
                    return Ok(Outcome::Terminated);
                }
                let found = {
                    let _t = self.stats.time("check");
                    aux.solve(&enabled).map_err(EnumError::from)?
                };
                if !found {
                    break;
                }
                let mss = aux.sat_subset().map_err(EnumError::from)?;
                let mcs = self.complement(&mss);
                {
                    let _t = self.stats.time("block");
                    Self::block_down(&mut self.outer, &mcs).map_err(EnumError::from)?;
                    Self::block_down(&mut aux, &mcs).map_err(EnumError::from)?;
                    self.blk_downs.push(mcs);
                }
                emit(MusMcs::Mss(mss));
            }

            included.extend(aux.unsat_core().map_err(EnumError::from)?);
            k += 1;
            // `included` grows whenever the bounded solver fails under its
            // assumptions, and once it covers every group the bounded solver
            // coincides with the outer one; the loop cannot spin forever
            debug_assert!(k <= 2 * self.n as usize + 2);
        }
        Ok(Outcome::Complete)
    }
}

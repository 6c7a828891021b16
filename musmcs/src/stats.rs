//! Wall-clock statistics for the enumeration engines.
//!
//! Every phase of the seed processing pipeline (seed selection, maximization,
//! satisfiability check, grow, shrink, blocking, peer communication) is timed
//! into a category, and arbitrary event counters can be maintained alongside.
//! Each worker owns its own `Stats` and ships it back to the coordinator when
//! it finishes.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct Stats {
    start: Instant,
    times: BTreeMap<&'static str, Duration>,
    counts: BTreeMap<&'static str, u64>,
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            start: Instant::now(),
            times: BTreeMap::new(),
            counts: BTreeMap::new(),
        }
    }

    /// Starts timing `category`; the elapsed time is accumulated when the
    /// returned guard is dropped. Also counts one occurrence of `category`.
    pub fn time(&mut self, category: &'static str) -> TimeGuard<'_> {
        *self.counts.entry(category).or_insert(0) += 1;
        TimeGuard {
            stats: self,
            category,
            started: Instant::now(),
        }
    }

    pub fn increment(&mut self, category: &'static str) {
        *self.counts.entry(category).or_insert(0) += 1;
    }

    pub fn count(&self, category: &'static str) -> u64 {
        self.counts.get(category).copied().unwrap_or(0)
    }

    /// Total wall-clock time since this `Stats` was created.
    pub fn total_time(&self) -> Duration {
        self.start.elapsed()
    }

    /// Renders the accumulated categories, sorted by total runtime, followed
    /// by the counters (with a per-occurrence average where a time exists).
    pub fn report(&self, label: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "==== {label}");
        let width = self
            .times
            .keys()
            .chain(self.counts.keys())
            .map(|c| c.len())
            .max()
            .unwrap_or(0)
            .max("total".len());

        let mut by_time: Vec<_> = self.times.iter().collect();
        by_time.sort_by_key(|(_, d)| **d);
        for (category, duration) in by_time {
            let _ = writeln!(out, "{category:<width$} : {:8.3}", duration.as_secs_f64());
        }
        let _ = writeln!(out, "{:<width$} : {:8.3}", "total", self.total_time().as_secs_f64());

        for (category, count) in &self.counts {
            let _ = writeln!(out, "{category:<width$} count : {count:8}");
            if let Some(duration) = self.times.get(category) {
                let _ = writeln!(
                    out,
                    "{category:<width$} per   : {:8.5}",
                    duration.as_secs_f64() / *count as f64
                );
            }
        }
        out
    }
}

pub struct TimeGuard<'a> {
    stats: &'a mut Stats,
    category: &'static str,
    started: Instant,
}

impl Drop for TimeGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        *self.stats.times.entry(self.category).or_insert(Duration::ZERO) += elapsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_and_counts_accumulate() {
        let mut stats = Stats::new();
        {
            let _t = stats.time("check");
        }
        {
            let _t = stats.time("check");
        }
        stats.increment("duplicate MUS");

        assert_eq!(stats.count("check"), 2);
        assert_eq!(stats.count("duplicate MUS"), 1);
        assert_eq!(stats.count("unknown"), 0);

        let report = stats.report("worker 0");
        assert!(report.contains("check"));
        assert!(report.contains("duplicate MUS"));
        assert!(report.contains("total"));
    }
}

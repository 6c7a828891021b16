//! Adapter for an external MUS extractor (MUSer2-compatible).
//!
//! One short-lived child process per shrink: the current seed is written as
//! a Group-CNF file (hard clauses and map-implied hard groups under group 0,
//! each remaining seed group under its own positive id), the child is run on
//! it, and its `v …` answer line is mapped back to the original group ids.
//!
//! The child is owned by a kill-on-drop guard and is waited on with a
//! polling loop that also watches the coordinator's shutdown flag, so a
//! hung or slow binary is killed on cancellation/timeout instead of being
//! orphaned. The temp files are owned by the adapter and released on every
//! exit path.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::input::Instance;

#[derive(Debug, Error)]
pub enum ShrinkerError {
    #[error("cannot run shrinker {path}: {source} (the internal shrink does not need a helper binary)")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("shrinker i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("shrinker exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("shrinker killed by shutdown")]
    Cancelled,
    #[error("shrinker output contains no `v …` line")]
    Unparseable,
    #[error("shrinker reported group {0} which was never sent")]
    BadGroup(usize),
}

/// Owns the running child; kills and reaps it unless it already finished.
struct ChildGuard {
    child: Child,
    finished: bool,
}

impl ChildGuard {
    /// Waits for the child, polling the shutdown flag between checks.
    fn wait(&mut self, cancel: &AtomicBool) -> Result<ExitStatus, ShrinkerError> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.finished = true;
                return Ok(status);
            }
            if cancel.load(Ordering::Relaxed) {
                // the drop below kills the child
                return Err(ShrinkerError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub struct ExternalShrinker {
    path: PathBuf,
    core_line: Regex,
    /// Set by the coordinator when the run winds down.
    cancel: Arc<AtomicBool>,
}

impl ExternalShrinker {
    pub fn new(path: PathBuf, cancel: Arc<AtomicBool>) -> ExternalShrinker {
        ExternalShrinker {
            path,
            core_line: Regex::new(r"(?m)^v[ \d]+$").unwrap(),
            cancel,
        }
    }

    /// Minimizes `seed` (an UNSAT subset) to a MUS. `hard` groups are sent in
    /// the don't-care group and re-added to the answer.
    pub fn shrink(
        &self,
        instance: &Instance,
        seed: &BTreeSet<u32>,
        hard: &BTreeSet<u32>,
    ) -> Result<BTreeSet<u32>, ShrinkerError> {
        let (file, soft_ids) = self.write_gcnf(instance, seed, hard)?;

        // stdout/stderr go to anonymous temp files: nothing to drain while
        // the child runs, and nothing left behind if it is killed
        let mut stdout_file = tempfile::tempfile()?;
        let stderr_file = tempfile::tempfile()?;
        let child = Command::new(&self.path)
            .args(["-comp", "-grp", "-v", "-1"])
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(stdout_file.try_clone()?)
            .stderr(stderr_file.try_clone()?)
            .spawn()
            .map_err(|source| ShrinkerError::Spawn {
                path: self.path.display().to_string(),
                source,
            })?;
        let mut guard = ChildGuard { child, finished: false };
        let status = guard.wait(&self.cancel)?;
        // dropping `file` removes the input; do it only after the child is done
        drop(file);

        if !status.success() {
            return Err(ShrinkerError::Failed {
                status: status.to_string(),
                stderr: read_back(stderr_file)?.trim().to_string(),
            });
        }

        stdout_file.seek(SeekFrom::Start(0))?;
        let mut stdout = String::new();
        stdout_file.read_to_string(&mut stdout)?;
        let line = self
            .core_line
            .find(&stdout)
            .ok_or(ShrinkerError::Unparseable)?
            .as_str();

        let mut mus: BTreeSet<u32> = hard.clone();
        for token in line.split_ascii_whitespace().skip(1) {
            let index: usize = token.parse().map_err(|_| ShrinkerError::Unparseable)?;
            // the trailing 0 terminator and the don't-care group are not part
            // of the answer
            if index == 0 {
                continue;
            }
            let id = *soft_ids.get(index - 1).ok_or(ShrinkerError::BadGroup(index))?;
            mus.insert(id);
        }
        debug!(kept = mus.len(), sent = seed.len(), "external shrink");
        debug_assert!(mus.len() <= seed.len());
        Ok(mus)
    }

    /// Writes the group-CNF round-trip file. Returns the live temp file and
    /// the positional mapping from the child's 1-based group ids back to the
    /// original soft ids.
    fn write_gcnf(
        &self,
        instance: &Instance,
        seed: &BTreeSet<u32>,
        hard: &BTreeSet<u32>,
    ) -> Result<(NamedTempFile, Vec<u32>), ShrinkerError> {
        let soft_ids: Vec<u32> = seed.iter().copied().filter(|id| !hard.contains(id)).collect();

        let hard_clauses: usize = std::iter::once(&0u32)
            .chain(hard.iter())
            .map(|&g| instance.groups[g as usize].len())
            .sum();
        let soft_clauses: usize = soft_ids.iter().map(|&g| instance.groups[g as usize].len()).sum();

        let file = NamedTempFile::with_suffix(".gcnf")?;
        let mut writer = BufWriter::new(file.as_file());
        writeln!(
            writer,
            "p gcnf {} {} {}",
            instance.num_vars,
            hard_clauses + soft_clauses,
            soft_ids.len()
        )?;
        for &group in std::iter::once(&0u32).chain(hard.iter()) {
            for &idx in &instance.groups[group as usize] {
                write_clause(&mut writer, 0, &instance.clauses[idx])?;
            }
        }
        for (pos, &group) in soft_ids.iter().enumerate() {
            for &idx in &instance.groups[group as usize] {
                write_clause(&mut writer, pos + 1, &instance.clauses[idx])?;
            }
        }
        writer.flush()?;
        drop(writer);
        Ok((file, soft_ids))
    }
}

fn read_back(mut file: File) -> Result<String, ShrinkerError> {
    file.seek(SeekFrom::Start(0))?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    Ok(text)
}

fn write_clause(writer: &mut impl Write, group: usize, clause: &[varisat::Lit]) -> std::io::Result<()> {
    write!(writer, "{{{group}}}")?;
    for lit in clause {
        write!(writer, " {}", lit.to_dimacs())?;
    }
    writeln!(writer, " 0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::dimacs;
    use std::io::Cursor;

    fn shrinker(path: &str) -> ExternalShrinker {
        ExternalShrinker::new(PathBuf::from(path), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn round_trips_the_seed_through_group_cnf() {
        let instance = dimacs::parse(Cursor::new("p cnf 2 4\n1 0\n-1 0\n2 0\n-2 0\n")).unwrap();
        let shrinker = shrinker("/nonexistent");
        let seed: BTreeSet<u32> = [1, 2, 4].into();
        let hard: BTreeSet<u32> = [2].into();

        let (file, soft_ids) = shrinker.write_gcnf(&instance, &seed, &hard).unwrap();
        assert_eq!(soft_ids, vec![1, 4]);

        let written = std::fs::read_to_string(file.path()).unwrap();
        let reparsed = dimacs::parse(Cursor::new(written.as_str())).unwrap();
        assert_eq!(reparsed.num_groups, 2);
        // group 0 holds the hard group's clause, soft groups follow the seed order
        assert_eq!(reparsed.groups[0].len(), 1);
        assert_eq!(reparsed.groups[1].len(), 1);
        assert_eq!(reparsed.groups[2].len(), 1);
        assert_eq!(reparsed.clauses[0].as_slice(), instance.clauses[1].as_slice());
        assert_eq!(reparsed.clauses[1].as_slice(), instance.clauses[0].as_slice());
        assert_eq!(reparsed.clauses[2].as_slice(), instance.clauses[3].as_slice());
    }

    #[test]
    fn missing_binary_is_a_spawn_failure() {
        let instance = dimacs::parse(Cursor::new("p cnf 1 2\n1 0\n-1 0\n")).unwrap();
        let shrinker = shrinker("/nonexistent/shrinker");
        let err = shrinker
            .shrink(&instance, &[1, 2].into(), &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, ShrinkerError::Spawn { .. }));
    }

    #[test]
    fn core_lines_are_recognized() {
        let shrinker = shrinker("x");
        let out = "c comments\nv 1 3 0\ns UNSATISFIABLE\n";
        assert_eq!(shrinker.core_line.find(out).unwrap().as_str(), "v 1 3 0");
        assert!(shrinker.core_line.find("s SATISFIABLE\n").is_none());
    }
}
